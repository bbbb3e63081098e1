//! The JSON + binary multipart exchange with the inference endpoint.

pub mod digest;
pub mod manifest;
pub mod multipart;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::loader::ImageInstance;
use digest::{DigestPair, is_digest_part, request_digest, response_digest};
use manifest::{RequestManifest, ResponseManifest};
use multipart::{ContentType, Part};

pub const MIME_DICOM: &str = "application/dicom";
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// Ordered parts of one request or response: the JSON manifest, the binary
/// buffers, and an optional trailing digest pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub manifest: Part,
    pub buffers: Vec<Part>,
    pub digest: Option<DigestPair>,
}

impl Exchange {
    /// Split decoded parts. The last part is taken as a digest pair only when
    /// it passes [`is_digest_part`] and parses.
    pub fn from_parts(mut parts: Vec<Part>) -> Result<Self> {
        if parts.is_empty() {
            return Err(Error::Multipart("exchange has no manifest part".to_string()));
        }
        let mut digest = None;
        if parts.len() > 1
            && let Some(last) = parts.last()
            && is_digest_part(last)
        {
            match DigestPair::parse(&last.data) {
                Some(pair) => {
                    parts.pop();
                    digest = Some(pair);
                }
                None => warn!(
                    "Trailing part {:?} looks like a digest pair but is not valid UTF-8; keeping it as a buffer",
                    last.name
                ),
            }
        }
        let buffers = parts.split_off(1);
        let manifest = parts.remove(0);
        Ok(Self {
            manifest,
            buffers,
            digest,
        })
    }

    pub fn into_parts(self) -> Vec<Part> {
        let mut parts = Vec::with_capacity(self.buffers.len() + 2);
        parts.push(self.manifest);
        parts.extend(self.buffers);
        parts.extend(self.digest.map(|d| d.to_part()));
        parts
    }

    pub fn encode(self, content_type: &ContentType) -> Vec<u8> {
        multipart::encode(&content_type.boundary, &self.into_parts())
    }

    pub fn decode(body: &[u8], content_type: &ContentType) -> Result<Self> {
        if !content_type.charset.eq_ignore_ascii_case(multipart::DEFAULT_CHARSET) {
            warn!(
                "Declared charset {} is not UTF-8; manifest is parsed as UTF-8",
                content_type.charset
            );
        }
        Self::from_parts(multipart::decode(body, &content_type.boundary)?)
    }

    /// Payloads of the binary buffers, in order.
    pub fn buffer_data(&self) -> Vec<&[u8]> {
        self.buffers.iter().map(|p| p.data.as_slice()).collect()
    }
}

/// A body ready to be sent, with its Content-Type and audit digest.
#[derive(Debug, Clone)]
pub struct EncodedBody {
    pub content_type: ContentType,
    pub body: Vec<u8>,
    pub digest: String,
}

/// Build a request body: the `request_json` manifest part, then attachments
/// named `"1"`, `"2"`, ..., then one DICOM part per ordered instance.
pub fn build_request(
    manifest: &RequestManifest,
    attachments: &[PathBuf],
    images: &[ImageInstance],
) -> Result<EncodedBody> {
    let manifest_part = Part::new("request_json", "text/json", serde_json::to_vec(manifest)?)
        .with_filename("request");

    let mut buffers = Vec::with_capacity(attachments.len() + images.len());
    for path in attachments {
        let data = fs::read(path)?;
        buffers.push(
            Part::new((buffers.len() + 1).to_string(), MIME_OCTET_STREAM, data)
                .with_filename(file_name_of(path)),
        );
    }
    for image in images {
        let data = fs::read(&image.dataset_path)?;
        buffers.push(
            Part::new((buffers.len() + 1).to_string(), MIME_DICOM, data)
                .with_filename(file_name_of(&image.dataset_path)),
        );
    }

    let exchange = Exchange {
        manifest: manifest_part,
        buffers,
        digest: None,
    };
    let parts = exchange.into_parts();
    let digest = request_digest(&parts);
    let content_type = ContentType::new(multipart::new_boundary());
    info!(
        "Built request with {} attachment(s) and {} image(s)",
        attachments.len(),
        images.len()
    );
    debug!("Request digest {digest}");

    Ok(EncodedBody {
        body: multipart::encode(&content_type.boundary, &parts),
        content_type,
        digest,
    })
}

/// Build a response body: `json-body`, then `elem_<i>` per buffer typed by
/// its manifest part, then the `hashes` digest pair.
///
/// Reuses the request's boundary when one is given.
pub fn build_response(
    manifest: &ResponseManifest,
    buffers: &[Vec<u8>],
    input_digest: &str,
    content_type: Option<&ContentType>,
) -> Result<EncodedBody> {
    let paired = manifest::pair_positional(&manifest.parts, buffers)?;
    let json = manifest.to_vec()?;
    let output_digest = response_digest(&json, buffers);

    let exchange = Exchange {
        manifest: Part::new("json-body", "application/json", json),
        buffers: paired
            .iter()
            .map(|p| {
                Part::new(
                    format!("elem_{}", p.index),
                    p.part.binary_type.mime_type(),
                    p.buffer.to_vec(),
                )
            })
            .collect(),
        digest: Some(DigestPair::new(input_digest, output_digest.clone())),
    };

    let content_type = content_type
        .cloned()
        .unwrap_or_else(|| ContentType::new(multipart::new_boundary()));
    Ok(EncodedBody {
        body: exchange.encode(&content_type),
        content_type,
        digest: output_digest,
    })
}

/// A decoded inference response.
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    pub manifest: ResponseManifest,
    /// The manifest as received, unknown fields included.
    pub raw_manifest: serde_json::Value,
    manifest_bytes: Vec<u8>,
    pub buffers: Vec<Vec<u8>>,
    pub digest: Option<DigestPair>,
}

impl InferenceResponse {
    pub fn decode(body: &[u8], content_type_header: &str) -> Result<Self> {
        let content_type = ContentType::parse(content_type_header)?;
        let exchange = Exchange::decode(body, &content_type)?;

        let raw_manifest: serde_json::Value = serde_json::from_slice(&exchange.manifest.data)?;
        let manifest: ResponseManifest = serde_json::from_value(raw_manifest.clone())?;
        match &exchange.digest {
            Some(pair) => debug!("Response digests input={} output={}", pair.input, pair.output),
            None => debug!("Response carries no digest part"),
        }
        info!(
            "Decoded response: {} manifest part(s), {} buffer(s)",
            manifest.parts.len(),
            exchange.buffers.len()
        );

        Ok(Self {
            manifest,
            raw_manifest,
            manifest_bytes: exchange.manifest.data,
            buffers: exchange.buffers.into_iter().map(|p| p.data).collect(),
            digest: exchange.digest,
        })
    }

    /// Digest of the manifest bytes and buffers as received.
    pub fn output_digest(&self) -> String {
        response_digest(&self.manifest_bytes, &self.buffers)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}
