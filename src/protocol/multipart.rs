//! `multipart/related` body encoding and decoding.
//!
//! Parts are written with form-data style headers:
//!
//! ```text
//! --<boundary>\r\n
//! Content-Disposition: form-data; name="<name>"; filename="<filename>"\r\n
//! Content-Type: <type>\r\n
//! \r\n
//! <payload>\r\n
//! --<boundary>--\r\n
//! ```
//!
//! Decoding goes through [`multipart_rs::MultipartReader`], driven to completion on the
//! current thread.

use std::borrow::Cow;

use futures::executor::block_on_stream;
use mime::Mime;
use multipart_rs::{MultipartItem, MultipartReader, MultipartType};

use crate::error::{Error, Result};

pub const MEDIA_TYPE: &str = "multipart/related";
pub const DEFAULT_CHARSET: &str = "utf-8";

/// One body part of a multipart exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Part {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            content_type: content_type.into(),
            data,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Media type without parameters, lowercased.
    pub fn media_type(&self) -> String {
        self.content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }
}

/// Parameters of a `multipart/related` Content-Type header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    pub boundary: String,
    pub charset: String,
}

impl ContentType {
    pub fn new(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            charset: DEFAULT_CHARSET.to_string(),
        }
    }

    /// Parse a header value such as `multipart/related; boundary="abc"`.
    pub fn parse(header: &str) -> Result<Self> {
        let parsed: Mime = header
            .parse()
            .map_err(|e| Error::Multipart(format!("invalid content-type {header:?}: {e}")))?;
        if parsed.type_() != mime::MULTIPART || parsed.subtype() != "related" {
            return Err(Error::Multipart(format!(
                "invalid content-type {header:?}"
            )));
        }

        let boundary = parsed
            .get_param(mime::BOUNDARY)
            .map(|b| b.as_str().to_string())
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::Multipart(format!("no boundary in {header:?}")))?;
        let charset = parsed
            .get_param(mime::CHARSET)
            .map_or_else(|| DEFAULT_CHARSET.to_string(), |c| c.as_str().to_string());
        Ok(Self { boundary, charset })
    }

    /// Header value with a quoted boundary.
    pub fn header_value(&self) -> String {
        format!("{MEDIA_TYPE}; boundary=\"{}\"", self.boundary)
    }
}

/// Fresh sender-chosen boundary token.
pub fn new_boundary() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn encode(boundary: &str, parts: &[Part]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(parts.iter().map(|p| p.data.len() + 160).sum());
    for part in parts {
        buf.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        let filename = part.filename.as_deref().unwrap_or(&part.name);
        buf.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                part.name, filename
            )
            .as_bytes(),
        );
        buf.extend_from_slice(format!("Content-Type: {}\r\n\r\n", part.content_type).as_bytes());
        buf.extend_from_slice(&part.data);
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    buf
}

pub fn decode(body: &[u8], boundary: &str) -> Result<Vec<Part>> {
    let close = format!("--{boundary}--");
    if !body.windows(close.len()).any(|w| w == close.as_bytes()) {
        return Err(Error::Multipart(format!(
            "closing delimiter {close:?} not found in body"
        )));
    }
    // Delimiter lines are only recognized when terminated by CRLF.
    let body = if body.ends_with(b"\r\n") {
        Cow::Borrowed(body)
    } else {
        Cow::Owned([body, b"\r\n"].concat())
    };

    let reader = MultipartReader::<std::io::Error>::from_data_with_boundary_and_type(
        &body,
        boundary,
        MultipartType::Related,
    )
    .map_err(|e| Error::Multipart(e.to_string()))?;

    block_on_stream(reader)
        .enumerate()
        .map(|(index, item)| {
            item.map(|item| into_part(item, index))
                .map_err(|e| Error::Multipart(format!("part {index}: {e}")))
        })
        .collect()
}

fn into_part(item: MultipartItem, index: usize) -> Part {
    let header = |name: &str| {
        item.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.trim())
    };
    let disposition = header("content-disposition").unwrap_or_default();

    Part {
        name: disposition_param(disposition, "name").unwrap_or_else(|| index.to_string()),
        filename: disposition_param(disposition, "filename"),
        content_type: header("content-type").unwrap_or("text/plain").to_string(),
        data: item.data.to_vec(),
    }
}

fn disposition_param(disposition: &str, key: &str) -> Option<String> {
    disposition.split(';').skip(1).find_map(|param| {
        let (k, v) = param.split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case(key)
            .then(|| v.trim().trim_matches('"').to_string())
    })
}
