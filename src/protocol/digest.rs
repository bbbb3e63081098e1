//! SHA-256 audit digests over exchanged payloads.
//!
//! The trailing `text/plain` part of a response carries `<input>:<output>`,
//! two lowercase hex digests. Receivers only log it.

use std::fmt;

use sha2::{Digest, Sha256};

use super::multipart::Part;

/// Hex characters in one SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;
/// `input` + `:` + `output`.
pub const PAIR_LEN: usize = DIGEST_HEX_LEN * 2 + 1;

/// Digest the concatenation of `payloads` in order.
pub fn digest_payloads<I, B>(payloads: I) -> String
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for payload in payloads {
        hasher.update(payload.as_ref());
    }
    hex::encode(hasher.finalize())
}

/// Digest of every request part payload in arrival order.
pub fn request_digest(parts: &[Part]) -> String {
    digest_payloads(parts.iter().map(|p| &p.data))
}

/// Digest of the serialized response manifest followed by each buffer.
pub fn response_digest<B: AsRef<[u8]>>(manifest_json: &[u8], buffers: &[B]) -> String {
    digest_payloads(
        std::iter::once(manifest_json).chain(buffers.iter().map(|b| b.as_ref())),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestPair {
    pub input: String,
    pub output: String,
}

impl DigestPair {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    /// Parse a trailing-part payload. Returns `None` unless it has the exact
    /// `64 + 1 + 64` shape.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() != PAIR_LEN || payload[DIGEST_HEX_LEN] != b':' {
            return None;
        }
        let text = std::str::from_utf8(payload).ok()?;
        let (input, output) = text.split_at(DIGEST_HEX_LEN);
        Some(Self::new(input, &output[1..]))
    }

    pub fn to_part(&self) -> Part {
        Part::new("hashes", "text/plain", self.to_string().into_bytes())
    }
}

impl fmt::Display for DigestPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.input, self.output)
    }
}

/// Whether `part` is a trailing digest part: declared `text/plain`, exactly
/// 129 bytes, `:` at offset 64.
pub fn is_digest_part(part: &Part) -> bool {
    part.media_type() == "text/plain"
        && part.data.len() == PAIR_LEN
        && part.data[DIGEST_HEX_LEN] == b':'
}
