//! Response body decoding.
//!
//! Bodies that a rewriting handler needs to read are decoded according to
//! their `Content-Encoding`. Anything other than `identity`, `gzip` and
//! `deflate` is rejected so the request can be answered with a 502 instead
//! of forwarding a corrupted page.

use std::io::{Cursor, Read};

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use hyper::body::Bytes;

use crate::error::{ProxyError, Result};

/// `Accept-Encoding` sent upstream for requests whose body may be rewritten.
pub const SUPPORTED_ENCODINGS: &str = "gzip, deflate";

/// A single content coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
}

impl ContentEncoding {
    /// Parses a single coding token.
    pub fn parse(token: &str) -> Result<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(Self::Identity),
            "gzip" | "x-gzip" => Ok(Self::Gzip),
            "deflate" => Ok(Self::Deflate),
            other => Err(ProxyError::UnknownEncoding(other.to_string())),
        }
    }

    /// Parses a `Content-Encoding` header value into codings in the order
    /// they were applied.
    pub fn parse_header(value: Option<&str>) -> Result<Vec<Self>> {
        let Some(value) = value else {
            return Ok(Vec::new());
        };
        value
            .split(',')
            .map(Self::parse)
            .filter(|coding| !matches!(coding, Ok(Self::Identity)))
            .collect()
    }

    fn decode(self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Self::Identity => out.extend_from_slice(data),
            Self::Gzip => {
                GzDecoder::new(Cursor::new(data))
                    .read_to_end(&mut out)
                    .map_err(|e| ProxyError::Upstream(format!("invalid gzip body: {e}")))?;
            }
            Self::Deflate => {
                // Servers disagree on zlib-wrapped vs raw deflate.
                if ZlibDecoder::new(Cursor::new(data))
                    .read_to_end(&mut out)
                    .is_err()
                {
                    out.clear();
                    DeflateDecoder::new(Cursor::new(data))
                        .read_to_end(&mut out)
                        .map_err(|e| ProxyError::Upstream(format!("invalid deflate body: {e}")))?;
                }
            }
        }
        Ok(out)
    }
}

/// Decodes `body` encoded with the codings named by `content_encoding`.
pub fn decode_body(content_encoding: Option<&str>, body: Bytes) -> Result<Bytes> {
    let codings = ContentEncoding::parse_header(content_encoding)?;
    if codings.is_empty() {
        return Ok(body);
    }

    let mut data = body.to_vec();
    for coding in codings.iter().rev() {
        data = coding.decode(&data)?;
    }
    Ok(Bytes::from(data))
}
