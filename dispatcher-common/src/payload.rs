//! Response body encoding for the external transport envelope (distilled
//! spec §4.5). Text-like bodies are re-encoded as UTF-8 and gzip-compressed
//! past a size threshold when compression actually shrinks them; everything
//! else is base64'd as opaque binary.

use base64::Engine;
use std::io::{Read, Write};

use crate::response::{BodyEncoding, EncodedBody};

/// Bodies at or above this size are gzip-compressed if doing so shrinks them.
const GZIP_THRESHOLD_BYTES: usize = 4096;

fn is_text_like(content_type: &str) -> bool {
    let mime = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    mime.starts_with("text/")
        || matches!(
            mime.as_str(),
            "application/json" | "application/xml" | "application/javascript"
        )
}

fn charset_of(content_type: &str) -> String {
    content_type
        .split(';')
        .skip(1)
        .find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            key.eq_ignore_ascii_case("charset").then(|| value.trim().to_owned())
        })
        .unwrap_or_else(|| "utf-8".to_owned())
}

/// Encode a raw response body for the envelope, given its declared
/// `Content-Type` header (or an empty string if absent).
pub fn encode_body(bytes: &[u8], content_type: &str) -> EncodedBody {
    if is_text_like(content_type) {
        if let Ok(text) = std::str::from_utf8(bytes) {
            let charset = charset_of(content_type);
            if bytes.len() >= GZIP_THRESHOLD_BYTES {
                if let Some(gzipped) = gzip_if_smaller(bytes) {
                    return EncodedBody {
                        encoding: BodyEncoding::Gzipped,
                        value: base64::engine::general_purpose::STANDARD.encode(gzipped),
                        charset,
                    };
                }
            }
            return EncodedBody {
                encoding: BodyEncoding::Text,
                value: text.to_owned(),
                charset,
            };
        }
    }

    EncodedBody {
        encoding: BodyEncoding::Binary,
        value: base64::engine::general_purpose::STANDARD.encode(bytes),
        charset: "binary".to_owned(),
    }
}

/// Decode an `EncodedBody` back into raw bytes. Inverse of `encode_body`.
pub fn decode_body(body: &EncodedBody) -> Result<Vec<u8>, PayloadError> {
    match body.encoding {
        BodyEncoding::Text => Ok(body.value.clone().into_bytes()),
        BodyEncoding::Gzipped => {
            let compressed = base64::engine::general_purpose::STANDARD
                .decode(&body.value)
                .map_err(|e| PayloadError::Decode(e.to_string()))?;
            let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| PayloadError::Decode(e.to_string()))?;
            Ok(out)
        }
        BodyEncoding::Binary => base64::engine::general_purpose::STANDARD
            .decode(&body.value)
            .map_err(|e| PayloadError::Decode(e.to_string())),
    }
}

fn gzip_if_smaller(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes).ok()?;
    let compressed = encoder.finish().ok()?;
    (compressed.len() < bytes.len()).then_some(compressed)
}

#[derive(thiserror::Error, Debug)]
pub enum PayloadError {
    #[error("failed to decode payload: {0}")]
    Decode(String),
}
