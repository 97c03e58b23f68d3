//! Content-Encoding handling.
//!
//! The header is validated strictly: after dropping `identity`, every token
//! must be one of gzip / deflate / br, or the whole response is rejected
//! with 415. Decoding applies the layers in reverse application order; the
//! raw bytes are retained until decoding succeeds so a decode failure can
//! fall back to serving the undecoded body.

use fetchgate_core::{ErrorKind, FetchError, Result};
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coding {
    Gzip,
    Deflate,
    Br,
}

/// Parse a `Content-Encoding` header into the applied codings, in
/// application order. `identity` tokens are dropped; anything else outside
/// the supported set rejects the response.
pub fn parse_content_encoding(header: Option<&str>) -> Result<Vec<Coding>> {
    let Some(raw) = header else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for token in raw.split(',') {
        let token = token.trim().to_ascii_lowercase();
        if token.is_empty() || token == "identity" {
            continue;
        }
        match token.as_str() {
            "gzip" | "x-gzip" => out.push(Coding::Gzip),
            "deflate" => out.push(Coding::Deflate),
            "br" => out.push(Coding::Br),
            other => {
                return Err(FetchError::new(
                    ErrorKind::UnsupportedContentEncoding,
                    format!("unsupported content encoding: {other}"),
                ));
            }
        }
    }
    Ok(out)
}

#[derive(Debug)]
pub struct DecodedBody {
    pub bytes: Vec<u8>,
    /// Decoding failed and the raw bytes are being served instead.
    pub fell_back: bool,
    /// The decoded output hit the byte cap.
    pub truncated: bool,
}

/// Read up to `cap` bytes (`0` = unlimited). `Ok(None)` means the source
/// errored before the cap was reached.
fn read_capped(mut r: impl Read, cap: usize) -> Option<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        match r.read(&mut buf) {
            Ok(0) => return Some((out, false)),
            Ok(n) => {
                if cap > 0 && out.len() + n > cap {
                    out.extend_from_slice(&buf[..cap - out.len()]);
                    return Some((out, true));
                }
                out.extend_from_slice(&buf[..n]);
                if cap > 0 && out.len() == cap {
                    // Distinguish "exactly the cap" from "more remained".
                    let mut one = [0u8; 1];
                    return match r.read(&mut one) {
                        Ok(0) => Some((out, false)),
                        _ => Some((out, true)),
                    };
                }
            }
            Err(_) => return None,
        }
    }
}

fn decode_one(bytes: &[u8], coding: Coding, cap: usize) -> Option<(Vec<u8>, bool)> {
    match coding {
        Coding::Gzip => read_capped(flate2::read::MultiGzDecoder::new(bytes), cap),
        Coding::Deflate => {
            // Both zlib-wrapped and raw deflate bodies occur in the wild.
            read_capped(flate2::read::ZlibDecoder::new(bytes), cap)
                .or_else(|| read_capped(flate2::read::DeflateDecoder::new(bytes), cap))
        }
        Coding::Br => read_capped(brotli::Decompressor::new(bytes, 8 * 1024), cap),
    }
}

/// Decode `body` through `codings` (reverse application order), capping the
/// decoded output at `max_bytes` (`0` = unlimited). Failure at any layer
/// falls back to the retained raw bytes.
pub fn decode_body(body: Vec<u8>, codings: &[Coding], max_bytes: usize) -> DecodedBody {
    if codings.is_empty() {
        return DecodedBody {
            bytes: body,
            fell_back: false,
            truncated: false,
        };
    }
    let mut current = body.clone();
    let mut truncated = false;
    for coding in codings.iter().rev() {
        match decode_one(&current, *coding, max_bytes) {
            Some((bytes, t)) => {
                current = bytes;
                truncated = truncated || t;
            }
            None => {
                tracing::warn!(
                    coding = ?coding,
                    "content-encoding decode failed; serving undecoded body"
                );
                return DecodedBody {
                    bytes: body,
                    fell_back: true,
                    truncated: false,
                };
            }
        }
    }
    DecodedBody {
        bytes: current,
        fell_back: false,
        truncated,
    }
}
