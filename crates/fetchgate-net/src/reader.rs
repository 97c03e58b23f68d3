//! Bounded response-body reading.
//!
//! The body is streamed under a byte cap (`0` = unlimited), decoded through
//! any declared content encodings, charset-resolved (BOM > declared >
//! meta-charset > UTF-8), and rejected if it looks binary. Cancellation
//! tears the stream down mid-read.

use crate::decode::{decode_body, parse_content_encoding};
use encoding_rs::Encoding;
use fetchgate_core::{ErrorKind, FetchError, Result};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

/// How many leading bytes the NUL heuristic inspects.
const NUL_SCAN_WINDOW: usize = 1000;
/// How many leading bytes the meta-charset scan inspects.
const META_SCAN_WINDOW: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Encoding(&'static Encoding),
    Utf32Le,
    Utf32Be,
}

impl Charset {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Encoding(e) => e.name(),
            Self::Utf32Le => "UTF-32LE",
            Self::Utf32Be => "UTF-32BE",
        }
    }

    fn is_wide(&self) -> bool {
        match self {
            Self::Utf32Le | Self::Utf32Be => true,
            Self::Encoding(e) => *e == encoding_rs::UTF_16LE || *e == encoding_rs::UTF_16BE,
        }
    }

    fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Self::Encoding(e) => e.decode(bytes).0.into_owned(),
            Self::Utf32Le => decode_utf32(bytes, true),
            Self::Utf32Be => decode_utf32(bytes, false),
        }
    }
}

/// encoding_rs deliberately omits UTF-32; a BOM-detected UTF-32 body is rare
/// enough that a small lossy decoder suffices.
fn decode_utf32(bytes: &[u8], little_endian: bool) -> String {
    let mut out = String::new();
    for chunk in bytes.chunks(4) {
        if chunk.len() < 4 {
            out.push(char::REPLACEMENT_CHARACTER);
            break;
        }
        let v = if little_endian {
            u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
        } else {
            u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
        };
        out.push(char::from_u32(v).unwrap_or(char::REPLACEMENT_CHARACTER));
    }
    out
}

/// BOM sniff. UTF-32 variants are checked before UTF-16 (a UTF-32LE BOM
/// starts with the UTF-16LE BOM bytes).
fn charset_from_bom(bytes: &[u8]) -> Option<Charset> {
    if bytes.starts_with(&[0xFF, 0xFE, 0x00, 0x00]) {
        return Some(Charset::Utf32Le);
    }
    if bytes.starts_with(&[0x00, 0x00, 0xFE, 0xFF]) {
        return Some(Charset::Utf32Be);
    }
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return Some(Charset::Encoding(encoding_rs::UTF_8));
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return Some(Charset::Encoding(encoding_rs::UTF_16LE));
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        return Some(Charset::Encoding(encoding_rs::UTF_16BE));
    }
    None
}

fn charset_from_label(label: &str) -> Option<Charset> {
    let l = label.trim();
    match l.to_ascii_lowercase().as_str() {
        "utf-32" | "utf-32le" | "utf32" => return Some(Charset::Utf32Le),
        "utf-32be" => return Some(Charset::Utf32Be),
        _ => {}
    }
    Encoding::for_label(l.as_bytes()).map(Charset::Encoding)
}

/// Scan the first bytes for `<meta charset=…>` / `<meta … content="…;
/// charset=…">` or an XML `encoding="…"` declaration.
fn charset_from_meta(bytes: &[u8]) -> Option<Charset> {
    let window = &bytes[..bytes.len().min(META_SCAN_WINDOW)];
    let hay: String = window.iter().map(|b| (*b as char).to_ascii_lowercase()).collect();
    for key in ["charset=", "encoding="] {
        let mut from = 0;
        while let Some(pos) = hay[from..].find(key) {
            let start = from + pos + key.len();
            let rest = hay[start..].trim_start_matches(['"', '\'', ' ']);
            let token: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
                .collect();
            if !token.is_empty() {
                if let Some(cs) = charset_from_label(&token) {
                    return Some(cs);
                }
            }
            from = start;
        }
    }
    None
}

/// Effective charset: BOM > caller-declared > meta scan > UTF-8.
pub fn resolve_charset(bytes: &[u8], declared: Option<&str>) -> Charset {
    if let Some(cs) = charset_from_bom(bytes) {
        return cs;
    }
    if let Some(cs) = declared.and_then(charset_from_label) {
        return cs;
    }
    if let Some(cs) = charset_from_meta(bytes) {
        return cs;
    }
    Charset::Encoding(encoding_rs::UTF_8)
}

/// Magic-number table, prefix-matched at offset 0 unless noted.
const SIGNATURES: &[(&[u8], &str)] = &[
    (b"%PDF", "pdf"),
    (&[0x89, 0x50, 0x4E, 0x47], "png"),
    (b"GIF8", "gif"),
    (&[0xFF, 0xD8, 0xFF], "jpeg"),
    (b"RIFF", "riff"),
    (b"BM", "bmp"),
    (&[0x49, 0x49, 0x2A, 0x00], "tiff"),
    (&[0x4D, 0x4D, 0x00, 0x2A], "tiff"),
    (&[0x00, 0x00, 0x01, 0x00], "ico"),
    (&[0x50, 0x4B, 0x03, 0x04], "zip"),
    (&[0x50, 0x4B, 0x05, 0x06], "zip"),
    (&[0x50, 0x4B, 0x07, 0x08], "zip"),
    (&[0x1F, 0x8B], "gzip"),
    (b"BZh", "bzip2"),
    (b"Rar!", "rar"),
    (&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C], "7z"),
    (&[0x7F, 0x45, 0x4C, 0x46], "elf"),
    (b"MZ", "pe"),
    (&[0xFE, 0xED, 0xFA, 0xCE], "mach-o"),
    (&[0xFE, 0xED, 0xFA, 0xCF], "mach-o"),
    (&[0xCE, 0xFA, 0xED, 0xFE], "mach-o"),
    (&[0xCF, 0xFA, 0xED, 0xFE], "mach-o"),
    (&[0x00, 0x61, 0x73, 0x6D], "wasm"),
    (&[0x1A, 0x45, 0xDF, 0xA3], "matroska"),
    (b"FLV", "flv"),
    (b"ID3", "mp3"),
    (b"OggS", "ogg"),
    (b"fLaC", "flac"),
    (b"MThd", "midi"),
    (b"wOFF", "woff"),
    (b"wOF2", "woff2"),
    (&[0x00, 0x01, 0x00, 0x00], "ttf"),
    (b"OTTO", "otf"),
    (b"SQLite format 3\x00", "sqlite"),
];

/// Classify leading bytes as a known binary format, or via the NUL
/// heuristic (exempting wide encodings, whose text legitimately contains
/// NULs).
pub fn sniff_binary(bytes: &[u8], charset: &Charset) -> Option<&'static str> {
    for (sig, name) in SIGNATURES {
        if bytes.starts_with(sig) {
            return Some(name);
        }
    }
    // MP4-family: "ftyp" at offset 4.
    if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
        return Some("mp4");
    }
    if !charset.is_wide() && bytes[..bytes.len().min(NUL_SCAN_WINDOW)].contains(&0) {
        return Some("nul-bytes");
    }
    None
}

/// Media types the pipeline will read. A missing Content-Type passes (binary
/// detection still applies downstream).
pub fn is_text_like_media_type(content_type: &str) -> bool {
    let Ok(m) = content_type.parse::<mime::Mime>() else {
        return false;
    };
    if m.type_() == mime::TEXT {
        return true;
    }
    let essence = m.essence_str().to_string();
    const ALLOWED: &[&str] = &[
        "application/json",
        "application/ld+json",
        "application/xml",
        "application/xhtml+xml",
        "application/javascript",
        "application/ecmascript",
        "application/x-javascript",
        "application/x-yaml",
        "application/yaml",
        "application/markdown",
    ];
    if ALLOWED.contains(&essence.as_str()) {
        return true;
    }
    const SUFFIXES: &[&str] = &["+json", "+xml", "+yaml", "+text", "+markdown"];
    SUFFIXES.iter().any(|s| essence.ends_with(s))
}

#[derive(Debug)]
pub struct TextBody {
    pub text: String,
    pub size: usize,
    pub truncated: bool,
    pub charset: &'static str,
    /// Content-Encoding decode failed and the raw body was served.
    pub decode_fell_back: bool,
}

#[derive(Debug)]
pub struct BufferBody {
    pub bytes: Vec<u8>,
    pub charset: &'static str,
    pub size: usize,
    pub truncated: bool,
    pub decode_fell_back: bool,
}

/// Stream the response body under `max_bytes` (`0` = unlimited), honouring
/// cancellation. Returns the raw (still encoded) bytes.
async fn read_capped_stream(
    resp: reqwest::Response,
    max_bytes: usize,
    cancel: &CancellationToken,
) -> Result<(Vec<u8>, bool)> {
    let mut bytes: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut stream = resp.bytes_stream();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(FetchError::new(
                    ErrorKind::AbortedDuringRead,
                    "request aborted while reading response body",
                ));
            }
            c = stream.next() => c,
        };
        let Some(chunk) = chunk else { break };
        let chunk =
            chunk.map_err(|e| FetchError::new(ErrorKind::Network, format!("body read failed: {e}")))?;
        if max_bytes > 0 && bytes.len() + chunk.len() > max_bytes {
            let can_take = max_bytes - bytes.len();
            bytes.extend_from_slice(&chunk[..can_take]);
            truncated = true;
            // Dropping the stream tears the connection down.
            break;
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok((bytes, truncated))
}

struct InnerBody {
    bytes: Vec<u8>,
    charset: Charset,
    truncated: bool,
    decode_fell_back: bool,
}

async fn read_inner(
    resp: reqwest::Response,
    url: &str,
    max_bytes: usize,
    cancel: &CancellationToken,
    declared_charset: Option<&str>,
) -> Result<InnerBody> {
    let codings = parse_content_encoding(
        resp.headers()
            .get(reqwest::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok()),
    )
    .map_err(|e| e.with_url(url))?;

    let (raw, stream_truncated) = read_capped_stream(resp, max_bytes, cancel).await?;
    let decoded = decode_body(raw, &codings, max_bytes);

    let charset = resolve_charset(&decoded.bytes, declared_charset);
    if let Some(format) = sniff_binary(&decoded.bytes, &charset) {
        return Err(FetchError::new(
            ErrorKind::BinaryContent,
            format!("binary content detected ({format})"),
        )
        .with_url(url));
    }

    Ok(InnerBody {
        truncated: stream_truncated || decoded.truncated,
        decode_fell_back: decoded.fell_back,
        bytes: decoded.bytes,
        charset,
    })
}

/// Read, decode, charset-resolve, and binary-check a response body,
/// returning decoded bytes.
pub async fn read_buffer(
    resp: reqwest::Response,
    url: &str,
    max_bytes: usize,
    cancel: &CancellationToken,
    declared_charset: Option<&str>,
) -> Result<BufferBody> {
    let inner = read_inner(resp, url, max_bytes, cancel, declared_charset).await?;
    Ok(BufferBody {
        size: inner.bytes.len(),
        charset: inner.charset.label(),
        truncated: inner.truncated,
        decode_fell_back: inner.decode_fell_back,
        bytes: inner.bytes,
    })
}

/// `read_buffer` + charset decode to a string.
pub async fn read_text(
    resp: reqwest::Response,
    url: &str,
    max_bytes: usize,
    cancel: &CancellationToken,
    declared_charset: Option<&str>,
) -> Result<TextBody> {
    let inner = read_inner(resp, url, max_bytes, cancel, declared_charset).await?;
    Ok(TextBody {
        text: inner.charset.decode(&inner.bytes),
        size: inner.bytes.len(),
        truncated: inner.truncated,
        charset: inner.charset.label(),
        decode_fell_back: inner.decode_fell_back,
    })
}
