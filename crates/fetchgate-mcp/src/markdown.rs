//! HTML → Markdown adapter behind the `HtmlTranslator` seam.
//!
//! Translation quality is deliberately out of scope for the pipeline; this
//! adapter only needs to be deterministic and total. Non-HTML text bodies
//! pass through unchanged.

use fetchgate_core::{HtmlTranslator, Result, TranslatedDoc};
use std::io::Cursor;

/// Subtrees that are chrome, not content.
const NOISE_TAGS: &[&str] = &[
    "script", "style", "noscript", "nav", "header", "footer", "aside", "form", "iframe", "svg",
];

pub struct TextTranslator {
    width: usize,
}

impl TextTranslator {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.clamp(20, 240),
        }
    }
}

impl Default for TextTranslator {
    fn default() -> Self {
        Self::new(100)
    }
}

fn looks_like_html(body: &str, content_type: Option<&str>) -> bool {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if ct.contains("html") {
            return true;
        }
        // A declared non-HTML text type passes through as-is.
        if ct.starts_with("text/") || ct.contains("json") || ct.contains("yaml") {
            return false;
        }
    }
    let head = body[..body.len().min(1024)].to_ascii_lowercase();
    head.contains("<!doctype html") || head.contains("<html")
}

fn html_title(html: &str) -> Option<String> {
    let doc = html_scraper::Html::parse_document(html);
    let sel = html_scraper::Selector::parse("title").ok()?;
    let el = doc.select(&sel).next()?;
    let title: String = el.text().collect::<String>().trim().to_string();
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

/// Best-effort `<tag …>…</tag>` block removal, ASCII-case-insensitive.
/// Conservative: a block without its close tag is left alone.
fn strip_tag_blocks(html: &str, tag: &str) -> String {
    let open_pat = format!("<{}", tag.to_ascii_lowercase());
    let close_pat = format!("</{}>", tag.to_ascii_lowercase());

    let mut out = String::new();
    let mut i = 0usize;
    let lower = html.to_ascii_lowercase();
    while let Some(rel_start) = lower[i..].find(&open_pat) {
        let start = i + rel_start;
        let after_open = start + open_pat.len();
        if let Some(rel_end) = lower[after_open..].find(&close_pat) {
            let end = after_open + rel_end + close_pat.len();
            out.push_str(&html[i..start]);
            i = end;
        } else {
            break;
        }
    }
    out.push_str(&html[i..]);
    out
}

fn strip_noise(html: &str) -> String {
    let mut out = html.to_string();
    for tag in NOISE_TAGS {
        out = strip_tag_blocks(&out, tag);
    }
    out
}

impl HtmlTranslator for TextTranslator {
    fn translate(
        &self,
        body: &str,
        content_type: Option<&str>,
        skip_noise_removal: bool,
    ) -> Result<TranslatedDoc> {
        if !looks_like_html(body, content_type) {
            return Ok(TranslatedDoc {
                markdown: body.to_string(),
                title: None,
            });
        }

        let title = html_title(body);
        let cleaned = if skip_noise_removal {
            body.to_string()
        } else {
            strip_noise(body)
        };
        let markdown = html2text::from_read(Cursor::new(cleaned.as_bytes()), self.width)
            .unwrap_or(cleaned);
        let markdown = if markdown.chars().all(char::is_whitespace) {
            String::new()
        } else {
            markdown
        };
        Ok(TranslatedDoc { markdown, title })
    }
}
