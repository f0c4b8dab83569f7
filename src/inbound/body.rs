//! Best-effort plain-text body extraction from a MIME part tree.

use std::sync::LazyLock;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use regex::Regex;

static BLOCK_ELEMENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|head)\b[^>]*>.*?</(script|style|head)\s*>")
        .expect("compile block element regex")
});
static LINE_BREAKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(p|div|li|tr|h[1-6])\s*>").expect("compile line break regex")
});
static TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("compile tag regex"));
static ENTITIES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&[a-zA-Z]+;|&#[0-9]+;").expect("compile entity regex"));
static SPACES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\u{a0}]+").expect("compile whitespace regex"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n+").expect("compile blank line regex"));

/// Provider-neutral MIME tree: a node may carry inline base64url data and
/// child parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadNode {
    pub mime_type: String,
    pub data: Option<String>,
    pub children: Vec<PayloadNode>,
}

impl PayloadNode {
    /// Leaf part holding `text`, encoded the way Gmail encodes body data.
    pub fn leaf(mime_type: &str, text: &str) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            data: Some(URL_SAFE_NO_PAD.encode(text.as_bytes())),
            children: Vec::new(),
        }
    }

    pub fn multipart(mime_type: &str, children: Vec<PayloadNode>) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            data: None,
            children,
        }
    }

    fn is_multipart(&self) -> bool {
        !self.children.is_empty()
    }

    fn decoded(&self) -> Option<String> {
        self.data.as_deref().and_then(decode_body_data)
    }
}

/// Order: inline data, first `text/plain` child, first `text/html` child
/// (tags stripped), nested multipart children, then empty.
pub fn extract_body(node: &PayloadNode) -> String {
    if let Some(text) = node.decoded() {
        return text;
    }

    if !node.is_multipart() {
        return String::new();
    }

    if let Some(text) = first_child_text(node, "text/plain") {
        return text;
    }

    if let Some(html) = first_child_text(node, "text/html") {
        return strip_html(&html);
    }

    node.children
        .iter()
        .filter(|child| child.is_multipart())
        .map(extract_body)
        .find(|text| !text.is_empty())
        .unwrap_or_default()
}

fn first_child_text(node: &PayloadNode, mime_type: &str) -> Option<String> {
    node.children
        .iter()
        .filter(|child| child.mime_type.eq_ignore_ascii_case(mime_type))
        .find_map(PayloadNode::decoded)
}

/// Gmail body data is base64url, usually unpadded; tolerate padding and the
/// standard alphabet too.
pub fn decode_body_data(data: &str) -> Option<String> {
    let trimmed = data.trim().trim_end_matches('=');
    if trimmed.is_empty() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(data.trim()))
        .ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Crude regex tag stripper; good enough for a preview, not a renderer.
pub fn strip_html(html: &str) -> String {
    let text = BLOCK_ELEMENTS.replace_all(html, " ");
    let text = LINE_BREAKS.replace_all(&text, "\n");
    let text = TAGS.replace_all(&text, "");
    let text = decode_common_entities(&text);
    let text = ENTITIES.replace_all(&text, " ");
    let text = SPACES.replace_all(&text, " ");
    let text = text
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");
    BLANK_LINES.replace_all(&text, "\n\n").trim().to_string()
}

fn decode_common_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
