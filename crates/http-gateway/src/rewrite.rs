use std::sync::OnceLock;

use regex::Regex;

/// The result of a [`RewriteRule`] looking at a response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOutcome {
    /// Leave the body as it is.
    Unchanged,
    /// Replace the body with the given text.
    Replaced(String),
}

/// A content-type scoped transformation of response bodies.
///
/// Rules are built once at startup and shared by every request. Like the
/// rest of the pipeline they are synchronous and must not perform I/O.
pub trait RewriteRule: Send + Sync {
    /// Short name used in log fields.
    fn name(&self) -> &str;

    /// Whether this rule applies to a response with the given `Content-Type`
    /// header value.
    fn matches(&self, content_type: &str) -> bool;

    /// Transform a body. Must be idempotent: applying the rule to its own
    /// output yields [`RewriteOutcome::Unchanged`].
    fn apply(&self, body: &str) -> RewriteOutcome;
}

/// Run every matching rule over `body` in order and return the final text if
/// anything changed.
pub fn run_rules(rules: &[std::sync::Arc<dyn RewriteRule>], content_type: &str, body: &str) -> Option<String> {
    let mut current: Option<String> = None;

    for rule in rules {
        if !rule.matches(content_type) {
            continue;
        }
        let input = current.as_deref().unwrap_or(body);
        if let RewriteOutcome::Replaced(text) = rule.apply(input) {
            tracing::trace!(rule = rule.name(), "response body rewritten");
            current = Some(text);
        }
    }

    current
}

/// Marker attribute on the injected style block, used to detect a previous
/// injection.
const STYLE_MARKER: &str = "data-remote-gateway";

const VIEWPORT_TAG: &str =
    r#"<meta name="viewport" content="width=device-width, initial-scale=1">"#;

const MOBILE_CSS: &str = "\
html{-webkit-text-size-adjust:100%;text-size-adjust:100%}\
body{margin:0;max-width:100vw;overflow-x:hidden;word-wrap:break-word}\
img,video,canvas,svg,iframe{max-width:100%;height:auto}\
pre,code{white-space:pre-wrap;word-break:break-word}\
table{display:block;max-width:100%;overflow-x:auto}\
input,select,textarea,button{font-size:16px}";

/// Makes HTML pages usable on phones: adds a viewport meta tag and a small
/// block of responsive CSS unless the page already has them.
#[derive(Debug, Default, Clone)]
pub struct MobileViewportRule;

impl MobileViewportRule {
    pub fn new() -> Self {
        Self
    }
}

impl RewriteRule for MobileViewportRule {
    fn name(&self) -> &str {
        "mobile-viewport"
    }

    fn matches(&self, content_type: &str) -> bool {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        mime == "text/html" || mime == "application/xhtml+xml"
    }

    fn apply(&self, body: &str) -> RewriteOutcome {
        let mut injection = String::new();
        if !has_viewport_meta(body) {
            injection.push_str(VIEWPORT_TAG);
        }
        if !body.contains(STYLE_MARKER) {
            injection.push_str("<style ");
            injection.push_str(STYLE_MARKER);
            injection.push('>');
            injection.push_str(MOBILE_CSS);
            injection.push_str("</style>");
        }
        if injection.is_empty() {
            return RewriteOutcome::Unchanged;
        }

        let mut out = String::with_capacity(body.len() + injection.len());
        match find_head_close(body) {
            Some(anchor) => {
                out.push_str(&body[..anchor]);
                out.push_str(&injection);
                out.push_str(&body[anchor..]);
            }
            None => {
                // No usable anchor: append at the very end.
                out.push_str(body);
                out.push_str(&injection);
            }
        }
        RewriteOutcome::Replaced(out)
    }
}

fn viewport_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<meta\b[^>]*\bname\s*=\s*["']?viewport\b"#)
            .expect("viewport pattern is valid")
    })
}

/// Whether the document declares a viewport meta tag anywhere.
fn has_viewport_meta(body: &str) -> bool {
    viewport_regex().is_match(body)
}

/// Byte offset of the first `</head>` tag that is real markup, skipping
/// comments and the raw text of `<script>` and `<style>` elements.
fn find_head_close(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut i = 0;

    while let Some(offset) = body[i..].find('<') {
        let start = i + offset;
        let rest = &body[start..];

        if rest.starts_with("<!--") {
            i = match rest.find("-->") {
                Some(end) => start + end + 3,
                None => return None,
            };
            continue;
        }

        if let Some(raw) = raw_text_element(rest) {
            // Skip to the matching close tag of the raw-text element.
            let close = format!("</{raw}");
            i = match find_ascii_case_insensitive(&body[start + 1..], &close) {
                Some(end) => start + 1 + end + close.len(),
                None => return None,
            };
            continue;
        }

        if starts_with_tag(rest, "/head") {
            return Some(start);
        }

        i = start + 1;
        if i >= bytes.len() {
            break;
        }
    }

    None
}

/// If `rest` opens a `<script>` or `<style>` element, return its name.
fn raw_text_element(rest: &str) -> Option<&'static str> {
    ["script", "style"]
        .into_iter()
        .find(|name| starts_with_tag(rest, name))
}

/// Whether `rest` (starting at `<`) opens the tag `name`, compared
/// case-insensitively and terminated by whitespace, `>` or `/`.
fn starts_with_tag(rest: &str, name: &str) -> bool {
    let after_lt = &rest.as_bytes()[1..];
    if after_lt.len() < name.len() || !after_lt[..name.len()].eq_ignore_ascii_case(name.as_bytes()) {
        return false;
    }
    match after_lt.get(name.len()) {
        None => false,
        Some(b) => b.is_ascii_whitespace() || *b == b'>' || *b == b'/',
    }
}

fn find_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let hay = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.len() > hay.len() {
        return None;
    }
    (0..=hay.len() - needle.len()).find(|&i| hay[i..i + needle.len()].eq_ignore_ascii_case(needle))
}
