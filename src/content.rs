use once_cell::sync::Lazy;
use regex::Regex;

static REDIRECT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*#redirect\s*:?\s*\[\[([^\]|#]+)(?:#[^\]|]*)?(?:\|[^\]]*)?\]\]").unwrap());

static CATEGORY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[Category:([^|\]]+?)(?:\|[^\]]+)?\]\]").unwrap());

static SECTION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(={2,})\s*(.+?)\s*={2,}\s*$").unwrap());

static IMAGE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[\[(?:File|Image):([^|\]]+?)(?:\|[^\]]*)*\]\]").unwrap());

static EXTERNAL_LINK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(https?://\S+?)(?:\s[^\]]+)?\]").unwrap());

static DISAMBIG_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\{\{(?:disambig(?:uation)?|dab|hndis|geodis|disamb|surname|given name|human name disambiguation|place name disambiguation|hospital disambiguation|airport disambiguation|letter-numbercombdisambig|school disambiguation|road disambiguation|biology disambiguation|taxonomy disambiguation|species latin name disambiguation|mathematical disambiguation|chemistry disambiguation|music disambiguation)\b").unwrap()
});

/// `[[File:..]]`, `[[Category:..]]` and other prefixed links vanish from plain text.
static NAMESPACED_LINK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[\[(?:File|Image|Category):[^\[\]]*(?:\[\[[^\]]*\]\][^\[\]]*)*\]\]").unwrap());

static PIPED_LINK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[[^|\]]*\|([^\]]+)\]\]").unwrap());

static PLAIN_LINK_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\[([^\]]+)\]\]").unwrap());

static LABELED_EXTERNAL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[https?://\S+\s([^\]]+)\]").unwrap());

static BARE_EXTERNAL_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[https?://[^\]\s]+\]").unwrap());

static REF_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<ref[^>/]*/>|<ref[^>]*>.*?</ref>").unwrap());

static COMMENT_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

static TAG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").unwrap());

static EMPHASIS_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"'{2,}").unwrap());

/// Target of a `#REDIRECT [[Target]]` page, without any section anchor.
pub fn redirect_target(text: &str) -> Option<String> {
    REDIRECT_REGEX
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty())
}

pub fn is_disambiguation(text: &str) -> bool {
    DISAMBIG_REGEX.is_match(text)
}

/// Returns the lead section (before the first `==` heading) as plain text.
pub fn extract_abstract(text: &str) -> String {
    // Strip templates first so headings inside {{Infobox ...}} don't truncate the lead.
    let stripped = strip_templates(text);

    let end_pos = SECTION_REGEX
        .find(&stripped)
        .map(|m| m.start())
        .unwrap_or(stripped.len());

    render_plain(&stripped[..end_pos])
}

pub fn extract_sections(text: &str) -> Vec<String> {
    SECTION_REGEX
        .captures_iter(text)
        .map(|c| c[2].trim().to_string())
        .collect()
}

pub fn extract_categories(text: &str) -> Vec<String> {
    CATEGORY_REGEX
        .captures_iter(text)
        .map(|c| collapse_whitespace(c[1].trim()))
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn extract_images(text: &str) -> Vec<String> {
    IMAGE_REGEX
        .captures_iter(text)
        .map(|c| collapse_whitespace(c[1].trim()))
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn extract_external_links(text: &str) -> Vec<String> {
    EXTERNAL_LINK_REGEX
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Whole article as readable text: templates, refs, comments, tags and link markup
/// removed, headings kept as their own lines.
pub fn plaintext(text: &str) -> String {
    render_plain(&strip_templates(text))
}

fn render_plain(text: &str) -> String {
    let text = COMMENT_REGEX.replace_all(text, "");
    let text = REF_REGEX.replace_all(&text, "");
    let text = NAMESPACED_LINK_REGEX.replace_all(&text, "");
    let text = PIPED_LINK_REGEX.replace_all(&text, "$1");
    let text = PLAIN_LINK_REGEX.replace_all(&text, "$1");
    let text = LABELED_EXTERNAL_REGEX.replace_all(&text, "$1");
    let text = BARE_EXTERNAL_REGEX.replace_all(&text, "");
    let text = TAG_REGEX.replace_all(&text, "");
    let text = EMPHASIS_REGEX.replace_all(&text, "");

    text.lines()
        .map(|line| line.trim().trim_matches('=').trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collapse_whitespace(s: &str) -> String {
    if s.contains(['\n', '\r']) {
        s.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        s.to_string()
    }
}

fn strip_templates(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    let mut run_start = 0;

    while i < bytes.len() {
        if i + 1 < bytes.len() && bytes[i] == b'{' && bytes[i + 1] == b'{' {
            result.push_str(&text[run_start..i]);
            let mut depth: i32 = 0;
            while i + 1 < bytes.len() {
                if bytes[i] == b'{' && bytes[i + 1] == b'{' {
                    depth += 1;
                    i += 2;
                } else if bytes[i] == b'}' && bytes[i + 1] == b'}' {
                    depth -= 1;
                    i += 2;
                    if depth == 0 {
                        break;
                    }
                } else {
                    i += 1;
                }
            }
            // Unclosed template: drop the rest
            if depth > 0 {
                i = bytes.len();
            }
            run_start = i;
        } else {
            i += 1;
        }
    }

    if run_start < bytes.len() {
        result.push_str(&text[run_start..]);
    }

    result
}
