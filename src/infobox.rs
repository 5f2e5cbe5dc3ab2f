use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A `{{Infobox ...}}` template: its declared kind plus `key = value` parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Infobox {
    pub kind: String,
    pub fields: Vec<(String, String)>,
}

impl Infobox {
    /// Content category named by the template, e.g. `Infobox film` -> `film`.
    ///
    /// Lowercased, with the `infobox` prefix and separators stripped. `None` for a
    /// bare `{{Infobox}}`.
    pub fn media_type(&self) -> Option<String> {
        let lowered = self.kind.to_lowercase();
        let rest = lowered.strip_prefix("infobox").unwrap_or(&lowered);
        let rest = rest.trim_matches(|c: char| c.is_whitespace() || c == '_');
        if rest.is_empty() {
            return None;
        }
        Some(rest.replace('_', " "))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn to_json(&self) -> Value {
        let mut fields = Map::new();
        for (key, value) in &self.fields {
            fields.insert(key.clone(), Value::String(value.clone()));
        }
        let mut out = Map::new();
        out.insert("type".to_string(), Value::String(self.kind.clone()));
        if let Some(media) = self.media_type() {
            out.insert("mediaType".to_string(), Value::String(media));
        }
        out.insert("fields".to_string(), Value::Object(fields));
        Value::Object(out)
    }
}

pub fn extract_infoboxes(text: &str) -> Vec<Infobox> {
    let mut results = Vec::new();
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(pos) = find_infobox_start(&bytes[search_from..]) {
        let abs_pos = search_from + pos;
        match find_matching_close(bytes, abs_pos) {
            Some(close_pos) => {
                if let Some(infobox) = parse_template_body(&text[abs_pos + 2..close_pos]) {
                    results.push(infobox);
                }
                search_from = close_pos + 2;
            }
            None => search_from = abs_pos + 2,
        }
    }

    results
}

/// Case-insensitive scan over raw bytes so offsets stay valid for non-ASCII text.
fn find_infobox_start(bytes: &[u8]) -> Option<usize> {
    const NEEDLE: &[u8] = b"{{infobox";
    if bytes.len() < NEEDLE.len() {
        return None;
    }
    (0..=bytes.len() - NEEDLE.len()).find(|&i| {
        let head_matches = bytes[i..i + NEEDLE.len()]
            .iter()
            .zip(NEEDLE)
            .all(|(a, b)| a.to_ascii_lowercase() == *b);
        head_matches
            && bytes
                .get(i + NEEDLE.len())
                .is_none_or(|next| matches!(next, b' ' | b'_' | b'\n' | b'\r' | b'|' | b'}'))
    })
}

fn find_matching_close(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth: i32 = 0;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'{', b'{') => {
                depth += 1;
                i += 2;
            }
            (b'}', b'}') => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
                i += 2;
            }
            _ => i += 1,
        }
    }
    None
}

fn parse_template_body(inner: &str) -> Option<Infobox> {
    let mut segments = split_top_level(inner).into_iter();
    let kind = segments.next()?.trim().to_string();
    if kind.is_empty() {
        return None;
    }

    let fields = segments
        .filter_map(|segment| {
            let (key, value) = segment.trim().split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect();

    Some(Infobox { kind, fields })
}

/// Splits on `|` outside nested `{{ }}` and `[[ ]]`, so piped links stay in one value.
fn split_top_level(content: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let bytes = content.as_bytes();
    let mut depth: i32 = 0;
    let mut last_split = 0;
    let mut i = 0;

    while i < bytes.len() {
        let pair = bytes.get(i + 1).map(|next| (bytes[i], *next));
        match pair {
            Some((b'{', b'{')) | Some((b'[', b'[')) => {
                depth += 1;
                i += 2;
            }
            Some((b'}', b'}')) | Some((b']', b']')) => {
                depth -= 1;
                i += 2;
            }
            _ if bytes[i] == b'|' && depth == 0 => {
                segments.push(&content[last_split..i]);
                last_split = i + 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    segments.push(&content[last_split..]);
    segments
}
