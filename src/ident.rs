/// Canonical storage key for a title or page id.
///
/// Surrounding whitespace is trimmed, then everything outside the URL-unreserved set is
/// percent-encoded, so `"Bad & Co."` becomes `"Bad%20%26%20Co."` on every run.
/// Returns `None` when nothing usable is left.
pub fn encode_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(urlencoding::encode(trimmed).into_owned())
}

/// Picks the first usable candidate in priority order: an id the serialized record
/// already carries, then the title, then the source page id.
pub fn resolve_id(
    record_id: Option<&str>,
    title: Option<&str>,
    page_id: Option<&str>,
) -> Option<String> {
    [record_id, title, page_id]
        .into_iter()
        .flatten()
        .find_map(encode_id)
}
