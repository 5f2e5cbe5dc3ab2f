use crate::ident::resolve_id;
use crate::infobox::Infobox;
use crate::markup::{Document, MarkupParser};
use crate::models::{RawPage, Record};
use crate::stats::RunCounters;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Replaces the default serialization of a parsed document.
pub type CustomTransform = Arc<dyn Fn(&dyn Document) -> Value + Send + Sync>;

/// Per-run settings, shared read-only by every page transform.
#[derive(Clone, Default)]
pub struct TransformOptions {
    pub skip_redirects: bool,
    pub skip_disambiguation: bool,
    /// When set, only pages whose media type is listed survive
    pub media_filter: Option<HashSet<String>>,
    pub plain_text_mode: bool,
    pub custom_transform: Option<CustomTransform>,
    /// Log skipped pages at info instead of debug
    pub verbose_skip: bool,
}

impl fmt::Debug for TransformOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformOptions")
            .field("skip_redirects", &self.skip_redirects)
            .field("skip_disambiguation", &self.skip_disambiguation)
            .field("media_filter", &self.media_filter)
            .field("plain_text_mode", &self.plain_text_mode)
            .field("custom_transform", &self.custom_transform.is_some())
            .field("verbose_skip", &self.verbose_skip)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ParseError,
    MediaFiltered,
    Redirect,
    Disambiguation,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ParseError => "parse error",
            SkipReason::MediaFiltered => "media filtered",
            SkipReason::Redirect => "redirect",
            SkipReason::Disambiguation => "disambiguation",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Transformed(Record),
    Skipped(SkipReason),
}

/// Decodes the five XML escapes that survive in dump text. `&amp;` goes last so
/// `&amp;lt;` ends up as `&lt;`, not `<`. Other entities are left alone.
pub fn unescape_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

pub struct PageTransformer<P: MarkupParser> {
    parser: P,
    options: TransformOptions,
}

impl<P: MarkupParser> PageTransformer<P> {
    pub fn new(parser: P, options: TransformOptions) -> Self {
        Self { parser, options }
    }

    pub fn options(&self) -> &TransformOptions {
        &self.options
    }

    pub fn transform(&self, page: &RawPage, counters: &RunCounters) -> Outcome {
        self.transform_with(page, &self.options, counters)
    }

    /// Turns one page into a record, or says why it was dropped.
    ///
    /// Filters run in order media type, redirect, disambiguation; the first match wins.
    /// Parse failures are logged and skipped without touching the counters.
    pub fn transform_with(
        &self,
        page: &RawPage,
        options: &TransformOptions,
        counters: &RunCounters,
    ) -> Outcome {
        let body = unescape_entities(&page.wiki_text);

        let mut doc = match self.parser.parse(&body, options) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(title = %page.title, error = %e, "Failed to parse article");
                return Outcome::Skipped(SkipReason::ParseError);
            }
        };

        let media_type = doc.infobox().and_then(Infobox::media_type);

        if let Some(allowed) = &options.media_filter {
            let keep = media_type.as_ref().is_some_and(|m| allowed.contains(m));
            if !keep {
                log_skip(options, page, SkipReason::MediaFiltered);
                return Outcome::Skipped(SkipReason::MediaFiltered);
            }
        }

        if options.skip_redirects && (page.redirect || doc.is_redirect()) {
            counters.inc_redirect_skips();
            log_skip(options, page, SkipReason::Redirect);
            return Outcome::Skipped(SkipReason::Redirect);
        }

        if options.skip_disambiguation && doc.is_disambiguation() {
            counters.inc_disambiguation_skips();
            log_skip(options, page, SkipReason::Disambiguation);
            return Outcome::Skipped(SkipReason::Disambiguation);
        }

        // The dump's title wins over anything the parser inferred
        doc.set_title(page.title.clone());

        let serialized = match &options.custom_transform {
            Some(custom) => custom(&doc),
            None => doc.to_json(options),
        };

        Outcome::Transformed(build_record(serialized, page, media_type))
    }
}

fn log_skip(options: &TransformOptions, page: &RawPage, reason: SkipReason) {
    if options.verbose_skip {
        info!(title = %page.title, %reason, "Skipping page");
    } else {
        debug!(title = %page.title, %reason, "Skipping page");
    }
}

/// Lifts `id`, `title` and `pageId` out of the serialized document into the record
/// envelope, falling back to the page's own title and id.
fn build_record(mut serialized: Value, page: &RawPage, media_type: Option<String>) -> Record {
    let (record_id, title, page_id) = match serialized.as_object_mut() {
        Some(map) => (
            map.remove("id").and_then(string_value),
            map.remove("title").and_then(string_value),
            map.remove("pageId").and_then(string_value),
        ),
        None => (None, None, None),
    };

    let title = title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| page.title.clone());
    let page_id = page_id.or_else(|| page.page_id.clone());
    let id = resolve_id(record_id.as_deref(), Some(&title), page_id.as_deref());

    Record {
        id,
        title,
        page_id,
        media_type,
        body: serialized,
    }
}

fn string_value(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::markup::WikitextParser;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn page(title: &str, text: &str) -> RawPage {
        RawPage {
            title: title.to_string(),
            namespace: "0".to_string(),
            page_id: Some("42".to_string()),
            wiki_text: text.to_string(),
            redirect: false,
        }
    }

    fn transformer(options: TransformOptions) -> PageTransformer<WikitextParser> {
        PageTransformer::new(WikitextParser::new(), options)
    }

    fn expect_record(outcome: Outcome) -> Record {
        match outcome {
            Outcome::Transformed(record) => record,
            Outcome::Skipped(reason) => panic!("unexpected skip: {reason}"),
        }
    }

    /// Parser that always fails, counting how often it was called.
    struct FailingParser {
        calls: AtomicUsize,
    }

    impl MarkupParser for FailingParser {
        type Doc = crate::markup::WikiDocument;

        fn parse(
            &self,
            _text: &str,
            _options: &TransformOptions,
        ) -> Result<Self::Doc, IngestError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(IngestError::Markup("boom".to_string()))
        }
    }

    #[test]
    fn unescape_supported_entities() {
        assert_eq!(
            unescape_entities("&apos;a&apos; &quot;b&quot; &lt;c&gt; d &amp; e"),
            "'a' \"b\" <c> d & e"
        );
    }

    #[test]
    fn unescape_leaves_everything_else() {
        let text = "&copy; &nbsp; &#169; & plain\nline two";
        assert_eq!(unescape_entities(text), text);
    }

    #[test]
    fn unescape_decodes_once() {
        assert_eq!(unescape_entities("&amp;lt;"), "&lt;");
    }

    #[test]
    fn redirect_skipped_and_counted() {
        let counters = RunCounters::new();
        let t = transformer(TransformOptions {
            skip_redirects: true,
            ..Default::default()
        });
        let outcome = t.transform(&page("Redirect Test", "#REDIRECT [[Target]]"), &counters);
        assert_eq!(outcome, Outcome::Skipped(SkipReason::Redirect));
        assert_eq!(counters.redirect_skips(), 1);
        assert_eq!(counters.processed(), 0);
    }

    #[test]
    fn dump_redirect_marker_counts_as_redirect() {
        let counters = RunCounters::new();
        let t = transformer(TransformOptions {
            skip_redirects: true,
            ..Default::default()
        });
        let mut p = page("Marked", "no redirect markup here");
        p.redirect = true;
        assert_eq!(t.transform(&p, &counters), Outcome::Skipped(SkipReason::Redirect));
    }

    #[test]
    fn redirect_kept_when_filter_off() {
        let counters = RunCounters::new();
        let record = expect_record(
            transformer(TransformOptions::default())
                .transform(&page("Redirect Test", "#REDIRECT [[Target]]"), &counters),
        );
        assert_eq!(record.body["redirectTo"], "Target");
        assert_eq!(counters.redirect_skips(), 0);
    }

    #[test]
    fn disambiguation_kept_when_filter_off() {
        let counters = RunCounters::new();
        let record = expect_record(
            transformer(TransformOptions::default())
                .transform(&page("Ambiguous", "* [[A]]\n* [[B]]\n{{disambiguation}}"), &counters),
        );
        assert_eq!(record.title, "Ambiguous");
        assert_eq!(counters.disambiguation_skips(), 0);
    }

    #[test]
    fn disambiguation_skipped_when_filter_on() {
        let counters = RunCounters::new();
        let t = transformer(TransformOptions {
            skip_disambiguation: true,
            ..Default::default()
        });
        let outcome = t.transform(&page("Ambiguous", "{{disambiguation}}"), &counters);
        assert_eq!(outcome, Outcome::Skipped(SkipReason::Disambiguation));
        assert_eq!(counters.disambiguation_skips(), 1);
    }

    #[test]
    fn media_filter_rejects_other_types() {
        let counters = RunCounters::new();
        let t = transformer(TransformOptions {
            media_filter: Some(HashSet::from(["film".to_string()])),
            ..Default::default()
        });
        let outcome = t.transform(&page("Thriller", "{{Infobox album\n| name = Thriller\n}}"), &counters);
        assert_eq!(outcome, Outcome::Skipped(SkipReason::MediaFiltered));
        assert_eq!(counters.snapshot(), RunCounters::new().snapshot());
    }

    #[test]
    fn media_filter_rejects_missing_type_and_keeps_match() {
        let counters = RunCounters::new();
        let t = transformer(TransformOptions {
            media_filter: Some(HashSet::from(["film".to_string()])),
            ..Default::default()
        });
        assert_eq!(
            t.transform(&page("Plain", "no infobox"), &counters),
            Outcome::Skipped(SkipReason::MediaFiltered)
        );
        let record = expect_record(t.transform(&page("Alien", "{{Infobox film\n| name = Alien\n}}"), &counters));
        assert_eq!(record.media_type.as_deref(), Some("film"));
    }

    #[test]
    fn media_filter_short_circuits_redirect_count() {
        let counters = RunCounters::new();
        let t = transformer(TransformOptions {
            skip_redirects: true,
            media_filter: Some(HashSet::from(["film".to_string()])),
            ..Default::default()
        });
        let outcome = t.transform(&page("R", "#REDIRECT [[Alien]]"), &counters);
        assert_eq!(outcome, Outcome::Skipped(SkipReason::MediaFiltered));
        assert_eq!(counters.redirect_skips(), 0);
    }

    #[test]
    fn escaped_ampersand_becomes_literal() {
        let counters = RunCounters::new();
        let record = expect_record(
            transformer(TransformOptions {
                plain_text_mode: true,
                ..Default::default()
            })
            .transform(&page("Bad & Co.", "Bad &amp; Co. is a firm."), &counters),
        );
        assert_eq!(record.title, "Bad & Co.");
        assert_eq!(record.body["plaintext"], "Bad & Co. is a firm.");
        assert_eq!(record.id.as_deref(), Some("Bad%20%26%20Co."));
    }

    #[test]
    fn id_is_stable_across_runs() {
        let a = expect_record(transformer(TransformOptions::default()).transform(&page("Zürich", "x"), &RunCounters::new()));
        let b = expect_record(transformer(TransformOptions::default()).transform(&page("Zürich", "x"), &RunCounters::new()));
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.as_deref(), Some("Z%C3%BCrich"));
    }

    #[test]
    fn empty_body_produces_minimal_record() {
        let record = expect_record(
            transformer(TransformOptions::default()).transform(&page("Empty", ""), &RunCounters::new()),
        );
        assert_eq!(record.title, "Empty");
        assert_eq!(record.page_id.as_deref(), Some("42"));
        assert_eq!(record.body["abstract"], "");
        assert!(record.body.get("title").is_none());
    }

    #[test]
    fn parse_error_is_skipped_without_counting() {
        let parser = FailingParser {
            calls: AtomicUsize::new(0),
        };
        let t = PageTransformer::new(parser, TransformOptions::default());
        let counters = RunCounters::new();
        assert_eq!(
            t.transform(&page("Broken", "x"), &counters),
            Outcome::Skipped(SkipReason::ParseError)
        );
        assert_eq!(counters.snapshot(), RunCounters::new().snapshot());
        assert_eq!(t.parser.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn custom_transform_replaces_shape_and_may_set_id() {
        let custom: CustomTransform = Arc::new(|doc: &dyn Document| {
            json!({
                "id": "custom-key",
                "headline": doc.title().unwrap_or_default().to_uppercase(),
            })
        });
        let t = transformer(TransformOptions {
            custom_transform: Some(custom),
            ..Default::default()
        });
        let record = expect_record(t.transform(&page("Rust", "{{Infobox software}}"), &RunCounters::new()));
        assert_eq!(record.id.as_deref(), Some("custom-key"));
        assert_eq!(record.title, "Rust");
        assert_eq!(record.body, json!({ "headline": "RUST" }));
        assert_eq!(record.media_type.as_deref(), Some("software"));
    }

    #[test]
    fn custom_transform_without_object_falls_back_to_title_id() {
        let custom: CustomTransform = Arc::new(|_: &dyn Document| json!("just a string"));
        let t = transformer(TransformOptions {
            custom_transform: Some(custom),
            ..Default::default()
        });
        let record = expect_record(t.transform(&page("Rust", ""), &RunCounters::new()));
        assert_eq!(record.id.as_deref(), Some("Rust"));
        assert_eq!(record.body, json!("just a string"));
    }
}
