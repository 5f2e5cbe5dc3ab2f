//! Boundary between the pipeline and article markup.
//!
//! The pipeline only needs the capabilities in [`Document`]; [`WikitextParser`] is the
//! built-in implementation, and callers can plug in any other [`MarkupParser`].

use crate::config::MAX_WIKITEXT_BYTES;
use crate::content;
use crate::error::IngestError;
use crate::infobox::{extract_infoboxes, Infobox};
use crate::transform::TransformOptions;
use serde_json::{json, Map, Value};

/// A parsed article.
pub trait Document {
    fn is_redirect(&self) -> bool;
    fn is_disambiguation(&self) -> bool;
    /// First infobox on the page, if any
    fn infobox(&self) -> Option<&Infobox>;
    fn title(&self) -> Option<&str>;
    fn set_title(&mut self, title: String);
    /// Default storable shape of the document
    fn to_json(&self, options: &TransformOptions) -> Value;
}

pub trait MarkupParser: Send + Sync {
    type Doc: Document;

    fn parse(&self, text: &str, options: &TransformOptions) -> Result<Self::Doc, IngestError>;
}

#[derive(Debug, Clone, Default)]
pub struct WikitextParser;

impl WikitextParser {
    pub fn new() -> Self {
        Self
    }
}

impl MarkupParser for WikitextParser {
    type Doc = WikiDocument;

    fn parse(&self, text: &str, options: &TransformOptions) -> Result<WikiDocument, IngestError> {
        if text.len() > MAX_WIKITEXT_BYTES {
            return Err(IngestError::Markup(format!(
                "article body is {} bytes, limit is {MAX_WIKITEXT_BYTES}",
                text.len()
            )));
        }

        // Plain-text runs never look at infoboxes, so skip finding them.
        let infoboxes = if options.plain_text_mode {
            Vec::new()
        } else {
            extract_infoboxes(text)
        };

        Ok(WikiDocument {
            title: None,
            redirect_target: content::redirect_target(text),
            disambiguation: content::is_disambiguation(text),
            infoboxes,
            text: text.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WikiDocument {
    title: Option<String>,
    redirect_target: Option<String>,
    disambiguation: bool,
    infoboxes: Vec<Infobox>,
    text: String,
}

impl WikiDocument {
    pub fn redirect_target(&self) -> Option<&str> {
        self.redirect_target.as_deref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl Document for WikiDocument {
    fn is_redirect(&self) -> bool {
        self.redirect_target.is_some()
    }

    fn is_disambiguation(&self) -> bool {
        self.disambiguation
    }

    fn infobox(&self) -> Option<&Infobox> {
        self.infoboxes.first()
    }

    fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    fn set_title(&mut self, title: String) {
        self.title = Some(title);
    }

    fn to_json(&self, options: &TransformOptions) -> Value {
        let mut out = Map::new();
        if let Some(title) = &self.title {
            out.insert("title".to_string(), json!(title));
        }

        if options.plain_text_mode {
            out.insert("plaintext".to_string(), json!(content::plaintext(&self.text)));
            return Value::Object(out);
        }

        if let Some(target) = &self.redirect_target {
            out.insert("redirectTo".to_string(), json!(target));
        }
        if self.disambiguation {
            out.insert("isDisambiguation".to_string(), json!(true));
        }
        out.insert("abstract".to_string(), json!(content::extract_abstract(&self.text)));
        out.insert("sections".to_string(), json!(content::extract_sections(&self.text)));
        out.insert("categories".to_string(), json!(content::extract_categories(&self.text)));
        out.insert("images".to_string(), json!(content::extract_images(&self.text)));
        out.insert(
            "externalLinks".to_string(),
            json!(content::extract_external_links(&self.text)),
        );
        out.insert(
            "infoboxes".to_string(),
            Value::Array(self.infoboxes.iter().map(Infobox::to_json).collect()),
        );
        Value::Object(out)
    }
}
