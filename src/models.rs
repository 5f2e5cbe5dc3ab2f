use crate::config::MAIN_NAMESPACE;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One `<page>` as it appeared in the dump. Consumed as soon as it is transformed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    pub title: String,
    pub namespace: String,
    pub page_id: Option<String>,
    /// Article body with the original line structure intact
    pub wiki_text: String,
    /// Set when the dump marks the page with `<redirect/>`
    pub redirect: bool,
}

impl RawPage {
    pub fn is_article(&self) -> bool {
        self.namespace == MAIN_NAMESPACE
    }
}

/// Storable output for one surviving page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Upsert key; absent when no usable id could be derived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub body: Value,
}
