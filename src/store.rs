use crate::config::{STORE_CONNECT_RETRIES, STORE_RETRY_DELAY_SECS};
use crate::error::IngestError;
use crate::models::Record;
use anyhow::{Context, Result};
use neo4rs::{query, ConfigBuilder, Graph, Query};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Where records end up. Upserts are keyed by `Record::id`; records without an id
/// get a key assigned by the store.
pub trait RecordStore: Send + Sync {
    fn upsert(&self, record: &Record) -> impl Future<Output = Result<()>> + Send;

    fn count(&self) -> impl Future<Output = Result<u64>> + Send;

    fn close(self) -> impl Future<Output = Result<()>> + Send
    where
        Self: Sized;
}

const CYPHER_UPSERT: &str = "MERGE (a:Article {id: $id})
SET a.title = $title,
    a.body = $body,
    a.page_id = CASE $page_id WHEN '' THEN null ELSE $page_id END,
    a.media_type = CASE $media_type WHEN '' THEN null ELSE $media_type END";

const CYPHER_CREATE_UNKEYED: &str = "CREATE (a:Article {id: randomUUID()})
SET a.title = $title,
    a.body = $body,
    a.page_id = CASE $page_id WHEN '' THEN null ELSE $page_id END,
    a.media_type = CASE $media_type WHEN '' THEN null ELSE $media_type END";

const CYPHER_ID_CONSTRAINT: &str =
    "CREATE CONSTRAINT article_id_unique IF NOT EXISTS FOR (a:Article) REQUIRE a.id IS UNIQUE;";

const CYPHER_COUNT: &str = "MATCH (a:Article) RETURN count(a) AS cnt";

pub struct Neo4jSettings {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Articles stored as `(:Article {id, title, body, page_id, media_type})` nodes, with
/// `body` holding the serialized JSON document.
pub struct Neo4jStore {
    graph: Graph,
    database: String,
}

impl Neo4jStore {
    /// Connects, verifies the connection and makes sure the id constraint exists.
    pub async fn connect(settings: &Neo4jSettings) -> Result<Self> {
        let graph = connect_with_retry(settings).await?;
        graph
            .run(query(CYPHER_ID_CONSTRAINT))
            .await
            .context("Failed to create article id constraint")?;
        info!(uri = %settings.uri, database = %settings.database, "Connected to Neo4j");
        Ok(Self {
            graph,
            database: settings.database.clone(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

fn record_query(cypher: &str, record: &Record) -> Result<Query> {
    let body = serde_json::to_string(&record.body).context("Failed to serialize record body")?;
    Ok(query(cypher)
        .param("title", record.title.as_str())
        .param("body", body)
        .param("page_id", record.page_id.as_deref().unwrap_or_default())
        .param("media_type", record.media_type.as_deref().unwrap_or_default()))
}

impl RecordStore for Neo4jStore {
    async fn upsert(&self, record: &Record) -> Result<()> {
        let q = match &record.id {
            Some(id) => record_query(CYPHER_UPSERT, record)?.param("id", id.as_str()),
            None => record_query(CYPHER_CREATE_UNKEYED, record)?,
        };
        self.graph
            .run(q)
            .await
            .with_context(|| format!("Failed to upsert article: {}", record.title))
    }

    async fn count(&self) -> Result<u64> {
        let mut result = self
            .graph
            .execute(query(CYPHER_COUNT))
            .await
            .with_context(|| format!("Failed to execute count query: {CYPHER_COUNT}"))?;

        if let Some(row) = result.next().await? {
            let count: i64 = row.get("cnt").context("Missing 'cnt' field in result")?;
            Ok(count.max(0) as u64)
        } else {
            Ok(0)
        }
    }

    async fn close(self) -> Result<()> {
        // Dropping the graph closes its pooled connections
        debug!(database = %self.database, "Closing Neo4j connection");
        drop(self.graph);
        Ok(())
    }
}

async fn connect_with_retry(settings: &Neo4jSettings) -> Result<Graph> {
    let delay = Duration::from_secs(STORE_RETRY_DELAY_SECS);
    let mut last_error = String::new();

    for attempt in 1..=STORE_CONNECT_RETRIES {
        let config = ConfigBuilder::default()
            .uri(settings.uri.as_str())
            .user(settings.user.as_str())
            .password(settings.password.as_str())
            .db(settings.database.as_str())
            .build()
            .context("Invalid Neo4j connection settings")?;

        match Graph::connect(config) {
            Ok(graph) => match graph.run(query("RETURN 1;")).await {
                Ok(()) => return Ok(graph),
                Err(e) => last_error = e.to_string(),
            },
            Err(e) => last_error = e.to_string(),
        }

        if attempt < STORE_CONNECT_RETRIES {
            info!(attempt, uri = %settings.uri, "Cannot reach Neo4j, retrying: {last_error}");
            tokio::time::sleep(delay).await;
        }
    }

    Err(IngestError::StoreUnavailable(format!(
        "cannot connect to Neo4j at {} after {STORE_CONNECT_RETRIES} attempts: {last_error}",
        settings.uri
    ))
    .into())
}

/// Process-local store, used for dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keyed: Mutex<HashMap<String, Record>>,
    unkeyed: Mutex<Vec<Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.keyed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        let keyed = self.keyed.lock().unwrap_or_else(PoisonError::into_inner).len();
        let unkeyed = self.unkeyed.lock().unwrap_or_else(PoisonError::into_inner).len();
        keyed + unkeyed
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryStore {
    async fn upsert(&self, record: &Record) -> Result<()> {
        match &record.id {
            Some(id) => {
                self.keyed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id.clone(), record.clone());
            }
            None => self
                .unkeyed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(record.clone()),
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }

    async fn close(self) -> Result<()> {
        Ok(())
    }
}
