//! Wikisink: streaming Wikipedia dump ingest into Neo4j
//!
//! Reads a MediaWiki XML export (plain or bzip2, multistream included) page by page,
//! turns each main-namespace article into a JSON record and upserts it into a graph
//! store keyed by a stable, URL-encoded id.
//!
//! 1. **Source** -- Open the dump, detecting bzip2 by magic bytes
//! 2. **Parse** -- Stream `<page>` elements with quick-xml; only namespace 0 survives
//! 3. **Transform** -- Parse wikitext, apply the media/redirect/disambiguation filters,
//!    serialize, resolve the id
//! 4. **Dispatch** -- Write directly to the store, or enqueue the raw page in a durable
//!    SQLite queue for `wikisink work` to process with retries
//!
//! A malformed dump ends the stream early but not the run; pages already dispatched
//! stay written. Per-page failures are logged and counted, never fatal.
//!
//! # Key Modules
//!
//! - [`source`] -- Byte source with transparent bzip2 decompression
//! - [`parser`] -- Streaming page reader
//! - [`transform`] -- Per-page filtering and record building
//! - [`markup`] -- Wikitext document model behind the [`markup::MarkupParser`] seam
//! - [`content`] / [`infobox`] -- Wikitext extraction helpers
//! - [`store`] -- Neo4j and in-memory record stores
//! - [`queue`] -- SQLite job queue with retry policy
//! - [`dispatch`] -- Direct vs queued routing of pages
//! - [`run`] -- Run lifecycle and summary
//! - [`worker`] -- Queue consumer
//! - [`stats`] -- Atomic run counters
//!
//! # Example Usage
//!
//! ```bash
//! # Ingest straight into Neo4j, dropping redirects and disambiguation pages
//! wikisink enwiki-latest-pages-articles.xml.bz2 --skip-redirects --skip-disambig -v
//!
//! # Queue films only, then drain the queue
//! wikisink enwiki-latest-pages-articles.xml.bz2 --worker --media film
//! wikisink work --exit-when-empty
//! ```

pub mod config;
pub mod content;
pub mod dispatch;
pub mod error;
pub mod ident;
pub mod infobox;
pub mod markup;
pub mod models;
pub mod parser;
pub mod queue;
pub mod run;
pub mod source;
pub mod stats;
pub mod store;
pub mod transform;
pub mod worker;
