/// Namespace of genuine articles; every other namespace is dropped at parse time
pub const MAIN_NAMESPACE: &str = "0";

/// Job type used for queued article writes
pub const JOB_TYPE_ARTICLE: &str = "article";

/// Maximum attempts per queued job (first run included)
pub const QUEUE_MAX_ATTEMPTS: u32 = 3;

/// First retry delay; doubles on every further failure
pub const QUEUE_BACKOFF_INITIAL_SECS: u64 = 10;

/// Grace period after end of stream in queued mode
pub const DRAIN_GRACE_SECS: u64 = 20;

pub const DEFAULT_DB: &str = "neo4j";

pub const DEFAULT_BOLT_URI: &str = "bolt://localhost:7687";

pub const DEFAULT_QUEUE_PATH: &str = "wikisink-queue.db";

/// Connection attempts before the store is declared unreachable
pub const STORE_CONNECT_RETRIES: u32 = 5;

pub const STORE_RETRY_DELAY_SECS: u64 = 2;

/// Buffer between the decompressor and the XML reader
pub const READ_BUFFER_BYTES: usize = 1024 * 1024;

/// Article bodies above this size are rejected by the markup parser.
/// MediaWiki caps pages at 2 MiB, so anything larger is corrupt input.
pub const MAX_WIKITEXT_BYTES: usize = 8 * 1024 * 1024;

pub const WORKER_POLL_INTERVAL_MS: u64 = 500;

pub const WORKER_CONCURRENCY: usize = 4;
