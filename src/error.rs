use std::path::PathBuf;
use thiserror::Error;

/// Failures the pipeline distinguishes between.
///
/// `SourceUnavailable` and `StoreUnavailable` end the run. `MalformedSource` ends the
/// stream early but the run still finishes. `Markup` only costs the one page.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("cannot open source {path:?}: {source}")]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed source: {0}")]
    MalformedSource(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("markup parse failed: {0}")]
    Markup(String),
}
