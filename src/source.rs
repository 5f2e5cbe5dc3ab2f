use crate::config::READ_BUFFER_BYTES;
use crate::error::IngestError;
use bzip2::read::MultiBzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::debug;

const BZIP2_MAGIC: &[u8] = b"BZh";

/// Opens `path` as a buffered byte stream, decompressing bzip2 on the fly.
///
/// Compression is detected from the `.bz2` extension or the stream's magic bytes, so
/// a renamed dump still decodes. Dumps are often multistream, hence `MultiBzDecoder`.
pub fn open(path: &Path) -> Result<Box<dyn BufRead + Send>, IngestError> {
    let file = File::open(path).map_err(|source| IngestError::SourceUnavailable {
        path: path.to_path_buf(),
        source,
    })?;

    let mut raw = BufReader::with_capacity(READ_BUFFER_BYTES, file);
    let has_magic = raw
        .fill_buf()
        .map_err(|source| IngestError::SourceUnavailable {
            path: path.to_path_buf(),
            source,
        })?
        .starts_with(BZIP2_MAGIC);
    let has_extension = path.extension().is_some_and(|e| e == "bz2");

    if has_magic || has_extension {
        debug!(path = %path.display(), "Opening bzip2 source");
        Ok(Box::new(BufReader::with_capacity(
            READ_BUFFER_BYTES,
            MultiBzDecoder::new(raw),
        )))
    } else {
        debug!(path = %path.display(), "Opening plain XML source");
        Ok(Box::new(raw))
    }
}
