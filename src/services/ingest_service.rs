//! Turns an upload body of possibly unknown length into a stream of exact,
//! known length, as required by [`ObjectStore::put`].
//!
//! [`ObjectStore::put`]: crate::services::object_store::ObjectStore::put

use std::{
    io::{self, Cursor},
    path::PathBuf,
};
use tempfile::TempPath;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;

/// Bodies up to this size are buffered in memory; larger ones spill to disk.
pub const MEMORY_THRESHOLD: u64 = 24 * 1024 * 1024;

const SPILL_PREFIX: &str = "transfer-";

/// An upload body with its final length.
///
/// When the body was spilled to disk the temporary file belongs to this
/// value and is removed when it is dropped.
pub struct IngestedBody<'a> {
    pub reader: Box<dyn AsyncRead + Send + Unpin + 'a>,
    pub len: u64,
    spill: Option<TempPath>,
}

impl IngestedBody<'_> {
    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct Ingestor {
    temp_dir: PathBuf,
    threshold: u64,
}

impl Ingestor {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self::with_threshold(temp_dir, MEMORY_THRESHOLD)
    }

    pub fn with_threshold(temp_dir: impl Into<PathBuf>, threshold: u64) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            threshold,
        }
    }

    /// Materialize `source` so its exact length is known.
    ///
    /// A declared length passes the source straight through. Otherwise up
    /// to `threshold` bytes are buffered in memory; anything longer is
    /// copied, buffered prefix first, into a temporary file that is then
    /// reopened for reading.
    pub async fn ingest<'a, R>(&self, mut source: R, declared_len: Option<u64>) -> io::Result<IngestedBody<'a>>
    where
        R: AsyncRead + Send + Unpin + 'a,
    {
        if let Some(len) = declared_len {
            return Ok(IngestedBody {
                reader: Box::new(source),
                len,
                spill: None,
            });
        }

        let mut buffered = Vec::new();
        (&mut source)
            .take(self.threshold + 1)
            .read_to_end(&mut buffered)
            .await?;

        if buffered.len() as u64 <= self.threshold {
            let len = buffered.len() as u64;
            return Ok(IngestedBody {
                reader: Box::new(Cursor::new(buffered)),
                len,
                spill: None,
            });
        }

        let spill = tempfile::Builder::new()
            .prefix(SPILL_PREFIX)
            .tempfile_in(&self.temp_dir)?;
        let (std_file, path) = spill.into_parts();
        let mut file = File::from_std(std_file);

        // `path` removes the file if any step below fails.
        file.write_all(&buffered).await?;
        let prefix_len = buffered.len() as u64;
        drop(buffered);
        let rest = tokio::io::copy(&mut source, &mut file).await?;
        file.flush().await?;
        drop(file);

        let len = prefix_len + rest;
        debug!("spilled {} byte upload to {}", len, path.display());

        let reader = File::open(&path).await?;
        Ok(IngestedBody {
            reader: Box::new(reader),
            len,
            spill: Some(path),
        })
    }
}
