//! Streams several stored objects into one tar.gz or zip archive.
//!
//! Two passes: an async preflight that proves every member exists before a
//! single byte is produced, then a blocking pass that copies each member
//! straight from the store into the encoder and on into the sink. No member
//! is ever buffered whole.

use crate::{
    models::archive::{ArchiveFormat, ArchiveRequest},
    services::{
        expiry_service::{Download, ExpiryService},
        object_store::{ObjectStore, StoreError},
    },
};
use chrono::Utc;
use flate2::{Compression, write::GzEncoder};
use std::{
    io::{self, Read, Write},
    sync::Arc,
};
use tar::{EntryType, Header};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, warn};

use super::zip_stream::{DosTimestamp, ZipStreamWriter};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive member `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ArchiveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ArchiveError::NotFound(_))
    }
}

impl From<StoreError> for ArchiveError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => ArchiveError::NotFound(key),
            other if other.is_not_found() => ArchiveError::NotFound(other.to_string()),
            other => ArchiveError::Store(other),
        }
    }
}

/// Yields exactly `remaining` bytes of `inner`.
///
/// An early end of `inner` is an `UnexpectedEof` error rather than a short
/// member, since the header already promised the full size.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, len: u64) -> Self {
        Self {
            inner,
            remaining: len,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("member ended {} bytes early", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Archive container being written member by member.
trait MemberWriter {
    fn append(&mut self, name: &str, size: u64, data: &mut dyn Read) -> Result<(), ArchiveError>;

    /// Write the trailer / central directory and flush the sink.
    fn finish(self: Box<Self>) -> Result<(), ArchiveError>;
}

struct TarGzMembers<W: Write> {
    builder: tar::Builder<GzEncoder<W>>,
    mtime: u64,
}

impl<W: Write> MemberWriter for TarGzMembers<W> {
    fn append(&mut self, name: &str, size: u64, data: &mut dyn Read) -> Result<(), ArchiveError> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(size);
        header.set_mode(0o600);
        header.set_mtime(self.mtime);
        self.builder.append_data(&mut header, name, data)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), ArchiveError> {
        let gzip = self.builder.into_inner()?;
        let mut sink = gzip.finish()?;
        sink.flush()?;
        Ok(())
    }
}

struct ZipMembers<W: Write> {
    writer: ZipStreamWriter<W>,
}

impl<W: Write> MemberWriter for ZipMembers<W> {
    fn append(&mut self, name: &str, size: u64, data: &mut dyn Read) -> Result<(), ArchiveError> {
        self.writer.append(name, size, data)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), ArchiveError> {
        self.writer.finish()?;
        Ok(())
    }
}

fn member_writer<W: Write + 'static>(format: ArchiveFormat, sink: W) -> Box<dyn MemberWriter> {
    let now = Utc::now();
    match format {
        ArchiveFormat::TarGz => Box::new(TarGzMembers {
            builder: tar::Builder::new(GzEncoder::new(sink, Compression::default())),
            mtime: now.timestamp().max(0) as u64,
        }),
        ArchiveFormat::Zip => Box::new(ZipMembers {
            writer: ZipStreamWriter::new(sink, DosTimestamp::from_datetime(now)),
        }),
    }
}

#[derive(Clone)]
pub struct ArchivePipeline {
    store: Arc<dyn ObjectStore>,
    expiry: ExpiryService,
}

impl ArchivePipeline {
    pub fn new(store: Arc<dyn ObjectStore>, expiry: ExpiryService) -> Self {
        Self { store, expiry }
    }

    /// Validate and stream `request` into `sink`.
    ///
    /// Nothing is written to `sink` unless every member passed preflight.
    pub async fn stream_archive<W>(
        &self,
        request: ArchiveRequest,
        format: ArchiveFormat,
        sink: W,
    ) -> Result<(), ArchiveError>
    where
        W: Write + Send + 'static,
    {
        self.preflight(&request).await?;
        let pipeline = self.clone();
        let runtime = Handle::current();
        tokio::task::spawn_blocking(move || {
            pipeline.write_members(&runtime, &request, format, sink)
        })
        .await
        .map_err(|err| ArchiveError::Io(io::Error::other(err)))?
    }

    /// Check that every member exists and has not expired.
    ///
    /// Age checks are best-effort here; the `get` decides. Readers are
    /// closed straight away.
    pub async fn preflight(&self, request: &ArchiveRequest) -> Result<(), ArchiveError> {
        for key in request.members() {
            if let Err(err) = self.expiry.check_age(key).await {
                warn!("archive preflight: age check of \"/{}\" failed: {}", key, err);
            }
            let object = self.store.get(key).await?;
            drop(object);
        }
        Ok(())
    }

    /// Streaming pass. Blocking; run it off the async workers.
    ///
    /// Each member is opened under its own lock, copied, then counted as a
    /// download. A failed write to `sink` ends the pass immediately and the
    /// in-flight member is not counted.
    pub fn write_members<W: Write + 'static>(
        &self,
        runtime: &Handle,
        request: &ArchiveRequest,
        format: ArchiveFormat,
        sink: W,
    ) -> Result<(), ArchiveError> {
        let mut writer = member_writer(format, sink);

        for key in request.members() {
            let Download {
                reader,
                info,
                ticket,
                ..
            } = runtime.block_on(self.expiry.open(key))?;

            let bridge = SyncIoBridge::new_with_handle(reader, runtime.clone());
            let mut data = ExactReader::new(bridge, info.size);
            writer.append(key.name(), info.size, &mut data)?;
            drop(data);

            match runtime.block_on(self.expiry.record_download(ticket)) {
                Ok(status) => debug!("archive member \"/{}\": {:?}", key, status),
                Err(err) => warn!("download check of \"/{}\" failed: {}", key, err),
            }
        }

        writer.finish()
    }
}
