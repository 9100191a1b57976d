//! The service the HTTP handlers talk to. Bundles the object store, the
//! expiry engine and both pipelines behind one cloneable value that serves
//! as router state.

use crate::{
    models::{
        archive::{ArchiveFormat, ArchiveRequest},
        content_type::content_type_for,
        metadata::{Metadata, UploadDirectives},
        object_key::{ObjectKey, generate_token, sanitize_name},
    },
    services::{
        archive_service::{ArchiveError, ArchivePipeline},
        body_stream::{ChannelSink, body_channel, receiver_stream},
        expiry_service::{Download, ExpiryService, ExpiryStatus},
        ingest_service::Ingestor,
        lock_registry::LockRegistry,
        object_store::{ObjectInfo, ObjectStore, StoreError, StoreResult},
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::{
    io::{self, BufWriter},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{io::AsyncRead, runtime::Handle};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

const TOKEN_ATTEMPTS: usize = 8;
const SINK_BUFFER_LEN: usize = 64 * 1024;

/// What the client gets back for one stored upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: ObjectKey,
    pub size: u64,
    pub etag: String,
}

#[derive(Clone)]
pub struct TransferService {
    store: Arc<dyn ObjectStore>,
    expiry: ExpiryService,
    archives: ArchivePipeline,
    ingestor: Ingestor,
    /// Directories probed by the readiness check.
    storage_dir: PathBuf,
    temp_dir: PathBuf,
    upload_limit: Option<u64>,
}

impl TransferService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        storage_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        let temp_dir = temp_dir.into();
        let expiry = ExpiryService::new(store.clone(), LockRegistry::new());
        let archives = ArchivePipeline::new(store.clone(), expiry.clone());
        Self {
            ingestor: Ingestor::new(&temp_dir),
            store,
            expiry,
            archives,
            storage_dir: storage_dir.into(),
            temp_dir,
            upload_limit: None,
        }
    }

    /// Replace the ingestion pipeline (e.g. a different spill threshold).
    pub fn with_ingestor(mut self, ingestor: Ingestor) -> Self {
        self.ingestor = ingestor;
        self
    }

    /// Cap on a single upload body, `None` for unlimited.
    pub fn with_upload_limit(mut self, limit: Option<u64>) -> Self {
        self.upload_limit = limit;
        self
    }

    pub fn upload_limit(&self) -> Option<u64> {
        self.upload_limit
    }

    pub fn expiry(&self) -> &ExpiryService {
        &self.expiry
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Pick a token whose namespace is not in use yet.
    pub async fn allocate_token(&self) -> StoreResult<String> {
        for _ in 0..TOKEN_ATTEMPTS {
            let token = generate_token();
            if !self.store.namespace_exists(&token).await? {
                return Ok(token);
            }
            debug!("token {} already taken, drawing another", token);
        }
        Err(StoreError::Io(io::Error::other(
            "could not allocate an unused upload token",
        )))
    }

    /// Store one uploaded file under `token` together with its policy.
    ///
    /// The metadata record is written before the blob, so a visible blob
    /// always has a policy. If the blob write fails the record is left for
    /// [`discard_namespace`](Self::discard_namespace) to clean up.
    pub async fn store_upload<R>(
        &self,
        token: &str,
        filename: &str,
        content_type: Option<&str>,
        directives: &UploadDirectives,
        source: R,
        declared_len: Option<u64>,
    ) -> StoreResult<UploadReceipt>
    where
        R: AsyncRead + Send + Unpin,
    {
        let name = sanitize_name(filename)?;
        let key = ObjectKey::new(token, &name)?;
        let content_type = content_type
            .map(str::trim)
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| content_type_for(&name))
            .to_string();

        let mut body = self.ingestor.ingest(source, declared_len).await?;
        info!(
            "uploading {} \"{}\" {} \"{}\"",
            token, name, body.len, content_type
        );

        let metadata = Metadata::for_upload(content_type.as_str(), directives, Utc::now());
        self.expiry.save_metadata(&key, &metadata).await?;

        let receipt = self
            .store
            .put(&key, &mut body.reader, &content_type, body.len)
            .await?;
        drop(body);

        Ok(UploadReceipt {
            key,
            size: receipt.size,
            etag: receipt.etag,
        })
    }

    /// Best-effort removal of a partially stored upload.
    pub async fn discard_namespace(&self, token: &str) {
        let Ok(key) = ObjectKey::new(token, "discarded") else {
            return;
        };
        if let Err(err) = self.store.delete(&key).await {
            warn!("failed to discard upload namespace {}: {}", token, err);
        }
    }

    /// Type and size of a live object. Never counts as a download.
    pub async fn head(&self, key: &ObjectKey) -> StoreResult<ObjectInfo> {
        match self.expiry.check_age(key).await {
            Ok(status) if status.is_live() => {}
            Ok(_) => return Err(StoreError::NotFound(key.to_string())),
            Err(err) => {
                warn!("metadata check: \"/{}\" unreadable: {}", key, err);
                return Err(StoreError::NotFound(key.to_string()));
            }
        }
        self.store.head(key).await
    }

    pub async fn open_download(&self, key: &ObjectKey) -> StoreResult<Download> {
        self.expiry.open(key).await
    }

    /// Stream an opened download; the download is counted once the last
    /// chunk has been handed to the response.
    pub fn stream_download(
        &self,
        download: Download,
    ) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        let (tx, rx) = body_channel();
        let expiry = self.expiry.clone();
        let Download { reader, ticket, .. } = download;

        tokio::spawn(async move {
            let mut chunks = ReaderStream::new(reader);
            while let Some(chunk) = chunks.next().await {
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() {
                    debug!("client went away while downloading \"/{}\"", ticket.key());
                    return;
                }
                if failed {
                    return;
                }
            }
            let key = ticket.key().clone();
            match expiry.record_download(ticket).await {
                Ok(ExpiryStatus::Expired(reason)) => debug!("\"/{}\" expired: {}", key, reason),
                Ok(_) => {}
                Err(err) => warn!("download check of \"/{}\" failed: {}", key, err),
            }
        });

        receiver_stream(rx)
    }

    /// Preflight `request`, then stream the archive from a blocking task.
    ///
    /// A preflight failure is returned before any body exists; failures
    /// after that abort the returned stream.
    pub async fn stream_archive(
        &self,
        request: ArchiveRequest,
        format: ArchiveFormat,
    ) -> Result<impl Stream<Item = io::Result<Bytes>> + Send + 'static, ArchiveError> {
        self.archives.preflight(&request).await?;

        let (tx, rx) = body_channel();
        let pipeline = self.archives.clone();
        let runtime = Handle::current();
        tokio::task::spawn_blocking(move || {
            let abort = ChannelSink::new(tx.clone());
            let sink = BufWriter::with_capacity(SINK_BUFFER_LEN, ChannelSink::new(tx));
            if let Err(err) = pipeline.write_members(&runtime, &request, format, sink) {
                warn!("archive streaming failed: {}", err);
                abort.fail(io::Error::other(err));
            }
        });

        Ok(receiver_stream(rx))
    }
}
