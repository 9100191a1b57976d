//! Expiry engine: evaluates age and download-count policies and keeps the
//! per-object metadata record up to date.
//!
//! Every sequence that reads and then writes (or deletes) an object's
//! metadata runs under that object's lock from [`LockRegistry`]. The
//! `*_locked` helpers assume the caller already holds it.
//!
//! The lock is not held while content streams. Downloads of limited objects
//! reserve a slot instead, so in-flight plus completed downloads never
//! exceed `MaxDownloads`.

use crate::{
    models::{metadata::Metadata, object_key::ObjectKey},
    services::{
        lock_registry::LockRegistry,
        object_store::{ObjectInfo, ObjectReader, ObjectStore, StoreError, StoreResult},
    },
};
use chrono::Utc;
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, io::Cursor, sync::Arc};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

const METADATA_CONTENT_TYPE: &str = "text/json";

/// Why an object was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    /// Blob present without a policy record; purged since it could never
    /// expire on its own.
    MissingMetadata,
    MaxDate,
    DownloadsExhausted,
}

impl fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpiryReason::MissingMetadata => write!(f, "missing metadata"),
            ExpiryReason::MaxDate => write!(f, "max-date expired"),
            ExpiryReason::DownloadsExhausted => write!(f, "max-downloads expired"),
        }
    }
}

/// Outcome of an expiry check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryStatus {
    /// Neither the namespace nor the object exists; nothing was done.
    Absent,
    /// Policy checked, object still live.
    Retained,
    /// A download was counted and the object is still live.
    Counted { downloads: u64 },
    /// The object (its whole namespace) was deleted.
    Expired(ExpiryReason),
}

impl ExpiryStatus {
    pub fn is_live(self) -> bool {
        matches!(self, ExpiryStatus::Retained | ExpiryStatus::Counted { .. })
    }
}

/// An object opened for download.
pub struct Download {
    pub reader: ObjectReader,
    pub info: ObjectInfo,
    pub metadata: Metadata,
    pub ticket: DownloadTicket,
}

/// Proof that a download is in flight.
///
/// For limited objects it holds a download slot. Hand it to
/// [`ExpiryService::record_download`] after the content was fully delivered;
/// dropping it instead frees the slot without using up a download.
pub struct DownloadTicket {
    key: ObjectKey,
    _slot: Option<SlotReservation>,
}

impl DownloadTicket {
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }
}

type SlotMap = Mutex<HashMap<String, u64>>;

/// One in-flight download of a limited object. Released on drop.
struct SlotReservation {
    key: String,
    slots: Arc<SlotMap>,
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        if let Some(in_flight) = slots.get_mut(&self.key) {
            *in_flight = in_flight.saturating_sub(1);
            if *in_flight == 0 {
                slots.remove(&self.key);
            }
        }
    }
}

enum AgeVerdict {
    Live(Metadata),
    Gone(ExpiryStatus),
}

#[derive(Clone)]
pub struct ExpiryService {
    store: Arc<dyn ObjectStore>,
    locks: LockRegistry,
    slots: Arc<SlotMap>,
}

impl ExpiryService {
    pub fn new(store: Arc<dyn ObjectStore>, locks: LockRegistry) -> Self {
        Self {
            store,
            locks,
            slots: Arc::default(),
        }
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    /// Downloads of `key` opened but not yet recorded or abandoned. Only
    /// limited objects are tracked.
    pub fn in_flight(&self, key: &ObjectKey) -> u64 {
        self.slots.lock().get(&key.lock_key()).copied().unwrap_or(0)
    }

    /// Age check: purge the object once its `MaxDate` has passed, or when
    /// its metadata record is missing.
    pub async fn check_age(&self, key: &ObjectKey) -> StoreResult<ExpiryStatus> {
        let _guard = self.locks.acquire(key).await;
        match self.evaluate_age_locked(key).await? {
            AgeVerdict::Live(_) => Ok(ExpiryStatus::Retained),
            AgeVerdict::Gone(status) => Ok(status),
        }
    }

    /// Download-count check: count one completed download and purge the
    /// object once its limit is reached.
    pub async fn check_downloads(&self, key: &ObjectKey) -> StoreResult<ExpiryStatus> {
        let _guard = self.locks.acquire(key).await;
        self.count_download_locked(key).await
    }

    /// Run the pre-download checks under `key`'s lock and open the payload.
    ///
    /// Expired, exhausted, missing or unreadable-policy objects all come back
    /// as [`StoreError::NotFound`], as does a limited object whose remaining
    /// downloads are all reserved by downloads still in flight. The lock is
    /// released before returning.
    pub async fn open(&self, key: &ObjectKey) -> StoreResult<Download> {
        let guard = self.locks.acquire(key).await;

        let metadata = match self.evaluate_age_locked(key).await {
            Ok(AgeVerdict::Live(metadata)) => metadata,
            Ok(AgeVerdict::Gone(_)) => return Err(StoreError::NotFound(key.to_string())),
            Err(err) if err.is_not_found() => return Err(err),
            Err(err) => {
                warn!("metadata check: \"/{}\" unreadable: {}", key, err);
                return Err(StoreError::NotFound(key.to_string()));
            }
        };

        if metadata.downloads_exhausted() {
            self.purge(key, ExpiryReason::DownloadsExhausted).await;
            return Err(StoreError::NotFound(key.to_string()));
        }

        let slot = self.reserve_slot_locked(key, &metadata)?;
        let object = self.store.get(key).await?;
        drop(guard);

        Ok(Download {
            reader: object.reader,
            info: object.info,
            metadata,
            ticket: DownloadTicket {
                key: key.clone(),
                _slot: slot,
            },
        })
    }

    /// Count a completed download, then free the ticket's slot.
    pub async fn record_download(&self, ticket: DownloadTicket) -> StoreResult<ExpiryStatus> {
        let _guard = self.locks.acquire(&ticket.key).await;
        let status = self.count_download_locked(&ticket.key).await;
        drop(ticket);
        status
    }

    /// Read the metadata record; `None` when it does not exist.
    pub async fn load_metadata(&self, key: &ObjectKey) -> StoreResult<Option<Metadata>> {
        let mut object = match self.store.get(&key.metadata_key()).await {
            Ok(object) => object,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        let mut raw = Vec::with_capacity(object.info.size as usize);
        object.reader.read_to_end(&mut raw).await?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Persist the metadata record, replacing any previous version.
    pub async fn save_metadata(&self, key: &ObjectKey, metadata: &Metadata) -> StoreResult<()> {
        let encoded = serde_json::to_vec(metadata)?;
        let len = encoded.len() as u64;
        self.store
            .put(
                &key.metadata_key(),
                &mut Cursor::new(encoded),
                METADATA_CONTENT_TYPE,
                len,
            )
            .await?;
        Ok(())
    }

    async fn evaluate_age_locked(&self, key: &ObjectKey) -> StoreResult<AgeVerdict> {
        if !self.store.namespace_exists(key.token()).await? {
            return Ok(AgeVerdict::Gone(ExpiryStatus::Absent));
        }

        let Some(metadata) = self.load_metadata(key).await? else {
            let status = self.purge_orphan_locked(key).await?;
            return Ok(AgeVerdict::Gone(status));
        };

        if metadata.is_past_max_date(Utc::now()) {
            info!("metadata check: max-date of \"/{}\" expired", key);
            let status = self.purge(key, ExpiryReason::MaxDate).await;
            return Ok(AgeVerdict::Gone(status));
        }

        Ok(AgeVerdict::Live(metadata))
    }

    async fn count_download_locked(&self, key: &ObjectKey) -> StoreResult<ExpiryStatus> {
        let Some(mut metadata) = self.load_metadata(key).await? else {
            return self.purge_orphan_locked(key).await;
        };

        // Two downloads may both have passed their pre-checks.
        if metadata.downloads_exhausted() {
            info!("metadata check: max-downloads of \"/{}\" expired", key);
            return Ok(self.purge(key, ExpiryReason::DownloadsExhausted).await);
        }

        metadata.downloads += 1;
        self.save_metadata(key, &metadata).await?;

        if metadata.downloads_exhausted() {
            info!("metadata check: max-downloads of \"/{}\" expired", key);
            return Ok(self.purge(key, ExpiryReason::DownloadsExhausted).await);
        }

        Ok(ExpiryStatus::Counted {
            downloads: metadata.downloads,
        })
    }

    /// No metadata record for `key`. A blob without one is purged; a name
    /// that was never stored leaves its namespace alone.
    async fn purge_orphan_locked(&self, key: &ObjectKey) -> StoreResult<ExpiryStatus> {
        match self.store.head(key).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => return Ok(ExpiryStatus::Absent),
            Err(err) => return Err(err),
        }
        warn!("metadata check: file \"/{}\" has no metadata!", key);
        Ok(self.purge(key, ExpiryReason::MissingMetadata).await)
    }

    /// Take a download slot of a limited object. `None` for unlimited ones.
    fn reserve_slot_locked(
        &self,
        key: &ObjectKey,
        metadata: &Metadata,
    ) -> StoreResult<Option<SlotReservation>> {
        if metadata.max_downloads <= 0 {
            return Ok(None);
        }
        let lock_key = key.lock_key();
        let mut slots = self.slots.lock();
        let in_flight = slots.get(&lock_key).copied().unwrap_or(0);
        if metadata.downloads + in_flight >= metadata.max_downloads as u64 {
            debug!(
                "metadata check: every remaining download of \"/{}\" is in flight",
                key
            );
            return Err(StoreError::NotFound(key.to_string()));
        }
        slots.insert(lock_key.clone(), in_flight + 1);
        Ok(Some(SlotReservation {
            key: lock_key,
            slots: self.slots.clone(),
        }))
    }

    /// Delete the object's namespace. Failures are logged, not returned.
    async fn purge(&self, key: &ObjectKey, reason: ExpiryReason) -> ExpiryStatus {
        match self.store.delete(key).await {
            Ok(()) => info!(
                "storage: file \"/{}\" successfully deleted ({})",
                key, reason
            ),
            Err(err) => warn!(
                "storage: failed to delete \"/{}\" because of {}",
                key, err
            ),
        }
        ExpiryStatus::Expired(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::metadata::{UNLIMITED_DOWNLOADS, UploadDirectives},
        services::local_store::LocalStore,
    };
    use chrono::TimeDelta;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tokio::time::timeout;

    struct Fixture {
        _dir: TempDir,
        store: Arc<dyn ObjectStore>,
        expiry: ExpiryService,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()));
        let expiry = ExpiryService::new(store.clone(), LockRegistry::new());
        Fixture {
            _dir: dir,
            store,
            expiry,
        }
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("tok", name).unwrap()
    }

    async fn put_blob(fx: &Fixture, key: &ObjectKey, body: &[u8]) {
        fx.store
            .put(key, &mut Cursor::new(body.to_vec()), "", body.len() as u64)
            .await
            .unwrap();
    }

    async fn upload(fx: &Fixture, key: &ObjectKey, max_downloads: i64) {
        put_blob(fx, key, b"payload").await;
        let mut meta = Metadata::for_upload("text/plain", &UploadDirectives::default(), Utc::now());
        meta.max_downloads = max_downloads;
        fx.expiry.save_metadata(key, &meta).await.unwrap();
    }

    async fn download(fx: &Fixture, key: &ObjectKey) -> StoreResult<Vec<u8>> {
        let mut dl = fx.expiry.open(key).await?;
        let mut body = Vec::new();
        dl.reader.read_to_end(&mut body).await?;
        fx.expiry.record_download(dl.ticket).await?;
        Ok(body)
    }

    #[tokio::test]
    async fn unlimited_objects_count_every_download() {
        let fx = fixture();
        let k = key("a.txt");
        upload(&fx, &k, UNLIMITED_DOWNLOADS).await;

        for _ in 0..5 {
            assert_eq!(download(&fx, &k).await.unwrap(), b"payload");
        }
        let meta = fx.expiry.load_metadata(&k).await.unwrap().unwrap();
        assert_eq!(meta.downloads, 5);
        assert!(fx.store.head(&k).await.is_ok());
    }

    #[tokio::test]
    async fn limited_objects_serve_exactly_k_downloads() {
        let fx = fixture();
        let k = key("a.txt");
        upload(&fx, &k, 3).await;

        for _ in 0..3 {
            assert_eq!(download(&fx, &k).await.unwrap(), b"payload");
        }
        assert!(download(&fx, &k).await.unwrap_err().is_not_found());
        assert!(!fx.store.namespace_exists("tok").await.unwrap());
    }

    #[tokio::test]
    async fn check_downloads_reports_the_reaching_download() {
        let fx = fixture();
        let k = key("a.txt");
        upload(&fx, &k, 2).await;

        assert_eq!(
            fx.expiry.check_downloads(&k).await.unwrap(),
            ExpiryStatus::Counted { downloads: 1 }
        );
        assert_eq!(
            fx.expiry.check_downloads(&k).await.unwrap(),
            ExpiryStatus::Expired(ExpiryReason::DownloadsExhausted)
        );
    }

    #[tokio::test]
    async fn already_exhausted_record_is_purged_without_counting() {
        let fx = fixture();
        let k = key("a.txt");
        upload(&fx, &k, 1).await;
        let mut meta = fx.expiry.load_metadata(&k).await.unwrap().unwrap();
        meta.downloads = 1;
        fx.expiry.save_metadata(&k, &meta).await.unwrap();

        assert_eq!(
            fx.expiry.check_downloads(&k).await.unwrap(),
            ExpiryStatus::Expired(ExpiryReason::DownloadsExhausted)
        );
        assert!(fx.store.get(&k).await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn past_max_date_expires_on_next_check() {
        let fx = fixture();
        let k = key("old.txt");
        upload(&fx, &k, UNLIMITED_DOWNLOADS).await;
        let mut meta = fx.expiry.load_metadata(&k).await.unwrap().unwrap();
        meta.max_date = Utc::now() - TimeDelta::seconds(1);
        fx.expiry.save_metadata(&k, &meta).await.unwrap();

        assert!(download(&fx, &k).await.unwrap_err().is_not_found());
        assert!(!fx.store.namespace_exists("tok").await.unwrap());
    }

    #[tokio::test]
    async fn live_object_is_retained_by_age_check() {
        let fx = fixture();
        let k = key("a.txt");
        upload(&fx, &k, UNLIMITED_DOWNLOADS).await;
        assert_eq!(fx.expiry.check_age(&k).await.unwrap(), ExpiryStatus::Retained);
    }

    #[tokio::test]
    async fn blob_without_metadata_is_purged() {
        let fx = fixture();
        let k = key("orphan.bin");
        put_blob(&fx, &k, b"no policy").await;

        assert_eq!(
            fx.expiry.check_age(&k).await.unwrap(),
            ExpiryStatus::Expired(ExpiryReason::MissingMetadata)
        );
        assert!(fx.store.get(&k).await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn missing_namespace_is_a_no_op() {
        let fx = fixture();
        assert_eq!(
            fx.expiry.check_age(&key("ghost.txt")).await.unwrap(),
            ExpiryStatus::Absent
        );
        assert!(fx.expiry.open(&key("ghost.txt")).await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn abandoned_download_does_not_use_a_slot() {
        let fx = fixture();
        let k = key("a.txt");
        upload(&fx, &k, 1).await;

        let dl = fx.expiry.open(&k).await.unwrap();
        assert_eq!(fx.expiry.in_flight(&k), 1);
        drop(dl);
        assert_eq!(fx.expiry.in_flight(&k), 0);

        assert_eq!(download(&fx, &k).await.unwrap(), b"payload");
        assert!(download(&fx, &k).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn unknown_name_leaves_namespace_alone() {
        let fx = fixture();
        upload(&fx, &key("a.txt"), UNLIMITED_DOWNLOADS).await;
        upload(&fx, &key("b.txt"), 1).await;
        let ghost = key("does-not-exist.txt");

        assert!(fx.expiry.open(&ghost).await.err().unwrap().is_not_found());
        assert_eq!(fx.expiry.check_age(&ghost).await.unwrap(), ExpiryStatus::Absent);
        assert_eq!(
            fx.expiry.check_downloads(&ghost).await.unwrap(),
            ExpiryStatus::Absent
        );

        assert!(fx.store.namespace_exists("tok").await.unwrap());
        assert!(fx.store.get(&key("a.txt")).await.is_ok());
        assert!(fx.store.get(&key("b.txt")).await.is_ok());
        assert_eq!(download(&fx, &key("b.txt")).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn unlimited_downloads_overlap() {
        let fx = fixture();
        let k = key("shared.bin");
        upload(&fx, &k, UNLIMITED_DOWNLOADS).await;

        // First download opened but not yet drained.
        let mut slow = fx.expiry.open(&k).await.unwrap();

        let wait = Duration::from_secs(1);
        let fast = timeout(wait, download(&fx, &k)).await.unwrap().unwrap();
        assert_eq!(fast, b"payload");
        let age = timeout(wait, fx.expiry.check_age(&k)).await.unwrap().unwrap();
        assert_eq!(age, ExpiryStatus::Retained);

        let mut body = Vec::new();
        slow.reader.read_to_end(&mut body).await.unwrap();
        fx.expiry.record_download(slow.ticket).await.unwrap();

        let meta = fx.expiry.load_metadata(&k).await.unwrap().unwrap();
        assert_eq!(meta.downloads, 2);
        assert_eq!(fx.expiry.in_flight(&k), 0);
    }

    #[tokio::test]
    async fn in_flight_downloads_reserve_limited_slots() {
        let fx = fixture();
        let k = key("twice.bin");
        upload(&fx, &k, 2).await;

        let first = fx.expiry.open(&k).await.unwrap();
        let second = fx.expiry.open(&k).await.unwrap();
        assert_eq!(fx.expiry.in_flight(&k), 2);

        // Both slots are taken, but nothing was used up yet.
        assert!(fx.expiry.open(&k).await.err().unwrap().is_not_found());
        assert!(fx.store.head(&k).await.is_ok());

        assert_eq!(
            fx.expiry.record_download(first.ticket).await.unwrap(),
            ExpiryStatus::Counted { downloads: 1 }
        );
        drop(second);
        assert_eq!(fx.expiry.in_flight(&k), 0);

        assert_eq!(download(&fx, &k).await.unwrap(), b"payload");
        assert!(!fx.store.namespace_exists("tok").await.unwrap());
        assert_eq!(fx.expiry.locks().tracked_keys(), 0);
    }

    #[tokio::test]
    async fn corrupt_metadata_is_reported_as_not_found_on_open() {
        let fx = fixture();
        let k = key("a.txt");
        put_blob(&fx, &k, b"payload").await;
        put_blob(&fx, &k.metadata_key(), b"{not json").await;

        assert!(matches!(
            fx.expiry.check_age(&k).await,
            Err(StoreError::Metadata(_))
        ));
        assert!(fx.expiry.open(&k).await.err().unwrap().is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_single_use_download_is_delivered_once() {
        let fx = fixture();
        let k = key("once.bin");
        upload(&fx, &k, 1).await;

        let (a, b) = tokio::join!(download(&fx, &k), download(&fx, &k));
        let delivered = [a, b].into_iter().filter(|r| r.is_ok()).count();
        assert_eq!(delivered, 1);
        assert!(!fx.store.namespace_exists("tok").await.unwrap());
        assert_eq!(fx.expiry.locks().tracked_keys(), 0);
        assert_eq!(fx.expiry.in_flight(&k), 0);
    }
}
