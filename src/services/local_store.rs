//! src/services/local_store.rs
//!
//! LocalStore: filesystem backend of [`ObjectStore`]. Objects live at
//! `basedir/{token}/{name}`, their metadata records at
//! `basedir/{token}/{name}.metadata`. One directory per upload token.

use crate::{
    models::{content_type::content_type_for, object_key::ObjectKey},
    services::object_store::{
        ObjectInfo, ObjectStore, PutReceipt, StoreError, StoreResult, StoredObject,
    },
};
use async_trait::async_trait;
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const COPY_BUFFER_LEN: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct LocalStore {
    /// Root directory holding one sub-directory per token.
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn namespace_root(&self, token: &str) -> PathBuf {
        self.base_path.join(token)
    }

    fn object_path(&self, key: &ObjectKey) -> PathBuf {
        self.namespace_root(key.token()).join(key.name())
    }

    fn map_missing(key: &ObjectKey, err: io::Error) -> StoreError {
        if err.kind() == ErrorKind::NotFound {
            StoreError::NotFound(key.to_string())
        } else {
            StoreError::Io(err)
        }
    }

    async fn create_namespace(&self, token: &str) -> io::Result<PathBuf> {
        let root = self.namespace_root(token);
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(&root).await?;
        Ok(root)
    }

    /// Copy `reader` into `file`, returning the byte count and MD5 digest.
    async fn copy_hashed(
        reader: &mut (dyn AsyncRead + Send + Unpin),
        file: &mut File,
    ) -> io::Result<(u64, String)> {
        let mut digest = Context::new();
        let mut written: u64 = 0;
        let mut buf = vec![0u8; COPY_BUFFER_LEN];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.consume(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            written += n as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok((written, format!("{:x}", digest.compute())))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn head(&self, key: &ObjectKey) -> StoreResult<ObjectInfo> {
        let meta = fs::symlink_metadata(self.object_path(key))
            .await
            .map_err(|err| Self::map_missing(key, err))?;
        if !meta.is_file() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(ObjectInfo {
            content_type: content_type_for(key.name()).to_string(),
            size: meta.len(),
        })
    }

    async fn get(&self, key: &ObjectKey) -> StoreResult<StoredObject> {
        let file = File::open(self.object_path(key))
            .await
            .map_err(|err| Self::map_missing(key, err))?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(StoredObject {
            reader: Box::new(file),
            info: ObjectInfo {
                content_type: content_type_for(key.name()).to_string(),
                size: meta.len(),
            },
        })
    }

    /// Stream into a temporary sibling, check the length, fsync, then
    /// rename over the final path so readers never observe a partial file.
    async fn put(
        &self,
        key: &ObjectKey,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
        size: u64,
    ) -> StoreResult<PutReceipt> {
        let root = self.create_namespace(key.token()).await?;
        let file_path = self.object_path(key);
        let tmp_path = root.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let (written, etag) = match Self::copy_hashed(reader, &mut file).await {
            Ok(result) => result,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        };
        drop(file);

        if written != size {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::LengthMismatch {
                key: key.to_string(),
                expected: size,
                actual: written,
            });
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        debug!(
            "stored {} ({} bytes, {}, etag {})",
            key, written, content_type, etag
        );
        Ok(PutReceipt {
            size: written,
            etag,
        })
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let root = self.namespace_root(key.token());
        match fs::remove_dir_all(&root).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("namespace {} already missing", root.display());
                Ok(())
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn namespace_exists(&self, token: &str) -> StoreResult<bool> {
        match fs::metadata(self.namespace_root(token)).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn key(token: &str, name: &str) -> ObjectKey {
        ObjectKey::new(token, name).unwrap()
    }

    async fn read_all(mut object: StoredObject) -> Vec<u8> {
        let mut out = Vec::new();
        object.reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn put_then_get_round_trips_bytes() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let k = key("tok", "hello.txt");

        let receipt = store
            .put(&k, &mut Cursor::new(b"hello world".to_vec()), "text/plain", 11)
            .await
            .unwrap();
        assert_eq!(receipt.size, 11);
        assert_eq!(receipt.etag, format!("{:x}", md5::compute(b"hello world")));

        let head = store.head(&k).await.unwrap();
        assert_eq!(head.size, 11);
        assert_eq!(head.content_type, "text/plain; charset=utf-8");

        let object = store.get(&k).await.unwrap();
        assert_eq!(object.info.size, 11);
        assert_eq!(read_all(object).await, b"hello world");
    }

    #[tokio::test]
    async fn unknown_extension_defaults_to_octet_stream() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let k = key("tok", "blob");
        store
            .put(&k, &mut Cursor::new(vec![1, 2, 3]), "", 3)
            .await
            .unwrap();
        assert_eq!(
            store.head(&k).await.unwrap().content_type,
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn put_rejects_length_mismatch_and_leaves_nothing() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let k = key("tok", "short.bin");

        let err = store
            .put(&k, &mut Cursor::new(vec![0u8; 4]), "", 10)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::LengthMismatch {
                expected: 10,
                actual: 4,
                ..
            }
        ));
        assert!(store.get(&k).await.err().unwrap().is_not_found());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("tok"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let k = key("nope", "gone.txt");
        assert!(store.head(&k).await.unwrap_err().is_not_found());
        assert!(store.get(&k).await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn delete_removes_whole_namespace_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let a = key("tok", "a.txt");
        let b = key("tok", "b.txt");
        for k in [&a, &b] {
            store
                .put(k, &mut Cursor::new(b"x".to_vec()), "", 1)
                .await
                .unwrap();
        }
        assert!(store.namespace_exists("tok").await.unwrap());

        store.delete(&a).await.unwrap();
        assert!(!store.namespace_exists("tok").await.unwrap());
        assert!(store.get(&b).await.err().unwrap().is_not_found());

        store.delete(&a).await.unwrap();
    }

    #[tokio::test]
    async fn put_overwrites_existing_object() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let k = key("tok", "a.txt");
        store
            .put(&k, &mut Cursor::new(b"first".to_vec()), "", 5)
            .await
            .unwrap();
        store
            .put(&k, &mut Cursor::new(b"2nd".to_vec()), "", 3)
            .await
            .unwrap();
        assert_eq!(read_all(store.get(&k).await.unwrap()).await, b"2nd");
    }
}
