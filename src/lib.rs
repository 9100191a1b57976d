//! Ephemeral file-sharing store: token-addressed uploads that expire after a
//! number of days or downloads, served over HTTP with axum.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use axum::Router;
use services::{
    local_store::LocalStore, object_store::ObjectStore, transfer_service::TransferService,
};
use std::{path::Path, sync::Arc};

/// Wire the filesystem store, expiry engine and router together.
pub fn build_app(
    storage_dir: impl AsRef<Path>,
    temp_dir: impl AsRef<Path>,
    max_upload_bytes: Option<u64>,
) -> Router {
    let storage_dir = storage_dir.as_ref();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(storage_dir));
    let service = TransferService::new(store, storage_dir, temp_dir.as_ref())
        .with_upload_limit(max_upload_bytes);
    let body_limit = max_upload_bytes.map(|max| usize::try_from(max).unwrap_or(usize::MAX));

    routes::routes::routes(body_limit).with_state(service)
}
