//! Defines routes for uploads, downloads and archives.
//!
//! ## Structure
//! - **Uploads**
//!   - `POST /` multipart form, one token for every file field
//!   - `PUT  /{filename}` raw body
//!
//! - **Retrieval**
//!   - `GET  /{token}/{filename}` download, counted against `Max-Downloads`
//!   - `HEAD /{token}/{filename}` headers only, never counted
//!   - `GET  /(t1/a,t2/b).tar.gz` or `.zip` archive of several objects
//!
//! Upload and retrieval share the `/{*path}` wildcard; the handlers decide
//! what the path names.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        transfer_handlers::{get_path, head_path, post_multipart, put_upload},
    },
    services::transfer_service::TransferService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. `body_limit` caps multipart bodies; `None` lifts
/// axum's default cap so large uploads can stream through.
pub fn routes(body_limit: Option<usize>) -> Router<TransferService> {
    let limit = match body_limit {
        Some(max) => DefaultBodyLimit::max(max),
        None => DefaultBodyLimit::disable(),
    };

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/", post(post_multipart))
        .route("/{*path}", get(get_path).head(head_path).put(put_upload))
        .layer(limit)
}
