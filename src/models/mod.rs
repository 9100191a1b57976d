//! Core data models for the transfer store.
//!
//! Keys address blobs inside per-upload token namespaces; metadata records
//! carry the expiry policy of each blob and serialize as JSON via `serde`.

pub mod archive;
pub mod content_type;
pub mod metadata;
pub mod object_key;
