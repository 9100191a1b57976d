pub mod archive_service;
pub mod body_stream;
pub mod expiry_service;
pub mod ingest_service;
pub mod local_store;
pub mod lock_registry;
pub mod object_store;
pub mod transfer_service;
pub mod zip_stream;
