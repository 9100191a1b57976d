//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that exercises the storage and spill directories

use crate::services::transfer_service::TransferService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Very small liveness probe. Always returns 200 OK and never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Best-effort write/read/delete against the object directory and the
/// directory large uploads spill into. HTTP 200 when both pass, 503
/// otherwise.
pub async fn readyz(State(service): State<TransferService>) -> impl IntoResponse {
    let mut checks = HashMap::new();
    checks.insert("storage", probe_dir(service.storage_dir()).await);
    checks.insert("temp", probe_dir(service.temp_dir()).await);

    let overall_ok = checks.values().all(|check| check.ok);
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn probe_dir(dir: &Path) -> CheckStatus {
    // Dot-prefixed so it can never collide with an 11-character token.
    let tmp_path = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    let outcome = match fs::write(&tmp_path, b"readyz").await {
        Ok(()) => match fs::read(&tmp_path).await {
            Ok(bytes) if bytes == b"readyz" => Ok(()),
            Ok(_) => Err("file content mismatch".to_string()),
            Err(e) => Err(format!("could not read tmp file: {}", e)),
        },
        Err(e) => return CheckStatus::failed(format!("could not write tmp file: {}", e)),
    };

    let removed = fs::remove_file(&tmp_path).await;
    match (outcome, removed) {
        (Ok(()), Ok(())) => CheckStatus {
            ok: true,
            error: None,
        },
        (Ok(()), Err(e)) => CheckStatus {
            ok: true,
            error: Some(format!("could not remove tmp file: {}", e)),
        },
        (Err(msg), _) => CheckStatus::failed(msg),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
