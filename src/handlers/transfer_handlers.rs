//! HTTP handlers for uploads, downloads and archives.
//! Bodies are streamed in both directions; every storage decision is left
//! to `TransferService`.

use crate::{
    errors::AppError,
    models::{
        archive::{ArchiveFormat, ArchiveRequest},
        metadata::UploadDirectives,
        object_key::ObjectKey,
    },
    services::{object_store::StoreError, transfer_service::TransferService},
};
use axum::{
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_DOWNLOADS_HEADER: &str = "max-downloads";
const MAX_DAYS_HEADER: &str = "max-days";
const FORWARDED_PROTO_HEADER: &str = "x-forwarded-proto";

/// `POST /` with a multipart body. Every file field is stored under one
/// fresh token; the response lists one URL per stored file.
pub async fn post_multipart(
    State(service): State<TransferService>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let directives = upload_directives(&headers);
    let token = service.allocate_token().await?;
    let mut urls = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                service.discard_namespace(&token).await;
                return Err(err.into());
            }
        };
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content_type = field.content_type().map(str::to_string);

        let reader = body_reader(field, None);
        let stored = service
            .store_upload(
                &token,
                &filename,
                content_type.as_deref(),
                &directives,
                reader,
                None,
            )
            .await;
        match stored {
            Ok(receipt) => urls.push(object_url(&headers, &receipt.key)),
            Err(err) => {
                service.discard_namespace(&token).await;
                return Err(err.into());
            }
        }
    }

    if urls.is_empty() {
        return Err(AppError::bad_request("no files in multipart body"));
    }

    let mut body = urls.join("\n");
    body.push('\n');
    Ok(text_response(body))
}

/// `PUT /{filename}` with the raw file as body.
pub async fn put_upload(
    State(service): State<TransferService>,
    Path(filename): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    if filename.contains('/') {
        return Err(AppError::bad_request("uploads go to /{filename}"));
    }

    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared_len == Some(0) {
        return Err(AppError::bad_request("Could not upload empty file"));
    }
    if let (Some(len), Some(limit)) = (declared_len, service.upload_limit()) {
        if len > limit {
            return Err(AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("upload exceeds {} bytes", limit),
            ));
        }
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let directives = upload_directives(&headers);
    let token = service.allocate_token().await?;

    let reader = body_reader(body.into_data_stream(), service.upload_limit());
    let receipt = match service
        .store_upload(
            &token,
            &filename,
            content_type.as_deref(),
            &directives,
            reader,
            declared_len,
        )
        .await
    {
        Ok(receipt) => receipt,
        Err(err) => {
            service.discard_namespace(&token).await;
            return Err(err.into());
        }
    };

    let mut response = text_response(object_url(&headers, &receipt.key));
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", receipt.etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// `GET /{token}/{filename}` or `GET /(t1/a,t2/b).tar.gz|.zip`.
pub async fn get_path(
    State(service): State<TransferService>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    if let Some((list, format)) = ArchiveFormat::split_request_path(&path) {
        return get_archive(&service, list, format).await;
    }

    let key = ObjectKey::parse_reference(&path).map_err(StoreError::from)?;
    let download = service.open_download(&key).await?;
    info!("downloading \"/{}\" ({} bytes)", key, download.info.size);

    let content_type = download.metadata.content_type.clone();
    let size = download.info.size;
    let body = Body::from_stream(service.stream_download(download));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), &content_type, Some(size), key.name());
    Ok(response)
}

/// `HEAD /{token}/{filename}`: the GET headers without a body. Not counted
/// as a download.
pub async fn head_path(
    State(service): State<TransferService>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    if ArchiveFormat::split_request_path(&path).is_some() {
        return Err(AppError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "archives can only be fetched with GET",
        ));
    }

    let key = ObjectKey::parse_reference(&path).map_err(StoreError::from)?;
    let info = service.head(&key).await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_download_headers(
        response.headers_mut(),
        &info.content_type,
        Some(info.size),
        key.name(),
    );
    Ok(response)
}

async fn get_archive(
    service: &TransferService,
    list: &str,
    format: ArchiveFormat,
) -> Result<Response, AppError> {
    let request = ArchiveRequest::parse(list).map_err(StoreError::from)?;
    if request.is_empty() {
        return Err(AppError::bad_request("archive lists no files"));
    }

    let member_count = request.len();
    let stream = service.stream_archive(request, format).await?;
    let filename = format!(
        "transfer-{}{}",
        Uuid::new_v4().as_u128() as u16,
        format.extension()
    );
    info!("streaming {} with {} members", filename, member_count);

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), format.content_type(), None, &filename);
    Ok(response)
}

/// Adapt an upload body into an `AsyncRead`, failing with `FileTooLarge`
/// once more than `limit` bytes have arrived.
fn body_reader<S, E>(stream: S, limit: Option<u64>) -> impl AsyncRead + Send + Unpin
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut received = 0u64;
    let limited = stream.map(move |chunk| {
        let chunk = chunk.map_err(io::Error::other)?;
        received += chunk.len() as u64;
        match limit {
            Some(max) if received > max => Err(io::Error::new(
                io::ErrorKind::FileTooLarge,
                format!("upload exceeds {} bytes", max),
            )),
            _ => Ok(chunk),
        }
    });
    StreamReader::new(Box::pin(limited))
}

fn upload_directives(headers: &HeaderMap) -> UploadDirectives {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
    };
    UploadDirectives {
        max_downloads: value(MAX_DOWNLOADS_HEADER),
        max_days: value(MAX_DAYS_HEADER),
    }
}

/// Absolute URL of a stored object, built from the request's own host.
fn object_url(headers: &HeaderMap, key: &ObjectKey) -> String {
    let proto = headers
        .get(FORWARDED_PROTO_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!(
        "{}://{}/{}/{}",
        proto,
        host,
        key.token(),
        escape_path_segment(key.name())
    )
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn escape_path_segment(segment: &str) -> String {
    let mut escaped = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                escaped.push(byte as char)
            }
            _ => escaped.push_str(&format!("%{:02X}", byte)),
        }
    }
    escaped
}

fn text_response(body: String) -> Response {
    (StatusCode::OK, body).into_response()
}

fn set_download_headers(
    headers: &mut HeaderMap,
    content_type: &str,
    length: Option<u64>,
    filename: &str,
) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    if let Some(length) = length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }

    let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', "'"));
    let disposition = HeaderValue::from_str(&disposition).unwrap_or_else(|err| {
        warn!("file name {:?} not usable in a header: {}", filename, err);
        HeaderValue::from_static("attachment")
    });
    headers.insert(header::CONTENT_DISPOSITION, disposition);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_use_forwarded_proto_and_host() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("files.example"));
        headers.insert(FORWARDED_PROTO_HEADER, HeaderValue::from_static("https"));
        let key = ObjectKey::new("tok", "my file.txt").unwrap();
        assert_eq!(
            object_url(&headers, &key),
            "https://files.example/tok/my%20file.txt"
        );
    }

    #[test]
    fn urls_default_to_plain_http() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("localhost:3000"));
        let key = ObjectKey::new("tok", "a.txt").unwrap();
        assert_eq!(object_url(&headers, &key), "http://localhost:3000/tok/a.txt");
    }

    #[test]
    fn directives_come_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(MAX_DOWNLOADS_HEADER, HeaderValue::from_static(" 3 "));
        let directives = upload_directives(&headers);
        assert_eq!(directives.max_downloads.as_deref(), Some("3"));
        assert_eq!(directives.max_days, None);
    }

    #[test]
    fn disposition_falls_back_for_unprintable_names() {
        let mut headers = HeaderMap::new();
        set_download_headers(&mut headers, "text/plain", Some(3), "bad\nname.txt");
        assert_eq!(headers[header::CONTENT_DISPOSITION], "attachment");
        assert_eq!(headers[header::CONTENT_LENGTH], "3");
    }
}
