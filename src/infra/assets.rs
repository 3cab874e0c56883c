//! Static file serving from the client build directory.

use std::path::Path;

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use mime_guess::Mime;
use tracing::warn;

use crate::application::error::ErrorReport;

pub const CACHE_IMMUTABLE: &str = "public, max-age=31536000, immutable";
pub const CACHE_ONE_WEEK: &str = "public, max-age=604800";
pub const CACHE_ONE_DAY: &str = "public, max-age=86400";

const IMMUTABLE_EXTENSIONS: &[&str] = &["gz", "br", "woff", "woff2", "ttf", "otf", "eot"];
const WEEK_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "avif", "ico", "svg"];

/// `Cache-Control` for a root-level dist file, chosen by extension.
pub fn cache_policy_for(path: &str) -> &'static str {
    let extension = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some(ext) if IMMUTABLE_EXTENSIONS.contains(&ext) => CACHE_IMMUTABLE,
        Some(ext) if WEEK_EXTENSIONS.contains(&ext) => CACHE_ONE_WEEK,
        _ => CACHE_ONE_DAY,
    }
}

/// Whether the last path segment looks like a file name.
pub fn is_static_asset_like_path(path: &str) -> bool {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return false;
    }
    let base = trimmed.rsplit('/').next().unwrap_or_default();
    !base.is_empty() && base != "." && base.contains('.')
}

/// Relative file path under a served directory, or `None` when the request
/// must not touch the filesystem.
pub fn sanitize_relative(path: &str) -> Option<&str> {
    let candidate = path.trim_start_matches('/');
    if candidate.is_empty()
        || candidate.ends_with('/')
        || candidate.contains("..")
        || candidate.contains('\\')
    {
        return None;
    }
    Some(candidate)
}

/// Serve `relative` from `root` with the given cache policy.
pub async fn serve_file(
    root: &Path,
    relative: &str,
    cache_control: &'static str,
    source: &'static str,
) -> Response {
    let Some(candidate) = sanitize_relative(relative) else {
        return not_found_response(source);
    };

    match read_file(root, candidate).await {
        Some(bytes) => {
            let mime = mime_guess::from_path(candidate).first_or_octet_stream();
            build_response(bytes, mime, cache_control)
        }
        None => not_found_response(source),
    }
}

/// Serve a root-level dist file, skipping the page shell.
pub async fn serve_root_file(root: &Path, index_file: &str, relative: &str) -> Option<Response> {
    let candidate = sanitize_relative(relative)?;
    if candidate.contains('/') || candidate == index_file {
        return None;
    }
    let bytes = read_file(root, candidate).await?;
    let mime = mime_guess::from_path(candidate).first_or_octet_stream();
    Some(build_response(bytes, mime, cache_policy_for(candidate)))
}

async fn read_file(root: &Path, candidate: &str) -> Option<Bytes> {
    let path = root.join(candidate);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return None,
    }
    match tokio::fs::read(&path).await {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(err) => {
            warn!(
                target = "ssrd::infra::assets",
                path = %path.display(),
                error = %err,
                "failed to read static file"
            );
            None
        }
    }
}

pub fn not_found_response(source: &'static str) -> Response {
    let mut response = StatusCode::NOT_FOUND.into_response();
    ErrorReport::from_message(source, StatusCode::NOT_FOUND, "Static asset not found")
        .attach(&mut response);
    response
}

fn build_response(bytes: Bytes, mime: Mime, cache_control: &'static str) -> Response {
    let len = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));

    response
}
