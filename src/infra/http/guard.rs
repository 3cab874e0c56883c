//! Access checks for the client-side data route.

use axum::http::{HeaderMap, StatusCode, header};
use subtle::ConstantTimeEq;
use url::Url;

use crate::application::{error::HttpError, state::FetchPolicy};

pub const SSR_TOKEN_HEADER: &str = "x-ssr-token";
pub const SSR_FETCH_HEADER: &str = "x-ssr-fetch";
const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";

const SOURCE: &str = "infra::http::guard";

/// Reject requests without the shared token (401) or that are neither
/// same-origin nor flagged with `X-SSR-Fetch: 1` (403).
pub fn check_data_request(policy: &FetchPolicy, headers: &HeaderMap) -> Result<(), HttpError> {
    if let Some(expected) = policy.token.as_deref().map(str::trim)
        && !expected.is_empty()
    {
        let presented = header_str(headers, SSR_TOKEN_HEADER).unwrap_or_default();
        if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
            return Err(HttpError::new(
                SOURCE,
                StatusCode::UNAUTHORIZED,
                "Unauthorized",
                "missing or invalid ssr token",
            ));
        }
    }

    let flagged = header_str(headers, SSR_FETCH_HEADER) == Some("1");
    if !flagged && !is_same_origin(headers) {
        return Err(HttpError::new(
            SOURCE,
            StatusCode::FORBIDDEN,
            "Forbidden",
            "cross-origin data request without fetch flag",
        ));
    }

    Ok(())
}

/// Compare the `Origin` (or `Referer`) authority with the host the request was
/// addressed to, preferring the first `X-Forwarded-Host` entry.
pub fn is_same_origin(headers: &HeaderMap) -> bool {
    let host = header_str(headers, FORWARDED_HOST_HEADER)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| header_str(headers, header::HOST.as_str()));
    let Some(host) = host else {
        return false;
    };

    let origin = header_str(headers, header::ORIGIN.as_str())
        .filter(|value| !value.is_empty())
        .or_else(|| header_str(headers, header::REFERER.as_str()));
    let Some(authority) = origin.and_then(authority_of) else {
        return false;
    };

    authority.eq_ignore_ascii_case(host)
}

fn authority_of(origin: &str) -> Option<String> {
    let parsed = Url::parse(origin).ok()?;
    let host = parsed.host_str().filter(|host| !host.is_empty())?;
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
