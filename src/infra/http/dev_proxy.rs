//! Development-mode reverse proxy to the frontend dev server.

use async_trait::async_trait;
use axum::{
    body::{Body, to_bytes},
    http::{HeaderMap, HeaderName, Request, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use reqwest::{Client, Url, redirect::Policy};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    application::{error::ErrorReport, state::PageProxy},
    infra::error::InfraError,
};

const MAX_FORWARDED_BODY: usize = 10 * 1024 * 1024;
const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";

const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, Error)]
enum ProxyError {
    #[error("failed to read request body: {0}")]
    Body(#[source] axum::Error),
    #[error(transparent)]
    Upstream(#[from] reqwest::Error),
}

/// Forwards requests verbatim to one upstream origin.
#[derive(Debug, Clone)]
pub struct DevProxy {
    client: Client,
    upstream: Url,
}

impl DevProxy {
    pub fn new(upstream: Url) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("ssrd/", env!("CARGO_PKG_VERSION")))
            .redirect(Policy::none())
            .build()?;
        Ok(Self { client, upstream })
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// Upstream URL for `uri`, keeping any base path of the upstream.
    fn target(&self, uri: &Uri) -> Url {
        let mut url = self.upstream.clone();
        let base = self.upstream.path().trim_end_matches('/');
        url.set_path(&format!("{base}{}", uri.path()));
        url.set_query(uri.query());
        url
    }

    async fn send(&self, request: Request<Body>) -> Result<Response, ProxyError> {
        let (parts, body) = request.into_parts();
        let url = self.target(&parts.uri);
        let body = to_bytes(body, MAX_FORWARDED_BODY)
            .await
            .map_err(ProxyError::Body)?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        if let Some(host) = headers.remove(header::HOST) {
            headers.insert(FORWARDED_HOST_HEADER, host);
        }

        debug!(
            target = "ssrd::http::dev_proxy",
            method = %parts.method,
            url = %url,
            "forwarding to dev server"
        );
        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

#[async_trait]
impl PageProxy for DevProxy {
    async fn forward(&self, request: Request<Body>) -> Response {
        const SOURCE: &str = "infra::http::dev_proxy";

        let path = request.uri().path().to_string();
        match self.send(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    target = "ssrd::http::dev_proxy",
                    upstream = %self.upstream,
                    path = %path,
                    error = %err,
                    "dev proxy error"
                );
                let mut response =
                    (StatusCode::BAD_GATEWAY, "dev server unavailable").into_response();
                ErrorReport::from_error(SOURCE, StatusCode::BAD_GATEWAY, &err)
                    .attach(&mut response);
                response
            }
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(upstream: &str) -> DevProxy {
        DevProxy::new(Url::parse(upstream).expect("url")).expect("client")
    }

    #[test]
    fn target_keeps_path_and_query() {
        let proxy = proxy("http://127.0.0.1:3333");

        let url = proxy.target(&Uri::from_static("/zh/docs?page=2"));

        assert_eq!(url.as_str(), "http://127.0.0.1:3333/zh/docs?page=2");
    }

    #[test]
    fn target_joins_upstream_base_path() {
        let proxy = proxy("http://localhost:5173/app/");

        let url = proxy.target(&Uri::from_static("/assets/main.js"));

        assert_eq!(url.as_str(), "http://localhost:5173/app/assets/main.js");
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive".parse().expect("value"));
        headers.insert("keep-alive", "timeout=5".parse().expect("value"));
        headers.insert(header::ACCEPT, "text/html".parse().expect("value"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers[header::ACCEPT], "text/html");
    }
}
