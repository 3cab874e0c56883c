use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::{
    application::{
        error::{ErrorReport, HttpError},
        render::{PageRequest, RenderPipeline},
        state::{DataRequest, PageBackend, RequestFacts, ServiceState},
    },
    domain::session::SESSION_COOKIE,
    infra::assets::{
        CACHE_IMMUTABLE, is_static_asset_like_path, not_found_response, serve_file,
        serve_root_file,
    },
};

use super::{
    guard::check_data_request,
    health_response,
    middleware::{RequestContext, log_responses, set_request_context},
};

/// Prefix of the JSON data route used for client-side navigation.
pub const DATA_PREFIX: &str = "/_ssr/data";

const FORWARDED_PROTO_HEADER: &str = "x-forwarded-proto";

pub fn build_router(state: ServiceState) -> Router {
    let mut router: Router<ServiceState> = Router::new().route("/_health", get(health));
    if state.pages.serves_static_files() {
        router = router.route("/assets/{*path}", get(serve_asset));
    }
    router
        .route(DATA_PREFIX, get(data_root))
        .route("/_ssr/data/{*path}", get(data_path))
        .fallback(fallback)
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn health(State(state): State<ServiceState>) -> Response {
    health_response(state.pages.is_open())
}

async fn serve_asset(State(state): State<ServiceState>, Path(path): Path<String>) -> Response {
    const SOURCE: &str = "infra::http::public::serve_asset";

    let root = state.client_dist.join("assets");
    serve_file(&root, &path, CACHE_IMMUTABLE, SOURCE).await
}

async fn data_root(
    State(state): State<ServiceState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    data_response(&state, "/", query, headers).await
}

async fn data_path(
    State(state): State<ServiceState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    data_response(&state, &path, query, headers).await
}

async fn data_response(
    state: &ServiceState,
    raw_path: &str,
    query: Option<String>,
    headers: HeaderMap,
) -> Response {
    const SOURCE: &str = "infra::http::public::data";

    if let Err(err) = check_data_request(&state.fetch, &headers) {
        return err.into_response();
    }

    let path = clean_path(raw_path);
    let facts = request_facts(&headers);
    let request = DataRequest {
        locale: state.locale_for_path(&path),
        path,
        query,
        headers,
    };

    match state.page_payload(&request, &facts).await {
        Ok(payload) => Json(payload).into_response(),
        Err(err) => {
            error!(
                target = "ssrd::http::data",
                path = %request.path,
                error = %err,
                "data source failed"
            );
            let message = if state.fetch.expose_errors {
                err.to_string()
            } else {
                "internal server error".to_string()
            };
            let mut response =
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": message })))
                    .into_response();
            ErrorReport::from_error(SOURCE, StatusCode::INTERNAL_SERVER_ERROR, &err)
                .attach(&mut response);
            response
        }
    }
}

async fn fallback(State(state): State<ServiceState>, request: Request<Body>) -> Response {
    const SOURCE: &str = "infra::http::public::fallback";

    let path = request.uri().path().to_string();

    let pipeline = match &state.pages {
        PageBackend::Render(pipeline) => Arc::clone(pipeline),
        PageBackend::Proxy(proxy) => {
            if path.starts_with(DATA_PREFIX) {
                return not_found_response(SOURCE);
            }
            return proxy.forward(request).await;
        }
    };

    if let Some(response) = serve_root_file(&state.client_dist, &state.index_file, &path).await {
        return response;
    }
    if path.starts_with(DATA_PREFIX) || is_static_asset_like_path(&path) || path.contains("..") {
        return not_found_response(SOURCE);
    }

    render_page(&state, &pipeline, path, request).await
}

async fn render_page(
    state: &ServiceState,
    pipeline: &RenderPipeline,
    path: String,
    request: Request<Body>,
) -> Response {
    let request_id =
        RequestContext::request_id_of(&request).unwrap_or_else(|| Uuid::new_v4().to_string());
    let (parts, _body) = request.into_parts();

    let locale = state.locale_for_path(&path);
    let facts = request_facts(&parts.headers);
    let data_request = DataRequest {
        path: path.clone(),
        query: parts.uri.query().map(str::to_string),
        locale: locale.clone(),
        headers: parts.headers,
    };

    let payload = match state.page_payload(&data_request, &facts).await {
        Ok(payload) => payload,
        Err(err) => return HttpError::from(err).into_response(),
    };

    let page = pipeline
        .render_page(&PageRequest::new(path, payload, locale).with_request_id(request_id))
        .await;
    html_response(page.html)
}

fn html_response(html: String) -> Response {
    let mut response = Response::new(Body::from(html));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    response
}

fn request_facts(headers: &HeaderMap) -> RequestFacts {
    RequestFacts {
        session_token: cookie_value(headers, SESSION_COOKIE),
        site_origin: site_origin(headers),
    }
}

fn site_origin(headers: &HeaderMap) -> Option<String> {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|host| !host.is_empty())?;
    let scheme = headers
        .get(FORWARDED_PROTO_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|scheme| !scheme.is_empty())
        .unwrap_or("http");
    Some(format!("{scheme}://{host}"))
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

/// Collapse `.`, `..` and repeated separators into an absolute path.
fn clean_path(raw: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.trim().split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_normalises_segments() {
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("zh/docs/"), "/zh/docs");
        assert_eq!(clean_path("/a/./b/../c"), "/a/c");
        assert_eq!(clean_path("../../etc"), "/etc");
    }

    #[test]
    fn site_origin_prefers_forwarded_proto() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("site.test"));
        assert_eq!(site_origin(&headers).as_deref(), Some("http://site.test"));

        headers.insert(
            FORWARDED_PROTO_HEADER,
            HeaderValue::from_static("https, http"),
        );
        assert_eq!(site_origin(&headers).as_deref(), Some("https://site.test"));
    }

    #[test]
    fn session_cookie_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session_token=abc123; other=1"),
        );

        assert_eq!(cookie_value(&headers, "session_token").as_deref(), Some("abc123"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }
}
