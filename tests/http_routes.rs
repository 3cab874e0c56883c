use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use ssrd::{
    application::{
        render::{PageShell, PipelineConfig, RenderError, RenderPipeline, RenderResult, Renderer},
        state::{
            DataRequest, DataSource, DataSourceError, EmptyDataSource, FetchPolicy, PageBackend,
            ServiceState,
        },
    },
    domain::{
        locale::LocaleSet,
        payload::{AsPayload, Payload},
        session::SessionParserSlot,
    },
    infra::http::build_router,
};
use tempfile::TempDir;
use tokio::time::Instant;
use tower::ServiceExt;

const SHELL: &str = "<!doctype html><html lang=\"en\"><head><title>app</title></head><body><div id=\"app\"><!--app-html--></div></body></html>";

/// Echoes the path and the payload's locale; `/broken` fails.
struct EchoRenderer {
    open: AtomicBool,
}

#[async_trait]
impl Renderer for EchoRenderer {
    async fn render(
        &self,
        url_path: &str,
        payload: &Payload,
        _deadline: Instant,
    ) -> Result<RenderResult, RenderError> {
        if url_path == "/broken" {
            return Err(RenderError::engine_fault("TypeError: x is undefined"));
        }
        let locale = payload
            .get("locale")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(RenderResult::new(
            format!("<main data-locale=\"{locale}\">{url_path}</main>"),
            "<meta name=\"rendered\" content=\"yes\">",
        ))
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct FailingSource;

#[async_trait]
impl DataSource for FailingSource {
    async fn load(
        &self,
        _request: &DataRequest,
    ) -> Result<Option<Box<dyn AsPayload>>, DataSourceError> {
        Err(DataSourceError::message("upstream refused connection"))
    }
}

struct PathSource;

#[async_trait]
impl DataSource for PathSource {
    async fn load(
        &self,
        request: &DataRequest,
    ) -> Result<Option<Box<dyn AsPayload>>, DataSourceError> {
        Ok(Some(Box::new(json!({
            "path": request.path,
            "query": request.query,
        }))))
    }
}

struct Harness {
    _dist: TempDir,
    pipeline: Arc<RenderPipeline>,
    router: Router,
}

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create dir");
    }
    std::fs::write(path, contents).expect("write file");
}

fn harness(data: Arc<dyn DataSource>, fetch: FetchPolicy) -> Harness {
    let dist = tempfile::tempdir().expect("tempdir");
    write(dist.path(), "index.html", SHELL);
    write(dist.path(), "robots.txt", "User-agent: *");
    write(dist.path(), "assets/app.js", "console.log('client')");

    let renderer = Arc::new(EchoRenderer {
        open: AtomicBool::new(true),
    });
    let pipeline = Arc::new(RenderPipeline::new(
        renderer,
        PageShell::new(SHELL),
        PipelineConfig::default(),
    ));
    let state = ServiceState {
        pages: PageBackend::Render(Arc::clone(&pipeline)),
        data,
        locales: Arc::new(LocaleSet::new("en", ["en", "zh"]).expect("locales")),
        sessions: SessionParserSlot::default(),
        fetch,
        client_dist: Arc::new(dist.path().to_path_buf()),
        index_file: Arc::from("index.html"),
    };
    let router = build_router(state);

    Harness {
        _dist: dist,
        pipeline,
        router,
    }
}

fn default_harness() -> Harness {
    harness(Arc::new(EmptyDataSource), FetchPolicy::default())
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

async fn get(router: &Router, uri: &str) -> Response {
    send(
        router,
        Request::builder()
            .uri(uri)
            .header(header::HOST, "site.test")
            .body(Body::empty())
            .expect("request"),
    )
    .await
}

async fn body_text(response: Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).expect("json body")
}

fn same_origin_data_request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::HOST, "site.test")
        .header(header::ORIGIN, "http://site.test")
        .body(Body::empty())
        .expect("request")
}

#[tokio::test]
async fn page_is_server_rendered_with_locale_and_no_cache_headers() {
    let harness = default_harness();

    let response = get(&harness.router, "/zh/docs").await;

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers[header::CONTENT_TYPE], "text/html; charset=utf-8");
    assert_eq!(
        headers[header::CACHE_CONTROL],
        "no-cache, no-store, must-revalidate"
    );
    assert_eq!(headers[header::PRAGMA], "no-cache");
    assert_eq!(headers[header::EXPIRES], "0");

    let html = body_text(response).await;
    assert!(html.contains("<html lang=\"zh\">"));
    assert!(html.contains("<main data-locale=\"zh\">/zh/docs</main>"));
    assert!(html.contains("<meta name=\"rendered\" content=\"yes\">"));
    assert!(html.contains("<script id=\"ssr-data\">"));
    assert!(html.contains("http://site.test"));
}

#[tokio::test]
async fn failed_render_serves_fallback_page() {
    let harness = default_harness();

    let response = get(&harness.router, "/broken").await;

    assert_eq!(response.status(), StatusCode::OK);
    let html = body_text(response).await;
    assert!(html.contains("<div id=\"app\"></div>"));
    assert!(html.contains("<meta name=\"ssr-error-id\" content=\""));
    assert!(html.contains("<script id=\"ssr-data\">"));
}

#[tokio::test]
async fn data_source_failure_on_page_is_internal_error() {
    let harness = harness(Arc::new(FailingSource), FetchPolicy::default());

    let response = get(&harness.router, "/about").await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn static_files_and_asset_like_paths() {
    let harness = default_harness();

    let asset = get(&harness.router, "/assets/app.js").await;
    assert_eq!(asset.status(), StatusCode::OK);
    assert_eq!(
        asset.headers()[header::CACHE_CONTROL],
        "public, max-age=31536000, immutable"
    );

    let robots = get(&harness.router, "/robots.txt").await;
    assert_eq!(robots.status(), StatusCode::OK);
    assert_eq!(body_text(robots).await, "User-agent: *");

    for uri in ["/favicon.ico", "/assets/missing.js", "/docs/guide.pdf"] {
        let response = get(&harness.router, uri).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn index_file_is_never_served_raw() {
    let harness = default_harness();

    let response = get(&harness.router, "/index.html").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_data_prefix_paths_are_not_rendered() {
    let harness = default_harness();

    let response = get(&harness.router, "/_ssr/dataset").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reflects_pool_state() {
    let harness = default_harness();

    let open = get(&harness.router, "/_health").await;
    assert_eq!(open.status(), StatusCode::NO_CONTENT);

    harness.pipeline.close();
    let closed = get(&harness.router, "/_health").await;
    assert_eq!(closed.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn data_route_requires_the_shared_token() {
    let harness = harness(
        Arc::new(EmptyDataSource),
        FetchPolicy {
            token: Some("s3cret".into()),
            expose_errors: false,
        },
    );

    let mut request = same_origin_data_request("/_ssr/data/en");
    request
        .headers_mut()
        .insert("x-ssr-token", "wrong".parse().expect("header"));
    let rejected = send(&harness.router, request).await;
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);

    let mut request = same_origin_data_request("/_ssr/data/en");
    request
        .headers_mut()
        .insert("x-ssr-token", "s3cret".parse().expect("header"));
    let accepted = send(&harness.router, request).await;
    assert_eq!(accepted.status(), StatusCode::OK);
}

#[tokio::test]
async fn cross_origin_data_requests_need_the_fetch_flag() {
    let harness = default_harness();

    let cross = Request::builder()
        .uri("/_ssr/data/en")
        .header(header::HOST, "site.test")
        .header(header::ORIGIN, "https://evil.test")
        .body(Body::empty())
        .expect("request");
    assert_eq!(
        send(&harness.router, cross).await.status(),
        StatusCode::FORBIDDEN
    );

    let flagged = Request::builder()
        .uri("/_ssr/data/en")
        .header(header::HOST, "site.test")
        .header("x-ssr-fetch", "1")
        .body(Body::empty())
        .expect("request");
    assert_eq!(send(&harness.router, flagged).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn data_route_returns_enriched_payload() {
    let harness = harness(Arc::new(PathSource), FetchPolicy::default());
    let token = STANDARD.encode(
        json!({"id": "u1", "name": "Ada", "email": "ada@example.com", "provider": "github", "iat": 1})
            .to_string(),
    );

    let mut request = same_origin_data_request("/_ssr/data/zh/./docs?page=2");
    request.headers_mut().insert(
        header::COOKIE,
        format!("session_token={token}").parse().expect("cookie"),
    );
    let response = send(&harness.router, request).await;

    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["path"], json!("/zh/docs"));
    assert_eq!(payload["query"], json!("page=2"));
    assert_eq!(payload["locale"], json!("zh"));
    assert_eq!(payload["siteOrigin"], json!("http://site.test"));
    assert_eq!(payload["session"]["user"]["email"], json!("ada@example.com"));
}

#[tokio::test]
async fn data_root_with_no_data_is_enriched_empty_object() {
    let harness = default_harness();

    let response = send(&harness.router, same_origin_data_request("/_ssr/data")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"locale": "en", "siteOrigin": "http://site.test"})
    );
}

#[tokio::test]
async fn data_source_errors_are_masked_unless_exposed() {
    let masked = harness(Arc::new(FailingSource), FetchPolicy::default());
    let response = send(&masked.router, same_origin_data_request("/_ssr/data/x")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_json(response).await,
        json!({"error": "internal server error"})
    );

    let exposed = harness(
        Arc::new(FailingSource),
        FetchPolicy {
            token: None,
            expose_errors: true,
        },
    );
    let response = send(&exposed.router, same_origin_data_request("/_ssr/data/x")).await;
    assert_eq!(
        body_json(response).await,
        json!({"error": "upstream refused connection"})
    );
}
