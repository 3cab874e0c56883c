//! Shared service state handed to every request handler.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, Request},
    response::Response,
};
use serde_json::Value;
use thiserror::Error;

use crate::{
    application::render::RenderPipeline,
    domain::{
        locale::LocaleSet,
        payload::{AsPayload, Payload},
        session::{SessionParser, SessionParserSlot},
    },
};

pub const SESSION_KEY: &str = "session";
pub const LOCALE_KEY: &str = "locale";
pub const SITE_ORIGIN_KEY: &str = "siteOrigin";

/// What a data source sees of the incoming request.
#[derive(Debug, Clone, Default)]
pub struct DataRequest {
    /// Page path, always starting with `/`.
    pub path: String,
    pub query: Option<String>,
    pub locale: String,
    pub headers: HeaderMap,
}

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("{0}")]
    Message(String),
    #[error("data source failed: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl DataSourceError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Supplies the per-page payload. `Ok(None)` means the page has no data.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn load(
        &self,
        request: &DataRequest,
    ) -> Result<Option<Box<dyn AsPayload>>, DataSourceError>;
}

/// Data source for deployments that render without backend data.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyDataSource;

#[async_trait]
impl DataSource for EmptyDataSource {
    async fn load(
        &self,
        _request: &DataRequest,
    ) -> Result<Option<Box<dyn AsPayload>>, DataSourceError> {
        Ok(None)
    }
}

/// Guard settings for the client-side data route.
#[derive(Debug, Clone, Default)]
pub struct FetchPolicy {
    pub token: Option<String>,
    pub expose_errors: bool,
}

/// Request facts used to enrich a payload.
#[derive(Debug, Clone, Default)]
pub struct RequestFacts {
    pub session_token: Option<String>,
    /// `scheme://host`, when the request named a host.
    pub site_origin: Option<String>,
}

/// Forwards page requests to another server.
#[async_trait]
pub trait PageProxy: Send + Sync {
    /// Upstream failures are answered, not returned.
    async fn forward(&self, request: Request<Body>) -> Response;
}

/// How pages that match no other route are produced.
#[derive(Clone)]
pub enum PageBackend {
    Render(Arc<RenderPipeline>),
    /// Development mode: static files and pages come from the dev server.
    Proxy(Arc<dyn PageProxy>),
}

impl PageBackend {
    pub fn is_open(&self) -> bool {
        match self {
            PageBackend::Render(pipeline) => pipeline.is_open(),
            PageBackend::Proxy(_) => true,
        }
    }

    pub fn serves_static_files(&self) -> bool {
        matches!(self, PageBackend::Render(_))
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub pages: PageBackend,
    pub data: Arc<dyn DataSource>,
    pub locales: Arc<LocaleSet>,
    pub sessions: SessionParserSlot,
    pub fetch: FetchPolicy,
    pub client_dist: Arc<PathBuf>,
    pub index_file: Arc<str>,
}

impl ServiceState {
    /// Install a custom session-token parser; `None` restores the default.
    pub fn set_session_parser(&self, parser: Option<Arc<dyn SessionParser>>) {
        self.sessions.set(parser);
    }

    pub fn locale_for_path(&self, path: &str) -> String {
        self.locales.from_path(path).to_string()
    }

    /// Load the page payload and merge in the request-derived keys.
    pub async fn page_payload(
        &self,
        request: &DataRequest,
        facts: &RequestFacts,
    ) -> Result<Payload, DataSourceError> {
        let loaded = self.data.load(request).await?;
        let payload = loaded.map(|data| data.as_payload()).unwrap_or_default();
        Ok(self.enrich(payload, &request.locale, facts))
    }

    /// Add `session`, `locale` and `siteOrigin`, replacing keys of the same name.
    pub fn enrich(&self, mut payload: Payload, locale: &str, facts: &RequestFacts) -> Payload {
        if let Some(session) = facts
            .session_token
            .as_deref()
            .and_then(|token| self.sessions.session_for(token))
        {
            payload.insert(SESSION_KEY.into(), Value::Object(session));
        }
        if !locale.is_empty() {
            payload.insert(LOCALE_KEY.into(), Value::String(locale.to_string()));
        }
        if let Some(origin) = facts.site_origin.as_ref() {
            payload.insert(SITE_ORIGIN_KEY.into(), Value::String(origin.clone()));
        }
        payload
    }
}
