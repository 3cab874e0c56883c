use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::domain::payload::Payload;

/// Global the render bundle registers as its entry point.
pub const RENDER_ENTRY_POINT: &str = "ssrRender";
/// Global carrying the per-request payload into the bundle.
pub const DATA_GLOBAL: &str = "__SSR_DATA__";
/// Global the bundle fills with head markup.
pub const HEAD_GLOBAL: &str = "__SSR_HEAD__";
/// Script name the bundle is compiled under.
pub const SCRIPT_NAME: &str = "server.js";

/// One render request as seen by an execution context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderInput {
    pub url_path: String,
    pub payload: Payload,
}

impl RenderInput {
    pub fn new(url_path: impl Into<String>, payload: Payload) -> Self {
        Self {
            url_path: url_path.into(),
            payload,
        }
    }
}

/// Markup produced by a successful render.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderResult {
    pub html: String,
    pub head: String,
}

impl RenderResult {
    pub fn new(html: impl Into<String>, head: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            head: head.into(),
        }
    }
}

/// Structured render failures. Every variant except the startup ones degrades to
/// the fallback page.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("engine pool timeout after {waited:?}")]
    PoolTimeout { waited: Duration },
    #[error("engine pool is closed")]
    PoolClosed,
    #[error("failed to compile `{script}`: {message}")]
    Compile { script: String, message: String },
    #[error("failed to initialise execution context: {message}")]
    ContextInit { message: String },
    #[error("{message}")]
    EngineFault { message: String },
    #[error("render promise rejected: {reason}")]
    AsyncRejected { reason: String },
    #[error("render timeout after {budget:?}")]
    Timeout { budget: Duration },
    #[error("render cancelled")]
    Cancelled,
}

impl RenderError {
    pub fn engine_fault(message: impl Into<String>) -> Self {
        Self::EngineFault {
            message: message.into(),
        }
    }

    pub fn context_init(message: impl Into<String>) -> Self {
        Self::ContextInit {
            message: message.into(),
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            RenderError::PoolTimeout { .. } | RenderError::PoolClosed => {
                FailureClass::PoolExhausted
            }
            RenderError::Timeout { .. } | RenderError::Cancelled => FailureClass::Timeout,
            RenderError::Compile { .. }
            | RenderError::ContextInit { .. }
            | RenderError::EngineFault { .. }
            | RenderError::AsyncRejected { .. } => FailureClass::EngineFault,
        }
    }
}

/// Coarse classification used for logging, metrics and fallback decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Timeout,
    PoolExhausted,
    EngineFault,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Timeout => "timeout",
            FailureClass::PoolExhausted => "pool_exhausted",
            FailureClass::EngineFault => "engine_fault",
        }
    }
}

/// Result of one pipeline render attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    Rendered(RenderResult),
    Failed(RenderError),
}

impl RenderOutcome {
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            RenderOutcome::Rendered(_) => None,
            RenderOutcome::Failed(err) => Some(err.class()),
        }
    }

    pub fn into_result(self) -> Result<RenderResult, RenderError> {
        match self {
            RenderOutcome::Rendered(result) => Ok(result),
            RenderOutcome::Failed(err) => Err(err),
        }
    }
}

impl From<Result<RenderResult, RenderError>> for RenderOutcome {
    fn from(value: Result<RenderResult, RenderError>) -> Self {
        match value {
            Ok(result) => RenderOutcome::Rendered(result),
            Err(err) => RenderOutcome::Failed(err),
        }
    }
}

/// The render capability every engine backend provides.
///
/// `deadline` bounds the whole call: pool checkout, execution and promise
/// resolution. Implementations must not keep executing for the caller once it
/// passes.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        url_path: &str,
        payload: &Payload,
        deadline: Instant,
    ) -> Result<RenderResult, RenderError>;

    /// Stop handing out execution contexts and dispose idle ones.
    fn close(&self) {}

    /// Whether the renderer still accepts work.
    fn is_open(&self) -> bool {
        true
    }
}
