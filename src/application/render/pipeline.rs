use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::{sync::Semaphore, task::JoinHandle, time::Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    METRIC_RENDER_FALLBACK_TOTAL, METRIC_RENDER_MS, METRIC_RENDER_TOTAL,
    engine::panic_message,
    page::PageShell,
    pool::available_parallelism,
    types::{RenderError, RenderOutcome, RenderResult, Renderer},
};
use crate::domain::payload::Payload;

/// Per-request budget when none is configured.
pub const DEFAULT_RENDER_DEADLINE: Duration = Duration::from_secs(3);
pub const DEFAULT_PREWARM_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// `None` sizes the limiter to the available parallelism; `Some(0)` disables it.
    pub concurrency_limit: Option<usize>,
    /// Zero falls back to [`DEFAULT_RENDER_DEADLINE`].
    pub deadline: Duration,
    pub prewarm_deadline: Duration,
}

impl PipelineConfig {
    fn permits(&self) -> Option<usize> {
        match self.concurrency_limit {
            None => Some(available_parallelism()),
            Some(0) => None,
            Some(limit) => Some(limit),
        }
    }

    fn effective_deadline(&self) -> Duration {
        if self.deadline.is_zero() {
            DEFAULT_RENDER_DEADLINE
        } else {
            self.deadline
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: None,
            deadline: DEFAULT_RENDER_DEADLINE,
            prewarm_deadline: DEFAULT_PREWARM_DEADLINE,
        }
    }
}

/// Everything the pipeline needs to produce one page.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub path: String,
    pub payload: Payload,
    pub locale: String,
    /// Correlation id embedded in the fallback page and failure logs.
    pub request_id: String,
}

impl PageRequest {
    pub fn new(path: impl Into<String>, payload: Payload, locale: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            payload,
            locale: locale.into(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// A servable page and how it was produced.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub html: String,
    pub outcome: RenderOutcome,
}

impl RenderedPage {
    pub fn is_fallback(&self) -> bool {
        matches!(self.outcome, RenderOutcome::Failed(_))
    }
}

/// Admission control, deadline, panic containment and page assembly around a
/// [`Renderer`]. Every request yields a page; failures degrade to the fallback.
pub struct RenderPipeline {
    renderer: Arc<dyn Renderer>,
    limiter: Option<Arc<Semaphore>>,
    deadline: Duration,
    prewarm_deadline: Duration,
    shell: PageShell,
}

impl RenderPipeline {
    pub fn new(renderer: Arc<dyn Renderer>, shell: PageShell, config: PipelineConfig) -> Self {
        Self {
            renderer,
            limiter: config.permits().map(|permits| Arc::new(Semaphore::new(permits))),
            deadline: config.effective_deadline(),
            prewarm_deadline: config.prewarm_deadline,
            shell,
        }
    }

    pub fn renderer(&self) -> &Arc<dyn Renderer> {
        &self.renderer
    }

    pub fn shell(&self) -> &PageShell {
        &self.shell
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Render within the configured deadline.
    pub async fn render_with_timeout(&self, path: &str, payload: &Payload) -> RenderOutcome {
        self.render_within(path, payload, self.deadline).await
    }

    /// Render and assemble the final page, degrading to the fallback page on any
    /// failure.
    pub async fn render_page(&self, request: &PageRequest) -> RenderedPage {
        let outcome = self
            .render_with_timeout(&request.path, &request.payload)
            .await;

        let html = match &outcome {
            RenderOutcome::Rendered(result) => {
                self.shell
                    .compose(result, &request.locale, &request.payload)
            }
            RenderOutcome::Failed(err) => {
                counter!(METRIC_RENDER_FALLBACK_TOTAL).increment(1);
                warn!(
                    target = "ssrd::render",
                    request_id = %request.request_id,
                    path = %request.path,
                    class = err.class().as_str(),
                    error = %err,
                    "render failed; serving fallback page"
                );
                self.shell
                    .fallback(&request.payload, &request.locale, &request.request_id)
            }
        };

        RenderedPage { html, outcome }
    }

    /// Render `/` once in the background so the first real request finds warm
    /// code paths. The result is discarded.
    pub fn prewarm(self: &Arc<Self>) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = pipeline
                .render_within("/", &Payload::new(), pipeline.prewarm_deadline)
                .await;
            match outcome.failure_class() {
                None => debug!(target = "ssrd::render", "prewarm render completed"),
                Some(class) => debug!(
                    target = "ssrd::render",
                    class = class.as_str(),
                    "prewarm render failed"
                ),
            }
        })
    }

    pub fn close(&self) {
        self.renderer.close();
    }

    pub fn is_open(&self) -> bool {
        self.renderer.is_open()
    }

    async fn render_within(&self, path: &str, payload: &Payload, budget: Duration) -> RenderOutcome {
        let started = Instant::now();
        let deadline = started + budget;

        let attempt = async {
            let _permit = match &self.limiter {
                Some(limiter) => Some(
                    limiter
                        .acquire()
                        .await
                        .map_err(|_| RenderError::PoolClosed)?,
                ),
                None => None,
            };
            if Instant::now() >= deadline {
                return Err(RenderError::Timeout { budget });
            }
            self.renderer.render(path, payload, deadline).await
        };

        let result: Result<RenderResult, RenderError> =
            match AssertUnwindSafe(tokio::time::timeout_at(deadline, attempt))
                .catch_unwind()
                .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(_elapsed)) => Err(RenderError::Timeout { budget }),
                Err(panic) => Err(RenderError::engine_fault(format!(
                    "render panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };

        let result = result.map_err(|err| match err {
            RenderError::Cancelled => RenderError::Timeout { budget },
            other => other,
        });

        let outcome = RenderOutcome::from(result);
        let label = outcome
            .failure_class()
            .map_or("ok", |class| class.as_str());
        counter!(METRIC_RENDER_TOTAL, "outcome" => label).increment(1);
        histogram!(METRIC_RENDER_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        outcome
    }
}
