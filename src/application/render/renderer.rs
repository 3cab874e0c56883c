use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::{sync::oneshot, time::Instant};
use tracing::debug;

use super::{
    engine::{CallError, CancelSignal, ScriptRuntime},
    pool::{ContextFactory, EnginePool, ExecutionContext},
    resolver::resolve,
    types::{
        DATA_GLOBAL, HEAD_GLOBAL, RENDER_ENTRY_POINT, RenderError, RenderInput, RenderResult,
        Renderer,
    },
};
use crate::domain::payload::Payload;

/// Run the render entry point inside `runtime`.
///
/// Binds the payload, invokes the entry point with the URL path, settles an
/// asynchronous result and reads the head output global.
pub fn render_in_context<R: ScriptRuntime>(
    runtime: &mut R,
    input: &RenderInput,
    signal: &CancelSignal,
) -> Result<RenderResult, RenderError> {
    if signal.is_cancelled() {
        return Err(RenderError::Cancelled);
    }

    runtime.clear_global(HEAD_GLOBAL)?;
    if input.payload.is_empty() {
        runtime.clear_global(DATA_GLOBAL)?;
    } else {
        runtime.set_global_json(DATA_GLOBAL, &Value::Object(input.payload.clone()))?;
    }

    let returned = runtime
        .call_global(RENDER_ENTRY_POINT, &input.url_path)
        .map_err(|err| match err {
            CallError::NotCallable => {
                RenderError::engine_fault(format!("{RENDER_ENTRY_POINT} is not a function"))
            }
            CallError::Thrown(message) => RenderError::engine_fault(message),
        })?;

    let settled = resolve(runtime, returned, signal)?;
    let html = runtime.stringify(&settled)?;
    let head = runtime.global_string(HEAD_GLOBAL)?.unwrap_or_default();

    Ok(RenderResult { html, head })
}

/// A render request addressed to one execution context.
#[derive(Debug, Clone)]
pub struct ContextJob {
    pub input: RenderInput,
    pub signal: CancelSignal,
}

/// What an execution context reports back for a [`ContextJob`].
#[derive(Debug)]
pub struct JobReport {
    pub result: Result<RenderResult, RenderError>,
    /// False when the context was interrupted or faulted and must not be reused.
    pub reusable: bool,
}

/// Execution context that runs render jobs off the caller's task.
pub trait JobContext: ExecutionContext {
    /// Signal bound to this context's interrupt flag.
    fn cancel_signal(&self, deadline: std::time::Instant) -> CancelSignal;

    /// Queue `job`; the receiver errors if the context dies before replying.
    fn submit(&self, job: ContextJob) -> oneshot::Receiver<JobReport>;
}

/// [`Renderer`] backed by an [`EnginePool`].
pub struct PooledRenderer<F: ContextFactory> {
    pool: Arc<EnginePool<F>>,
}

impl<F: ContextFactory> PooledRenderer<F> {
    pub fn new(pool: Arc<EnginePool<F>>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<EnginePool<F>> {
        &self.pool
    }
}

#[async_trait]
impl<F> Renderer for PooledRenderer<F>
where
    F: ContextFactory,
    F::Context: JobContext,
{
    async fn render(
        &self,
        url_path: &str,
        payload: &Payload,
        deadline: Instant,
    ) -> Result<RenderResult, RenderError> {
        let context = tokio::time::timeout_at(deadline, self.pool.get())
            .await
            .map_err(|_| RenderError::Cancelled)??;
        let checkout = Checkout::new(&self.pool, context);

        let (signal, reply) = match checkout.context() {
            Some(context) => {
                let signal = context.cancel_signal(deadline.into_std());
                let reply = context.submit(ContextJob {
                    input: RenderInput::new(url_path, payload.clone()),
                    signal: signal.clone(),
                });
                (signal, reply)
            }
            None => return Err(RenderError::PoolClosed),
        };

        match tokio::time::timeout_at(deadline, reply).await {
            Err(_) => {
                signal.interrupt();
                checkout.discard();
                Err(RenderError::Cancelled)
            }
            Ok(Err(_)) => {
                checkout.discard();
                Err(RenderError::engine_fault(
                    "execution context exited before replying",
                ))
            }
            Ok(Ok(report)) => {
                if report.reusable && !signal.is_interrupted() {
                    checkout.release();
                } else {
                    checkout.discard();
                }
                report.result
            }
        }
    }

    fn close(&self) {
        self.pool.close();
    }

    fn is_open(&self) -> bool {
        !self.pool.is_closed()
    }
}

/// Owns a checked-out context until it is returned. Dropping it without a
/// decision (for example when the caller's future is cancelled) interrupts and
/// discards the context.
struct Checkout<'a, F: ContextFactory> {
    pool: &'a EnginePool<F>,
    context: Option<F::Context>,
}

impl<'a, F: ContextFactory> Checkout<'a, F> {
    fn new(pool: &'a EnginePool<F>, context: F::Context) -> Self {
        Self {
            pool,
            context: Some(context),
        }
    }

    fn context(&self) -> Option<&F::Context> {
        self.context.as_ref()
    }

    fn release(mut self) {
        if let Some(context) = self.context.take() {
            self.pool.put(context);
        }
    }

    fn discard(mut self) {
        if let Some(context) = self.context.take() {
            self.pool.discard(context);
        }
    }
}

impl<F: ContextFactory> Drop for Checkout<'_, F> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            debug!(
                target = "ssrd::render",
                context_id = context.id(),
                "render abandoned; discarding context"
            );
            self.pool.discard(context);
        }
    }
}
