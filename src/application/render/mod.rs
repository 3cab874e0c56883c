//! Server-side rendering core.
//!
//! An [`EnginePool`] owns the execution contexts, the [`PooledRenderer`] runs one
//! render inside a checked-out context, and the [`RenderPipeline`] wraps that
//! with admission control, a deadline and the fallback page.

mod engine;
mod page;
mod pipeline;
mod pool;
mod renderer;
mod resolver;
mod types;

pub use engine::{AsyncState, CallError, CancelSignal, ScriptRuntime, panic_message};
pub use page::{
    APP_HTML_PLACEHOLDER, PageShell, SSR_DATA_SCRIPT_ID, apply_html_lang, inject_head_content,
    inject_ssr_data, js_escape,
};
pub use pipeline::{
    DEFAULT_PREWARM_DEADLINE, DEFAULT_RENDER_DEADLINE, PageRequest, PipelineConfig, RenderPipeline,
    RenderedPage,
};
pub use pool::{
    ContextFactory, DEFAULT_ACQUIRE_TIMEOUT, EnginePool, ExecutionContext, MIN_POOL_SIZE,
    PoolConfig, PoolStats, SlotLease,
};
pub use renderer::{ContextJob, JobContext, JobReport, PooledRenderer, render_in_context};
pub use resolver::resolve;
pub use types::{
    DATA_GLOBAL, FailureClass, HEAD_GLOBAL, RENDER_ENTRY_POINT, RenderError, RenderInput,
    RenderOutcome, RenderResult, Renderer, SCRIPT_NAME,
};

pub(crate) use pool::available_parallelism;

pub const METRIC_RENDER_TOTAL: &str = "ssrd_render_total";
pub const METRIC_RENDER_MS: &str = "ssrd_render_ms";
pub const METRIC_RENDER_FALLBACK_TOTAL: &str = "ssrd_render_fallback_total";
pub const METRIC_ENGINE_POOL_SIZE: &str = "ssrd_engine_pool_size";
pub const METRIC_ENGINE_POOL_TIMEOUT_TOTAL: &str = "ssrd_engine_pool_timeout_total";
pub const METRIC_ENGINE_CONTEXT_DISCARDED_TOTAL: &str = "ssrd_engine_context_discarded_total";
