//! Script engine backends and the factory that picks one from configuration.

mod boa;
mod worker;

use std::sync::Arc;

use tracing::{info, warn};

use crate::application::render::{EnginePool, PoolConfig, PooledRenderer, RenderError, Renderer};

pub use boa::{BoaLoader, BoaRuntime, CompiledProgram};
pub use worker::{EngineWorker, RuntimeLoader, WorkerFactory};

/// Default engine-side bound on loop iterations per evaluation.
pub const DEFAULT_LOOP_ITERATION_LIMIT: u64 = 1_000_000;

/// Available engine backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    #[default]
    Boa,
}

impl EngineKind {
    /// Resolve a configured engine name. Unknown names fall back to the default.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "boa" | "js" | "default" => EngineKind::Boa,
            other => {
                warn!(
                    target = "ssrd::engine",
                    requested = other,
                    fallback = EngineKind::default().as_str(),
                    "unknown engine kind"
                );
                EngineKind::default()
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Boa => "boa",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub kind: EngineKind,
    pub pool: PoolConfig,
    pub loop_iteration_limit: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            pool: PoolConfig::default(),
            loop_iteration_limit: DEFAULT_LOOP_ITERATION_LIMIT,
        }
    }
}

/// Start the configured backend's pool and wrap it as a [`Renderer`].
pub async fn build_renderer(
    options: &EngineOptions,
    program: CompiledProgram,
) -> Result<Arc<dyn Renderer>, RenderError> {
    match options.kind {
        EngineKind::Boa => {
            let loader = BoaLoader::new(program, options.loop_iteration_limit);
            let pool = EnginePool::start(WorkerFactory::new(loader), options.pool.clone()).await?;
            let stats = pool.stats();
            info!(
                target = "ssrd::engine",
                engine = options.kind.as_str(),
                warm = stats.size,
                max_size = stats.max_size,
                acquire_timeout_ms = options.pool.acquire_timeout.as_millis() as u64,
                "engine pool started"
            );
            Ok(Arc::new(PooledRenderer::new(pool)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_aliases_resolve_to_boa() {
        for name in ["", "boa", "JS", " default ", "v8"] {
            assert_eq!(EngineKind::parse(name), EngineKind::Boa, "{name}");
        }
    }
}
