use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("failed to load `{}`: {message}", path.display())]
    Startup { path: PathBuf, message: String },
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn startup(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Startup {
            path: path.into(),
            message: message.into(),
        }
    }
}
