use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the ssrd binary.
#[derive(Debug, Parser)]
#[command(
    name = "ssrd",
    version,
    about = "Server-side rendering daemon for pre-built JavaScript bundles"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "SSRD_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP server.
    Serve(Box<ServeArgs>),
    /// Render a single page to stdout and exit.
    Render(RenderArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    /// Request path to render, e.g. `/en/about`.
    #[arg(value_name = "PATH")]
    pub path: String,

    /// JSON object handed to the bundle as the page payload.
    #[arg(long, value_name = "JSON")]
    pub payload: Option<String>,

    /// Locale for the `lang` attribute; detected from the path when omitted.
    #[arg(long, value_name = "LOCALE")]
    pub locale: Option<String>,

    #[command(flatten)]
    pub engine: EngineOverrides,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,
}

/// Engine and bundle flags shared by `serve` and `render`.
#[derive(Debug, Args, Default, Clone)]
pub struct EngineOverrides {
    /// Select the script engine backend.
    #[arg(long = "engine-kind", value_name = "KIND")]
    pub engine_kind: Option<String>,

    /// Upper bound on pooled execution contexts (floored at 8).
    #[arg(long = "engine-pool-max-size", value_name = "COUNT")]
    pub pool_max_size: Option<usize>,

    /// How long a render waits for a free execution context.
    #[arg(long = "engine-acquire-timeout-ms", value_name = "MILLIS")]
    pub acquire_timeout_ms: Option<u64>,

    /// Per-render deadline.
    #[arg(long = "render-deadline-ms", value_name = "MILLIS")]
    pub render_deadline_ms: Option<u64>,

    /// Concurrent renders admitted by the pipeline; 0 disables the limit.
    #[arg(long = "render-concurrency-limit", value_name = "COUNT")]
    pub render_concurrency_limit: Option<usize>,

    /// Path to the server render bundle.
    #[arg(
        long = "frontend-server-bundle",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub server_bundle: Option<PathBuf>,

    /// Directory holding the client build and `index.html`.
    #[arg(
        long = "frontend-client-dist",
        value_name = "PATH",
        value_hint = ValueHint::DirPath
    )]
    pub client_dist: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub engine: EngineOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle the warm-up render issued at startup.
    #[arg(
        long = "render-prewarm",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub render_prewarm: Option<bool>,

    /// Proxy pages to the frontend dev server instead of rendering them.
    #[arg(
        long = "frontend-dev-mode",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub frontend_dev_mode: Option<bool>,

    /// Frontend dev server used in development mode.
    #[arg(long = "frontend-dev-server-url", value_name = "URL")]
    pub frontend_dev_server_url: Option<String>,
}
