//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::domain::locale::LocaleSet;

pub use cli::{CliArgs, Command, EngineOverrides, RenderArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "ssrd";
const ENV_PREFIX: &str = "SSRD";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_ENGINE_KIND: &str = "boa";
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_LOOP_ITERATION_LIMIT: u64 = 1_000_000;
const DEFAULT_RENDER_DEADLINE_MS: u64 = 3_000;
const DEFAULT_PREWARM_DEADLINE_MS: u64 = 2_000;
const DEFAULT_CLIENT_DIST: &str = "web/dist/client";
const DEFAULT_SERVER_BUNDLE: &str = "web/dist/server/server.js";
const DEFAULT_INDEX_FILE: &str = "index.html";
const DEFAULT_DEV_SERVER_URL: &str = "http://127.0.0.1:3333";
const DEFAULT_LOCALE: &str = "en";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub engine: EngineSettings,
    pub render: RenderSettings,
    pub frontend: FrontendSettings,
    pub locales: LocaleSet,
    pub fetch: FetchSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Backend name as configured; resolved once logging is up.
    pub kind: String,
    /// `None` applies the parallelism-based default.
    pub pool_max_size: Option<usize>,
    pub acquire_timeout: Duration,
    /// 0 disables the engine-side loop bound.
    pub loop_iteration_limit: u64,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    /// `None` admits as many renders as there are CPUs, `Some(0)` any number.
    pub concurrency_limit: Option<usize>,
    pub deadline: Duration,
    pub prewarm: bool,
    pub prewarm_deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct FrontendSettings {
    pub client_dist: PathBuf,
    pub server_bundle: PathBuf,
    pub index_file: String,
    /// Proxy page traffic to `dev_server_url` instead of rendering.
    pub dev_mode: bool,
    pub dev_server_url: Url,
}

impl FrontendSettings {
    pub fn index_path(&self) -> PathBuf {
        self.client_dist.join(&self.index_file)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchSettings {
    pub token: Option<String>,
    pub expose_errors: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("locales.supported")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Render(args)) => raw.apply_render_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    engine: RawEngineSettings,
    render: RawRenderSettings,
    frontend: RawFrontendSettings,
    locales: RawLocaleSettings,
    fetch: RawFetchSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_engine_overrides(&overrides.engine);
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(prewarm) = overrides.render_prewarm {
            self.render.prewarm = Some(prewarm);
        }
        if let Some(dev_mode) = overrides.frontend_dev_mode {
            self.frontend.dev_mode = Some(dev_mode.to_string());
        }
        if let Some(url) = overrides.frontend_dev_server_url.as_ref() {
            self.frontend.dev_server_url = Some(url.clone());
        }
    }

    fn apply_render_overrides(&mut self, args: &RenderArgs) {
        self.apply_engine_overrides(&args.engine);
        if let Some(level) = args.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
    }

    fn apply_engine_overrides(&mut self, overrides: &EngineOverrides) {
        if let Some(kind) = overrides.engine_kind.as_ref() {
            self.engine.kind = Some(kind.clone());
        }
        if let Some(size) = overrides.pool_max_size {
            self.engine.pool_max_size = Some(size);
        }
        if let Some(ms) = overrides.acquire_timeout_ms {
            self.engine.acquire_timeout_ms = Some(ms);
        }
        if let Some(ms) = overrides.render_deadline_ms {
            self.render.deadline_ms = Some(ms);
        }
        if let Some(limit) = overrides.render_concurrency_limit {
            self.render.concurrency_limit = Some(limit);
        }
        if let Some(path) = overrides.server_bundle.as_ref() {
            self.frontend.server_bundle = Some(path.clone());
        }
        if let Some(path) = overrides.client_dist.as_ref() {
            self.frontend.client_dist = Some(path.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            engine,
            render,
            frontend,
            locales,
            fetch,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let engine = build_engine_settings(engine);
        let render = build_render_settings(render);
        let frontend = build_frontend_settings(frontend)?;
        let locales = build_locale_set(locales)?;
        let fetch = build_fetch_settings(fetch);

        Ok(Self {
            server,
            logging,
            engine,
            render,
            frontend,
            locales,
            fetch,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_engine_settings(engine: RawEngineSettings) -> EngineSettings {
    EngineSettings {
        kind: engine
            .kind
            .unwrap_or_else(|| DEFAULT_ENGINE_KIND.to_string()),
        pool_max_size: engine.pool_max_size.filter(|size| *size > 0),
        acquire_timeout: millis_or(engine.acquire_timeout_ms, DEFAULT_ACQUIRE_TIMEOUT_MS),
        loop_iteration_limit: engine
            .loop_iteration_limit
            .unwrap_or(DEFAULT_LOOP_ITERATION_LIMIT),
    }
}

fn build_render_settings(render: RawRenderSettings) -> RenderSettings {
    RenderSettings {
        concurrency_limit: render.concurrency_limit,
        deadline: millis_or(render.deadline_ms, DEFAULT_RENDER_DEADLINE_MS),
        prewarm: render.prewarm.unwrap_or(true),
        prewarm_deadline: millis_or(render.prewarm_deadline_ms, DEFAULT_PREWARM_DEADLINE_MS),
    }
}

fn build_frontend_settings(frontend: RawFrontendSettings) -> Result<FrontendSettings, LoadError> {
    let index_file = frontend
        .index_file
        .map(|name| name.trim().to_string())
        .unwrap_or_else(|| DEFAULT_INDEX_FILE.to_string());
    if index_file.is_empty() || index_file.contains('/') || index_file.contains("..") {
        return Err(LoadError::invalid(
            "frontend.index_file",
            "must be a plain file name inside the client dist directory",
        ));
    }

    let raw_url = frontend
        .dev_server_url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| DEFAULT_DEV_SERVER_URL.to_string());
    let dev_server_url = Url::parse(&raw_url)
        .map_err(|err| LoadError::invalid("frontend.dev_server_url", format!("{raw_url}: {err}")))?;
    if !matches!(dev_server_url.scheme(), "http" | "https") || !dev_server_url.has_host() {
        return Err(LoadError::invalid(
            "frontend.dev_server_url",
            format!("{raw_url}: expected an http(s) URL with a host"),
        ));
    }

    Ok(FrontendSettings {
        client_dist: frontend
            .client_dist
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CLIENT_DIST)),
        server_bundle: frontend
            .server_bundle
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVER_BUNDLE)),
        index_file,
        dev_mode: frontend.dev_mode.as_deref().is_some_and(is_dev_mode),
        dev_server_url,
    })
}

/// Flag values that switch development mode on; anything else leaves it off.
fn is_dev_mode(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | "dev"
    )
}

fn build_locale_set(locales: RawLocaleSettings) -> Result<LocaleSet, LoadError> {
    let default = locales
        .default
        .unwrap_or_else(|| DEFAULT_LOCALE.to_string());
    let supported = locales.supported.unwrap_or_default();
    LocaleSet::new(default, supported)
        .map_err(|err| LoadError::invalid("locales.default", err.to_string()))
}

fn build_fetch_settings(fetch: RawFetchSettings) -> FetchSettings {
    FetchSettings {
        token: fetch.token.and_then(|value| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }),
        expose_errors: fetch.expose_errors.unwrap_or(false),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    kind: Option<String>,
    pool_max_size: Option<usize>,
    acquire_timeout_ms: Option<u64>,
    loop_iteration_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    concurrency_limit: Option<usize>,
    deadline_ms: Option<u64>,
    prewarm: Option<bool>,
    prewarm_deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFrontendSettings {
    client_dist: Option<PathBuf>,
    server_bundle: Option<PathBuf>,
    index_file: Option<String>,
    dev_mode: Option<String>,
    dev_server_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLocaleSettings {
    default: Option<String>,
    supported: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFetchSettings {
    token: Option<String>,
    expose_errors: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

/// Zero and unset both fall back to `default_ms`.
fn millis_or(value: Option<u64>, default_ms: u64) -> Duration {
    Duration::from_millis(value.filter(|ms| *ms > 0).unwrap_or(default_ms))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
