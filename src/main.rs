use std::{
    future::IntoFuture,
    io::Write,
    path::Path,
    process,
    sync::Arc,
};

use serde_json::Value;
use ssrd::{
    application::{
        error::AppError,
        render::{PageRequest, PageShell, PipelineConfig, PoolConfig, RenderPipeline},
        state::{EmptyDataSource, FetchPolicy, LOCALE_KEY, PageBackend, ServiceState},
    },
    config,
    domain::{payload::Payload, session::SessionParserSlot},
    infra::{
        engine::{self, CompiledProgram, EngineKind, EngineOptions},
        error::InfraError,
        http::{self, DevProxy},
        telemetry,
    },
};
use tokio::sync::Notify;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(target = "ssrd::main", error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(target = "ssrd::main", error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Render(args) => run_render(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let (pages, pipeline) = if settings.frontend.dev_mode {
        let proxy = DevProxy::new(settings.frontend.dev_server_url.clone())?;
        info!(
            target = "ssrd::main",
            upstream = %proxy.upstream(),
            "development mode enabled; proxying pages to the dev server"
        );
        (PageBackend::Proxy(Arc::new(proxy)), None)
    } else {
        let pipeline = build_pipeline(&settings).await?;
        if settings.render.prewarm {
            pipeline.prewarm();
        }
        (PageBackend::Render(Arc::clone(&pipeline)), Some(pipeline))
    };

    let state = ServiceState {
        pages,
        data: Arc::new(EmptyDataSource),
        locales: Arc::new(settings.locales.clone()),
        sessions: SessionParserSlot::default(),
        fetch: FetchPolicy {
            token: settings.fetch.token.clone(),
            expose_errors: settings.fetch.expose_errors,
        },
        client_dist: Arc::new(settings.frontend.client_dist.clone()),
        index_file: Arc::from(settings.frontend.index_file.as_str()),
    };

    let result = serve_http(&settings, state).await;

    if let Some(pipeline) = pipeline {
        pipeline.close();
        info!(target = "ssrd::main", "engine pool closed");
    }

    result
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let mut payload = match args.payload.as_deref() {
        Some(raw) => parse_payload(raw)?,
        None => Payload::new(),
    };
    let locale = args
        .locale
        .map(|locale| locale.trim().to_string())
        .filter(|locale| !locale.is_empty())
        .unwrap_or_else(|| settings.locales.from_path(&args.path).to_string());
    payload.insert(LOCALE_KEY.into(), Value::String(locale.clone()));

    let pipeline = build_pipeline(&settings).await?;
    let page = pipeline
        .render_page(&PageRequest::new(args.path, payload, locale))
        .await;
    pipeline.close();

    if let Some(class) = page.outcome.failure_class() {
        warn!(
            target = "ssrd::main",
            class = class.as_str(),
            "render failed; printed fallback page"
        );
    }

    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(page.html.as_bytes())
        .and_then(|()| stdout.write_all(b"\n"))
        .and_then(|()| stdout.flush())
        .map_err(InfraError::from)?;
    Ok(())
}

fn parse_payload(raw: &str) -> Result<Payload, AppError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AppError::validation("--payload must be a JSON object")),
        Err(err) => Err(AppError::validation(format!(
            "--payload is not valid JSON: {err}"
        ))),
    }
}

/// Load the page shell and bundle, start the engine pool and wrap it in the pipeline.
async fn build_pipeline(settings: &config::Settings) -> Result<Arc<RenderPipeline>, AppError> {
    let shell = read_startup_file(&settings.frontend.index_path()).await?;
    let bundle = read_startup_file(&settings.frontend.server_bundle).await?;
    let program = CompiledProgram::compile(bundle)?;

    let options = EngineOptions {
        kind: EngineKind::parse(&settings.engine.kind),
        pool: PoolConfig::new(
            settings.engine.pool_max_size,
            Some(settings.engine.acquire_timeout),
        ),
        loop_iteration_limit: settings.engine.loop_iteration_limit,
    };
    let renderer = engine::build_renderer(&options, program).await?;

    let config = PipelineConfig {
        concurrency_limit: settings.render.concurrency_limit,
        deadline: settings.render.deadline,
        prewarm_deadline: settings.render.prewarm_deadline,
    };
    Ok(Arc::new(RenderPipeline::new(
        renderer,
        PageShell::new(shell),
        config,
    )))
}

async fn read_startup_file(path: &Path) -> Result<String, InfraError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|err| InfraError::startup(path, err.to_string()))
}

async fn serve_http(settings: &config::Settings, state: ServiceState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(target = "ssrd::main", addr = %settings.server.addr, "listening");

    let shutdown = Arc::new(Notify::new());
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown({
        let shutdown = Arc::clone(&shutdown);
        async move { shutdown.notified().await }
    });
    let mut server = tokio::spawn(server.into_future());

    tokio::select! {
        joined = &mut server => return server_result(joined),
        () = shutdown_signal() => {}
    }

    info!(
        target = "ssrd::main",
        grace_seconds = settings.server.graceful_shutdown.as_secs(),
        "shutdown requested; draining connections"
    );
    shutdown.notify_one();

    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => server_result(joined),
        Err(_) => {
            warn!(
                target = "ssrd::main",
                "graceful shutdown period elapsed; dropping open connections"
            );
            server.abort();
            Ok(())
        }
    }
}

fn server_result(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(InfraError::from(err).into()),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target = "ssrd::main", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(target = "ssrd::main", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
