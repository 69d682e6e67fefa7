#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # ttyhub
//!
//! Terminal session sharing core. ttyhub owns PTY-backed sessions, records
//! their output asciinema-style, exposes a per-session IPC socket speaking a
//! framed binary protocol, and serves an HTTP/WS control plane for creating,
//! listing, driving, and viewing sessions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    middleware,
    routing::{delete, get, post},
    Extension, Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use ttyhub::{auth, routes, ws, AppState, AuthToken, Config, SessionRegistry};

/// Terminal session sharing server.
#[derive(Parser)]
#[command(name = "ttyhub", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    // Validate config before proceeding
    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            tracing::error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("ttyhub v{} starting", env!("CARGO_PKG_VERSION"));

    let control_root = config.control_root_path();
    info!("Control root: {}", control_root.display());

    if config.auth_token().is_none() {
        warn!("No auth token configured — control plane is unauthenticated");
    }

    let registry = match SessionRegistry::new(control_root, config.registry_settings(), None) {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!("Failed to initialize control root: {e}");
            std::process::exit(1);
        }
    };

    // Recover sessions left behind by a previous run, then optionally sweep
    // out old exited ones.
    let (running, exited) = registry.recover().await;
    if running + exited > 0 {
        info!("Recovered {running} running and {exited} exited session(s)");
    }
    if config.server.cleanup_on_startup {
        let age = Duration::from_secs(config.server.cleanup_age_hours * 3600);
        let removed = registry.cleanup_stale(age).await;
        if removed > 0 {
            info!("Startup cleanup removed {removed} stale session(s)");
        }
    }

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        registry: registry.clone(),
    };

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route(
            "/api/sessions",
            get(routes::sessions::list_sessions).post(routes::sessions::create_session),
        )
        .route(
            "/api/sessions/{id}",
            get(routes::sessions::get_session)
                .delete(routes::sessions::kill_session)
                .patch(routes::sessions::patch_session),
        )
        .route("/api/sessions/{id}/input", post(routes::sessions::send_input))
        .route(
            "/api/sessions/{id}/resize",
            post(routes::sessions::resize_session),
        )
        .route("/api/sessions/{id}/status", post(routes::sessions::set_status))
        .route(
            "/api/sessions/{id}/recording",
            get(routes::sessions::tail_session_recording),
        )
        .route(
            "/api/sessions/{id}/state",
            delete(routes::sessions::remove_session),
        )
        .layer(middleware::from_fn(auth::require_token));

    // WS authenticates via query parameter inside the handler.
    let ws_route = Router::new().route("/api/sessions/{id}/ws", get(ws::ws_attach));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ]);

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_route)
        .layer(Extension(AuthToken(state.config.auth_token())))
        .with_state(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            state.config.server.max_connections,
        ));

    let listen = state.config.effective_listen();
    let listener = TcpListener::bind(&listen).await.expect("Failed to bind");
    info!("Listening on {listen}");

    // Periodic sweep: retire IPC listeners of exited sessions nobody watches.
    let sweep_registry = registry.clone();
    let sweep_interval = state.config.server.sweep_interval_secs;
    let sweep_task = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(sweep_interval.max(1)));
        loop {
            interval.tick().await;
            sweep_registry.reap().await;
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    sweep_task.abort();
    registry.kill_all().await;
    info!("Goodbye");
}
