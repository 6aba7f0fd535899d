/*
 * volume-sweeper - StatefulSet Volume Claim Janitor
 * Copyright (C) 2025 the volume-sweeper authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! volume-sweeper - Kubernetes controller for StatefulSet volume claims
//!
//! This service keeps the managed-by label on PersistentVolumeClaims in sync
//! with the StatefulSet owning the mounting pod and deletes orphaned claims.
//! It also provides health and readiness endpoints for probes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::Parser;
use serde_json::{json, Value};
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use volume_sweeper::{controller, Selector, SweeperConfig};

#[derive(Parser, Debug)]
#[command(name = "volume-sweeper", version, about = "Deletes orphaned StatefulSet volume claims")]
struct Cli {
    /// Namespace to watch. Empty watches all namespaces.
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Label selector restricting which StatefulSets are managed.
    #[arg(long, env = "LABEL_SELECTOR", default_value = "")]
    selector: String,

    /// Log claim deletions instead of performing them.
    #[arg(long)]
    dry_run: bool,

    /// Do not re-queue keys whose sync failed; wait for the next watch event
    /// instead.
    #[arg(long)]
    no_requeue_on_error: bool,

    /// Seconds to wait for the initial cache sync before startup fails.
    #[arg(long, default_value_t = 300)]
    cache_sync_timeout_secs: u64,

    /// Listen address for the health endpoints.
    #[arg(long, default_value = "0.0.0.0:8080")]
    health_addr: String,
}

#[derive(Clone)]
struct AppState {
    ready: watch::Receiver<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    info!("Starting volume-sweeper v{}", env!("CARGO_PKG_VERSION"));

    // A selector typo must never widen the deletion scope, so parse failure
    // is fatal.
    let selector: Selector = cli
        .selector
        .parse()
        .with_context(|| format!("failed to parse label selector {:?}", cli.selector))?;

    let config = Arc::new(SweeperConfig {
        namespace: (!cli.namespace.is_empty()).then(|| cli.namespace.clone()),
        selector,
        dry_run: cli.dry_run,
        requeue_on_error: !cli.no_requeue_on_error,
        cache_sync_timeout: Duration::from_secs(cli.cache_sync_timeout_secs),
    });

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let (ready_tx, ready_rx) = watch::channel(false);

    // Start the controller in the background
    let controller_handle = {
        let client = client.clone();
        let config = config.clone();
        tokio::spawn(async move { controller::run(client, config, ready_tx, shutdown_signal()).await })
    };

    // Build the HTTP router for probes
    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(AppState { ready: ready_rx });

    let listener = tokio::net::TcpListener::bind(&cli.health_addr).await?;
    info!("Health endpoints listening on {}", cli.health_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            error!("Health server error: {}", err);
        }
    });

    // The controller drives the process lifetime; it returns on shutdown or
    // on a fatal startup error.
    let result = controller_handle.await;
    server_handle.abort();

    match result {
        Ok(Ok(())) => {
            info!("volume-sweeper stopped");
            Ok(())
        }
        Ok(Err(err)) => {
            error!("Controller error: {}", err);
            Err(err.into())
        }
        Err(join_err) => {
            warn!("Controller task failed to join: {}", join_err);
            Err(join_err.into())
        }
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "volume-sweeper",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !*state.ready.borrow() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(json!({
        "status": "ready",
        "service": "volume-sweeper",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
