use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::metrics::Metrics;
use crate::notification::Notification;

/// Grace period for in-flight requests after the shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Matrix-style error body.
#[derive(Debug, Serialize)]
pub struct MatrixError {
    pub errcode: &'static str,
    pub error: String,

    #[serde(skip)]
    status: StatusCode,
}

impl MatrixError {
    fn bad_json(error: impl ToString) -> Self {
        Self {
            errcode: "M_BAD_JSON",
            error: error.to_string(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    fn missing_param(error: impl ToString) -> Self {
        Self {
            errcode: "M_MISSING_PARAM",
            error: error.to_string(),
            status: StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for MatrixError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct NotifyRequest {
    notification: Notification,
}

#[derive(Debug, Serialize)]
struct NotifyResponse {
    rejected: Vec<String>,
}

#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, metrics: Arc<Metrics>) -> Self {
        Self {
            dispatcher,
            metrics,
        }
    }
}

/// The gateway router. Oversized bodies are refused with 413 by the body
/// limit layer; a `GET` on the notify path yields 405 from method routing.
pub fn router(state: AppState, max_body_size: usize) -> Router {
    Router::new()
        .route(
            "/_matrix/push/v1/notify",
            post(notify).layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route("/health", get(|| async { "OK" }))
        .route("/version", get(|| async { VERSION }))
        .with_state(state)
}

async fn notify(State(state): State<AppState>, body: Bytes) -> Response {
    let start = Instant::now();

    let request: NotifyRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return MatrixError::bad_json(err).into_response(),
    };

    let notification = request.notification.normalize();
    if notification.devices.is_empty() {
        return MatrixError::missing_param("notification has no devices").into_response();
    }

    let result = state.dispatcher.dispatch(notification).await;

    state
        .metrics
        .notify_duration
        .observe(start.elapsed().as_secs_f64());

    let status = if result.retry {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(NotifyResponse {
            rejected: result.rejected,
        }),
    )
        .into_response()
}

fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let metrics = metrics.clone();
            async move {
                match metrics.render() {
                    Ok(body) => body.into_response(),
                    Err(err) => {
                        error!(error = %err, "failed to render metrics");
                        StatusCode::INTERNAL_SERVER_ERROR.into_response()
                    }
                }
            }
        }),
    )
}

/// Binds the configured addresses and serves until SIGTERM/ctrl-c, then
/// drains for up to [`DRAIN_TIMEOUT`] before forcing the remaining
/// connections closed.
pub async fn run(
    config: &Config,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    let state = AppState::new(dispatcher.clone(), metrics.clone());
    let app = router(state, config.http.max_body_size);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut servers = JoinSet::new();
    for address in &config.http.bind_addresses {
        let addr = SocketAddr::new(*address, config.http.port);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(%addr, "listening for notifications");

        let app = app.clone();
        let mut rx = shutdown_rx.clone();
        servers.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await
        });
    }

    if let Some(metrics_config) = &config.metrics {
        let addr = SocketAddr::new(metrics_config.bind_address, metrics_config.port);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics listener {addr}"))?;
        info!(%addr, "exposing metrics");

        let app = metrics_router(metrics);
        let mut rx = shutdown_rx.clone();
        servers.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await
        });
    }

    let drain = async {
        let mut rx = shutdown_rx.clone();
        let _ = rx.changed().await;
        tokio::time::sleep(DRAIN_TIMEOUT).await;
    };
    tokio::pin!(drain);

    loop {
        tokio::select! {
            joined = servers.join_next() => match joined {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(err))) => return Err(err).context("server error"),
                Some(Err(err)) => return Err(err).context("server task failed"),
            },
            _ = &mut drain => {
                warn!("drain deadline reached, closing remaining connections");
                servers.shutdown().await;
                break;
            }
        }
    }

    dispatcher.shutdown().await;
    info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
