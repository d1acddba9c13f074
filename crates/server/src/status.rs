//! Status surface over HTTP
//!
//! - `GET /health` - 200 while some feed is live and the writer runs, 503 otherwise
//! - `GET /status` - the full [`PipelineStatus`] as JSON
//! - `GET /subscriptions` - the live subscription list
//! - `PUT /subscriptions` - replace it; sessions apply the diff without reconnecting

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use common::{
    CircuitState, OverallHealth, PipelineStatus, StatusBoard, Subscription, SubscriptionHandle, SubscriptionSet,
};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::{Result, ServerError};

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    feeds: OverallHealth,
    writer_running: bool,
    circuit: CircuitState,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct UpdatedBody {
    entries: usize,
}

/// Shared state behind every route
#[derive(Clone)]
pub struct AppState {
    board: StatusBoard,
    subscriptions: Option<SubscriptionHandle>,
}

impl AppState {
    pub fn new(board: StatusBoard) -> Self {
        Self {
            board,
            subscriptions: None,
        }
    }

    /// Accept subscription updates on `/subscriptions`
    pub fn with_subscriptions(mut self, handle: SubscriptionHandle) -> Self {
        self.subscriptions = Some(handle);
        self
    }
}

#[derive(Clone)]
pub struct StatusServer {
    host: String,
    port: u16,
    state: AppState,
    bound_addr: Arc<RwLock<Option<SocketAddr>>>,
}

impl StatusServer {
    pub fn new(host: impl Into<String>, port: u16, board: StatusBoard) -> Self {
        Self {
            host: host.into(),
            port,
            state: AppState::new(board),
            bound_addr: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_subscriptions(mut self, handle: SubscriptionHandle) -> Self {
        self.state = self.state.with_subscriptions(handle);
        self
    }

    /// Address actually bound, once listening
    pub fn address(&self) -> Option<SocketAddr> {
        *self.bound_addr.read()
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ServerError::InvalidAddress(format!("{}:{}", self.host, self.port)))
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.bind_addr()?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::bind(addr.to_string(), e))?;

        let local_addr = listener.local_addr()?;
        *self.bound_addr.write() = Some(local_addr);
        info!(%local_addr, "Status server listening");

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            })
            .await;

        *self.bound_addr.write() = None;
        match result {
            Ok(()) => {
                info!("Status server stopped");
                Ok(())
            }
            Err(e) => {
                error!(%e, "Status server error");
                Err(ServerError::Io(e))
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/subscriptions", get(get_subscriptions).put(put_subscriptions))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.board.snapshot();
    let healthy = status.is_healthy();
    let body = HealthBody {
        status: if healthy { "healthy" } else { "unhealthy" },
        feeds: status.supervisor.overall,
        writer_running: status.writer.running,
        circuit: status.writer.circuit,
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

async fn status_handler(State(state): State<AppState>) -> Json<PipelineStatus> {
    Json(state.board.snapshot())
}

fn error_response(code: StatusCode, error: impl Into<String>) -> Response {
    (code, Json(ErrorBody { error: error.into() })).into_response()
}

fn updates_disabled() -> Response {
    error_response(StatusCode::NOT_FOUND, "subscription updates are not enabled")
}

async fn get_subscriptions(State(state): State<AppState>) -> Response {
    match &state.subscriptions {
        Some(handle) => Json(handle.current().iter().cloned().collect::<Vec<_>>()).into_response(),
        None => updates_disabled(),
    }
}

/// Replace the whole subscription set
///
/// Entries must name a symbol and an underlying; the set is rejected whole
/// if any entry does not.
async fn put_subscriptions(State(state): State<AppState>, Json(entries): Json<Vec<Subscription>>) -> Response {
    let Some(handle) = &state.subscriptions else {
        return updates_disabled();
    };

    if let Some(bad) = entries
        .iter()
        .find(|s| s.feed_symbol.trim().is_empty() || s.instrument.underlying.trim().is_empty())
    {
        warn!(source = %bad.source, feed_symbol = %bad.feed_symbol, "Rejected subscription update");
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("{} subscription needs a feed_symbol and an underlying", bad.source),
        );
    }

    let entries = handle.replace(SubscriptionSet::new(entries));
    info!(entries, "Subscription set replaced over HTTP");
    (StatusCode::OK, Json(UpdatedBody { entries })).into_response()
}
