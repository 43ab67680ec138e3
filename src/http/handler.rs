//! axum router and request handlers for the reseed service.
//!
//! Routes:
//! - `GET  {prefix}/i2pseeds.su3` - A random signed su3 bundle
//! - `GET  /healthz`              - Health check
//! - `GET  /metrics`              - Prometheus metrics

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::RejectReason;
use crate::reseed::ReseedError;
use crate::AppState;

/// File name reseed clients request and save the bundle under.
pub const SU3_FILE_NAME: &str = "i2pseeds.su3";

/// `Retry-After` sent while the first generation is still being built.
const NOT_READY_RETRY_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let reseed_path = format!("{}/{SU3_FILE_NAME}", state.config.server.prefix);
    Router::new()
        .route(&reseed_path, get(handle_reseed))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET {prefix}/i2pseeds.su3`
///
/// Hands out one bundle from the live generation.  Never waits on a build.
#[instrument(skip(state, headers), fields(client = tracing::field::Empty))]
async fn handle_reseed(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let client = client_addr(&headers, peer, state.config.server.trust_proxy);
    tracing::Span::current().record("client", client.as_str());

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let allowed = &state.config.server.allowed_user_agents;
    if !allowed.is_empty() && !allowed.iter().any(|ua| ua == user_agent) {
        debug!(%user_agent, "user agent not allowed");
        state.metrics.metrics.record_reject(RejectReason::UserAgent);
        return Err(AppError::Forbidden);
    }

    let bundle = state.reseeder.get_bundle().map_err(|e| {
        let retry_after = match e {
            ReseedError::CacheEmpty => state.reseeder.rebuild_interval(),
            _ => Duration::from_secs(NOT_READY_RETRY_SECS),
        };
        AppError::from_reseed(e, retry_after)
    })?;

    info!(
        generation = bundle.generation,
        bundle = bundle.index,
        bytes = bundle.bytes.len(),
        "serving su3 bundle"
    );

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, bundle.content_type().to_owned()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={SU3_FILE_NAME}"),
            ),
        ],
        bundle.bytes,
    )
        .into_response())
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        reseeder: Arc::clone(&state.reseeder),
    };
    crate::health::health_handler(State(health_state)).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the reseeder.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Address to log for the caller.  Behind a trusted proxy that is the first
/// `X-Forwarded-For` hop; otherwise the socket peer.
fn client_addr(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(addr) = forwarded {
            return addr.to_owned();
        }
    }
    peer.ip().to_string()
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The client's user agent is not on the allow list.
    Forbidden,
    /// No bundle can be served right now.
    Unavailable {
        reason: ReseedError,
        retry_after: Duration,
    },
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl AppError {
    fn from_reseed(err: ReseedError, retry_after: Duration) -> Self {
        if err.is_cache_read() {
            AppError::Unavailable {
                reason: err,
                retry_after,
            }
        } else {
            AppError::Internal(err.into())
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden").into_response(),
            AppError::Unavailable {
                reason,
                retry_after,
            } => {
                warn!(reason = reason.kind(), "reseed request refused");
                let mut response =
                    (StatusCode::SERVICE_UNAVAILABLE, reason.to_string()).into_response();
                response.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(retry_after.as_secs().max(1)),
                );
                response
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
