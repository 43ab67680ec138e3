use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::reseed::{CacheStatus, Reseeder};

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub signer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    pub bundles: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub built_at: Option<String>,
    pub building: bool,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub cache: CheckResult,
    pub netdb: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// Minimal subset of `AppState` required by the health-check handler.
#[derive(Clone)]
pub struct HealthState {
    pub reseeder: Arc<Reseeder>,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

fn check_cache(status: CacheStatus) -> CheckResult {
    match status {
        CacheStatus::Empty => CheckResult::unhealthy("no generation published yet"),
        CacheStatus::Ready { bundles: 0, .. } => {
            CheckResult::unhealthy("live generation has no bundles")
        }
        CacheStatus::Ready { .. } => CheckResult::healthy(),
    }
}

async fn check_netdb(reseeder: &Reseeder) -> CheckResult {
    if reseeder.source().is_available().await {
        CheckResult::healthy()
    } else {
        CheckResult::unhealthy("netDb directory is not readable")
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(cache: CacheStatus, checks: &HealthChecks) -> HealthStatus {
    if cache == CacheStatus::Empty {
        // Nothing to serve until the first build lands.
        HealthStatus::Unhealthy
    } else if checks.cache.ok && checks.netdb.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let reseeder = &state.reseeder;
    let cache_status = reseeder.status();
    let generation = reseeder.current_generation();

    let checks = HealthChecks {
        cache: check_cache(cache_status),
        netdb: check_netdb(reseeder).await,
    };
    let status = aggregate_status(cache_status, &checks);

    let body = HealthResponse {
        status,
        signer_id: reseeder.signer_id().to_owned(),
        generation: generation.as_ref().map(|g| g.id),
        bundles: generation.as_ref().map_or(0, |g| g.bundles.len()),
        built_at: generation.as_ref().map(|g| g.built_at.to_rfc3339()),
        building: reseeder.is_building(),
        checks,
    };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::netdb::{DescriptorRecord, DescriptorSource, LocalNetDb, StaticSource};
    use crate::reseed::{ReseedConfig, SigningIdentity};

    fn reseeder(source: Arc<dyn DescriptorSource>) -> Arc<Reseeder> {
        Arc::new(Reseeder::new(
            ReseedConfig::default(),
            SigningIdentity::new("reseed@mail.i2p", [9u8; 32].to_vec()),
            source,
            MetricsRegistry::new(),
        ))
    }

    async fn fetch_health(reseeder: &Arc<Reseeder>) -> (StatusCode, serde_json::Value) {
        let response = health_handler(State(HealthState {
            reseeder: Arc::clone(reseeder),
        }))
        .await
        .into_response();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn unpublished_cache_is_unhealthy() {
        let reseeder = reseeder(Arc::new(StaticSource::default()));
        let (status, body) = fetch_health(&reseeder).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["signer_id"], "reseed@mail.i2p");
        assert!(body.get("generation").is_none());
    }

    #[tokio::test]
    async fn ready_cache_is_ok() {
        let records = vec![DescriptorRecord::new("routerInfo-a.dat", vec![1u8; 10])];
        let reseeder = reseeder(Arc::new(StaticSource::new(records)));
        reseeder.start().await.unwrap();
        let (status, body) = fetch_health(&reseeder).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["generation"], 1);
        assert_eq!(body["bundles"], 4);
        reseeder.shutdown().await;
    }

    #[tokio::test]
    async fn empty_generation_is_degraded() {
        let reseeder = reseeder(Arc::new(StaticSource::default()));
        reseeder.start().await.unwrap();
        let (status, body) = fetch_health(&reseeder).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["checks"]["cache"]["ok"], false);
        reseeder.shutdown().await;
    }

    #[tokio::test]
    async fn missing_netdb_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let source = LocalNetDb::new(dir.path().join("absent"), 0);
        let reseeder = reseeder(Arc::new(source));
        let (_, body) = fetch_health(&reseeder).await;
        assert_eq!(body["checks"]["netdb"]["ok"], false);
    }
}
