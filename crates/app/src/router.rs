use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{error, info};

use invoice_sync_core::{EventPosition, Normalizer};
use invoice_sync_storage::Database;
use invoice_sync_util::Secret;

use crate::problem::ProblemResponse;
use crate::queue::QueueHandle;
use crate::reconcile::{ReconcileService, ReconcileTriggerError};
use crate::signature::SignatureVerifier;
use crate::sync::Clock;
use crate::{telemetry, webhook};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    normalizer: Arc<Normalizer>,
    verifier: SignatureVerifier,
    queue: QueueHandle,
    reconcile: Option<ReconcileService>,
    admin_token: Option<Secret>,
    clock: Clock,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        normalizer: Arc<Normalizer>,
        verifier: SignatureVerifier,
        queue: QueueHandle,
        reconcile: Option<ReconcileService>,
        admin_token: Option<Secret>,
    ) -> Self {
        Self {
            metrics,
            storage,
            normalizer,
            verifier,
            queue,
            reconcile,
            admin_token,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub fn reconcile(&self) -> Option<&ReconcileService> {
        self.reconcile.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/webhooks/blockchain/health", post(webhook::health))
        .route("/webhooks/blockchain/:provider", post(webhook::handle))
        .route("/invoices/:invoice_id/lifecycle", get(invoice_lifecycle))
        .route("/admin/reconcile", post(admin_reconcile))
        .route("/_debug/reconcile", get(debug_reconcile))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LifecycleResponse {
    invoice_id: String,
    token_id: Option<String>,
    status: String,
    owner_address: Option<String>,
    funded_amount_cents: i64,
    repaid_amount_cents: i64,
    last_applied_event: Option<PositionView>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PositionView {
    block_number: u64,
    transaction_index: u64,
    log_index: u64,
}

impl From<EventPosition> for PositionView {
    fn from(position: EventPosition) -> Self {
        Self {
            block_number: position.block_number,
            transaction_index: position.transaction_index,
            log_index: position.log_index,
        }
    }
}

async fn invoice_lifecycle(
    State(state): State<AppState>,
    Path(invoice_id): Path<String>,
) -> Result<Json<LifecycleResponse>, ProblemResponse> {
    let view = state
        .storage()
        .lifecycle()
        .fetch_status(&invoice_id)
        .await
        .map_err(|err| {
            error!(stage = "storage", %invoice_id, error = %err, "failed to load lifecycle status");
            ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "lifecycle_unavailable",
                "failed to load lifecycle status",
            )
        })?
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::NOT_FOUND,
                "invoice_not_found",
                format!("no lifecycle record for invoice {invoice_id}"),
            )
        })?;

    Ok(Json(LifecycleResponse {
        invoice_id: view.invoice_id,
        token_id: view.token_id,
        status: view.status.as_str().to_string(),
        owner_address: view.owner_address,
        funded_amount_cents: view.funded_amount_cents,
        repaid_amount_cents: view.repaid_amount_cents,
        last_applied_event: view.last_applied_event.map(PositionView::from),
        updated_at: view.updated_at,
    }))
}

#[derive(Debug, Deserialize)]
struct ReconcileRequest {
    from_block: u64,
    to_block: u64,
}

async fn admin_reconcile(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let Some(expected) = state.admin_token.as_ref() else {
        return Err(ProblemResponse::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "admin_disabled",
            "admin token is not configured",
        ));
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default();
    if !bool::from(expected.expose().ct_eq(provided.as_bytes())) {
        return Err(ProblemResponse::new(
            StatusCode::UNAUTHORIZED,
            "invalid_admin_token",
            "missing or invalid bearer token",
        ));
    }

    let Some(service) = state.reconcile() else {
        return Err(ProblemResponse::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "reconcile_unavailable",
            "no chain reader is configured",
        ));
    };

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        let request: ReconcileRequest = serde_json::from_slice(&body).map_err(|err| {
            ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "invalid_reconcile_request",
                format!("invalid request body: {err}"),
            )
        })?;
        Some(request)
    };

    let result = match &request {
        Some(range) => service.trigger_range(range.from_block, range.to_block).await,
        None => service.trigger_catch_up().await,
    };
    match result {
        Ok(()) => {
            info!(stage = "reconcile", range = ?request.as_ref().map(|r| (r.from_block, r.to_block)), "reconciliation queued");
            Ok((StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))).into_response())
        }
        Err(err @ ReconcileTriggerError::InvalidRange { .. }) => Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_reconcile_request",
            err.to_string(),
        )),
        Err(err @ ReconcileTriggerError::ChannelClosed) => Err(ProblemResponse::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "reconcile_unavailable",
            err.to_string(),
        )),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DebugReconcileResponse {
    network: String,
    checkpoint: Option<CheckpointStatusView>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointStatusView {
    status: String,
    last_block: Option<u64>,
    error_message: Option<String>,
    last_run_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

async fn debug_reconcile(
    State(state): State<AppState>,
) -> Result<Json<DebugReconcileResponse>, ProblemResponse> {
    let network = state.normalizer().network().to_string();
    let checkpoint = state
        .storage()
        .checkpoints()
        .fetch(&network)
        .await
        .map_err(|err| {
            error!(stage = "reconcile", error = %err, network = %network, "failed to load reconcile checkpoint");
            ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "debug_reconcile_error",
                "failed to load reconcile checkpoint",
            )
        })?;

    Ok(Json(DebugReconcileResponse {
        network,
        checkpoint: checkpoint.map(|cp| CheckpointStatusView {
            status: cp.status.as_str().to_string(),
            last_block: cp.last_block,
            error_message: cp.error_message,
            last_run_at: cp.last_run_at,
            updated_at: cp.updated_at,
        }),
    }))
}
