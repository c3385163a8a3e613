use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use twi_hook_core::Topic;

use crate::problem::ProblemResponse;
use crate::registry::{SubscriptionRegistry, SweepTracker};
use crate::{telemetry, webhook};

#[derive(Clone)]
pub struct AppState {
    registry: SubscriptionRegistry,
    sweep: Arc<SweepTracker>,
    wait_for_confirm: bool,
    secret: Option<Arc<[u8]>>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        registry: SubscriptionRegistry,
        sweep: Arc<SweepTracker>,
        wait_for_confirm: bool,
        secret: Option<Arc<[u8]>>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            registry,
            sweep,
            wait_for_confirm,
            secret,
            metrics,
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn sweep(&self) -> &SweepTracker {
        &self.sweep
    }

    /// When set, unsubscribe confirmations leave the record for the waiter to remove.
    pub fn wait_for_confirm(&self) -> bool {
        self.wait_for_confirm
    }

    pub fn secret(&self) -> Option<Arc<[u8]>> {
        self.secret.clone()
    }

    pub fn metrics(&self) -> Option<&PrometheusHandle> {
        self.metrics.as_ref()
    }
}

pub fn app_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics));

    Topic::ALL
        .into_iter()
        .fold(router, |router, topic| {
            router.route(
                topic.callback_path(),
                get(webhook::handle_challenge).post(webhook::handle_notification),
            )
        })
        .with_state(state)
}

async fn root() -> &'static str {
    "twitch webhook"
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Result<Response, ProblemResponse> {
    let handle = state.metrics().ok_or_else(|| {
        ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "metrics_disabled",
            "no metrics recorder is installed",
        )
    })?;
    let body = telemetry::render_metrics(handle);
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response())
}
