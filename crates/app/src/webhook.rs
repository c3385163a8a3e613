use std::{
    panic::{self, AssertUnwindSafe},
    time::Instant,
};

use axum::{
    body::Bytes,
    extract::{MatchedPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};
use twi_hook_core::{Payload, Topic};
use uuid::Uuid;

use crate::problem::ProblemResponse;
use crate::registry::EventHandler;
use crate::router::AppState;

const HEADER_SIGNATURE: &str = "X-Hub-Signature";

#[derive(Debug, Deserialize)]
pub struct ChallengeQuery {
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    uuid: Option<String>,
}

/// Answers the hub's verification GET for any topic path.
pub async fn handle_challenge(
    State(state): State<AppState>,
    Query(query): Query<ChallengeQuery>,
) -> Result<Response, ProblemResponse> {
    let mode = query.mode.as_deref().unwrap_or_default();
    let Some(challenge) = query.challenge else {
        counter!("webhook_challenges_total", "mode" => mode_label(mode), "result" => "missing_challenge")
            .increment(1);
        warn!(stage = "challenge", mode, "verification request without hub.challenge");
        return Err(ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "missing_challenge",
            "verification request must include hub.challenge",
        ));
    };
    let raw_uuid = query.uuid.unwrap_or_default();
    let id = Uuid::parse_str(&raw_uuid).ok();

    match mode {
        "subscribe" => {
            let confirmed = match id {
                Some(id) => state.registry().mark_active(id).await,
                None => None,
            };
            if confirmed.is_none() {
                counter!("webhook_challenges_total", "mode" => "subscribe", "result" => "unknown")
                    .increment(1);
                warn!(stage = "challenge", uuid = %raw_uuid, "subscribe challenge for unknown subscription");
                return Err(ProblemResponse::new(
                    StatusCode::NOT_FOUND,
                    "unknown_subscription",
                    format!("no subscription with uuid {raw_uuid:?}"),
                ));
            }
            info!(stage = "challenge", uuid = %raw_uuid, "subscription confirmed");
        }
        "unsubscribe" => {
            state.sweep().confirm(&raw_uuid);
            if let Some(id) = id {
                if state.wait_for_confirm() {
                    state.registry().mark_removed(id).await;
                } else {
                    state.registry().remove(id).await;
                }
            }
            info!(stage = "challenge", uuid = %raw_uuid, "unsubscribe confirmed");
        }
        other => {
            debug!(stage = "challenge", mode = other, uuid = %raw_uuid, "echoing challenge for unhandled mode");
        }
    }

    counter!("webhook_challenges_total", "mode" => mode_label(mode), "result" => "echoed")
        .increment(1);
    Ok(challenge_response(challenge))
}

/// Receives a notification POST, normalizes it for the matched topic and
/// invokes the subscription's handlers. Always answers with an empty `200`.
pub async fn handle_notification(
    State(state): State<AppState>,
    path: MatchedPath,
    Query(query): Query<NotificationQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let start = Instant::now();
    let Some(topic) = Topic::from_callback_path(path.as_str()) else {
        warn!(stage = "dispatch", path = path.as_str(), "notification on unknown path");
        return StatusCode::OK;
    };
    let label = topic.as_str();

    if let Some(secret) = state.secret() {
        let provided = headers
            .get(HEADER_SIGNATURE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if let Err(reason) = verify_signature(&secret, &body, provided) {
            counter!("webhook_notifications_total", "topic" => label, "result" => "invalid_signature")
                .increment(1);
            warn!(stage = "dispatch", topic = label, %reason, "dropping notification with bad signature");
            return StatusCode::OK;
        }
    }

    let json = serde_json::from_slice::<Value>(&body).ok();
    let payload = match topic.extract_payload(json) {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            counter!("webhook_notifications_total", "topic" => label, "result" => "empty")
                .increment(1);
            debug!(stage = "dispatch", topic = label, "notification without payload");
            return StatusCode::OK;
        }
        Err(err) => {
            counter!("webhook_notifications_total", "topic" => label, "result" => "invalid_payload")
                .increment(1);
            warn!(stage = "dispatch", topic = label, error = %err, "failed to normalize notification");
            return StatusCode::OK;
        }
    };

    let Some(id) = query.uuid.as_deref().and_then(|raw| Uuid::parse_str(raw).ok()) else {
        counter!("webhook_notifications_total", "topic" => label, "result" => "missing_uuid")
            .increment(1);
        warn!(stage = "dispatch", topic = label, uuid = ?query.uuid, "notification without a valid uuid");
        return StatusCode::OK;
    };

    let handlers = state.registry().handlers(id).await;
    if handlers.is_empty() {
        counter!("webhook_notifications_total", "topic" => label, "result" => "unrouted")
            .increment(1);
        debug!(stage = "dispatch", topic = label, %id, "no handlers for notification");
        return StatusCode::OK;
    }

    dispatch(topic, id, &payload, &handlers);
    counter!("webhook_notifications_total", "topic" => label, "result" => "dispatched").increment(1);
    histogram!("webhook_dispatch_latency_seconds", "topic" => label)
        .record(start.elapsed().as_secs_f64());
    StatusCode::OK
}

/// Invokes each handler in order; a panicking handler does not stop the rest.
fn dispatch(topic: Topic, id: Uuid, payload: &Payload, handlers: &[EventHandler]) {
    for (index, handler) in handlers.iter().enumerate() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(id, payload)));
        if outcome.is_err() {
            counter!("webhook_handler_panics_total", "topic" => topic.as_str()).increment(1);
            error!(
                stage = "dispatch",
                topic = topic.as_str(),
                %id,
                handler = index,
                "event handler panicked"
            );
        }
    }
}

fn challenge_response(challenge: String) -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], challenge).into_response()
}

fn mode_label(mode: &str) -> &'static str {
    match mode {
        "subscribe" => "subscribe",
        "unsubscribe" => "unsubscribe",
        _ => "other",
    }
}

fn verify_signature(secret: &[u8], body: &[u8], provided: &str) -> Result<(), String> {
    let hex_part = provided
        .strip_prefix("sha256=")
        .ok_or_else(|| "signature must start with 'sha256='".to_string())?;
    let provided_bytes =
        hex::decode(hex_part).map_err(|_| "signature is not valid hex".to_string())?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| "failed to initialize signature verifier".to_string())?;
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_bytes: &[u8] = expected.as_ref();

    if expected_bytes.ct_eq(provided_bytes.as_slice()).into() {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}
