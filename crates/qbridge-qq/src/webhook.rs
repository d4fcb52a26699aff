//! Webhook ingress: signature checks, validation challenge, event hand-off.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use qbridge_core::{BoundedQueue, PushOutcome};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::dto::{ValidationRequest, ValidationResponse, WebhookPayload};
use crate::events::VendorEvent;
use crate::signature::WebhookSigner;

pub const SIGNATURE_HEADER: &str = "x-signature-ed25519";
pub const TIMESTAMP_HEADER: &str = "x-signature-timestamp";
pub const APP_ID_HEADER: &str = "x-bot-appid";

const OP_DISPATCH: i32 = 0;
const OP_CALLBACK_VALIDATION: i32 = 13;

#[derive(Debug)]
pub struct WebhookState {
    pub app_id: String,
    pub signer: WebhookSigner,
    pub inbound: Arc<BoundedQueue<VendorEvent>>,
}

pub fn build_webhook_router(path: &str, state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(path, post(handle_webhook))
        .route("/healthz", get(handle_health))
        .with_state(state)
}

/// Serves the webhook on an already bound listener until `shutdown` flips to true.
pub async fn serve_webhook(
    listener: TcpListener,
    path: &str,
    state: Arc<WebhookState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local_addr = listener
        .local_addr()
        .context("failed to resolve webhook bound address")?;
    tracing::info!(addr = %local_addr, path, "qq webhook server listening");

    axum::serve(listener, build_webhook_router(path, state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("qq webhook server exited unexpectedly")
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status":"ok"})))
}

async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str());
    if !content_type.contains("application/json") {
        return error_response(StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported media type");
    }
    if header_str(&headers, APP_ID_HEADER).trim() != state.app_id {
        return error_response(StatusCode::UNAUTHORIZED, "app id mismatch");
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(error = %error, "failed to parse webhook payload");
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid webhook payload: {error}"),
            );
        }
    };
    tracing::debug!(op = payload.op, event_type = %payload.t, "webhook received");

    match payload.op {
        OP_DISPATCH => {
            let verified = state.signer.verify(
                header_str(&headers, SIGNATURE_HEADER),
                header_str(&headers, TIMESTAMP_HEADER),
                &body,
            );
            if let Err(error) = verified {
                tracing::warn!(error = %error, event_id = %payload.id, "webhook signature rejected");
                return (StatusCode::BAD_REQUEST, "true").into_response();
            }
            let event = VendorEvent::from(payload);
            if state.inbound.push(event) == PushOutcome::Closed {
                return error_response(StatusCode::SERVICE_UNAVAILABLE, "bridge is shutting down");
            }
            (StatusCode::OK, "ok").into_response()
        }
        OP_CALLBACK_VALIDATION => {
            let request: ValidationRequest = match serde_json::from_value(payload.d) {
                Ok(request) => request,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to parse validation payload");
                    return error_response(StatusCode::BAD_REQUEST, &error.to_string());
                }
            };
            let signature = state
                .signer
                .sign_validation(&request.event_ts, &request.plain_token);
            (
                StatusCode::OK,
                Json(ValidationResponse {
                    plain_token: request.plain_token,
                    signature,
                }),
            )
                .into_response()
        }
        other => {
            tracing::debug!(op = other, "unhandled webhook op");
            StatusCode::OK.into_response()
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

fn error_response(status: StatusCode, message: &str) -> Response {
    tracing::info!(status = status.as_u16(), message, "webhook request rejected");
    (
        status,
        Json(json!({"status": "error", "message": message})),
    )
        .into_response()
}
