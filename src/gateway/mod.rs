/// HTTP intake for gateway webhooks plus the realtime client channel.
///
/// Webhook deliveries are parsed into inbound events, run through the
/// reconciliation engine, and acknowledged according to their error class:
/// terminal rejections are acknowledged-and-dropped (redelivering an
/// unprocessable event is useless), storage failures ask the gateway to
/// retry (idempotency makes that safe). Successful ingests publish a
/// domain event to the broadcast hub.
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dedup::DuplicateResolver;
use crate::errors::CourierError;
use crate::events::{DomainEvent, InboundEvent};
use crate::hub::{BroadcastHub, Frame};
use crate::reconcile::ReconcileEngine;

type HmacSha256 = Hmac<Sha256>;

/// Max webhook payload size: 1 MB.
const WEBHOOK_MAX_BODY: usize = 1_048_576;

/// Client-level liveness exchange on the realtime channel.
const CLIENT_PING: &str = "ping";

/// Shared state between the HTTP handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub engine: Arc<ReconcileEngine>,
    pub resolver: Arc<DuplicateResolver>,
    pub hub: Arc<BroadcastHub>,
    pub webhook_secret: Option<String>,
}

/// Build the HTTP router.
fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/webhook", post(webhook_handler))
        .route("/api/health", get(health_handler))
        .route("/api/ws", get(ws_handler))
        .with_state(state)
}

/// GET /api/health — liveness check.
async fn health_handler() -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": crate::VERSION
    }))
}

/// Validate HMAC-SHA256 signature against a payload.
pub(crate) fn validate_webhook_signature(secret: &str, signature: &str, body: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    // Support both raw hex and "sha256=..." prefix (GitHub-style)
    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    expected.as_bytes().ct_eq(sig.as_bytes()).into()
}

/// Terminal acknowledgement: the event is logged and dropped; the gateway
/// must not redeliver it.
fn dropped(err: &CourierError) -> Response {
    (
        StatusCode::OK,
        axum::Json(json!({
            "status": "dropped",
            "reason": err.class(),
            "detail": err.to_string(),
        })),
    )
        .into_response()
}

/// POST /api/webhook — receive one inbound event from a gateway.
async fn webhook_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if body.len() > WEBHOOK_MAX_BODY {
        warn!("webhook payload too large ({} bytes)", body.len());
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    if let Some(secret) = state.webhook_secret.as_deref() {
        let signature = headers
            .get("X-Signature-256")
            .or_else(|| headers.get("X-Hub-Signature-256"))
            .or_else(|| headers.get("X-Webhook-Signature"))
            .and_then(|v| v.to_str().ok());

        let Some(signature) = signature else {
            warn!("webhook: missing signature header");
            return StatusCode::FORBIDDEN.into_response();
        };
        if !validate_webhook_signature(secret, signature, &body) {
            warn!("webhook: invalid signature");
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    let event: InboundEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            let err = CourierError::MalformedPayload(e.to_string());
            warn!("webhook: {}", err);
            return dropped(&err);
        }
    };

    match state.engine.ingest(&event).await {
        Ok(receipt) => {
            if receipt.duplicate {
                debug!(
                    "webhook: duplicate delivery of {} absorbed",
                    event.provider_message_id
                );
            } else {
                let domain_event = DomainEvent::message_created(
                    receipt.contact_id,
                    receipt.conversation_id,
                    receipt.message_id,
                    event.platform,
                    &event.body.display_text(),
                    event.timestamp,
                );
                let delivered = state.hub.broadcast(&domain_event);
                debug!(
                    "webhook: message {} broadcast to {} client(s)",
                    receipt.message_id, delivered
                );
            }

            // A back-filled phone may have revealed duplicates that predate
            // it; run the online repair off the request path.
            if let Some(phone) = receipt.backfilled_phone.clone() {
                let resolver = state.resolver.clone();
                let platform = event.platform;
                tokio::spawn(async move {
                    match resolver.merge_contacts_by_phone(platform, &phone).await {
                        Ok(0) => {}
                        Ok(merged) => {
                            info!("online repair merged {} contact(s) for {}", merged, phone);
                        }
                        Err(e) => error!("online repair for {} failed: {}", phone, e),
                    }
                });
            }

            (
                StatusCode::OK,
                axum::Json(json!({
                    "status": "ok",
                    "contactId": receipt.contact_id,
                    "conversationId": receipt.conversation_id,
                    "messageId": receipt.message_id,
                    "duplicate": receipt.duplicate,
                })),
            )
                .into_response()
        }
        Err(err) if err.is_rejection() => {
            // Unknown integrations are a configuration gap operators must
            // notice, not a drop in the dark.
            if matches!(err, CourierError::UnknownIntegration { .. }) {
                error!("webhook: {} — check integration provisioning", err);
            } else {
                warn!("webhook: {}", err);
            }
            dropped(&err)
        }
        Err(err) if err.is_retryable() => {
            warn!("webhook: transient failure, asking gateway to retry: {}", err);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(json!({"error": err.to_string(), "retryable": true})),
            )
                .into_response()
        }
        Err(err) => {
            error!("webhook: ingest failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

/// GET /api/ws — upgrade to the realtime client channel.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub.clone()))
}

/// Drive one client connection: a writer task drains hub frames into the
/// socket, the reader loop records liveness and answers client pings. The
/// connection is unregistered on any exit path.
async fn handle_socket(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let id = Uuid::new_v4();
    let Some(mut rx) = hub.register(id) else {
        return;
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let outgoing = match frame {
                Frame::Event(payload) => Message::Text(payload.into()),
                Frame::Ping => Message::Ping(Vec::new().into()),
                Frame::Pong => Message::Text("pong".into()),
                Frame::Close => break,
            };
            if ws_sender.send(outgoing).await.is_err() {
                break;
            }
        }
    });

    hub.open(id);
    debug!("realtime client {} connected", id);

    while let Some(Ok(incoming)) = ws_receiver.next().await {
        match incoming {
            Message::Text(text) => handle_client_text(&hub, id, &text),
            Message::Pong(_) => hub.mark_responsive(id),
            Message::Close(_) => break,
            // No binary protocol; pings are answered by the axum layer.
            _ => {}
        }
    }

    hub.unregister(id);
    writer.abort();
    debug!("realtime client {} disconnected", id);
}

/// Any text frame counts as liveness; a `ping` additionally gets a `pong`.
/// There is no further client command set.
fn handle_client_text(hub: &BroadcastHub, id: Uuid, text: &str) {
    hub.mark_responsive(id);
    if text.trim() == CLIENT_PING {
        hub.send_to(id, Frame::Pong);
    }
}

/// Start the HTTP server. Returns the join handle and the bound address.
pub async fn start(
    host: &str,
    port: u16,
    state: GatewayState,
) -> Result<(tokio::task::JoinHandle<()>, std::net::SocketAddr)> {
    let app = build_router(state);
    let listener = TcpListener::bind(format!("{}:{}", host, port)).await?;
    let addr = listener.local_addr()?;
    info!("webhook intake listening on {}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    Ok((handle, addr))
}
