//! HTTP surface: call webhooks, the relay WebSocket and a health check.

use crate::channel::{Channel, Outbound};
use crate::error::SessionError;
use crate::registry::SessionKey;
use crate::relay::{LegDirection, Relay};
use crate::twiml;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
}

/// Webhook body for a new inbound call.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IncomingCall {
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub call_sid: Option<String>,
}

/// Webhook body sent when an agent accepts the caller's task.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReservationAccepted {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub workspace_sid: Option<String>,
    #[serde(default)]
    pub resource_sid: Option<String>,
    /// JSON object carrying at least the caller's `from`
    pub task_attributes: String,
}

#[derive(Debug, Deserialize)]
struct TaskAttributes {
    from: String,
}

#[derive(Debug, Deserialize)]
pub struct InterceptParams {
    pub direction: LegDirection,
    #[serde(default)]
    pub from: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/incoming-call", post(incoming_call))
        .route("/reservation-accepted", post(reservation_accepted))
        .route("/intercept", get(intercept))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn incoming_call(State(state): State<AppState>, Form(call): Form<IncomingCall>) -> Response {
    info!(
        from = %call.from,
        to = call.to.as_deref().unwrap_or(""),
        call_sid = call.call_sid.as_deref().unwrap_or(""),
        "Incoming call"
    );

    let settings = state.relay.settings();
    let url = match twiml::relay_url(&settings.public_domain, LegDirection::Inbound, &call.from) {
        Ok(url) => url,
        Err(e) => {
            error!("Cannot build relay url: {:#}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Relay unavailable").into_response();
        }
    };

    let markup = twiml::connect_relay(
        &url,
        &settings.session.languages.caller,
        &settings.welcome_greeting,
        None,
    );

    ([(header::CONTENT_TYPE, "text/xml")], markup).into_response()
}

async fn reservation_accepted(
    State(state): State<AppState>,
    Form(event): Form<ReservationAccepted>,
) -> Response {
    info!(
        event_type = event.event_type.as_deref().unwrap_or(""),
        reservation = event.resource_sid.as_deref().unwrap_or(""),
        "Reservation accepted"
    );

    let attributes: TaskAttributes = match serde_json::from_str(&event.task_attributes) {
        Ok(attributes) => attributes,
        Err(e) => {
            warn!(error = %e, "Unreadable task attributes: {}", event.task_attributes);
            return (StatusCode::BAD_REQUEST, "Invalid TaskAttributes").into_response();
        }
    };

    let result = SessionKey::parse(&attributes.from).and_then(|key| state.relay.start_session(&key));

    match result {
        Ok(started) => {
            debug!(from = %attributes.from, started, "Translation armed");
            (StatusCode::OK, "OK").into_response()
        }
        Err(SessionError::NotFound(key)) => {
            error!(session = %key, "No session for accepted reservation");
            (StatusCode::NOT_FOUND, "Not Found").into_response()
        }
        Err(SessionError::InvalidKey(raw)) => {
            warn!(from = %raw, "Reservation for an invalid party identifier");
            (StatusCode::BAD_REQUEST, "Invalid from").into_response()
        }
        Err(e) => {
            warn!(from = %attributes.from, error = %e, "Cannot start translation");
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
    }
}

async fn intercept(
    State(state): State<AppState>,
    Query(params): Query<InterceptParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_leg(socket, state.relay, params))
}

/// Pump one relay WebSocket through a [`Channel`].
async fn handle_leg(socket: WebSocket, relay: Arc<Relay>, params: InterceptParams) {
    let label = format!(
        "{}:{}",
        params.direction.as_str(),
        params.from.as_deref().unwrap_or("-")
    );
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (channel, mut outbound) = Channel::new(label);

    let writer = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Frame(payload) => {
                    if ws_sender.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    relay.accept_leg(&channel, params.direction, params.from);
    info!(channel = channel.label(), "Relay connection opened");

    loop {
        tokio::select! {
            _ = channel.closed() => break,
            next = ws_receiver.next() => match next {
                Some(Ok(Message::Text(text))) => channel.dispatch(&text),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => channel.dispatch(text),
                    Err(e) => warn!(channel = channel.label(), error = %e, "Dropping non UTF-8 binary message"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => warn!(channel = channel.label(), error = %e, "WebSocket read error"),
            },
        }
    }

    channel.close();
    let _ = writer.await;
    info!(channel = channel.label(), "Relay connection finished");
}
