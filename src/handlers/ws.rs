//! WebSocket subscriber endpoint.
//!
//! Each connection becomes one hub session. The read pump handles control
//! frames (subscribe/update/ping/stats); the write pump drains the session's
//! bounded outbound queue into the socket. Either pump ending tears the
//! session down.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::hub::filter::ClientSubscription;
use crate::hub::protocol::{
    ClientFrame, ServerFrame, StatsFrame, ERR_FILTER, ERR_INVALID_SUBSCRIPTION,
    ERR_UNKNOWN_ACTION,
};
use crate::hub::session::Session;
use crate::hub::Hub;

use super::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (session, out_rx) = state.hub.new_session();
    state.hub.register(Arc::clone(&session)).await;

    let (ws_tx, ws_rx) = socket.split();

    let mut write_task = tokio::spawn(write_pump(out_rx, ws_tx, Arc::clone(&session)));

    // If the hub refused the session its queue is already closed; the write
    // pump exits at once and the select below closes the socket.
    tokio::select! {
        _ = read_pump(ws_rx, Arc::clone(&session), state.hub.clone()) => {}
        _ = &mut write_task => {}
    }

    state.hub.unregister(session.id());
    write_task.abort();
    debug!(session = session.id(), "websocket handler finished");
}

async fn write_pump(
    mut out_rx: mpsc::Receiver<String>,
    mut ws_tx: SplitSink<WebSocket, Message>,
    session: Arc<Session>,
) {
    while let Some(text) = out_rx.recv().await {
        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
            debug!(session = session.id(), error = %e, "websocket write failed");
            break;
        }
    }

    session.mark_closed();
    let _ = ws_tx.close().await;
}

async fn read_pump(mut ws_rx: SplitStream<WebSocket>, session: Arc<Session>, hub: Hub) {
    while let Some(message) = ws_rx.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(session = session.id(), error = %e, "websocket read failed");
                break;
            }
        };

        match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => handle_client_frame(&session, &hub, frame),
            Err(_) => session.send_frame(&ServerFrame::Error {
                code: ERR_INVALID_SUBSCRIPTION.into(),
                message: "Invalid control frame".into(),
            }),
        }
    }

    info!(session = session.id(), "subscriber disconnected");
}

fn handle_client_frame(session: &Arc<Session>, hub: &Hub, frame: ClientFrame) {
    match frame.action.as_str() {
        "subscribe" => apply_subscription(session, frame.data, "subscribed"),
        "update" => apply_subscription(session, frame.data, "updated"),
        "ping" => session.send_frame(&ServerFrame::Pong {
            timestamp: Utc::now().timestamp(),
        }),
        "stats" => session.send_frame(&ServerFrame::Stats(StatsFrame {
            connected: hub.client_count(),
            total_clients: hub.max_clients(),
            queued: session.queued(),
            dropped: session.dropped_rate() + session.dropped_queue(),
        })),
        other => session.send_frame(&ServerFrame::Error {
            code: ERR_UNKNOWN_ACTION.into(),
            message: format!("Unknown action: {other}"),
        }),
    }
}

fn apply_subscription(session: &Arc<Session>, data: serde_json::Value, ack: &str) {
    let subscription: ClientSubscription = match serde_json::from_value(data) {
        Ok(sub) => sub,
        Err(e) => {
            session.send_frame(&ServerFrame::Error {
                code: ERR_INVALID_SUBSCRIPTION.into(),
                message: format!("Invalid subscription format: {e}"),
            });
            return;
        }
    };

    match session.update_subscription(subscription) {
        Ok(()) => session.send_frame(&ServerFrame::Ack {
            message: ack.to_string(),
        }),
        Err(e) => session.send_frame(&ServerFrame::Error {
            code: ERR_FILTER.into(),
            message: e.to_string(),
        }),
    }
}
