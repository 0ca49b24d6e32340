//! Display surface over a WebSocket: each connection is one subscriber of the
//! session's notification channel.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{types::NotificationEvent, AppState};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let surface_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<NotificationEvent>(state.ws_send_buffer.max(1));

    // Events already on screen elsewhere are shown here too.
    for event in state.notifications.active() {
        forward_one(&tx, surface_id, event);
    }
    let subscription = state.notifications.subscribe(forward(tx, surface_id));
    info!(%surface_id, "notification surface connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    error!("failed to serialize notification: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Close(_) => break,
            other => debug!(%surface_id, ?other, "ignoring client message"),
        }
    }

    subscription.unsubscribe();
    send_task.abort();
    info!(%surface_id, "notification surface disconnected");
}

/// Handler bridging the synchronous channel to one connection's send queue.
/// Delivery must not block the emitter, so a full queue drops the event.
fn forward(
    tx: mpsc::Sender<NotificationEvent>,
    surface_id: Uuid,
) -> impl Fn(&NotificationEvent) + Send + Sync + 'static {
    move |event| forward_one(&tx, surface_id, event.clone())
}

fn forward_one(tx: &mpsc::Sender<NotificationEvent>, surface_id: Uuid, event: NotificationEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            warn!(%surface_id, id = %event.id, "send buffer full, notification dropped");
        }
        Err(TrySendError::Closed(_)) => {
            debug!(%surface_id, "surface gone");
        }
    }
}
