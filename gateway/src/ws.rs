//! WebSocket transport: one task per socket, pumping client frames into the
//! gateway and the connection's outbox back onto the wire.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use common_net::message::encode;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::hub::Gateway;
use crate::registry::Outbound;
use crate::{HTTP_REQUESTS_TOTAL, WS_PATH};

pub async fn ws_handler(ws: WebSocketUpgrade, State(gateway): State<Gateway>) -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&[WS_PATH]).inc();
    ws.on_upgrade(move |socket| session(socket, gateway))
}

async fn session(socket: WebSocket, gateway: Gateway) {
    let (outbox, mut outbound) = mpsc::unbounded_channel();
    let connection_id = gateway.connect(outbox).await;
    let (mut sink, mut stream) = socket.split();
    let mut reason = "disconnect";

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    gateway.route_client_event(&connection_id, &text).await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    gateway
                        .route_client_event(&connection_id, &String::from_utf8_lossy(&bytes))
                        .await;
                }
                Some(Ok(Message::Close(_))) => {
                    reason = "logout";
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%err, %connection_id, "ws: receive failed");
                    break;
                }
                None => break,
            },
            queued = outbound.recv() => match queued {
                Some(Outbound::Message(message)) => match encode(&message) {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%err, %connection_id, "ws: encode failed"),
                },
                Some(Outbound::Close { code, reason: why }) => {
                    let frame = CloseFrame { code, reason: why.into() };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                None => break,
            },
        }
    }

    gateway.disconnect(&connection_id, reason).await;
}
