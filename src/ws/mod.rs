pub mod handlers;

use axum::{
    extract::{
        connect_info::ConnectInfo,
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::SplitSink, stream::StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::RoomRegistry;
use crate::room::RoomEvent;
use handlers::Session;

/// WebSocket upgrade handler. The admission throttle runs here, before the
/// upgrade, so a limited address is refused at the transport level without
/// touching any room state.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(registry): State<Arc<RoomRegistry>>,
) -> Response {
    let forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    if !registry.admit(addr, forwarded_for) {
        return (StatusCode::TOO_MANY_REQUESTS, "exceeded connection limit").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, addr, registry))
        .into_response()
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, registry: Arc<RoomRegistry>) {
    tracing::debug!(peer = %addr, "websocket connected");
    let (mut sender, mut receiver) = socket.split();

    let mut session = Session::new(registry);
    let mut events: Option<broadcast::Receiver<RoomEvent>> = None;

    'outer: loop {
        tokio::select! {
            // Room fan-out, once joined.
            event = async {
                match events.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match event {
                    Ok(event) => {
                        if let Some(msg) = session.filter_event(event) {
                            if !send(&mut sender, &msg).await {
                                break 'outer;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(peer = %addr, skipped, "room event subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events = None;
                    }
                }
            }

            // Client messages, handled serially.
            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => {
                                let reply = session.handle(msg).await;
                                for msg in &reply.messages {
                                    if !send(&mut sender, msg).await {
                                        break 'outer;
                                    }
                                }
                                if let Some(rx) = reply.subscription {
                                    events = Some(rx);
                                }
                                if reply.disconnect {
                                    break 'outer;
                                }
                            }
                            Err(e) => {
                                tracing::debug!(peer = %addr, error = %e, "unparseable client message");
                                let msg = ServerMessage::error(format!("invalid message: {e}"));
                                if !send(&mut sender, &msg).await {
                                    break 'outer;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => break 'outer,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break 'outer;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(peer = %addr, error = %e, "websocket error");
                        break 'outer;
                    }
                    None => break 'outer,
                }
            }
        }
    }

    session.teardown().await;
    tracing::debug!(peer = %addr, "websocket closed");
}

async fn send(sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize server message");
            true
        }
    }
}
