use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use metrics::counter;
use signal_core::{encode_to_string, Envelope, PeerHandle, SignalError};
use tracing::{debug, info, warn};

use crate::handlers::AppState;

pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state, remote_addr))
}

pub fn generate_peer_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

async fn handle_socket(
    socket: WebSocket,
    session_id: String,
    state: AppState,
    remote_addr: SocketAddr,
) {
    let peer_id = generate_peer_id();
    let (mut sink, mut stream) = socket.split();

    let registry = state.router.registry().clone();
    let handle = match registry.register(&session_id, &peer_id) {
        Ok(handle) => handle,
        Err(err) => {
            warn!(
                session_id = %session_id,
                peer_id = %peer_id,
                remote = %remote_addr,
                error = %err,
                "join rejected"
            );
            counter!("signal_connections_total", 1, "outcome" => "rejected");
            reject(&mut sink, &peer_id, &err).await;
            return;
        }
    };

    counter!("signal_connections_total", 1, "outcome" => "accepted");
    info!(
        session_id = %session_id,
        peer_id = %peer_id,
        remote = %remote_addr,
        "peer connected"
    );

    let mut writer = tokio::spawn(write_outbound(sink, handle));

    loop {
        tokio::select! {
            frame = stream.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        warn!(peer_id = %peer_id, error = %err, "websocket read failed");
                        break;
                    }
                    None => break,
                };
                match message {
                    Message::Text(text) => inbound(&state, &peer_id, text.as_bytes()),
                    Message::Binary(data) => inbound(&state, &peer_id, &data),
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
            _ = &mut writer => {
                debug!(peer_id = %peer_id, "outbound queue closed");
                break;
            }
        }
    }

    if let Some(departure) = registry.unregister(&peer_id) {
        info!(
            session_id = %departure.session_id,
            peer_id = %departure.peer_id,
            remaining = departure.remaining,
            "peer disconnected"
        );
    }
    writer.abort();
}

fn inbound(state: &AppState, peer_id: &str, bytes: &[u8]) {
    match state.router.on_message(peer_id, bytes) {
        Ok(outcome) => debug!(
            peer_id = %peer_id,
            forwarded = outcome.forwarded.len(),
            buffered = outcome.buffered,
            released = outcome.released,
            absorbed = outcome.absorbed,
            rejected = outcome.rejected.len(),
            "frame routed"
        ),
        Err(err) => debug!(peer_id = %peer_id, error = %err, "frame rejected"),
    }
}

/// Drains the peer's outbound queue onto the socket. The queue ends when the
/// registry drops the peer, at which point the socket is closed.
async fn write_outbound(mut sink: SplitSink<WebSocket, Message>, mut handle: PeerHandle) {
    while let Some(envelope) = handle.outbound.recv().await {
        let text = match encode_to_string(&envelope) {
            Ok(text) => text,
            Err(err) => {
                warn!(peer_id = %handle.peer_id, error = %err, "dropping unencodable envelope");
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            debug!(peer_id = %handle.peer_id, "websocket write failed");
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

async fn reject(sink: &mut SplitSink<WebSocket, Message>, peer_id: &str, err: &SignalError) {
    if let Ok(text) = encode_to_string(&Envelope::error(peer_id, err)) {
        let _ = sink.send(Message::Text(text)).await;
    }
    let _ = sink.send(Message::Close(None)).await;
}
