use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use marquee_core::encode_server_frame;

use crate::{context::ServerContext, Router};

pub(super) fn router() -> Router {
    Router::new().route("/ws", get(gateway_handler))
}

async fn gateway_handler(context: ServerContext, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, context))
}

/// Pumps one client connection: frames in to the gateway, queued
/// messages out to the socket, a synthesized leave on the way out.
async fn handle_socket(socket: WebSocket, context: ServerContext) {
    let gateway = context.cluster.gateway.clone();
    let session = gateway.connect();
    let session_id = session.id;

    let (mut sink, mut incoming) = socket.split();
    let mut outgoing = session.stream();

    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing.next().await {
            let frame = encode_server_frame(&message);

            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }

        let _ = sink.close().await;
    });

    while let Some(Ok(message)) = incoming.next().await {
        match message {
            Message::Text(text) => gateway.handle_frame(session_id, &text).await,
            Message::Close(_) => break,
            // Pings are answered by the library; binary frames are not
            // part of the protocol
            _ => {}
        }
    }

    gateway.disconnect(session_id).await;
    writer.abort();
}
