use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::{
    broker::{Broker, ConnectionId, Frame},
    config::Config,
    protocol,
};

#[debug_handler(state = crate::AppState)]
pub(crate) async fn socket(
    State(broker): State<Broker>,
    State(config): State<Arc<Config>>,

    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let queue = config.outbound_queue;
    ws.max_message_size(config.max_frame_bytes)
        .on_upgrade(move |stream| serve(stream, broker, queue))
}

async fn serve(stream: WebSocket, broker: Broker, queue: usize) {
    let conn = ConnectionId::next();
    let (outbox, mut rx) = mpsc::channel::<Frame>(queue);
    broker.connect(conn, outbox);
    tracing::debug!(%conn, "websocket upgraded");

    let (mut sender, mut receiver) = stream.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let reader = async {
        while let Some(msg) = receiver.next().await {
            let event = match msg {
                Ok(Message::Text(text)) => protocol::decode(text.as_str()),
                Ok(Message::Binary(bytes)) => protocol::decode_bytes(&bytes),
                Ok(Message::Close(_)) => break,
                // ping/pong are answered by the transport
                Ok(_) => continue,
                Err(err) => {
                    tracing::debug!(%conn, error = %err, "websocket receive error");
                    break;
                }
            };

            match event {
                Ok(event) => broker.inbound(conn, event).await,
                Err(err) => tracing::warn!(%conn, error = %err, "undecodable frame dropped"),
            }
        }
    };

    tokio::select! {
        _ = &mut writer => {},
        _ = reader => writer.abort(),
    };

    broker.disconnect(conn);
}
