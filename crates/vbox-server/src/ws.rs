//! Websocket bridge between one browser connection and its box session.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use axum::Json;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use futures_util::{SinkExt, StreamExt};
use libvbox::{Client, ClientConnection, ClientHandle, VboxError};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use vbox_protocol::{ClientFrame, ErrorCode, Handshake, Response, ServerEvent, ServerFrame};

use crate::AppState;

const WRITE_QUEUE: usize = 256;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(handshake): Query<Handshake>,
) -> HttpResponse {
    let client = match state.coordinator.admit(&handshake).await {
        Ok(client) => client,
        Err(err) => return rejection(&err),
    };
    ws.max_message_size(state.max_frame_bytes)
        .max_frame_size(state.max_frame_bytes)
        .on_upgrade(move |socket| ws_session_task(socket, state, client))
}

/// HTTP status answering a refused handshake.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidHandshake | ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::AccessDenied => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
        ErrorCode::QuotaExceeded | ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rejection(err: &VboxError) -> HttpResponse {
    let (code, message) = err.to_error_code();
    tracing::info!(?code, "handshake refused: {message}");
    (
        status_for(code),
        Json(json!({ "code": code, "message": message })),
    )
        .into_response()
}

async fn ws_session_task(mut socket: WebSocket, state: Arc<AppState>, client: Client) {
    let box_id = client.box_id.clone();
    let connection = match state.coordinator.join(client).await {
        Ok(connection) => connection,
        Err(err) => {
            tracing::warn!(%box_id, "join failed: {err}");
            let close = CloseFrame {
                code: close_code::ERROR,
                reason: "workspace unavailable".into(),
            };
            let _ = socket.send(Message::Close(Some(close))).await;
            return;
        }
    };
    let handle = connection.handle.clone();
    if let Err(err) = ws_session_inner(socket, connection).await {
        tracing::warn!(%box_id, "ws session closed with error: {err}");
    }
    handle.disconnect().await;
}

async fn ws_session_inner(socket: WebSocket, connection: ClientConnection) -> Result<()> {
    let ClientConnection {
        client,
        mut events,
        handle,
    } = connection;
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Replies complete out of band, so all writes go through one queue.
    let (tx, mut rx) = mpsc::channel::<Message>(WRITE_QUEUE);
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let outcome = async {
        loop {
            tokio::select! {
                maybe_event = events.recv() => {
                    let Some(event) = maybe_event else {
                        tracing::debug!(connection_id = %client.connection_id, "box dropped connection");
                        break;
                    };
                    send_event(&tx, event).await?;
                }
                maybe_msg = ws_rx.next() => {
                    let Some(msg) = maybe_msg else {
                        break;
                    };
                    match msg? {
                        Message::Text(text) => handle_text(&handle, &tx, text.as_str()).await?,
                        Message::Binary(_) => {
                            tracing::debug!(connection_id = %client.connection_id, "ignoring binary frame");
                        }
                        Message::Close(_) => break,
                        Message::Ping(v) => tx.send(Message::Pong(v)).await?,
                        Message::Pong(_) => {}
                    }
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    drop(tx);
    let _ = writer.await;
    outcome
}

async fn handle_text(handle: &ClientHandle, tx: &mpsc::Sender<Message>, text: &str) -> Result<()> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            match request_id_of(text) {
                Some(request_id) => {
                    let response =
                        Response::error(ErrorCode::InvalidRequest, format!("invalid message: {err}"));
                    send_frame(tx, &ServerFrame::Reply { request_id, response }).await?;
                }
                None => tracing::debug!("dropping malformed frame: {err}"),
            }
            return Ok(());
        }
    };

    let pending = handle.submit(frame.request).await?;
    let Some(request_id) = frame.request_id else {
        return Ok(());
    };
    let tx = tx.clone();
    tokio::spawn(async move {
        let response = pending.await.unwrap_or_else(|_| {
            Response::error(ErrorCode::ServerError, "box session closed")
        });
        if send_frame(&tx, &ServerFrame::Reply { request_id, response })
            .await
            .is_err()
        {
            tracing::debug!(request_id, "reply dropped, connection closed");
        }
    });
    Ok(())
}

fn request_id_of(text: &str) -> Option<u64> {
    serde_json::from_str::<Value>(text)
        .ok()?
        .get("requestId")?
        .as_u64()
}

async fn send_event(tx: &mpsc::Sender<Message>, event: ServerEvent) -> Result<()> {
    send_frame(tx, &ServerFrame::Event(event)).await
}

async fn send_frame(tx: &mpsc::Sender<Message>, frame: &ServerFrame) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    tx.send(Message::Text(text.into()))
        .await
        .map_err(|_| anyhow!("websocket writer closed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_errors_map_to_statuses() {
        assert_eq!(status_for(ErrorCode::InvalidHandshake), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::AccessDenied), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorCode::UpstreamUnavailable), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn request_id_survives_bad_payload() {
        assert_eq!(request_id_of(r#"{"requestId":4,"event":"nope"}"#), Some(4));
        assert_eq!(request_id_of(r#"{"event":"nope"}"#), None);
        assert_eq!(request_id_of("not json"), None);
    }
}
