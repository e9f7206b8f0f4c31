//! Framing helpers shared by the admission handshake and the connection
//! loop: header extraction plus thin wrappers around `axum`'s WebSocket
//! send/recv for the error and close frames spec §7 defines.
//!
//! Adapted from the teacher's `ws_common.rs`, trimmed to the frame kinds
//! this protocol actually has (no separate heartbeat payload type — a
//! heartbeat here is a `ping`/`pong` pair already in `sync_protocol`).

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::http::HeaderMap;
use sync_protocol::{Close, CloseReason, ErrorMessage, WsMessage};

use crate::auth::extract_bearer;

pub fn extract_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .map(ToOwned::to_owned)
}

pub async fn send_message(socket: &mut WebSocket, msg: &WsMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    }
}

pub async fn send_error(socket: &mut WebSocket, code: &str, message: &str, fatal: bool) {
    send_message(
        socket,
        &WsMessage::Error(ErrorMessage {
            code: code.to_owned(),
            message: message.to_owned(),
            fatal,
        }),
    )
    .await;
}

pub async fn send_close(socket: &mut WebSocket, reason: CloseReason) {
    send_message(socket, &WsMessage::Close(Close { reason })).await;
}

fn parse_text_message(msg: Option<Result<Message, axum::Error>>) -> Result<String, ()> {
    match msg {
        Some(Ok(Message::Text(text))) => Ok(text.to_string()),
        _ => Err(()),
    }
}

/// Used only for the admission handshake's first frame, which must be a
/// `hello` received within a fixed grace period. Once admitted, the
/// connection loop reads frames directly in its `select!`.
pub async fn recv_text_with_timeout(socket: &mut WebSocket, timeout: Duration) -> Result<String, ()> {
    match tokio::time::timeout(timeout, socket.recv()).await {
        Ok(msg) => parse_text_message(msg),
        Err(_) => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_token_from_headers_handles_missing_malformed_and_valid_bearer() {
        let missing = HeaderMap::new();
        assert_eq!(extract_token_from_headers(&missing), None);

        let mut malformed = HeaderMap::new();
        malformed.insert("authorization", axum::http::HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_token_from_headers(&malformed), None);

        let mut valid = HeaderMap::new();
        valid.insert("authorization", axum::http::HeaderValue::from_static("Bearer tok-1"));
        assert_eq!(extract_token_from_headers(&valid), Some("tok-1".to_owned()));
    }

    #[test]
    fn parse_text_message_rejects_non_text_frames() {
        assert_eq!(parse_text_message(None), Err(()));
        assert_eq!(parse_text_message(Some(Ok(Message::Ping(vec![1].into())))), Err(()));
        assert_eq!(
            parse_text_message(Some(Ok(Message::Text("hi".into())))),
            Ok("hi".to_owned())
        );
    }
}
