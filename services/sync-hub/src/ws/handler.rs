//! Admission & Auth Glue (C9) handshake, plus the per-connection
//! `tokio::select!` loop that is this protocol's C5/C6/C7/C2 meeting
//! point: one task per socket, reading inbound frames, ticking the
//! heartbeat, and draining the Hub-delivered outbound queue, the same
//! shape as the teacher's `ws_forwarder::handle_forwarder_socket`.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::Utc;
use sync_protocol::{
    error_codes, Ack, CatchupRequest, CloseReason, HelloAck, MutationEnvelope, Ping, Pong, WsMessage,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth;
use crate::catchup;
use crate::error::SyncError;
use crate::hub::RegisterOutcome;
use crate::model::{DeviceId, UserId};
use crate::pipeline;
use crate::rate_limit::MutationRateLimiter;
use crate::repo::change_log;
use crate::state::AppState;
use crate::ws::common::{extract_token_from_headers, recv_text_with_timeout, send_close, send_error, send_message};
use crate::ws::delivery::{new_connection, OutboundFrame};

const HELLO_GRACE_PERIOD: Duration = Duration::from_secs(10);

pub async fn ws_sync_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, state, headers).await;
    })
}

async fn handle_socket(mut socket: WebSocket, state: AppState, headers: HeaderMap) {
    let hello = match admit(&mut socket, &headers).await {
        Some(hello) => hello,
        None => return,
    };

    let Some(token) = resolve_token(&hello, &headers) else {
        send_error(&mut socket, error_codes::UNAUTHORIZED, "missing auth token", true).await;
        return;
    };

    let Some(user_id) = auth::authenticate(&state.pool, &token).await else {
        send_error(&mut socket, error_codes::UNAUTHORIZED, "invalid or revoked token", true).await;
        return;
    };
    let user_id = UserId(user_id);
    let device_id = DeviceId(hello.device_id.clone());

    let (handle, kill, mut inbox) = new_connection(device_id.clone(), state.config.outbound_queue_cap);
    let outbound_tx = handle.blocking_sender();

    let suppress_upto = match state
        .hub
        .register(&user_id, device_id.clone(), handle, kill, hello.since_seq)
        .await
    {
        RegisterOutcome::TooManyConnections => {
            send_error(&mut socket, error_codes::TOO_MANY_CONNECTIONS, "connection limit reached", true).await;
            send_close(&mut socket, CloseReason::TooManyConnections).await;
            return;
        }
        RegisterOutcome::Registered { evicted, suppress_upto } => {
            if let Some((_, evicted_kill)) = evicted {
                evicted_kill.kill(CloseReason::Superseded);
            }
            suppress_upto
        }
    };

    let current_seq = change_log::current_seq(&state.pool, &user_id.0).await.unwrap_or(0);
    let retention_min_seq = change_log::retention_min_seq(&state.pool, &user_id.0).await.unwrap_or(0);
    let hello_ack = WsMessage::HelloAck(HelloAck {
        session_id: Uuid::new_v4().to_string(),
        current_seq,
        retention_min_seq,
        server_time: Utc::now().timestamp_millis(),
        heartbeat_interval_s: state.config.heartbeat_interval_s,
    });
    if !send_message(&mut socket, &hello_ack).await {
        state.hub.unregister(&user_id, &device_id).await;
        return;
    }

    {
        let pool = state.pool.clone();
        let device_id = device_id.clone();
        let user_id_str = user_id.0.clone();
        let since_seq = hello.since_seq;
        let page_size = state.config.catchup_page_size;
        let tx = outbound_tx.clone();
        let suppress_upto = suppress_upto.clone();
        tokio::spawn(async move {
            if let Err(err) = catchup::run(&pool, &user_id_str, &device_id.0, since_seq, page_size, &tx, &suppress_upto).await
            {
                warn!(user_id = %user_id_str, %err, "catchup replay failed");
            }
        });
    }

    let limiter = MutationRateLimiter::new(state.config.mutation_rate_per_s, state.config.mutation_burst);
    let close_reason = connection_loop(&mut socket, &state, &user_id, &device_id, &mut inbox, &outbound_tx, &limiter).await;

    state.hub.unregister(&user_id, &device_id).await;
    send_close(&mut socket, close_reason).await;
    info!(user_id = %user_id, device_id = %device_id, reason = ?close_reason, "connection closed");
}

/// Reads the mandatory first `hello` frame within the grace period.
async fn admit(socket: &mut WebSocket, _headers: &HeaderMap) -> Option<sync_protocol::Hello> {
    let text = match recv_text_with_timeout(socket, HELLO_GRACE_PERIOD).await {
        Ok(text) => text,
        Err(()) => {
            send_error(socket, error_codes::PROTOCOL_ERROR, "expected hello within grace period", true).await;
            return None;
        }
    };
    match serde_json::from_str::<WsMessage>(&text) {
        Ok(WsMessage::Hello(hello)) => Some(hello),
        Ok(_) => {
            send_error(socket, error_codes::PROTOCOL_ERROR, "first frame must be hello", true).await;
            None
        }
        Err(_) => {
            send_error(socket, error_codes::PROTOCOL_ERROR, "malformed hello", true).await;
            None
        }
    }
}

/// The wire protocol carries the token in `Hello.auth_token`; an
/// `Authorization` header is accepted as a fallback for clients that set
/// one during the upgrade handshake.
fn resolve_token(hello: &sync_protocol::Hello, headers: &HeaderMap) -> Option<String> {
    if !hello.auth_token.is_empty() {
        Some(hello.auth_token.clone())
    } else {
        extract_token_from_headers(headers)
    }
}

#[allow(clippy::too_many_arguments)]
async fn connection_loop(
    socket: &mut WebSocket,
    state: &AppState,
    user_id: &UserId,
    device_id: &DeviceId,
    inbox: &mut crate::ws::delivery::ConnectionInbox,
    outbound_tx: &tokio::sync::mpsc::Sender<OutboundFrame>,
    limiter: &MutationRateLimiter,
) -> CloseReason {
    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval());
    heartbeat.tick().await; // first tick fires immediately; consume it
    let mut last_client_activity = Instant::now();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if last_client_activity.elapsed() > state.config.heartbeat_timeout() {
                    return CloseReason::SendTimeout;
                }
                let ping = WsMessage::Ping(Ping { nonce: Uuid::new_v4().to_string() });
                if !send_message(socket, &ping).await {
                    return CloseReason::SendTimeout;
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_client_activity = Instant::now();
                        match serde_json::from_str::<WsMessage>(&text) {
                            Ok(WsMessage::Ping(ping)) => {
                                if !send_message(socket, &WsMessage::Pong(Pong { nonce: ping.nonce })).await {
                                    return CloseReason::SendTimeout;
                                }
                            }
                            Ok(WsMessage::Mutation(envelope)) => {
                                if !limiter.check() {
                                    send_error(socket, error_codes::RATE_LIMITED, "mutation rate exceeded", true).await;
                                    return CloseReason::RateLimited;
                                }
                                let result = ingest_mutation(state, user_id, device_id, envelope).await;
                                if !send_message(socket, &WsMessage::MutationResult(result)).await {
                                    return CloseReason::SendTimeout;
                                }
                            }
                            Ok(WsMessage::Ack(Ack { .. })) => {
                                // Advisory only; the server tracks no client-side ack state.
                            }
                            Ok(WsMessage::Catchup(CatchupRequest { since_seq })) => {
                                spawn_resync(state, user_id, device_id, since_seq, outbound_tx);
                            }
                            Ok(_) => {
                                send_error(socket, error_codes::PROTOCOL_ERROR, "unexpected frame kind", false).await;
                            }
                            Err(_) => {
                                send_error(socket, error_codes::PROTOCOL_ERROR, "malformed frame", false).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return CloseReason::ServerShutdown,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return CloseReason::ServerShutdown,
                }
            }

            frame = inbox.outbound_rx.recv() => {
                let Some(frame) = frame else { return CloseReason::ServerShutdown };
                let timeout = state.config.per_frame_send_timeout();
                let sent = tokio::time::timeout(timeout, send_message(socket, &frame.into_ws_message())).await;
                match sent {
                    Ok(true) => {}
                    Ok(false) | Err(_) => return CloseReason::SendTimeout,
                }
            }

            reason = &mut inbox.kill_rx => {
                return reason.unwrap_or(CloseReason::ServerShutdown);
            }
        }
    }
}

/// Runs a mutation through the pipeline and always produces a reply: a
/// transient storage failure degrades to `rejected{transient}` rather than
/// dropping the connection, so the client can retry with the same
/// `client_msg_id` once the store recovers.
async fn ingest_mutation(
    state: &AppState,
    user_id: &UserId,
    device_id: &DeviceId,
    envelope: MutationEnvelope,
) -> sync_protocol::MutationResult {
    let client_msg_id = envelope.client_msg_id.clone();
    match pipeline::ingest(&state.pool, &user_id.0, &device_id.0, envelope).await {
        Ok(outcome) => {
            if let Some(entry) = &outcome.appended {
                pipeline::publish(state.fabric.as_ref(), entry).await;
            }
            outcome.result
        }
        Err(err) => {
            warn!(user_id = %user_id, %err, "mutation ingest failed, replying transient");
            pipeline::rejected(client_msg_id, &SyncError::Transient(err)).result
        }
    }
}

fn spawn_resync(
    state: &AppState,
    user_id: &UserId,
    device_id: &DeviceId,
    since_seq: i64,
    outbound_tx: &tokio::sync::mpsc::Sender<OutboundFrame>,
) {
    let pool = state.pool.clone();
    let user_id = user_id.0.clone();
    let device_id = device_id.0.clone();
    let page_size = state.config.catchup_page_size;
    let tx = outbound_tx.clone();
    // An explicit mid-connection `catchup` frame does not move the live
    // suppression watermark; it replays into the same outbound queue as
    // an ordinary page, relying on the client to dedup overlapping seqs.
    let suppress_upto = std::sync::Arc::new(std::sync::atomic::AtomicI64::new(since_seq));
    tokio::spawn(async move {
        let _ = catchup::run(&pool, &user_id, &device_id, since_seq, page_size, &tx, &suppress_upto).await;
    });
}
