//! Delivery Engine (C6): per-connection outbound queue and the
//! backpressure policy around it.
//!
//! Grounded in the teacher's `state.rs::StreamBroadcast` /
//! `ws_forwarder.rs::handle_forwarder_socket`, which drains a bounded
//! channel to the socket from the same task that reads it, using
//! `tokio::select!` so neither direction blocks the other. The eviction
//! policy (spec §4.6: "holding memory for a stuck client penalizes
//! healthy peers") is new here — the teacher's broadcast channels drop the
//! oldest message on overflow instead of evicting, which is wrong for a
//! system whose correctness depends on at-least-once catchup keyed by seq.

use std::sync::Mutex;
use metrics::gauge;
use tokio::sync::{mpsc, oneshot};
use sync_protocol::{ChangeEvent, CloseReason, WsMessage};

use crate::metrics::OUTBOUND_QUEUE_DEPTH;
use crate::model::DeviceId;

/// A frame queued for delivery to one connection's writer task.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Message(WsMessage),
    Event(ChangeEvent),
}

impl OutboundFrame {
    pub fn into_ws_message(self) -> WsMessage {
        match self {
            OutboundFrame::Message(m) => m,
            OutboundFrame::Event(e) => WsMessage::Event(e),
        }
    }
}

/// A cloneable reference to a live connection's inbox, held by the Hub and
/// used to route change events and catchup frames to it.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub device_id: DeviceId,
    outbound: mpsc::Sender<OutboundFrame>,
}

pub struct EnqueueFull;

impl ConnectionHandle {
    pub fn new(device_id: DeviceId, outbound: mpsc::Sender<OutboundFrame>) -> Self {
        Self { device_id, outbound }
    }

    /// Non-blocking enqueue. A full queue means the peer is slow; the
    /// caller (Hub dispatch or Catchup) must evict rather than wait, per
    /// spec §4.6.
    pub fn try_enqueue(&self, frame: OutboundFrame) -> Result<(), EnqueueFull> {
        self.outbound.try_send(frame).map_err(|_| EnqueueFull)?;
        let depth = self.outbound.max_capacity() - self.outbound.capacity();
        gauge!(OUTBOUND_QUEUE_DEPTH).set(depth as f64);
        Ok(())
    }

    /// A blocking-send clone of the same channel, handed to the Catchup
    /// Service so a large replay backpressures instead of racing the live
    /// dispatch loop's non-blocking `try_enqueue`.
    pub fn blocking_sender(&self) -> mpsc::Sender<OutboundFrame> {
        self.outbound.clone()
    }
}

/// Owned by the connection's writer task; paired with a `ConnectionHandle`
/// the Hub keeps. Also carries the kill switch the Hub uses to force-close
/// a connection it has decided to evict (superseded, backpressure, or
/// admission limits).
pub struct ConnectionInbox {
    pub outbound_rx: mpsc::Receiver<OutboundFrame>,
    pub kill_rx: oneshot::Receiver<CloseReason>,
}

/// Held by the Hub and evicted shared across the read-locked fan-out loop,
/// so the send slot is behind a `Mutex` rather than consumed by value.
pub struct KillSwitch(Mutex<Option<oneshot::Sender<CloseReason>>>);

impl KillSwitch {
    /// Best-effort and idempotent: the first call sends the reason, later
    /// calls and a writer task that already exited are both no-ops.
    pub fn kill(&self, reason: CloseReason) {
        if let Some(tx) = self.0.lock().unwrap().take() {
            let _ = tx.send(reason);
        }
    }
}

/// Builds a fresh connection pipe: the Hub keeps the `ConnectionHandle` +
/// `KillSwitch`, the writer task keeps the `ConnectionInbox`.
pub fn new_connection(
    device_id: DeviceId,
    queue_capacity: usize,
) -> (ConnectionHandle, KillSwitch, ConnectionInbox) {
    let (tx, rx) = mpsc::channel(queue_capacity);
    let (kill_tx, kill_rx) = oneshot::channel();
    (
        ConnectionHandle::new(device_id, tx),
        KillSwitch(Mutex::new(Some(kill_tx))),
        ConnectionInbox {
            outbound_rx: rx,
            kill_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_overflow_is_reported_as_full_not_blocking() {
        let (handle, _kill, mut inbox) = new_connection(DeviceId("D1".to_owned()), 1);
        handle
            .try_enqueue(OutboundFrame::Message(WsMessage::Ping(sync_protocol::Ping {
                nonce: "a".to_owned(),
            })))
            .ok();
        let overflow = handle.try_enqueue(OutboundFrame::Message(WsMessage::Ping(
            sync_protocol::Ping { nonce: "b".to_owned() },
        )));
        assert!(overflow.is_err());
        assert!(inbox.outbound_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn kill_switch_delivers_reason_to_writer() {
        let (_handle, kill, mut inbox) = new_connection(DeviceId("D1".to_owned()), 4);
        kill.kill(CloseReason::Superseded);
        kill.kill(CloseReason::Superseded); // idempotent
        let reason = inbox.kill_rx.try_recv().unwrap();
        assert_eq!(reason, CloseReason::Superseded);
    }
}
