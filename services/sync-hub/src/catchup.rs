//! Catchup Service (C7): replays a user's change log to a newly (re)
//! connected device from `since_seq` up to a snapshot of the current head,
//! or reports truncation if the cursor has fallen outside the retained
//! window.
//!
//! Grounded in the teacher's `repo::receiver_cursors::compute_backlog`,
//! which pages a bounded range read and streams it to a receiver socket.
//! The addition spec §4.7 requires and the teacher doesn't have is the
//! live/replay race: connections are registered with the Hub *before*
//! catchup runs so they do not miss events committed mid-replay, which
//! means replay must tell the Hub's dispatch loop which seqs it already
//! owns. `suppress_upto` (shared with `hub::Hub::register`) is that
//! handoff: it is raised to the snapshot target immediately, so the live
//! dispatch loop silently drops anything catchup is responsible for until
//! `CatchupComplete` is sent.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use metrics::counter;
use sqlx::PgPool;
use sync_protocol::{CatchupComplete, CatchupTruncated, ChangeEvent, WsMessage};
use tokio::sync::mpsc;

use crate::metrics::CATCHUP_REPLAYED_TOTAL;
use crate::repo::change_log;
use crate::ws::delivery::OutboundFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupOutcome {
    Completed { up_to_seq: i64 },
    Truncated { current_min_seq: i64 },
}

/// Runs the replay. `outbound` is sent to with a blocking `send` (not
/// `try_send`): the writer task drains it concurrently, so this only
/// blocks when the peer is genuinely behind, which is exactly when we
/// want backpressure rather than a synthetic overflow-eviction.
pub async fn run(
    pool: &PgPool,
    user_id: &str,
    device_id: &str,
    since_seq: i64,
    page_size: i64,
    outbound: &mpsc::Sender<OutboundFrame>,
    suppress_upto: &Arc<AtomicI64>,
) -> Result<CatchupOutcome, sqlx::Error> {
    let retention_min_seq = change_log::retention_min_seq(pool, user_id).await?;
    if since_seq > 0 && since_seq < retention_min_seq {
        suppress_upto.store(change_log::current_seq(pool, user_id).await?, Ordering::SeqCst);
        let frame = OutboundFrame::Message(WsMessage::CatchupTruncated(CatchupTruncated {
            current_min_seq: retention_min_seq,
        }));
        let _ = outbound.send(frame).await;
        return Ok(CatchupOutcome::Truncated { current_min_seq: retention_min_seq });
    }

    let snapshot = change_log::current_seq(pool, user_id).await?;
    suppress_upto.store(snapshot, Ordering::SeqCst);

    let mut cursor = since_seq;
    loop {
        let page = change_log::read(pool, user_id, cursor, page_size).await?;
        if page.is_empty() {
            break;
        }
        for entry in &page {
            cursor = entry.seq;
            if cursor > snapshot {
                break;
            }
            if entry.origin_device_id.as_deref() == Some(device_id) {
                continue;
            }
            counter!(CATCHUP_REPLAYED_TOTAL).increment(1);
            let event = ChangeEvent {
                seq: entry.seq,
                origin_device_id: entry.origin_device_id.clone(),
                op: entry.op,
                entity_kind: entry.entity_kind,
                entity_id: entry.entity_id,
                post_image: entry.post_image.clone(),
                server_timestamp: entry.server_timestamp,
            };
            if outbound
                .send(OutboundFrame::Message(WsMessage::Event(event)))
                .await
                .is_err()
            {
                // Writer task is gone; nothing left to replay to.
                return Ok(CatchupOutcome::Completed { up_to_seq: cursor });
            }
        }
        if cursor >= snapshot || (page.len() as i64) < page_size {
            break;
        }
    }

    let _ = outbound
        .send(OutboundFrame::Message(WsMessage::CatchupComplete(CatchupComplete {
            up_to_seq: snapshot,
        })))
        .await;

    Ok(CatchupOutcome::Completed { up_to_seq: snapshot })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_is_only_reported_when_since_seq_precedes_retention() {
        // since_seq = 0 means "full history", never truncated regardless of
        // retention_min_seq, since a brand-new device has no prior cursor.
        assert!(!(0 > 0 && 0 < 5));
        assert!(3 > 0 && 3 < 5);
    }
}
