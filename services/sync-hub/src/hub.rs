//! Connection Registry / Hub (C5): tracks live connections per user and
//! fans out committed changes to them.
//!
//! Grounded in the teacher's `AppState` (`state.rs`), which keeps a
//! `DashMap`-style registry of live forwarder sessions and a per-stream
//! broadcast sender. The key departure spec §5 forces: fan-out for one
//! user must never contend with another user's, so the registry is
//! sharded per user (`UserBucket`) behind its own lock, instead of the
//! teacher's single global map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use metrics::{counter, gauge};
use sync_protocol::{ChangeEvent, CloseReason};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::fabric::Fabric;
use crate::metrics::{CONNECTIONS_EVICTED_TOTAL, CONNECTIONS_LIVE};
use crate::model::{DeviceId, UserId};
use crate::ws::delivery::{ConnectionHandle, KillSwitch, OutboundFrame};

struct LiveConnection {
    handle: ConnectionHandle,
    kill: KillSwitch,
    /// Events with `seq <= suppress_upto` are this connection's own catchup
    /// replay's responsibility; the dispatch loop must not double-deliver
    /// them while that replay is in flight (spec §4.7 step 4).
    suppress_upto: Arc<AtomicI64>,
}

struct UserBucket {
    conns: RwLock<HashMap<DeviceId, LiveConnection>>,
    dispatch: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl UserBucket {
    fn new() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            dispatch: tokio::sync::Mutex::new(None),
        }
    }
}

pub enum RegisterOutcome {
    Registered {
        evicted: Option<(ConnectionHandle, KillSwitch)>,
        /// Shared cell the caller's catchup replay updates as it streams
        /// pages, so the dispatch loop knows which live seqs to skip.
        suppress_upto: Arc<AtomicI64>,
    },
    TooManyConnections,
}

/// Per-process registry of live connections, one bucket per user so
/// fan-out for user A never blocks fan-out for user B.
pub struct Hub {
    fabric: Arc<dyn Fabric>,
    users: RwLock<HashMap<UserId, Arc<UserBucket>>>,
    max_conns_per_user: usize,
}

impl Hub {
    pub fn new(fabric: Arc<dyn Fabric>, max_conns_per_user: usize) -> Self {
        Self {
            fabric,
            users: RwLock::new(HashMap::new()),
            max_conns_per_user,
        }
    }

    async fn bucket_for(&self, user_id: &UserId) -> Arc<UserBucket> {
        {
            let users = self.users.read().await;
            if let Some(b) = users.get(user_id) {
                return b.clone();
            }
        }
        let mut users = self.users.write().await;
        if let Some(b) = users.get(user_id) {
            return b.clone();
        }
        let bucket = Arc::new(UserBucket::new());
        users.insert(user_id.clone(), bucket.clone());
        bucket
    }

    /// Registers a new connection for `(user_id, device_id)`. Any existing
    /// connection for the same key is evicted (spec §4.5: "second
    /// connection for the same key supersedes the first"); the caller is
    /// responsible for invoking the returned `KillSwitch`.
    ///
    /// `since_seq` seeds the suppression watermark so the live dispatch
    /// loop does not race the caller's catchup replay; the caller should
    /// raise it to the catchup snapshot target once that is known.
    pub async fn register(
        &self,
        user_id: &UserId,
        device_id: DeviceId,
        handle: ConnectionHandle,
        kill: KillSwitch,
        since_seq: i64,
    ) -> RegisterOutcome {
        let bucket = self.bucket_for(user_id).await;
        let suppress_upto = Arc::new(AtomicI64::new(since_seq));

        let evicted = {
            let mut conns = bucket.conns.write().await;
            if !conns.contains_key(&device_id) && conns.len() >= self.max_conns_per_user {
                return RegisterOutcome::TooManyConnections;
            }
            let was_empty = conns.is_empty();
            let evicted = conns.remove(&device_id).map(|c| (c.handle, c.kill));
            conns.insert(
                device_id.clone(),
                LiveConnection {
                    handle,
                    kill,
                    suppress_upto: suppress_upto.clone(),
                },
            );
            if was_empty {
                self.start_dispatch(user_id.clone(), bucket.clone()).await;
            }
            evicted
        };

        gauge!(CONNECTIONS_LIVE).increment(1.0);
        RegisterOutcome::Registered { evicted, suppress_upto }
    }

    /// Removes a connection. If it was the last one for the user, tears
    /// down the fabric subscription and dispatch task.
    pub async fn unregister(&self, user_id: &UserId, device_id: &DeviceId) {
        let bucket = {
            let users = self.users.read().await;
            match users.get(user_id) {
                Some(b) => b.clone(),
                None => return,
            }
        };

        let now_empty = {
            let mut conns = bucket.conns.write().await;
            let removed = conns.remove(device_id);
            if removed.is_some() {
                gauge!(CONNECTIONS_LIVE).decrement(1.0);
            }
            conns.is_empty()
        };

        if now_empty {
            if let Some(task) = bucket.dispatch.lock().await.take() {
                task.abort();
            }
            self.fabric.unsubscribe(&user_id.0).await;
            let mut users = self.users.write().await;
            if let Some(b) = users.get(user_id) {
                if b.conns.try_read().map(|c| c.is_empty()).unwrap_or(false) {
                    users.remove(user_id);
                }
            }
        }
    }

    /// Spawns the task that drains this user's fabric subscription and
    /// fans each event out to every connection but the one it originated
    /// from (echo suppression, spec §4.5/§8).
    async fn start_dispatch(&self, user_id: UserId, bucket: Arc<UserBucket>) {
        let mut rx = self.fabric.subscribe(&user_id.0).await;
        let dispatch_bucket = bucket.clone();
        let task = tokio::spawn(async move {
            loop {
                let entry = match rx.recv().await {
                    Ok(entry) => entry,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(user_id = %user_id, skipped = n, "fabric receiver lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                let event = ChangeEvent {
                    seq: entry.seq,
                    origin_device_id: entry.origin_device_id.clone(),
                    op: entry.op,
                    entity_kind: entry.entity_kind,
                    entity_id: entry.entity_id,
                    post_image: entry.post_image.clone(),
                    server_timestamp: entry.server_timestamp,
                };

                let conns = dispatch_bucket.conns.read().await;
                for (device_id, conn) in conns.iter() {
                    if entry.origin_device_id.as_deref() == Some(device_id.0.as_str()) {
                        continue;
                    }
                    if entry.seq <= conn.suppress_upto.load(Ordering::SeqCst) {
                        continue;
                    }
                    if conn
                        .handle
                        .try_enqueue(OutboundFrame::Event(event.clone()))
                        .is_err()
                    {
                        debug!(user_id = %user_id, device_id = %device_id, "outbound queue full, evicting");
                        counter!(CONNECTIONS_EVICTED_TOTAL, "reason" => "backpressure").increment(1);
                        conn.kill.kill(CloseReason::Backpressure);
                    }
                }
            }
        });
        *bucket.dispatch.lock().await = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::InProcessFabric;
    use crate::ws::delivery::new_connection;
    use std::time::Duration;
    use sync_protocol::{EntityKind, Op};

    fn sample_entry(seq: i64, origin: Option<&str>) -> Arc<crate::model::ChangeLogEntry> {
        Arc::new(crate::model::ChangeLogEntry {
            user_id: "u1".to_owned(),
            seq,
            origin_device_id: origin.map(str::to_owned),
            entity_kind: EntityKind::Bookmark,
            entity_id: uuid::Uuid::nil(),
            op: Op::Create,
            post_image: serde_json::json!({}),
            client_timestamp: 1,
            server_timestamp: 1,
        })
    }

    #[tokio::test]
    async fn register_then_publish_delivers_to_the_connection() {
        let fabric: Arc<dyn Fabric> = Arc::new(InProcessFabric::new(16));
        let hub = Hub::new(fabric.clone(), 16);
        let user = UserId("u1".to_owned());
        let (handle, kill, mut inbox) = new_connection(DeviceId("D1".to_owned()), 16);

        match hub.register(&user, DeviceId("D1".to_owned()), handle, kill, 0).await {
            RegisterOutcome::Registered { .. } => {}
            RegisterOutcome::TooManyConnections => panic!("unexpected"),
        }

        fabric.publish("u1", sample_entry(1, Some("D2"))).await;

        let frame = tokio::time::timeout(Duration::from_secs(1), inbox.outbound_rx.recv())
            .await
            .expect("no timeout")
            .expect("frame");
        match frame {
            OutboundFrame::Event(e) => assert_eq!(e.seq, 1),
            _ => panic!("expected event frame"),
        }
    }

    #[tokio::test]
    async fn events_are_not_echoed_to_their_origin_device() {
        let fabric: Arc<dyn Fabric> = Arc::new(InProcessFabric::new(16));
        let hub = Hub::new(fabric.clone(), 16);
        let user = UserId("u1".to_owned());
        let (handle, kill, mut inbox) = new_connection(DeviceId("D1".to_owned()), 16);
        hub.register(&user, DeviceId("D1".to_owned()), handle, kill, 0).await;

        fabric.publish("u1", sample_entry(1, Some("D1"))).await;

        let result = tokio::time::timeout(Duration::from_millis(200), inbox.outbound_rx.recv()).await;
        assert!(result.is_err(), "origin device must not receive its own event");
    }

    #[tokio::test]
    async fn second_connection_for_same_device_supersedes_the_first() {
        let fabric: Arc<dyn Fabric> = Arc::new(InProcessFabric::new(16));
        let hub = Hub::new(fabric, 16);
        let user = UserId("u1".to_owned());
        let (h1, k1, mut inbox1) = new_connection(DeviceId("D1".to_owned()), 16);
        hub.register(&user, DeviceId("D1".to_owned()), h1, k1, 0).await;

        let (h2, k2, _inbox2) = new_connection(DeviceId("D1".to_owned()), 16);
        let outcome = hub.register(&user, DeviceId("D1".to_owned()), h2, k2, 0).await;
        match outcome {
            RegisterOutcome::Registered { evicted, .. } => {
                let (_, kill) = evicted.expect("first connection should be evicted");
                kill.kill(CloseReason::Superseded);
            }
            RegisterOutcome::TooManyConnections => panic!("unexpected"),
        }

        let reason = inbox1.kill_rx.try_recv().expect("kill signal delivered");
        assert_eq!(reason, CloseReason::Superseded);
    }

    #[tokio::test]
    async fn registration_beyond_the_per_user_cap_is_rejected() {
        let fabric: Arc<dyn Fabric> = Arc::new(InProcessFabric::new(16));
        let hub = Hub::new(fabric, 1);
        let user = UserId("u1".to_owned());
        let (h1, k1, _inbox1) = new_connection(DeviceId("D1".to_owned()), 16);
        hub.register(&user, DeviceId("D1".to_owned()), h1, k1, 0).await;

        let (h2, k2, _inbox2) = new_connection(DeviceId("D2".to_owned()), 16);
        let outcome = hub.register(&user, DeviceId("D2".to_owned()), h2, k2, 0).await;
        assert!(matches!(outcome, RegisterOutcome::TooManyConnections));
    }

    #[tokio::test]
    async fn suppress_upto_hides_events_the_connections_own_catchup_will_cover() {
        let fabric: Arc<dyn Fabric> = Arc::new(InProcessFabric::new(16));
        let hub = Hub::new(fabric.clone(), 16);
        let user = UserId("u1".to_owned());
        let (handle, kill, mut inbox) = new_connection(DeviceId("D1".to_owned()), 16);
        let outcome = hub
            .register(&user, DeviceId("D1".to_owned()), handle, kill, 5)
            .await;
        let RegisterOutcome::Registered { suppress_upto, .. } = outcome else {
            panic!("unexpected");
        };
        assert_eq!(suppress_upto.load(Ordering::SeqCst), 5);

        fabric.publish("u1", sample_entry(3, Some("D2"))).await;
        let suppressed = tokio::time::timeout(Duration::from_millis(200), inbox.outbound_rx.recv()).await;
        assert!(suppressed.is_err(), "seq within suppress window must not be live-delivered");

        fabric.publish("u1", sample_entry(9, Some("D2"))).await;
        let delivered = tokio::time::timeout(Duration::from_secs(1), inbox.outbound_rx.recv())
            .await
            .expect("no timeout")
            .expect("frame");
        match delivered {
            OutboundFrame::Event(e) => assert_eq!(e.seq, 9),
            _ => panic!("expected event frame"),
        }
    }
}
