//! Conflict Resolver (C3): a pure decision function, no I/O.
//!
//! Grounded in the teacher's `repo::events::upsert_event`, which makes the
//! accept/reject call inline against the existing row (identical payload ->
//! retransmit, different payload at an existing key -> integrity conflict).
//! This generalizes that same-key decision into last-writer-wins over
//! `(client_timestamp, origin_device_id)` per spec §4.3.

/// The decision-relevant slice of a stored entity's head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentHead<'a> {
    pub updated_at: i64,
    pub last_origin_device_id: Option<&'a str>,
}

/// The decision-relevant slice of a proposed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposedHead<'a> {
    pub client_timestamp: i64,
    pub origin_device_id: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

/// `resolve(current, proposed) -> accept | reject`, spec §4.3.
///
/// `current = None` means the entity does not exist yet (or was previously
/// deleted and pruned): any op is accepted, including delete, which is a
/// no-op-accept that still produces a log entry for idempotent fan-out.
pub fn resolve(current: Option<CurrentHead<'_>>, proposed: ProposedHead<'_>) -> Decision {
    let Some(current) = current else {
        return Decision::Accept;
    };

    if proposed.client_timestamp > current.updated_at {
        return Decision::Accept;
    }
    if proposed.client_timestamp < current.updated_at {
        return Decision::Reject;
    }

    // Tie: deterministic tie-break on origin_device_id, lexicographic.
    // A proposal with no origin (server-originated) never wins a tie
    // against a device-originated current head, and vice versa is
    // treated as still requiring a strictly-greater id.
    match (proposed.origin_device_id, current.last_origin_device_id) {
        (Some(p), Some(c)) if p > c => Decision::Accept,
        _ => Decision::Reject,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_current_always_accepts() {
        let proposed = ProposedHead {
            client_timestamp: 1,
            origin_device_id: Some("D1"),
        };
        assert_eq!(resolve(None, proposed), Decision::Accept);
    }

    #[test]
    fn strictly_newer_timestamp_accepts() {
        let current = CurrentHead {
            updated_at: 200,
            last_origin_device_id: Some("D1"),
        };
        let proposed = ProposedHead {
            client_timestamp: 250,
            origin_device_id: Some("D2"),
        };
        assert_eq!(resolve(Some(current), proposed), Decision::Accept);
    }

    #[test]
    fn strictly_older_timestamp_rejects_as_stale() {
        let current = CurrentHead {
            updated_at: 200,
            last_origin_device_id: Some("D1"),
        };
        let proposed = ProposedHead {
            client_timestamp: 150,
            origin_device_id: Some("D2"),
        };
        assert_eq!(resolve(Some(current), proposed), Decision::Reject);
    }

    #[test]
    fn tie_breaks_lexicographically_on_device_id() {
        let current = CurrentHead {
            updated_at: 300,
            last_origin_device_id: Some("D1"),
        };
        // "D2" > "D1" lexicographically: accept.
        let winner = ProposedHead {
            client_timestamp: 300,
            origin_device_id: Some("D2"),
        };
        assert_eq!(resolve(Some(current), winner), Decision::Accept);

        // "D0" < "D1": reject.
        let loser = ProposedHead {
            client_timestamp: 300,
            origin_device_id: Some("D0"),
        };
        assert_eq!(resolve(Some(current), loser), Decision::Reject);
    }

    #[test]
    fn scenario_3_tie_on_timestamp_from_spec() {
        // Current updated_at=300, last_origin_device_id="D1".
        let current = CurrentHead {
            updated_at: 300,
            last_origin_device_id: Some("D1"),
        };
        // D2 at 300 -> accepted (D2 > D1).
        assert_eq!(
            resolve(
                Some(current),
                ProposedHead {
                    client_timestamp: 300,
                    origin_device_id: Some("D2"),
                },
            ),
            Decision::Accept
        );
        // D0 at 300 -> rejected stale (D0 < D1).
        assert_eq!(
            resolve(
                Some(current),
                ProposedHead {
                    client_timestamp: 300,
                    origin_device_id: Some("D0"),
                },
            ),
            Decision::Reject
        );
    }
}
