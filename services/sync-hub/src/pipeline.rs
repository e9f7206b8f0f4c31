//! Mutation Pipeline (C2): `ingest(user_id, envelope) -> accepted | rejected
//! | duplicate`, the single choke point every inbound mutation passes
//! through before it can become a change log entry.
//!
//! Grounded in the teacher's `repo::races::replace_participants`/
//! `replace_chips` for the transaction shape (`pool.begin()` ->
//! `&mut *tx` statements -> `tx.commit()`), and in
//! `repo::events::upsert_event` for the fetch-current / decide / upsert
//! sequence the conflict resolver now sits in the middle of.

use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use sqlx::PgPool;
use sync_protocol::{EntityKind, MutationEnvelope, MutationResult, MutationStatus, Op};
use uuid::Uuid;

use crate::conflict::{self, CurrentHead, Decision, ProposedHead};
use crate::error::SyncError;
use crate::fabric::{Fabric, FabricMessage};
use crate::metrics::{MUTATIONS_REJECTED_TOTAL, MUTATIONS_TOTAL};
use crate::model::{Bookmark, ChangeLogEntry, Collection, Visibility};
use crate::repo::{bookmarks, change_log, collections};

pub struct IngestOutcome {
    pub result: MutationResult,
    /// Set only when a new entry was actually appended, so the caller can
    /// decide whether to publish to the fabric.
    pub appended: Option<Arc<ChangeLogEntry>>,
}

pub(crate) fn rejected(client_msg_id: String, err: &SyncError) -> IngestOutcome {
    counter!(MUTATIONS_REJECTED_TOTAL, "code" => err.wire_code()).increment(1);
    IngestOutcome {
        result: MutationResult {
            client_msg_id,
            status: MutationStatus::Rejected,
            seq: None,
            reason: Some(err.wire_code().to_owned()),
        },
        appended: None,
    }
}

pub async fn ingest(
    pool: &PgPool,
    user_id: &str,
    device_id: &str,
    envelope: MutationEnvelope,
) -> Result<IngestOutcome, sqlx::Error> {
    counter!(MUTATIONS_TOTAL).increment(1);
    if let Some(seq) =
        change_log::find_by_idempotency_key(pool, device_id, &envelope.client_msg_id).await?
    {
        return Ok(IngestOutcome {
            result: MutationResult {
                client_msg_id: envelope.client_msg_id,
                status: MutationStatus::Duplicate,
                seq: Some(seq),
                reason: None,
            },
            appended: None,
        });
    }

    let entity_id = match (envelope.op, envelope.entity_id) {
        (Op::Create, None) => Uuid::new_v4(),
        (Op::Create, Some(id)) => id,
        (Op::Update | Op::Delete, Some(id)) => id,
        (Op::Update | Op::Delete, None) => {
            return Ok(rejected(
                envelope.client_msg_id,
                &SyncError::Validation("entity_id is required for update/delete".to_owned()),
            ));
        }
    };

    let mut tx = pool.begin().await?;

    let decision_and_image = match envelope.entity_kind {
        EntityKind::Bookmark => {
            apply_bookmark(&mut tx, user_id, device_id, entity_id, &envelope).await?
        }
        EntityKind::Collection => {
            apply_collection(&mut tx, user_id, device_id, entity_id, &envelope).await?
        }
    };

    let post_image = match decision_and_image {
        Ok(image) => image,
        Err(err) => {
            tx.rollback().await?;
            return Ok(rejected(envelope.client_msg_id, &err));
        }
    };

    let append = change_log::append(
        &mut tx,
        change_log::NewEntry {
            user_id,
            origin_device_id: Some(device_id),
            entity_kind: envelope.entity_kind,
            entity_id,
            op: envelope.op,
            post_image,
            client_timestamp: envelope.client_timestamp,
            device_id: Some(device_id),
            client_msg_id: Some(&envelope.client_msg_id),
        },
    )
    .await?;

    match append {
        change_log::AppendOutcome::Appended(entry) => {
            tx.commit().await?;
            let seq = entry.seq;
            Ok(IngestOutcome {
                result: MutationResult {
                    client_msg_id: envelope.client_msg_id,
                    status: MutationStatus::Accepted,
                    seq: Some(seq),
                    reason: None,
                },
                appended: Some(Arc::new(entry)),
            })
        }
        change_log::AppendOutcome::AlreadyRecorded => {
            tx.rollback().await?;
            let seq = change_log::find_by_idempotency_key(pool, device_id, &envelope.client_msg_id)
                .await?;
            Ok(IngestOutcome {
                result: MutationResult {
                    client_msg_id: envelope.client_msg_id,
                    status: MutationStatus::Duplicate,
                    seq,
                    reason: None,
                },
                appended: None,
            })
        }
    }
}

/// Publishes an accepted mutation to the fabric so every other live
/// connection for this user hears about it. Best-effort: publish failure
/// is not surfaced to the originating device, since the mutation is
/// already durable (spec §4.2 step 4).
pub async fn publish(fabric: &dyn Fabric, entry: &FabricMessage) {
    fabric.publish(&entry.user_id, entry.clone()).await;
}

async fn apply_bookmark(
    tx: &mut sqlx::PgConnection,
    user_id: &str,
    device_id: &str,
    entity_id: Uuid,
    envelope: &MutationEnvelope,
) -> Result<Result<Value, SyncError>, sqlx::Error> {
    let current = bookmarks::fetch(tx, user_id, entity_id).await?;

    if envelope.op != Op::Create && current.is_none() {
        return Ok(Err(SyncError::UnknownEntity(entity_id)));
    }

    let proposed = ProposedHead {
        client_timestamp: envelope.client_timestamp,
        origin_device_id: Some(device_id),
    };
    let current_head = current.as_ref().map(|c| CurrentHead {
        updated_at: c.updated_at,
        last_origin_device_id: c.last_origin_device_id.as_deref(),
    });
    if conflict::resolve(current_head, proposed) == Decision::Reject {
        return Ok(Err(SyncError::Stale));
    }

    if envelope.op != Op::Delete {
        let url = envelope.payload.get("url").and_then(Value::as_str);
        match url {
            Some(url) if !url.is_empty() && url::Url::parse(url).is_ok() => {}
            _ => return Ok(Err(SyncError::Validation("url must be a valid, non-empty URL".to_owned()))),
        }
    }

    let base = current.unwrap_or_else(|| Bookmark {
        id: entity_id,
        user_id: user_id.to_owned(),
        url: String::new(),
        title: String::new(),
        description: String::new(),
        tags: Vec::new(),
        collection_ids: Vec::new(),
        created_at: envelope.client_timestamp,
        updated_at: envelope.client_timestamp,
        last_origin_device_id: None,
        deleted: false,
        deleted_at: None,
    });

    let updated = Bookmark {
        url: string_field(&envelope.payload, "url").unwrap_or(base.url),
        title: string_field(&envelope.payload, "title").unwrap_or(base.title),
        description: string_field(&envelope.payload, "description").unwrap_or(base.description),
        tags: string_vec_field(&envelope.payload, "tags").unwrap_or(base.tags),
        collection_ids: uuid_vec_field(&envelope.payload, "collection_ids")
            .unwrap_or(base.collection_ids),
        updated_at: envelope.client_timestamp,
        last_origin_device_id: Some(device_id.to_owned()),
        deleted: envelope.op == Op::Delete,
        deleted_at: if envelope.op == Op::Delete {
            Some(envelope.client_timestamp)
        } else {
            None
        },
        ..base
    };

    bookmarks::upsert(tx, &updated).await?;
    Ok(Ok(serde_json::to_value(&updated).expect("Bookmark always serializes")))
}

async fn apply_collection(
    tx: &mut sqlx::PgConnection,
    user_id: &str,
    device_id: &str,
    entity_id: Uuid,
    envelope: &MutationEnvelope,
) -> Result<Result<Value, SyncError>, sqlx::Error> {
    let current = collections::fetch(tx, user_id, entity_id).await?;

    if envelope.op != Op::Create && current.is_none() {
        return Ok(Err(SyncError::UnknownEntity(entity_id)));
    }

    let proposed = ProposedHead {
        client_timestamp: envelope.client_timestamp,
        origin_device_id: Some(device_id),
    };
    let current_head = current.as_ref().map(|c| CurrentHead {
        updated_at: c.updated_at,
        last_origin_device_id: c.last_origin_device_id.as_deref(),
    });
    if conflict::resolve(current_head, proposed) == Decision::Reject {
        return Ok(Err(SyncError::Stale));
    }

    let parent_id = envelope
        .payload
        .get("parent_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok());

    if envelope.op != Op::Delete && parent_id.is_some() {
        match collections::check_parent(tx, user_id, entity_id, parent_id).await? {
            collections::ParentCheck::Ok => {}
            collections::ParentCheck::NotFound => {
                return Ok(Err(SyncError::Validation("parent_id does not exist".to_owned())));
            }
            collections::ParentCheck::WouldCycle => {
                return Ok(Err(SyncError::Validation("parent_id would create a cycle".to_owned())));
            }
            collections::ParentCheck::TooDeep => {
                return Ok(Err(SyncError::Validation("collection nesting too deep".to_owned())));
            }
        }
    }

    if envelope.op != Op::Delete {
        let name = envelope.payload.get("name").and_then(Value::as_str);
        if name.map(str::is_empty).unwrap_or(true) {
            return Ok(Err(SyncError::Validation("name is required".to_owned())));
        }
    }

    let base = current.unwrap_or_else(|| Collection {
        id: entity_id,
        user_id: user_id.to_owned(),
        name: String::new(),
        description: String::new(),
        parent_id: None,
        visibility: Visibility::Private,
        created_at: envelope.client_timestamp,
        updated_at: envelope.client_timestamp,
        last_origin_device_id: None,
        deleted: false,
        deleted_at: None,
    });

    let updated = Collection {
        name: string_field(&envelope.payload, "name").unwrap_or(base.name),
        description: string_field(&envelope.payload, "description").unwrap_or(base.description),
        parent_id: if envelope.op == Op::Delete { base.parent_id } else { parent_id.or(base.parent_id) },
        visibility: envelope
            .payload
            .get("visibility")
            .and_then(Value::as_str)
            .and_then(Visibility::parse)
            .unwrap_or(base.visibility),
        updated_at: envelope.client_timestamp,
        last_origin_device_id: Some(device_id.to_owned()),
        deleted: envelope.op == Op::Delete,
        deleted_at: if envelope.op == Op::Delete {
            Some(envelope.client_timestamp)
        } else {
            None
        },
        ..base
    };

    collections::upsert(tx, &updated).await?;
    Ok(Ok(serde_json::to_value(&updated).expect("Collection always serializes")))
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn string_vec_field(payload: &Value, key: &str) -> Option<Vec<String>> {
    payload.get(key)?.as_array().map(|arr| {
        arr.iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect()
    })
}

fn uuid_vec_field(payload: &Value, key: &str) -> Option<Vec<Uuid>> {
    payload.get(key)?.as_array().map(|arr| {
        arr.iter()
            .filter_map(Value::as_str)
            .filter_map(|s| Uuid::parse_str(s).ok())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_field_ignores_non_string_json_values() {
        let payload = serde_json::json!({"url": 5});
        assert_eq!(string_field(&payload, "url"), None);
    }

    #[test]
    fn uuid_vec_field_skips_unparseable_entries() {
        let payload = serde_json::json!({"collection_ids": ["not-a-uuid", Uuid::nil().to_string()]});
        assert_eq!(uuid_vec_field(&payload, "collection_ids"), Some(vec![Uuid::nil()]));
    }
}
