//! Change Log Store (C1): append-only per-user log with a monotonic
//! per-user seq allocator.
//!
//! Grounded in the teacher's `repo::events::upsert_event` /
//! `repo::receiver_cursors` pair: a per-key uniqueness upsert plus a
//! cursor-keyed range read. Here the "key" is the idempotency pair
//! `(device_id, client_msg_id)` and the "cursor" is `(user_id, seq)`.

use chrono::Utc;
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Row};
use sync_protocol::{EntityKind, Op};
use uuid::Uuid;

use crate::model::ChangeLogEntry;

pub struct NewEntry<'a> {
    pub user_id: &'a str,
    pub origin_device_id: Option<&'a str>,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub op: Op,
    pub post_image: Value,
    pub client_timestamp: i64,
    pub device_id: Option<&'a str>,
    pub client_msg_id: Option<&'a str>,
}

pub enum AppendOutcome {
    Appended(ChangeLogEntry),
    /// Lost a race against a concurrent append with the same idempotency
    /// key; caller should look the winner up and return `duplicate`.
    AlreadyRecorded,
}

fn entity_kind_str(k: EntityKind) -> &'static str {
    match k {
        EntityKind::Bookmark => "bookmark",
        EntityKind::Collection => "collection",
    }
}

fn op_str(op: Op) -> &'static str {
    match op {
        Op::Create => "create",
        Op::Update => "update",
        Op::Delete => "delete",
    }
}

fn parse_entity_kind(s: &str) -> EntityKind {
    match s {
        "collection" => EntityKind::Collection,
        _ => EntityKind::Bookmark,
    }
}

fn parse_op(s: &str) -> Op {
    match s {
        "create" => Op::Create,
        "delete" => Op::Delete,
        _ => Op::Update,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err.as_database_error().and_then(|e| e.code()), Some(code) if code == "23505")
}

/// Allocates the next per-user seq and appends the log row, all within the
/// caller's transaction. Row-locks `user_seq_counters` for `user_id` for the
/// duration of the transaction, which is what makes append linearizable per
/// user_id (spec §4.1).
pub async fn append(
    conn: &mut PgConnection,
    entry: NewEntry<'_>,
) -> Result<AppendOutcome, sqlx::Error> {
    sqlx::query(
        "INSERT INTO user_seq_counters (user_id, next_seq) VALUES ($1, 1)
         ON CONFLICT (user_id) DO NOTHING",
    )
    .bind(entry.user_id)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query(
        "UPDATE user_seq_counters SET next_seq = next_seq + 1
         WHERE user_id = $1
         RETURNING next_seq - 1",
    )
    .bind(entry.user_id)
    .fetch_one(&mut *conn)
    .await?;
    let seq: i64 = row.get(0);

    let server_timestamp = Utc::now().timestamp_millis();

    let insert = sqlx::query(
        r#"INSERT INTO change_log
            (user_id, seq, origin_device_id, entity_kind, entity_id, op,
             post_image, client_timestamp, server_timestamp, device_id, client_msg_id)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
    )
    .bind(entry.user_id)
    .bind(seq)
    .bind(entry.origin_device_id)
    .bind(entity_kind_str(entry.entity_kind))
    .bind(entry.entity_id)
    .bind(op_str(entry.op))
    .bind(&entry.post_image)
    .bind(entry.client_timestamp)
    .bind(server_timestamp)
    .bind(entry.device_id)
    .bind(entry.client_msg_id)
    .execute(&mut *conn)
    .await;

    match insert {
        Ok(_) => Ok(AppendOutcome::Appended(ChangeLogEntry {
            user_id: entry.user_id.to_owned(),
            seq,
            origin_device_id: entry.origin_device_id.map(str::to_owned),
            entity_kind: entry.entity_kind,
            entity_id: entry.entity_id,
            op: entry.op,
            post_image: entry.post_image,
            client_timestamp: entry.client_timestamp,
            server_timestamp,
        })),
        Err(e) if is_unique_violation(&e) => Ok(AppendOutcome::AlreadyRecorded),
        Err(e) => Err(e),
    }
}

/// Looks up a previously-recorded seq for an idempotency key, used both for
/// the pipeline's pre-flight dedup check and to resolve a lost append race.
pub async fn find_by_idempotency_key(
    pool: &PgPool,
    device_id: &str,
    client_msg_id: &str,
) -> Result<Option<i64>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT seq FROM change_log WHERE device_id = $1 AND client_msg_id = $2",
    )
    .bind(device_id)
    .bind(client_msg_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get(0)))
}

/// Reads entries with `seq > since_seq` in ascending order, up to `limit`.
/// A finite, restartable page — callers drive repeated calls for the full
/// catchup replay (spec §4.7).
pub async fn read(
    pool: &PgPool,
    user_id: &str,
    since_seq: i64,
    limit: i64,
) -> Result<Vec<ChangeLogEntry>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT user_id, seq, origin_device_id, entity_kind, entity_id, op,
                  post_image, client_timestamp, server_timestamp
           FROM change_log
           WHERE user_id = $1 AND seq > $2
           ORDER BY seq ASC
           LIMIT $3"#,
    )
    .bind(user_id)
    .bind(since_seq)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| ChangeLogEntry {
            user_id: r.get("user_id"),
            seq: r.get("seq"),
            origin_device_id: r.get("origin_device_id"),
            entity_kind: parse_entity_kind(r.get::<String, _>("entity_kind").as_str()),
            entity_id: r.get("entity_id"),
            op: parse_op(r.get::<String, _>("op").as_str()),
            post_image: r.get("post_image"),
            client_timestamp: r.get("client_timestamp"),
            server_timestamp: r.get("server_timestamp"),
        })
        .collect())
}

/// The highest committed seq for a user (0 if the user has no log yet).
pub async fn current_seq(pool: &PgPool, user_id: &str) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) FROM change_log WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(row.get(0))
}

/// The lowest seq still retained for a user (0 if empty or no pruning has
/// happened yet), used to answer `catchup_truncated`.
pub async fn retention_min_seq(pool: &PgPool, user_id: &str) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COALESCE(MIN(seq), 0) FROM change_log WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(row.get(0))
}

/// Deletes entries older than `older_than` (server_timestamp, ms since
/// epoch), preserving the seq allocator's high-water mark in
/// `user_seq_counters` so seqs never get reused (spec §4.1).
pub async fn prune(pool: &PgPool, user_id: &str, older_than: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM change_log WHERE user_id = $1 AND server_timestamp < $2")
        .bind(user_id)
        .bind(older_than)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_and_op_round_trip_through_their_wire_strings() {
        assert_eq!(parse_entity_kind(entity_kind_str(EntityKind::Bookmark)), EntityKind::Bookmark);
        assert_eq!(parse_entity_kind(entity_kind_str(EntityKind::Collection)), EntityKind::Collection);
        assert_eq!(parse_op(op_str(Op::Create)), Op::Create);
        assert_eq!(parse_op(op_str(Op::Update)), Op::Update);
        assert_eq!(parse_op(op_str(Op::Delete)), Op::Delete);
    }
}
