//! Collection entity storage plus the acyclic-forest validation rule from
//! spec §9: "not a data-structure cycle to manage — a validation rule",
//! walked the same way the teacher walks a natural-key chain in
//! `repo::receiver_cursors::compute_backlog` (iterative lookups, no
//! recursive SQL).

use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::model::{Collection, Visibility, MAX_COLLECTION_DEPTH};

pub async fn fetch(
    conn: &mut PgConnection,
    user_id: &str,
    id: Uuid,
) -> Result<Option<Collection>, sqlx::Error> {
    let row = sqlx::query(
        r#"SELECT id, user_id, name, description, parent_id, visibility,
                  created_at, updated_at, last_origin_device_id, deleted, deleted_at
           FROM collections WHERE user_id = $1 AND id = $2"#,
    )
    .bind(user_id)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(row_to_collection))
}

fn row_to_collection(r: sqlx::postgres::PgRow) -> Collection {
    Collection {
        id: r.get("id"),
        user_id: r.get("user_id"),
        name: r.get("name"),
        description: r.get("description"),
        parent_id: r.get("parent_id"),
        visibility: Visibility::parse(&r.get::<String, _>("visibility")).unwrap_or(Visibility::Private),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        last_origin_device_id: r.get("last_origin_device_id"),
        deleted: r.get("deleted"),
        deleted_at: r.get("deleted_at"),
    }
}

pub async fn upsert(conn: &mut PgConnection, collection: &Collection) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO collections
            (id, user_id, name, description, parent_id, visibility,
             created_at, updated_at, last_origin_device_id, deleted, deleted_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
           ON CONFLICT (user_id, id) DO UPDATE SET
             name = EXCLUDED.name,
             description = EXCLUDED.description,
             parent_id = EXCLUDED.parent_id,
             visibility = EXCLUDED.visibility,
             updated_at = EXCLUDED.updated_at,
             last_origin_device_id = EXCLUDED.last_origin_device_id,
             deleted = EXCLUDED.deleted,
             deleted_at = EXCLUDED.deleted_at"#,
    )
    .bind(collection.id)
    .bind(&collection.user_id)
    .bind(&collection.name)
    .bind(&collection.description)
    .bind(collection.parent_id)
    .bind(collection.visibility.as_str())
    .bind(collection.created_at)
    .bind(collection.updated_at)
    .bind(&collection.last_origin_device_id)
    .bind(collection.deleted)
    .bind(collection.deleted_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParentCheck {
    Ok,
    NotFound,
    WouldCycle,
    TooDeep,
}

/// Validates that `parent_id` (if any) exists for `user_id`, does not form
/// a cycle by including `self_id` among its own ancestors, and keeps the
/// resulting depth within `MAX_COLLECTION_DEPTH` (spec §3, §9).
pub async fn check_parent(
    conn: &mut PgConnection,
    user_id: &str,
    self_id: Uuid,
    parent_id: Option<Uuid>,
) -> Result<ParentCheck, sqlx::Error> {
    let Some(parent_id) = parent_id else {
        return Ok(ParentCheck::Ok);
    };

    let mut current = parent_id;
    let mut depth: u32 = 1;
    loop {
        if current == self_id {
            return Ok(ParentCheck::WouldCycle);
        }
        if depth > MAX_COLLECTION_DEPTH {
            return Ok(ParentCheck::TooDeep);
        }
        let row = sqlx::query("SELECT parent_id FROM collections WHERE user_id = $1 AND id = $2")
            .bind(user_id)
            .bind(current)
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            None => return Ok(ParentCheck::NotFound),
            Some(r) => match r.get::<Option<Uuid>, _>("parent_id") {
                Some(next) => {
                    current = next;
                    depth += 1;
                }
                None => return Ok(ParentCheck::Ok),
            },
        }
    }
}
