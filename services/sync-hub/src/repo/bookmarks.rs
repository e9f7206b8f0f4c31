//! Bookmark entity storage: fetch-current, then full upsert or soft-delete,
//! mirroring the teacher's `repo::events::upsert_stream` upsert-by-natural-key
//! shape, generalized to carry the full post-image the conflict resolver
//! already decided to accept.

use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::model::Bookmark;

pub async fn fetch(
    conn: &mut PgConnection,
    user_id: &str,
    id: Uuid,
) -> Result<Option<Bookmark>, sqlx::Error> {
    let row = sqlx::query(
        r#"SELECT id, user_id, url, title, description, tags, collection_ids,
                  created_at, updated_at, last_origin_device_id, deleted, deleted_at
           FROM bookmarks WHERE user_id = $1 AND id = $2"#,
    )
    .bind(user_id)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(row_to_bookmark))
}

fn row_to_bookmark(r: sqlx::postgres::PgRow) -> Bookmark {
    Bookmark {
        id: r.get("id"),
        user_id: r.get("user_id"),
        url: r.get("url"),
        title: r.get("title"),
        description: r.get("description"),
        tags: r.get("tags"),
        collection_ids: r.get("collection_ids"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        last_origin_device_id: r.get("last_origin_device_id"),
        deleted: r.get("deleted"),
        deleted_at: r.get("deleted_at"),
    }
}

/// Upserts the full post-image. Accepts either a create or an update; the
/// pipeline has already merged partial payload fields onto the current
/// entity before calling this.
pub async fn upsert(conn: &mut PgConnection, bookmark: &Bookmark) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO bookmarks
            (id, user_id, url, title, description, tags, collection_ids,
             created_at, updated_at, last_origin_device_id, deleted, deleted_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
           ON CONFLICT (user_id, id) DO UPDATE SET
             url = EXCLUDED.url,
             title = EXCLUDED.title,
             description = EXCLUDED.description,
             tags = EXCLUDED.tags,
             collection_ids = EXCLUDED.collection_ids,
             updated_at = EXCLUDED.updated_at,
             last_origin_device_id = EXCLUDED.last_origin_device_id,
             deleted = EXCLUDED.deleted,
             deleted_at = EXCLUDED.deleted_at"#,
    )
    .bind(bookmark.id)
    .bind(&bookmark.user_id)
    .bind(&bookmark.url)
    .bind(&bookmark.title)
    .bind(&bookmark.description)
    .bind(&bookmark.tags)
    .bind(&bookmark.collection_ids)
    .bind(bookmark.created_at)
    .bind(bookmark.updated_at)
    .bind(&bookmark.last_origin_device_id)
    .bind(bookmark.deleted)
    .bind(bookmark.deleted_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
