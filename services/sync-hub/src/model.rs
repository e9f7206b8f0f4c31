use serde::{Deserialize, Serialize};
use std::fmt;
use sync_protocol::{EntityKind, Op};
use uuid::Uuid;

/// Opaque user identifier. The core never mutates it; it is handed in by
/// the external authenticator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque device identifier chosen by the client at first connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Visibility of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Shared,
    Public,
}

impl Visibility {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Self::Private),
            "shared" => Some(Self::Shared),
            "public" => Some(Self::Public),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Shared => "shared",
            Self::Public => "public",
        }
    }
}

/// Maximum nesting depth for a collection forest (spec §3).
pub const MAX_COLLECTION_DEPTH: u32 = 16;

/// A stored bookmark, as persisted and as carried in a change log
/// post-image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: Uuid,
    pub user_id: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub collection_ids: Vec<Uuid>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_origin_device_id: Option<String>,
    pub deleted: bool,
    pub deleted_at: Option<i64>,
}

/// A stored collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub description: String,
    pub parent_id: Option<Uuid>,
    pub visibility: Visibility,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_origin_device_id: Option<String>,
    pub deleted: bool,
    pub deleted_at: Option<i64>,
}

/// A committed row in the per-user change log (spec §3, C1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub user_id: String,
    pub seq: i64,
    pub origin_device_id: Option<String>,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub op: Op,
    pub post_image: serde_json::Value,
    pub client_timestamp: i64,
    pub server_timestamp: i64,
}
