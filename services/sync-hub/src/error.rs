use thiserror::Error;

/// Internal error type for the mutation pipeline and its repos.
///
/// Mapped to wire-level `error_codes` at the WebSocket boundary (see
/// `ws::handler`); never leaked to a client as a Rust `Display` string
/// beyond `Transient`'s underlying message, which is operator-facing via
/// `tracing` and advisory-only on the wire.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("rejected as stale")]
    Stale,

    #[error("unknown entity {0}")]
    UnknownEntity(uuid::Uuid),

    #[error("transient storage error: {0}")]
    Transient(#[from] sqlx::Error),
}

impl SyncError {
    pub fn wire_code(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => sync_protocol::error_codes::VALIDATION_ERROR,
            SyncError::Stale => sync_protocol::error_codes::STALE,
            SyncError::UnknownEntity(_) => sync_protocol::error_codes::UNKNOWN_ENTITY,
            SyncError::Transient(_) => sync_protocol::error_codes::TRANSIENT,
        }
    }
}
