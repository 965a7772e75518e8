//! Stored passkey credential rows.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

/// A registered passkey as stored.
///
/// `passkey_data` is the full serialized credential (public key, policy,
/// flags); `sign_count` is tracked in its own column so the anti-cloning
/// check can be a single guarded update.
#[derive(Clone, Debug)]
pub struct PasskeyCredential {
    pub id: Uuid,
    pub user_id: Uuid,
    pub credential_id: Vec<u8>,
    pub label: Option<String>,
    pub passkey_data: serde_json::Value,
    pub sign_count: i64,
    pub backup_eligible: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl PasskeyCredential {
    pub(crate) fn from_row(row: &PgRow) -> Self {
        Self {
            id: row.get("id"),
            user_id: row.get("user_id"),
            credential_id: row.get("credential_id"),
            label: row.get("label"),
            passkey_data: row.get("passkey_data"),
            sign_count: row.get("sign_count"),
            backup_eligible: row.get("backup_eligible"),
            created_at: row.get("created_at"),
            last_used_at: row.get("last_used_at"),
        }
    }
}
