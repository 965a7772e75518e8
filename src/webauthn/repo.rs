//! Persistence for passkey credentials.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::models::PasskeyCredential;

/// Outcome of the guarded sign-count update.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CounterCheck {
    Updated,
    /// The presented count did not move forward: possible cloned credential.
    Replay,
}

pub async fn create_credential(
    pool: &PgPool,
    user_id: Uuid,
    credential_id: &[u8],
    label: Option<&str>,
    passkey_data: &serde_json::Value,
    sign_count: i64,
    backup_eligible: bool,
) -> Result<()> {
    let query = r"
        INSERT INTO webauthn_credentials
            (user_id, credential_id, label, passkey_data, sign_count, backup_eligible)
        VALUES ($1, $2, $3, $4, $5, $6)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(credential_id)
        .bind(label)
        .bind(passkey_data)
        .bind(sign_count)
        .bind(backup_eligible)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to create passkey credential")?;
    Ok(())
}

pub async fn list_user_credentials(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Vec<PasskeyCredential>> {
    let query = r"
        SELECT id, user_id, credential_id, label, passkey_data, sign_count,
               backup_eligible, created_at, last_used_at
        FROM webauthn_credentials
        WHERE user_id = $1
        ORDER BY created_at
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(user_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list passkey credentials")?;

    Ok(rows.iter().map(PasskeyCredential::from_row).collect())
}

pub async fn find_by_credential_id(
    pool: &PgPool,
    credential_id: &[u8],
) -> Result<Option<PasskeyCredential>> {
    let query = r"
        SELECT id, user_id, credential_id, label, passkey_data, sign_count,
               backup_eligible, created_at, last_used_at
        FROM webauthn_credentials
        WHERE credential_id = $1
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(credential_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to find passkey credential")?;

    Ok(row.as_ref().map(PasskeyCredential::from_row))
}

/// Advance the sign count if and only if the authenticator moved it forward.
///
/// Counterless authenticators report 0 forever; a stored 0 with a presented 0
/// passes. Any other non-increasing value is a replay and the row is left
/// untouched. The condition lives in the UPDATE so concurrent assertions
/// cannot both pass.
pub async fn update_counter_checked(
    pool: &PgPool,
    credential_id: &[u8],
    new_count: i64,
) -> Result<CounterCheck> {
    let query = r"
        UPDATE webauthn_credentials
        SET sign_count = $2,
            last_used_at = NOW()
        WHERE credential_id = $1
          AND (sign_count < $2 OR ($2 = 0 AND sign_count = 0))
        RETURNING user_id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row: Option<Uuid> = sqlx::query(query)
        .bind(credential_id)
        .bind(new_count)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to update sign count")?
        .map(|row| row.get("user_id"));

    Ok(if row.is_some() {
        CounterCheck::Updated
    } else {
        CounterCheck::Replay
    })
}

/// Persist updated credential state (backup flags) after an assertion.
pub async fn update_credential_data(
    pool: &PgPool,
    credential_id: &[u8],
    passkey_data: &serde_json::Value,
) -> Result<()> {
    let query = r"
        UPDATE webauthn_credentials
        SET passkey_data = $2
        WHERE credential_id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(credential_id)
        .bind(passkey_data)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update passkey data")?;
    Ok(())
}
