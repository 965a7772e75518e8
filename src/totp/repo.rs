//! Persistence for TOTP enrollment and backup codes.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

/// TOTP enrollment state of a user.
pub struct TotpState {
    pub secret: Option<String>,
    pub enabled: bool,
}

pub async fn get_totp_state(pool: &PgPool, user_id: Uuid) -> Result<Option<TotpState>> {
    let query = "SELECT totp_secret, totp_enabled FROM users WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to get TOTP state")?;

    Ok(row.map(|row| TotpState {
        secret: row.get("totp_secret"),
        enabled: row.get("totp_enabled"),
    }))
}

/// Store a pending secret. Re-running setup before enablement replaces it.
/// No-op once TOTP is enabled; callers reject that case up front.
pub async fn set_pending_secret(pool: &PgPool, user_id: Uuid, secret: &str) -> Result<()> {
    let query = r"
        UPDATE users
        SET totp_secret = $2
        WHERE id = $1 AND NOT totp_enabled
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(secret)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to store pending TOTP secret")?;
    Ok(())
}

/// Flip enrollment on. Fails quietly if no secret was staged.
pub async fn enable_totp(pool: &PgPool, user_id: Uuid) -> Result<bool> {
    let query = r"
        UPDATE users
        SET totp_enabled = TRUE
        WHERE id = $1 AND totp_secret IS NOT NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to enable TOTP")?;
    Ok(result.rows_affected() > 0)
}

/// Disable TOTP and drop the secret plus all backup codes in one transaction.
pub async fn disable_totp(pool: &PgPool, user_id: Uuid) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin TOTP disable transaction")?;

    let query = r"
        UPDATE users
        SET totp_enabled = FALSE,
            totp_secret = NULL
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to disable TOTP")?;

    let query = "DELETE FROM backup_codes WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to delete backup codes")?;

    tx.commit()
        .await
        .context("failed to commit TOTP disable transaction")?;
    Ok(())
}

/// Replace the user's backup codes with a new batch. The old batch dies even
/// if codes in it were never used.
pub async fn replace_backup_codes(
    pool: &PgPool,
    user_id: Uuid,
    batch_id: Uuid,
    code_hashes: &[String],
) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin backup code transaction")?;

    let query = "DELETE FROM backup_codes WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to delete previous backup codes")?;

    let query = r"
        INSERT INTO backup_codes (user_id, batch_id, code_hash)
        VALUES ($1, $2, $3)
    ";
    for code_hash in code_hashes {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(batch_id)
            .bind(code_hash)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to insert backup code")?;
    }

    tx.commit()
        .await
        .context("failed to commit backup code transaction")?;
    Ok(())
}

/// Unused backup codes for verification: (row id, Argon2id hash).
pub async fn list_unused_backup_codes(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Vec<(Uuid, String)>> {
    let query = r"
        SELECT id, code_hash
        FROM backup_codes
        WHERE user_id = $1 AND used_at IS NULL
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
        .context("failed to list backup codes")?;

    Ok(rows
        .into_iter()
        .map(|row| (row.get("id"), row.get("code_hash")))
        .collect())
}

/// Burn a backup code. The guard on `used_at` makes consumption single-use
/// even when two requests race on the same code.
pub async fn consume_backup_code(pool: &PgPool, code_id: Uuid) -> Result<bool> {
    let query = r"
        UPDATE backup_codes
        SET used_at = NOW()
        WHERE id = $1 AND used_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(code_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to consume backup code")?;
    Ok(result.rows_affected() > 0)
}
