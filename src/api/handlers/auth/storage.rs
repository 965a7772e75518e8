//! Database helpers for users, lockout, sessions, and devices.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::session_kind::SessionKind;
use super::utils::{generate_token, hash_token, is_unique_violation};

/// Consecutive failures that trigger a lockout.
pub(crate) const MAX_FAILED_LOGINS: i32 = 5;
/// Lockout window in minutes.
pub(crate) const LOCKOUT_MINUTES: i64 = 30;

/// Minimal fields needed to evaluate a password login.
pub(crate) struct LoginRecord {
    pub(crate) user_id: Uuid,
    pub(crate) username: String,
    pub(crate) password_hash: Option<String>,
    pub(crate) totp_enabled: bool,
    pub(crate) locked_until: Option<DateTime<Utc>>,
}

/// Minimal data returned for a valid session token.
pub(crate) struct SessionRecord {
    pub(crate) user_id: Uuid,
    pub(crate) username: String,
    pub(crate) email: Option<String>,
    pub(crate) kind: SessionKind,
}

/// Device snapshot captured at session creation.
#[derive(Clone, Debug, Default)]
pub(crate) struct DeviceSnapshot {
    pub(crate) os: Option<String>,
    pub(crate) browser: Option<String>,
    pub(crate) ip: Option<String>,
}

/// A device row as shown to its owner.
pub(crate) struct DeviceRecord {
    pub(crate) id: Uuid,
    pub(crate) name: Option<String>,
    pub(crate) os: Option<String>,
    pub(crate) browser: Option<String>,
    pub(crate) ip: Option<String>,
    pub(crate) trusted: bool,
    pub(crate) last_seen_at: Option<DateTime<Utc>>,
}

/// A session row as shown to its owner.
pub(crate) struct SessionRow {
    pub(crate) id: Uuid,
    pub(crate) os: Option<String>,
    pub(crate) browser: Option<String>,
    pub(crate) ip: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) expires_at: DateTime<Utc>,
    pub(crate) last_seen_at: Option<DateTime<Utc>>,
    pub(crate) current: bool,
}

/// Look up login data by email or phone (both normalized by the caller).
pub(crate) async fn lookup_login_record(
    pool: &PgPool,
    identifier: &str,
) -> Result<Option<LoginRecord>> {
    let query = r"
        SELECT id, username, password_hash, totp_enabled, locked_until
        FROM users
        WHERE email = $1 OR phone = $1
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(identifier)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup login record")?;

    Ok(row.map(|row| LoginRecord {
        user_id: row.get("id"),
        username: row.get("username"),
        password_hash: row.get("password_hash"),
        totp_enabled: row.get("totp_enabled"),
        locked_until: row.get("locked_until"),
    }))
}

/// Count a failed login attempt, locking the account at the threshold.
///
/// Counting and locking happen in one statement so concurrent failures cannot
/// skip the lock. The counter is not reset by the lock; only a successful
/// login clears it. Returns the lock expiry when the account is now locked.
pub(crate) async fn register_failed_login(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Option<DateTime<Utc>>> {
    let query = r"
        UPDATE users
        SET failed_logins = failed_logins + 1,
            locked_until = CASE
                WHEN failed_logins + 1 >= $2
                THEN NOW() + ($3 * INTERVAL '1 minute')
                ELSE locked_until
            END
        WHERE id = $1
        RETURNING locked_until
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(MAX_FAILED_LOGINS)
        .bind(LOCKOUT_MINUTES)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to register failed login")?;

    Ok(row.get("locked_until"))
}

/// Reset the failure counter and clear any lock after a successful login.
pub(crate) async fn reset_failed_logins(pool: &PgPool, user_id: Uuid) -> Result<()> {
    let query = r"
        UPDATE users
        SET failed_logins = 0,
            locked_until = NULL
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
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to reset failed logins")?;
    Ok(())
}

/// Resolve a user id to its username.
pub(crate) async fn lookup_username(pool: &PgPool, user_id: Uuid) -> Result<Option<String>> {
    let query = "SELECT username FROM users WHERE id = $1";
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
        .context("failed to lookup username")?;
    Ok(row.map(|row| row.get("username")))
}

/// Fetch the stored password hash for re-verification flows (TOTP disable).
pub(crate) async fn lookup_password_hash(pool: &PgPool, user_id: Uuid) -> Result<Option<String>> {
    let query = "SELECT password_hash FROM users WHERE id = $1";
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
        .context("failed to lookup password hash")?;
    Ok(row.and_then(|row| row.get("password_hash")))
}

/// Mint a session of the given kind.
///
/// Generates a random token, stores only its hash plus the device snapshot,
/// and returns the raw value so the caller can set the cookie.
pub(crate) async fn insert_session(
    pool: &PgPool,
    user_id: Uuid,
    kind: SessionKind,
    ttl_seconds: i64,
    device: &DeviceSnapshot,
) -> Result<String> {
    let query = r"
        INSERT INTO user_sessions
            (user_id, session_hash, kind, os, browser, ip, active, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, TRUE, NOW() + ($7 * INTERVAL '1 second'))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );

    for _ in 0..3 {
        let token = generate_token()?;
        let token_hash = hash_token(&token);
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(token_hash)
            .bind(kind.as_str())
            .bind(device.os.as_deref())
            .bind(device.browser.as_deref())
            .bind(device.ip.as_deref())
            .bind(ttl_seconds)
            .execute(pool)
            .instrument(span.clone())
            .await;

        match result {
            Ok(_) => return Ok(token),
            Err(err) if is_unique_violation(&err) => {}
            Err(err) => return Err(err).context("failed to insert session"),
        }
    }

    Err(anyhow!("failed to generate unique session token"))
}

/// Resolve a session token hash to its owner.
///
/// Only active, unexpired sessions resolve. Activity is recorded without
/// extending the TTL.
pub(crate) async fn lookup_session(
    pool: &PgPool,
    token_hash: &[u8],
) -> Result<Option<SessionRecord>> {
    let query = r"
        SELECT users.id, users.username, users.email, user_sessions.kind
        FROM user_sessions
        JOIN users ON users.id = user_sessions.user_id
        WHERE user_sessions.session_hash = $1
          AND user_sessions.active
          AND user_sessions.expires_at > NOW()
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup session")?;

    let Some(row) = row else {
        return Ok(None);
    };

    let query = r"
        UPDATE user_sessions
        SET last_seen_at = NOW()
        WHERE session_hash = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update session last_seen_at")?;

    let kind: String = row.get("kind");
    let kind = SessionKind::from_str(&kind)
        .ok_or_else(|| anyhow!("unknown session kind in store: {kind}"))?;

    Ok(Some(SessionRecord {
        user_id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        kind,
    }))
}

/// Deactivate the session behind a presented token. Idempotent.
///
/// Rows are kept for audit; `active = FALSE` is what invalidates them.
pub(crate) async fn revoke_session_by_hash(pool: &PgPool, token_hash: &[u8]) -> Result<()> {
    let query = "UPDATE user_sessions SET active = FALSE WHERE session_hash = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to revoke session")?;
    Ok(())
}

/// Deactivate one session by id, scoped to its owner.
pub(crate) async fn revoke_session_by_id(
    pool: &PgPool,
    user_id: Uuid,
    session_id: Uuid,
) -> Result<bool> {
    let query = r"
        UPDATE user_sessions
        SET active = FALSE
        WHERE id = $1 AND user_id = $2 AND active
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(session_id)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to revoke session by id")?;
    Ok(result.rows_affected() > 0)
}

/// Deactivate every active session of the user except the presented one.
pub(crate) async fn revoke_other_sessions(
    pool: &PgPool,
    user_id: Uuid,
    current_hash: &[u8],
) -> Result<u64> {
    let query = r"
        UPDATE user_sessions
        SET active = FALSE
        WHERE user_id = $1 AND session_hash <> $2 AND active
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(user_id)
        .bind(current_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to revoke other sessions")?;
    Ok(result.rows_affected())
}

/// Deactivate outstanding MFA challenge sessions after the factor succeeds.
pub(crate) async fn revoke_mfa_challenge_sessions(pool: &PgPool, user_id: Uuid) -> Result<()> {
    let query = r"
        UPDATE user_sessions
        SET active = FALSE
        WHERE user_id = $1 AND kind = 'mfa_challenge' AND active
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to revoke MFA challenge sessions")?;
    Ok(())
}

/// List the caller's active sessions, marking the presented one.
pub(crate) async fn list_sessions(
    pool: &PgPool,
    user_id: Uuid,
    current_hash: &[u8],
) -> Result<Vec<SessionRow>> {
    let query = r"
        SELECT id, os, browser, ip, created_at, expires_at, last_seen_at,
               session_hash = $2 AS current
        FROM user_sessions
        WHERE user_id = $1
          AND kind = 'full'
          AND active
          AND expires_at > NOW()
        ORDER BY created_at DESC
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(user_id)
        .bind(current_hash)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list sessions")?;

    Ok(rows
        .into_iter()
        .map(|row| SessionRow {
            id: row.get("id"),
            os: row.get("os"),
            browser: row.get("browser"),
            ip: row.get("ip"),
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
            last_seen_at: row.get("last_seen_at"),
            current: row.get("current"),
        })
        .collect())
}

/// Upsert a device by (user, fingerprint), refreshing last-seen and network
/// fields. New devices are untrusted; trust is only granted by the explicit
/// trust endpoint.
pub(crate) async fn upsert_device(
    pool: &PgPool,
    user_id: Uuid,
    fingerprint: &[u8],
    name: Option<&str>,
    os: Option<&str>,
    browser: Option<&str>,
    ip: Option<&str>,
) -> Result<DeviceRecord> {
    let query = r"
        INSERT INTO devices (user_id, fingerprint, name, os, browser, ip, trusted, last_seen_at)
        VALUES ($1, $2, $3, $4, $5, $6, FALSE, NOW())
        ON CONFLICT (user_id, fingerprint) DO UPDATE
        SET ip = EXCLUDED.ip,
            last_seen_at = NOW()
        RETURNING id, name, os, browser, ip, trusted, last_seen_at
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(fingerprint)
        .bind(name)
        .bind(os)
        .bind(browser)
        .bind(ip)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to upsert device")?;

    Ok(DeviceRecord {
        id: row.get("id"),
        name: row.get("name"),
        os: row.get("os"),
        browser: row.get("browser"),
        ip: row.get("ip"),
        trusted: row.get("trusted"),
        last_seen_at: row.get("last_seen_at"),
    })
}

/// List the caller's devices.
pub(crate) async fn list_devices(pool: &PgPool, user_id: Uuid) -> Result<Vec<DeviceRecord>> {
    let query = r"
        SELECT id, name, os, browser, ip, trusted, last_seen_at
        FROM devices
        WHERE user_id = $1
        ORDER BY last_seen_at DESC NULLS LAST
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
        .context("failed to list devices")?;

    Ok(rows
        .into_iter()
        .map(|row| DeviceRecord {
            id: row.get("id"),
            name: row.get("name"),
            os: row.get("os"),
            browser: row.get("browser"),
            ip: row.get("ip"),
            trusted: row.get("trusted"),
            last_seen_at: row.get("last_seen_at"),
        })
        .collect())
}

/// Mark a device trusted, scoped to its owner.
pub(crate) async fn set_device_trusted(
    pool: &PgPool,
    user_id: Uuid,
    device_id: Uuid,
) -> Result<bool> {
    let query = r"
        UPDATE devices
        SET trusted = TRUE
        WHERE id = $1 AND user_id = $2
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(device_id)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to trust device")?;
    Ok(result.rows_affected() > 0)
}

/// Delete a device, scoped to its owner.
pub(crate) async fn delete_device(pool: &PgPool, user_id: Uuid, device_id: Uuid) -> Result<bool> {
    let query = "DELETE FROM devices WHERE id = $1 AND user_id = $2";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(device_id)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete device")?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::{DeviceSnapshot, LOCKOUT_MINUTES, LoginRecord, MAX_FAILED_LOGINS, SessionRecord};
    use crate::api::handlers::auth::session_kind::SessionKind;
    use uuid::Uuid;

    #[test]
    fn lockout_constants() {
        assert_eq!(MAX_FAILED_LOGINS, 5);
        assert_eq!(LOCKOUT_MINUTES, 30);
    }

    #[test]
    fn login_record_holds_values() {
        let record = LoginRecord {
            user_id: Uuid::nil(),
            username: "alice".to_string(),
            password_hash: None,
            totp_enabled: false,
            locked_until: None,
        };
        assert_eq!(record.user_id, Uuid::nil());
        assert!(record.password_hash.is_none());
        assert!(!record.totp_enabled);
    }

    #[test]
    fn session_record_holds_kind() {
        let record = SessionRecord {
            user_id: Uuid::nil(),
            username: "alice".to_string(),
            email: Some("alice@example.com".to_string()),
            kind: SessionKind::MfaChallenge,
        };
        assert_eq!(record.kind, SessionKind::MfaChallenge);
    }

    #[test]
    fn device_snapshot_default_is_empty() {
        let snapshot = DeviceSnapshot::default();
        assert!(snapshot.os.is_none());
        assert!(snapshot.browser.is_none());
        assert!(snapshot.ip.is_none());
    }
}
