//! Fire-and-forget audit sink.
//!
//! Every authentication, 2FA, device-trust, passkey, and consent decision is
//! recorded in `audit_log`. Recording failures are logged and swallowed; they
//! never change the outcome of the operation being audited.

use sqlx::PgPool;
use tracing::{Instrument, warn};
use uuid::Uuid;

/// Outcome of an audited operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// A single security-relevant event.
#[derive(Debug)]
pub struct AuditEvent<'a> {
    /// User the event concerns, when known.
    pub actor: Option<Uuid>,
    /// Short verb, e.g. `login`, `totp_verify`, `consent`.
    pub action: &'a str,
    /// Resource acted on, e.g. an email, client id, or credential id.
    pub resource: &'a str,
    pub outcome: AuditOutcome,
    pub ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// Record an event, swallowing failures.
pub async fn record(pool: &PgPool, event: AuditEvent<'_>) {
    let query = r"
        INSERT INTO audit_log (actor, action, resource, outcome, ip_address, user_agent)
        VALUES ($1, $2, $3, $4, $5, $6)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(event.actor)
        .bind(event.action)
        .bind(event.resource)
        .bind(event.outcome.as_str())
        .bind(event.ip)
        .bind(event.user_agent)
        .execute(pool)
        .instrument(span)
        .await;

    if let Err(err) = result {
        warn!(action = event.action, "Failed to write audit log: {err}");
    }
}
