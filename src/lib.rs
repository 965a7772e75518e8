//! # Atesti (Identity & Authorization Engine)
//!
//! `atesti` is an identity provider: it authenticates end users and issues
//! credentials that downstream applications trust.
//!
//! ## Authentication
//!
//! - **Password** login with Argon2id verification and a brute-force lockout
//!   state machine (5 consecutive failures lock the account for 30 minutes).
//! - **TOTP** two-factor authentication with a batch of 8 single-use backup
//!   codes generated at enablement.
//! - **Passkeys** (`WebAuthn`): registration ceremonies for authenticated
//!   users and discoverable (usernameless) login ceremonies that mint a
//!   session directly, bypassing password and TOTP.
//!
//! ## Devices & Sessions
//!
//! Every successful login upserts a device fingerprint for the user. Devices
//! are untrusted by default; an explicit, audited trust action is the only
//! path to the TOTP bypass. Sessions are opaque bearer tokens stored as
//! hashes with an `active` flag; revocation deactivates rather than deletes.
//!
//! ## Authorization (`OAuth2`/`OIDC`)
//!
//! Authorization-code flow with PKCE: consent info, consent decision,
//! single-use 10-minute authorization codes, RS256 bearer and ID tokens, and
//! JWKS/discovery publication.
//!
//! Security boundaries:
//! - Raw session tokens, authorization codes, and backup codes never touch
//!   the database; only hashes are stored.
//! - Single-use guarantees (codes, backup codes, challenges) are enforced
//!   with atomic read-and-invalidate statements, never read-then-write.

pub mod api;
pub mod audit;
pub mod cli;
pub mod token;
pub mod totp;
pub mod webauthn;

#[cfg(test)]
pub(crate) mod test_support;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
