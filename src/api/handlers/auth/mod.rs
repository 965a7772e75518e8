//! Authentication: passwords, sessions, devices, TOTP, and passkeys.
//!
//! Flow Overview
//!
//! 1. `login` checks the password, enforces the lockout, records the device,
//!    and mints either a full session or a short MFA challenge session.
//! 2. `mfa/verify` upgrades a challenge session once a TOTP or backup code is
//!    presented.
//! 3. `passkeys/*` cover both authenticated registration and anonymous
//!    discoverable login.
//! 4. `session`, `sessions/*`, and `devices/*` let a user inspect and prune
//!    their own footprint.
//!
//! Security boundaries
//!
//! - Session tokens, authorization codes, and backup codes are stored as
//!   hashes only.
//! - Failure responses for login are uniform 401s; only a lockout says more,
//!   and then only how long to wait.
//! - MFA challenge tokens reach exactly one endpoint.

#[cfg(test)]
mod integration_tests;

pub mod backup_codes;
pub mod devices;
pub mod login;
pub mod passkeys;
pub mod password;
pub(crate) mod principal;
pub mod rate_limit;
pub mod session;
pub mod session_kind;
pub mod state;
pub(crate) mod storage;
pub mod totp;
pub mod types;
pub(crate) mod utils;

pub use rate_limit::{NoopRateLimiter, RateLimiter};
pub use state::{AuthConfig, AuthState};
