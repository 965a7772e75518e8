//! Time-based one-time passwords (RFC 6238) and backup codes.

pub mod repo;
pub mod service;

pub use service::TotpService;
