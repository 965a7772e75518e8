//! Passkey (WebAuthn) ceremonies, credentials, and counter enforcement.

pub mod models;
pub mod repo;
pub mod service;

pub use service::PasskeyService;
