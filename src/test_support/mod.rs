//! Container-backed helpers for database integration tests.
//!
//! Tests that need a real Postgres go through [`postgres::PostgresContainer`]
//! and skip themselves when no container runtime is reachable.

pub(crate) mod postgres;
pub(crate) mod runtime;
