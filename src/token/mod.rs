//! RS256 token signing for the authorization server.

pub mod jwt;

pub use jwt::{TokenSigner, UserProfile};
