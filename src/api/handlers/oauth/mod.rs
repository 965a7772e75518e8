//! OAuth2 authorization server with OIDC discovery.
//!
//! Authorization-code grant only, S256 PKCE, exact redirect URI matching.
//! Codes are hashed at rest and single-use; tokens are RS256-signed and
//! verifiable against the published JWKS.

pub mod authorize;
pub mod discovery;
pub mod error;
pub mod pkce;
pub(crate) mod storage;
pub mod token;
pub mod types;
