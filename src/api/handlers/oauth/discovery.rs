//! OIDC discovery and key publication.

use std::sync::Arc;

use axum::Extension;
use axum::response::{IntoResponse, Response};

use crate::token::TokenSigner;

/// Published signing keys.
#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    tag = "oauth",
    responses(
        (status = 200, description = "JSON Web Key Set"),
    )
)]
pub async fn jwks(Extension(signer): Extension<Arc<TokenSigner>>) -> Response {
    axum::Json(signer.jwks()).into_response()
}

/// OpenID Provider metadata.
#[utoipa::path(
    get,
    path = "/.well-known/openid-configuration",
    tag = "oauth",
    responses(
        (status = 200, description = "Provider metadata"),
    )
)]
pub async fn openid_configuration(Extension(signer): Extension<Arc<TokenSigner>>) -> Response {
    let issuer = signer.issuer().trim_end_matches('/');
    axum::Json(serde_json::json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/oauth/authorize"),
        "token_endpoint": format!("{issuer}/oauth/token"),
        "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code"],
        "code_challenge_methods_supported": ["S256"],
        "id_token_signing_alg_values_supported": ["RS256"],
        "subject_types_supported": ["public"],
        "scopes_supported": ["openid", "profile", "email", "phone"],
        "token_endpoint_auth_methods_supported": ["client_secret_post", "none"],
    }))
    .into_response()
}
