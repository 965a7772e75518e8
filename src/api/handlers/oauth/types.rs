//! Request/response types for the authorization server.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Query parameters of the authorization request.
#[derive(IntoParams, Deserialize, Debug)]
pub struct AuthorizeQuery {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_type: String,
    pub scope: String,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

/// A scope with the wording shown on the consent screen.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ScopeInfo {
    pub name: String,
    pub description: String,
}

#[must_use]
pub fn describe_scope(scope: &str) -> String {
    match scope {
        "openid" => "Confirm your identity".to_string(),
        "profile" => "See your username".to_string(),
        "email" => "See your email address".to_string(),
        "phone" => "See your phone number".to_string(),
        other => format!("Access to {other}"),
    }
}

/// What the consent screen needs to render.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ConsentInfoResponse {
    pub client_name: String,
    pub client_description: Option<String>,
    pub logo_url: Option<String>,
    pub scopes: Vec<ScopeInfo>,
}

/// The consent decision, echoing the authorization parameters.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ConsentRequest {
    pub approved: bool,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

/// Form body of the token endpoint.
#[derive(ToSchema, Deserialize, Debug)]
pub struct TokenRequest {
    pub grant_type: String,
    pub code: String,
    pub redirect_uri: String,
    pub client_id: String,
    pub code_verifier: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{TokenResponse, describe_scope};

    #[test]
    fn known_scopes_have_wording() {
        assert_eq!(describe_scope("email"), "See your email address");
        assert_eq!(describe_scope("custom:read"), "Access to custom:read");
    }

    #[test]
    fn id_token_omitted_when_absent() {
        let response = TokenResponse {
            access_token: "at".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: 3600,
            scope: "openid".to_string(),
            id_token: None,
        };
        let value = serde_json::to_value(&response).unwrap_or_default();
        assert!(value.get("id_token").is_none());
    }
}
