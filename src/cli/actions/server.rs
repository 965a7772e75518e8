use crate::{api, api::handlers::auth::AuthConfig, token::TokenSigner};
use anyhow::{Context, Result};
use std::fs;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub frontend_base_url: String,
    pub issuer: String,
    pub signing_key_path: Option<String>,
    pub session_ttl_seconds: Option<i64>,
}

/// Execute the server action.
///
/// # Errors
/// Returns an error if the signing key cannot be loaded or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    // The issuer travels with the signer; AuthConfig only carries the
    // frontend-facing settings.
    let mut auth_config = AuthConfig::new(args.frontend_base_url);
    if let Some(ttl) = args.session_ttl_seconds {
        auth_config = auth_config.with_session_ttl_seconds(ttl);
    }

    // Without a configured key, tokens are only verifiable for the lifetime
    // of this process; fine for development, not for production.
    let signer = if let Some(path) = &args.signing_key_path {
        let pem = fs::read_to_string(path)
            .with_context(|| format!("Failed to read signing key: {path}"))?;
        TokenSigner::from_pem(&args.issuer, &pem)?
    } else {
        TokenSigner::generate(&args.issuer)?
    };

    api::new(args.port, args.dsn, auth_config, signer).await
}
