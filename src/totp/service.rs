//! TOTP code generation and verification.

use anyhow::{Context, Result};
use totp_rs::{Algorithm, Secret, TOTP};

const TOTP_DIGITS: usize = 6;
const TOTP_STEP_SECONDS: u64 = 30;
// One step of clock skew tolerated on either side.
const TOTP_SKEW: u8 = 1;

/// Authenticator-app compatible TOTP: SHA-1, 6 digits, 30-second step.
#[derive(Clone, Debug)]
pub struct TotpService {
    issuer: String,
}

impl TotpService {
    #[must_use]
    pub fn new(issuer: &str) -> Self {
        Self {
            issuer: issuer.to_string(),
        }
    }

    /// Generate a fresh base32-encoded shared secret.
    #[must_use]
    pub fn generate_secret(&self) -> String {
        Secret::generate_secret().to_encoded().to_string()
    }

    fn build(&self, secret_base32: &str, account: &str) -> Result<TOTP> {
        let secret = Secret::Encoded(secret_base32.to_string())
            .to_bytes()
            .map_err(|err| anyhow::anyhow!("invalid TOTP secret: {err:?}"))?;
        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP_SECONDS,
            secret,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .context("failed to build TOTP")
    }

    /// The `otpauth://` provisioning URI for enrollment QR codes.
    ///
    /// # Errors
    /// Returns an error if the stored secret is not valid base32.
    pub fn otpauth_url(&self, secret_base32: &str, account: &str) -> Result<String> {
        Ok(self.build(secret_base32, account)?.get_url())
    }

    /// Check a submitted code against the secret, within the skew window.
    ///
    /// Any failure (bad secret, clock error) verifies as `false`.
    #[must_use]
    pub fn verify(&self, secret_base32: &str, account: &str, code: &str) -> bool {
        let Ok(totp) = self.build(secret_base32, account) else {
            return false;
        };
        matches!(totp.check_current(code.trim()), Ok(true))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::TotpService;

    #[test]
    fn generated_secret_round_trips() {
        let service = TotpService::new("atesti");
        let secret = service.generate_secret();
        let url = service.otpauth_url(&secret, "alice@example.com").unwrap();
        assert!(url.starts_with("otpauth://totp/"));
        assert!(url.contains("issuer=atesti"));
    }

    #[test]
    fn current_code_verifies_and_garbage_does_not() {
        let service = TotpService::new("atesti");
        let secret = service.generate_secret();

        let totp = service.build(&secret, "alice@example.com").unwrap();
        let code = totp.generate_current().unwrap();

        assert!(service.verify(&secret, "alice@example.com", &code));
        assert!(!service.verify(&secret, "alice@example.com", "000000"));
    }

    #[test]
    fn invalid_secret_fails_closed() {
        let service = TotpService::new("atesti");
        assert!(!service.verify("not base32!!", "alice@example.com", "123456"));
    }
}
