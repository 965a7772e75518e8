//! WebAuthn ceremony state and verification.
//!
//! Ceremony state lives in memory with a short TTL. Registration state is
//! keyed by user id, so starting a new registration replaces any pending one.
//! Authentication is discoverable (the request names no user), so its state
//! is keyed by a random nonce the browser carries in a short-lived cookie;
//! taking the state consumes it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use rand::{RngCore, rngs::OsRng};
use url::Url;
use uuid::Uuid;
use webauthn_rs::prelude::{
    AuthenticationResult, CreationChallengeResponse, CredentialID, DiscoverableAuthentication,
    DiscoverableKey, Passkey, PasskeyRegistration, PublicKeyCredential,
    RegisterPublicKeyCredential, RequestChallengeResponse,
};
use webauthn_rs::{Webauthn, WebauthnBuilder};

const CHALLENGE_TTL: Duration = Duration::from_secs(5 * 60);

struct RegistrationEntry {
    state: PasskeyRegistration,
    label: Option<String>,
    created_at: Instant,
}

struct AuthenticationEntry {
    state: DiscoverableAuthentication,
    created_at: Instant,
}

pub struct PasskeyService {
    webauthn: Webauthn,
    registrations: Mutex<HashMap<Uuid, RegistrationEntry>>,
    authentications: Mutex<HashMap<String, AuthenticationEntry>>,
}

impl PasskeyService {
    /// Build the service for one relying party.
    ///
    /// # Errors
    /// Returns an error if the origin does not parse or the RP id is invalid.
    pub fn new(rp_id: &str, rp_origin: &str, rp_name: &str) -> Result<Self> {
        let origin = Url::parse(rp_origin).context("invalid relying party origin")?;
        let webauthn = WebauthnBuilder::new(rp_id, &origin)
            .context("invalid relying party id")?
            .rp_name(rp_name)
            .build()
            .context("failed to build WebAuthn context")?;

        Ok(Self {
            webauthn,
            registrations: Mutex::new(HashMap::new()),
            authentications: Mutex::new(HashMap::new()),
        })
    }

    /// Start a registration ceremony, replacing any pending one for the user.
    ///
    /// # Errors
    /// Returns an error if the ceremony cannot be created.
    pub fn register_begin(
        &self,
        user_id: Uuid,
        username: &str,
        display_name: &str,
        exclude: Option<Vec<CredentialID>>,
        label: Option<String>,
    ) -> Result<CreationChallengeResponse> {
        let (challenge, state) = self
            .webauthn
            .start_passkey_registration(user_id, username, display_name, exclude)
            .map_err(|err| anyhow!("failed to start passkey registration: {err}"))?;

        let mut registrations = self
            .registrations
            .lock()
            .map_err(|_| anyhow!("registration state lock poisoned"))?;
        registrations.retain(|_, entry| entry.created_at.elapsed() < CHALLENGE_TTL);
        registrations.insert(
            user_id,
            RegistrationEntry {
                state,
                label,
                created_at: Instant::now(),
            },
        );

        Ok(challenge)
    }

    /// Take the pending registration state for a user, consuming it.
    pub fn take_registration(&self, user_id: Uuid) -> Option<(PasskeyRegistration, Option<String>)> {
        let mut registrations = self.registrations.lock().ok()?;
        let entry = registrations.remove(&user_id)?;
        if entry.created_at.elapsed() >= CHALLENGE_TTL {
            return None;
        }
        Some((entry.state, entry.label))
    }

    /// Verify the browser's attestation against the pending state.
    ///
    /// # Errors
    /// Returns an error if the attestation does not verify.
    pub fn register_finish(
        &self,
        response: &RegisterPublicKeyCredential,
        state: &PasskeyRegistration,
    ) -> Result<Passkey> {
        self.webauthn
            .finish_passkey_registration(response, state)
            .map_err(|err| anyhow!("failed to finish passkey registration: {err}"))
    }

    /// Start a discoverable authentication ceremony.
    ///
    /// Returns the challenge and the nonce the state is filed under.
    ///
    /// # Errors
    /// Returns an error if the ceremony cannot be created.
    pub fn auth_begin(&self) -> Result<(RequestChallengeResponse, String)> {
        let (challenge, state) = self
            .webauthn
            .start_discoverable_authentication()
            .map_err(|err| anyhow!("failed to start passkey authentication: {err}"))?;

        let mut nonce_bytes = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .context("failed to generate challenge nonce")?;
        let nonce = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(nonce_bytes);

        let mut authentications = self
            .authentications
            .lock()
            .map_err(|_| anyhow!("authentication state lock poisoned"))?;
        authentications.retain(|_, entry| entry.created_at.elapsed() < CHALLENGE_TTL);
        authentications.insert(
            nonce.clone(),
            AuthenticationEntry {
                state,
                created_at: Instant::now(),
            },
        );

        Ok((challenge, nonce))
    }

    /// Take the authentication state behind a nonce, consuming it. A second
    /// call with the same nonce gets nothing.
    pub fn take_authentication(&self, nonce: &str) -> Option<DiscoverableAuthentication> {
        let mut authentications = self.authentications.lock().ok()?;
        let entry = authentications.remove(nonce)?;
        if entry.created_at.elapsed() >= CHALLENGE_TTL {
            return None;
        }
        Some(entry.state)
    }

    /// Identify which user and credential the assertion claims to be from.
    ///
    /// # Errors
    /// Returns an error if the assertion carries no usable user handle.
    pub fn identify(&self, response: &PublicKeyCredential) -> Result<(Uuid, Vec<u8>)> {
        let (user_id, credential_id) = self
            .webauthn
            .identify_discoverable_authentication(response)
            .map_err(|err| anyhow!("failed to identify passkey assertion: {err}"))?;
        Ok((user_id, credential_id.to_vec()))
    }

    /// Verify the assertion against the ceremony state and known credentials.
    ///
    /// # Errors
    /// Returns an error if the assertion does not verify.
    pub fn auth_finish(
        &self,
        response: &PublicKeyCredential,
        state: DiscoverableAuthentication,
        credentials: &[DiscoverableKey],
    ) -> Result<AuthenticationResult> {
        self.webauthn
            .finish_discoverable_authentication(response, state, credentials)
            .map_err(|err| anyhow!("failed to finish passkey authentication: {err}"))
    }
}

/// Serialize a passkey for storage.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn serialize_passkey(passkey: &Passkey) -> Result<serde_json::Value> {
    serde_json::to_value(passkey).context("failed to serialize passkey")
}

/// Deserialize a stored passkey.
///
/// # Errors
/// Returns an error if the stored data is not a valid passkey.
pub fn deserialize_passkey(value: &serde_json::Value) -> Result<Passkey> {
    serde_json::from_value(value.clone()).context("failed to deserialize stored passkey")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::PasskeyService;
    use uuid::Uuid;

    fn service() -> PasskeyService {
        PasskeyService::new("localhost", "http://localhost:5173", "atesti").unwrap()
    }

    #[test]
    fn rejects_bad_origin() {
        assert!(PasskeyService::new("localhost", "not a url", "atesti").is_err());
    }

    #[test]
    fn registration_state_is_single_use() {
        let service = service();
        let user_id = Uuid::new_v4();
        service
            .register_begin(user_id, "alice", "Alice", None, Some("laptop".to_string()))
            .unwrap();

        let taken = service.take_registration(user_id);
        assert!(taken.is_some());
        assert_eq!(taken.unwrap().1.as_deref(), Some("laptop"));
        assert!(service.take_registration(user_id).is_none());
    }

    #[test]
    fn new_registration_replaces_pending_one() {
        let service = service();
        let user_id = Uuid::new_v4();
        service
            .register_begin(user_id, "alice", "Alice", None, Some("first".to_string()))
            .unwrap();
        service
            .register_begin(user_id, "alice", "Alice", None, Some("second".to_string()))
            .unwrap();

        let (_, label) = service.take_registration(user_id).unwrap();
        assert_eq!(label.as_deref(), Some("second"));
    }

    #[test]
    fn authentication_state_is_single_use() {
        let service = service();
        let (_, nonce) = service.auth_begin().unwrap();
        assert!(service.take_authentication(&nonce).is_some());
        assert!(service.take_authentication(&nonce).is_none());
    }

    #[test]
    fn unknown_nonce_yields_nothing() {
        let service = service();
        assert!(service.take_authentication("no-such-nonce").is_none());
    }
}
