//! Backup code generation and verification helpers.
//!
//! Backup codes are the one-time fallback for the TOTP factor. A batch of 8
//! codes is generated when 2FA is enabled; each code is Argon2id-hashed and
//! consumed permanently on first successful use. Re-enabling 2FA replaces the
//! batch.

use anyhow::{Context, Result};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use rand::{RngCore, rngs::OsRng};
use uuid::Uuid;

const BACKUP_CODE_COUNT: usize = 8;
const BACKUP_CODE_LEN: usize = 12;
const BACKUP_CODE_GROUP_SIZE: usize = 4;
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// A freshly generated backup-code batch (plaintext + hashes).
#[derive(Debug)]
pub struct BackupCodeBatch {
    pub batch_id: Uuid,
    pub codes: Vec<String>,
    pub code_hashes: Vec<String>,
}

impl BackupCodeBatch {
    /// Generate a new batch of 8 backup codes.
    ///
    /// # Errors
    /// Returns an error if random generation or hashing fails.
    pub fn generate() -> Result<Self> {
        let mut rng = OsRng;
        Self::generate_with_rng(&mut rng)
    }

    fn generate_with_rng<R: RngCore + ?Sized>(rng: &mut R) -> Result<Self> {
        let mut codes = Vec::with_capacity(BACKUP_CODE_COUNT);
        let mut code_hashes = Vec::with_capacity(BACKUP_CODE_COUNT);
        for _ in 0..BACKUP_CODE_COUNT {
            let code = generate_code(rng)?;
            let hash = hash_backup_code(&code)?;
            codes.push(code);
            code_hashes.push(hash);
        }
        Ok(Self {
            batch_id: Uuid::new_v4(),
            codes,
            code_hashes,
        })
    }
}

/// Normalize a backup code for verification (case-insensitive, separators dropped).
///
/// # Errors
/// Returns an error if the input cannot be a backup code.
pub fn normalize_backup_code(input: &str) -> Result<String> {
    let normalized: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect();

    if normalized.len() != BACKUP_CODE_LEN {
        return Err(anyhow::anyhow!("invalid backup code length"));
    }

    if !normalized
        .as_bytes()
        .iter()
        .all(|ch| BACKUP_CODE_ALPHABET.contains(ch))
    {
        return Err(anyhow::anyhow!("invalid backup code characters"));
    }

    Ok(normalized)
}

/// Format a normalized backup code for display.
///
/// # Errors
/// Returns an error if the input has the wrong length.
pub fn format_backup_code(normalized: &str) -> Result<String> {
    if normalized.len() != BACKUP_CODE_LEN {
        return Err(anyhow::anyhow!("invalid backup code length"));
    }
    let mut out = String::with_capacity(BACKUP_CODE_LEN + 2);
    for (idx, chunk) in normalized
        .as_bytes()
        .chunks(BACKUP_CODE_GROUP_SIZE)
        .enumerate()
    {
        if idx > 0 {
            out.push('-');
        }
        out.push_str(std::str::from_utf8(chunk).context("invalid backup code chunk")?);
    }
    Ok(out)
}

/// Verify a backup code against a stored hash.
///
/// # Errors
/// Returns an error if the input cannot be a backup code.
pub fn verify_backup_code(code: &str, stored_hash: &str) -> Result<bool> {
    let normalized = normalize_backup_code(code)?;
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return Ok(false);
    };
    Ok(Argon2::default()
        .verify_password(normalized.as_bytes(), &parsed)
        .is_ok())
}

/// Generate a single backup code in grouped form.
fn generate_code<R: RngCore + ?Sized>(rng: &mut R) -> Result<String> {
    let mut raw = [0u8; BACKUP_CODE_LEN];
    rng.fill_bytes(&mut raw);
    let mut normalized = String::with_capacity(BACKUP_CODE_LEN);
    for byte in raw {
        let idx = usize::from(byte) % BACKUP_CODE_ALPHABET.len();
        if let Some(&char_byte) = BACKUP_CODE_ALPHABET.get(idx) {
            normalized.push(char_byte as char);
        }
    }
    format_backup_code(&normalized)
}

/// Hash a backup code using Argon2id.
fn hash_backup_code(code: &str) -> Result<String> {
    let normalized = normalize_backup_code(code)?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(normalized.as_bytes(), &salt)
        .map_err(|_| anyhow::anyhow!("failed to hash backup code"))?
        .to_string();
    Ok(hash)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{
        BACKUP_CODE_COUNT, BackupCodeBatch, format_backup_code, normalize_backup_code,
        verify_backup_code,
    };

    #[test]
    fn batch_has_eight_codes() {
        let batch = BackupCodeBatch::generate().unwrap();
        assert_eq!(batch.codes.len(), BACKUP_CODE_COUNT);
        assert_eq!(batch.code_hashes.len(), BACKUP_CODE_COUNT);
    }

    #[test]
    fn normalize_backup_code_trims_and_uppercases() {
        let normalized = normalize_backup_code("abcd-efgh-jklm").unwrap();
        assert_eq!(normalized, "ABCDEFGHJKLM");
    }

    #[test]
    fn format_backup_code_groups() {
        let formatted = format_backup_code("ABCDEFGHJKLM").unwrap();
        assert_eq!(formatted, "ABCD-EFGH-JKLM");
    }

    #[test]
    fn hash_and_verify_round_trip() {
        let batch = BackupCodeBatch::generate().unwrap();
        let code = batch.codes.first().unwrap();
        let hash = batch.code_hashes.first().unwrap();
        assert!(verify_backup_code(code, hash).unwrap());
        assert!(!verify_backup_code("ABCD-EFGH-9999", hash).unwrap());
    }

    #[test]
    fn verification_is_case_insensitive() {
        let batch = BackupCodeBatch::generate().unwrap();
        let code = batch.codes.first().unwrap().to_lowercase();
        let hash = batch.code_hashes.first().unwrap();
        assert!(verify_backup_code(&code, hash).unwrap());
    }

    #[test]
    fn backup_code_single_use_enforced() {
        let batch = BackupCodeBatch::generate().unwrap();
        let code = batch.codes.first().unwrap();
        let hash = batch.code_hashes.first().unwrap();
        let mut used = false;

        let mut consume = |input: &str| {
            if used {
                return false;
            }
            if verify_backup_code(input, hash).unwrap_or(false) {
                used = true;
                true
            } else {
                false
            }
        };

        assert!(consume(code));
        assert!(!consume(code));
    }
}
