//! Credential Vault
//! Mission: Authenticated encryption of venue secrets under the master key

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

use crate::error::{GatewayError, Result};

/// Ciphertext layout version. Bump when the layout changes so old rows can
/// be re-encrypted during a key rotation.
const FORMAT_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM vault. Immutable after construction; the master key never
/// leaves this struct and plaintext is never logged.
///
/// Ciphertext layout: `base64(version || nonce[12] || ciphertext+tag)`.
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    pub fn new(master_key: &[u8; 32]) -> Self {
        let key = GenericArray::from_slice(master_key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| GatewayError::Internal("credential encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let data = BASE64
            .decode(encoded)
            .map_err(|_| GatewayError::ValidationFailed("ciphertext is not valid base64".to_string()))?;

        if data.len() < 1 + NONCE_LEN + TAG_LEN {
            return Err(GatewayError::ValidationFailed(
                "ciphertext too short".to_string(),
            ));
        }
        if data[0] != FORMAT_VERSION {
            return Err(GatewayError::ValidationFailed(format!(
                "unknown ciphertext version {}",
                data[0]
            )));
        }

        let nonce = Nonce::from_slice(&data[1..1 + NONCE_LEN]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &data[1 + NONCE_LEN..])
            .map_err(|_| {
                GatewayError::AuthenticationFailed(
                    "ciphertext failed authentication (tampered or wrong key)".to_string(),
                )
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| GatewayError::Internal("decrypted secret is not utf-8".to_string()))
    }

    /// Encrypt an optional secret, passing `None` and empty strings through.
    pub fn encrypt_opt(&self, plaintext: Option<&str>) -> Result<Option<String>> {
        match plaintext {
            Some(p) if !p.is_empty() => Ok(Some(self.encrypt(p)?)),
            _ => Ok(None),
        }
    }

    pub fn decrypt_opt(&self, encoded: Option<&str>) -> Result<Option<String>> {
        match encoded {
            Some(c) if !c.is_empty() => Ok(Some(self.decrypt(c)?)),
            _ => Ok(None),
        }
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> CredentialVault {
        CredentialVault::new(b"0123456789abcdef0123456789abcdef")
    }

    #[test]
    fn test_round_trip() {
        let vault = test_vault();
        let secret = "0xdeadbeefcafebabe-private-key";
        let ct = vault.encrypt(secret).unwrap();
        assert_ne!(ct, secret);
        assert_eq!(vault.decrypt(&ct).unwrap(), secret);
    }

    #[test]
    fn test_nonce_freshness() {
        let vault = test_vault();
        let a = vault.encrypt("same-secret").unwrap();
        let b = vault.encrypt("same-secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_fails_with_auth_error() {
        let vault = test_vault();
        let ct = vault.encrypt("secret").unwrap();
        let mut raw = BASE64.decode(&ct).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);

        match vault.decrypt(&tampered) {
            Err(GatewayError::AuthenticationFailed(_)) => {}
            other => panic!("expected AuthenticationFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_version_rejected() {
        let vault = test_vault();
        let ct = vault.encrypt("secret").unwrap();
        let mut raw = BASE64.decode(&ct).unwrap();
        raw[0] = 9;
        match vault.decrypt(&BASE64.encode(raw)) {
            Err(GatewayError::ValidationFailed(msg)) => assert!(msg.contains("version")),
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let vault = test_vault();
        let other = CredentialVault::new(b"ffffffffffffffffffffffffffffffff");
        let ct = vault.encrypt("secret").unwrap();
        assert!(other.decrypt(&ct).is_err());
    }

    #[test]
    fn test_empty_optional_secrets_pass_through() {
        let vault = test_vault();
        assert_eq!(vault.encrypt_opt(None).unwrap(), None);
        assert_eq!(vault.encrypt_opt(Some("")).unwrap(), None);
        let ct = vault.encrypt_opt(Some("k")).unwrap().unwrap();
        assert_eq!(vault.decrypt_opt(Some(&ct)).unwrap().unwrap(), "k");
    }
}
