//! Secrets at rest and engagement signing.
//!
//! Provider API keys, SMTP passwords and the per-workspace secret key are
//! stored as hex-encoded AES-256-GCM ciphertext keyed by the process master
//! passphrase. Unsubscribe and confirmation links are signed with an
//! HMAC-SHA256 of the contact email under the workspace secret key.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{MailtideError, MailtideResult};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;

fn derive_key(passphrase: &str) -> Key<Aes256Gcm> {
    let digest = Sha256::digest(passphrase.as_bytes());
    *Key::<Aes256Gcm>::from_slice(&digest)
}

/// Encrypt a secret under the master passphrase.
///
/// Output is `hex(nonce || ciphertext)`; the nonce is random per call, so
/// encrypting the same plaintext twice yields different ciphertexts.
pub fn encrypt_secret(plaintext: &str, passphrase: &str) -> MailtideResult<String> {
    let cipher = Aes256Gcm::new(&derive_key(passphrase));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| MailtideError::internal("secret encryption failed"))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(hex::encode(out))
}

/// Decrypt a hex-encoded `nonce || ciphertext` secret.
pub fn decrypt_secret(encrypted: &str, passphrase: &str) -> MailtideResult<String> {
    let raw = hex::decode(encrypted)
        .map_err(|_| MailtideError::data_integrity("encrypted secret is not valid hex"))?;

    if raw.len() <= NONCE_LEN {
        return Err(MailtideError::data_integrity(
            "encrypted secret shorter than nonce",
        ));
    }

    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(&derive_key(passphrase));

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| MailtideError::data_integrity("secret decryption failed"))?;

    String::from_utf8(plaintext)
        .map_err(|_| MailtideError::data_integrity("decrypted secret is not valid UTF-8"))
}

/// `HMAC_SHA256(email, workspace_secret_key)` in lowercase hex.
pub fn email_hmac(email: &str, secret_key: &str) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(email.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of an unsubscribe/confirm HMAC parameter.
pub fn verify_email_hmac(email: &str, secret_key: &str, provided_hex: &str) -> bool {
    let Ok(provided) = hex::decode(provided_hex) else {
        return false;
    };

    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(email.as_bytes());
    mac.verify_slice(&provided).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let secret = "sk_live_abc123";
        let encrypted = encrypt_secret(secret, "passphrase").unwrap();
        assert_ne!(encrypted, secret);
        assert_eq!(decrypt_secret(&encrypted, "passphrase").unwrap(), secret);
    }

    #[test]
    fn test_decrypt_wrong_passphrase_fails() {
        let encrypted = encrypt_secret("secret", "right").unwrap();
        assert!(decrypt_secret(&encrypted, "wrong").is_err());
    }

    #[test]
    fn test_nonce_makes_ciphertexts_distinct() {
        let a = encrypt_secret("same", "key").unwrap();
        let b = encrypt_secret("same", "key").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_rejects_garbage() {
        assert!(decrypt_secret("not-hex", "key").is_err());
        assert!(decrypt_secret("aabb", "key").is_err());
    }

    #[test]
    fn test_email_hmac_is_lowercase_hex() {
        let mac = email_hmac("a@b.test", "secret");
        assert_eq!(mac.len(), 64);
        assert!(mac.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_verify_email_hmac() {
        let mac = email_hmac("x@y.test", "ws-secret");
        assert!(verify_email_hmac("x@y.test", "ws-secret", &mac));
        assert!(!verify_email_hmac("x@y.test", "ws-secret", "deadbeef"));
        assert!(!verify_email_hmac("x@y.test", "other-secret", &mac));
        assert!(!verify_email_hmac("x@y.test", "ws-secret", "zz-not-hex"));
    }
}
