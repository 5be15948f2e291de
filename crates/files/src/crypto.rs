//! Two-layer AES-256-CBC for file metadata at rest.
//!
//! Each layer is stored as `iv:ciphertext`, hex IV and base64 body. Records
//! under a user-keyed context are wrapped twice, user key first, then the
//! system key; unkeyed contexts use the system layer only. Decryption
//! inverts the order and falls back gracefully: a payload whose inner layer
//! fails the format check is legacy single-layer data, and a payload whose
//! colon-separated head is not a valid IV is plaintext and returned as-is.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::RngCore;
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

/// Stretch an arbitrary passphrase into an AES-256 key.
fn derive_key(passphrase: &str) -> [u8; 32] {
    Sha256::digest(passphrase.as_bytes()).into()
}

/// Encrypt one layer, producing `iv_hex:ciphertext_base64`.
pub(crate) fn encrypt_layer(plaintext: &str, passphrase: &str) -> String {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    let key = derive_key(passphrase);
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    format!("{}:{}", hex::encode(iv), STANDARD.encode(ciphertext))
}

/// Decrypt one layer. Returns `None` when the payload does not carry a
/// valid `iv:ciphertext` envelope or fails decryption, which callers treat
/// as "not encrypted at this layer".
pub(crate) fn decrypt_layer(payload: &str, passphrase: &str) -> Option<String> {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    let (iv_hex, body) = payload.split_once(':')?;

    let iv = hex::decode(iv_hex).ok()?;
    if iv.len() != IV_LEN {
        return None;
    }

    let ciphertext = STANDARD.decode(body).ok()?;
    let key = derive_key(passphrase);

    let iv: [u8; IV_LEN] = iv.try_into().ok()?;
    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .ok()?;

    String::from_utf8(plaintext).ok()
}

/// Encrypt a record payload for storage under the given context.
pub(crate) fn encrypt(payload: &str, user_key: Option<&str>, system_key: Option<&str>) -> String {
    let inner = match user_key {
        Some(key) => encrypt_layer(payload, key),
        None => payload.to_string(),
    };

    match system_key {
        Some(key) => encrypt_layer(&inner, key),
        None => inner,
    }
}

/// Decrypt a stored payload, tolerating legacy single-layer records and
/// plaintext.
pub(crate) fn decrypt(payload: &str, user_key: Option<&str>, system_key: Option<&str>) -> String {
    let outer = match system_key.and_then(|key| decrypt_layer(payload, key)) {
        Some(decrypted) => decrypted,
        None => payload.to_string(),
    };

    match user_key.and_then(|key| decrypt_layer(&outer, key)) {
        Some(inner) => inner,
        None => outer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_round_trips() {
        let encrypted = encrypt_layer("secret payload", "passphrase");
        assert_ne!(encrypted, "secret payload");
        assert_eq!(decrypt_layer(&encrypted, "passphrase").unwrap(), "secret payload");
    }

    #[test]
    fn wrong_key_fails_the_layer() {
        let encrypted = encrypt_layer("secret payload", "passphrase");
        assert!(decrypt_layer(&encrypted, "other").is_none());
    }

    #[test]
    fn two_layer_round_trip() {
        let stored = encrypt(r#"{"id":"f1"}"#, Some("user-key"), Some("system-key"));
        let recovered = decrypt(&stored, Some("user-key"), Some("system-key"));
        assert_eq!(recovered, r#"{"id":"f1"}"#);
    }

    #[test]
    fn legacy_single_layer_is_readable_with_both_keys() {
        let stored = encrypt(r#"{"id":"f1"}"#, None, Some("system-key"));
        let recovered = decrypt(&stored, Some("user-key"), Some("system-key"));
        assert_eq!(recovered, r#"{"id":"f1"}"#);
    }

    #[test]
    fn plaintext_with_colons_passes_through() {
        let payload = "not:encrypted:at all";
        assert_eq!(decrypt(payload, Some("user"), Some("system")), payload);
    }

    #[test]
    fn plaintext_without_colons_passes_through() {
        let payload = r#"{"id":"f1"}"#;
        assert_eq!(decrypt(payload, None, Some("system")), payload);
    }
}
