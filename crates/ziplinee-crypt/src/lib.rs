//! Secret envelope encryption and decryption.
//!
//! Secrets travel through manifests and configs as envelopes of the form
//! `ziplinee.secret(<nonce>.<ciphertext>)` with both parts base64url encoded
//! (no padding). Encryption is AES-256-GCM; the fully qualified pipeline name
//! (`source/owner/name`) is bound in as associated data, so an envelope
//! lifted from one pipeline does not decrypt in another.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum Error {
    #[error("decryption key must be 32 bytes of AES-256 key material")]
    InvalidKeyLength,

    #[error("value is not a valid secret envelope")]
    InvalidEnvelope,

    #[error("invalid base64 in secret envelope: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("decryption failed; wrong key, tampered ciphertext or wrong pipeline")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decrypted secret is not valid utf-8")]
    InvalidPlaintext,
}

pub type Result<T> = std::result::Result<T, Error>;

fn envelope_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"ziplinee\.secret\(([A-Za-z0-9_-]+)\.([A-Za-z0-9_-]+)\)")
            .expect("envelope regex is valid")
    })
}

/// Returns every envelope (full `ziplinee.secret(...)` match) found in the
/// input, in order of appearance.
pub fn collect_all_envelopes(input: &str) -> Vec<String> {
    envelope_regex()
        .find_iter(input)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Decrypts secret envelopes with a fixed AES-256 key.
#[derive(Clone)]
pub struct SecretHelper {
    cipher: Aes256Gcm,
}

impl SecretHelper {
    /// Accepts the key as raw 32 bytes or base64 of 32 bytes.
    pub fn new(key_material: &str) -> Result<Self> {
        let trimmed = key_material.trim();

        let key_bytes = match STANDARD.decode(trimmed) {
            Ok(decoded) if decoded.len() == 32 => decoded,
            _ if trimmed.len() == 32 => trimmed.as_bytes().to_vec(),
            _ => return Err(Error::InvalidKeyLength),
        };

        let cipher = Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| Error::InvalidKeyLength)?;
        Ok(SecretHelper { cipher })
    }

    /// Encrypts a plaintext into an envelope bound to the pipeline name.
    pub fn encrypt(&self, plaintext: &str, pipeline: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: pipeline.as_bytes(),
                },
            )
            .map_err(|_| Error::EncryptionFailed)?;

        Ok(format!(
            "ziplinee.secret({}.{})",
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    /// Decrypts a single envelope; the whole input must be the envelope.
    pub fn decrypt_envelope(&self, envelope: &str, pipeline: &str) -> Result<String> {
        let captures = envelope_regex()
            .captures(envelope.trim())
            .filter(|c| c.get(0).map(|m| m.as_str().len()) == Some(envelope.trim().len()))
            .ok_or(Error::InvalidEnvelope)?;

        let nonce_bytes = URL_SAFE_NO_PAD.decode(&captures[1])?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(Error::InvalidEnvelope);
        }
        let ciphertext = URL_SAFE_NO_PAD.decode(&captures[2])?;

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: pipeline.as_bytes(),
                },
            )
            .map_err(|_| Error::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| Error::InvalidPlaintext)
    }

    /// Replaces every envelope inside a larger string with its plaintext.
    /// Values without envelopes pass through unchanged.
    pub fn decrypt_all_envelopes(&self, input: &str, pipeline: &str) -> Result<String> {
        let mut output = String::with_capacity(input.len());
        let mut last_end = 0;

        for found in envelope_regex().find_iter(input) {
            output.push_str(&input[last_end..found.start()]);
            output.push_str(&self.decrypt_envelope(found.as_str(), pipeline)?);
            last_end = found.end();
        }
        output.push_str(&input[last_end..]);

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = "github.com/ziplineeci/ziplinee-ci-builder";

    fn helper() -> SecretHelper {
        SecretHelper::new("0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let helper = helper();

        let envelope = helper.encrypt("this is a secret", PIPELINE).unwrap();
        let plaintext = helper.decrypt_envelope(&envelope, PIPELINE).unwrap();

        assert!(envelope.starts_with("ziplinee.secret("));
        assert_eq!(plaintext, "this is a secret");
    }

    #[test]
    fn accepts_base64_key_material() {
        let raw = "0123456789abcdef0123456789abcdef";
        let encoded = STANDARD.encode(raw);

        let helper = SecretHelper::new(&encoded).unwrap();
        let envelope = helper.encrypt("x", PIPELINE).unwrap();

        // same key either way, so the raw-key helper decrypts it
        assert_eq!(helper.decrypt_envelope(&envelope, PIPELINE).unwrap(), "x");
    }

    #[test]
    fn rejects_short_key() {
        assert!(matches!(
            SecretHelper::new("too-short"),
            Err(Error::InvalidKeyLength)
        ));
    }

    #[test]
    fn decryption_is_bound_to_pipeline() {
        let helper = helper();

        let envelope = helper.encrypt("secret", PIPELINE).unwrap();
        let result = helper.decrypt_envelope(&envelope, "github.com/evil/other");

        assert!(matches!(result, Err(Error::DecryptionFailed)));
    }

    #[test]
    fn rejects_wrong_key() {
        let envelope = helper().encrypt("secret", PIPELINE).unwrap();

        let other = SecretHelper::new("fedcba9876543210fedcba9876543210").unwrap();
        assert!(matches!(
            other.decrypt_envelope(&envelope, PIPELINE),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn rejects_non_envelope_input() {
        assert!(matches!(
            helper().decrypt_envelope("plain value", PIPELINE),
            Err(Error::InvalidEnvelope)
        ));
    }

    #[test]
    fn decrypt_all_envelopes_replaces_in_place() {
        let helper = helper();

        let envelope = helper.encrypt("hunter2", PIPELINE).unwrap();
        let input = format!("password={envelope} --verbose");

        let output = helper.decrypt_all_envelopes(&input, PIPELINE).unwrap();
        assert_eq!(output, "password=hunter2 --verbose");
    }

    #[test]
    fn decrypt_all_envelopes_passes_plain_values_through() {
        let output = helper()
            .decrypt_all_envelopes("no secrets here", PIPELINE)
            .unwrap();
        assert_eq!(output, "no secrets here");
    }

    #[test]
    fn collects_envelopes_in_order() {
        let helper = helper();
        let first = helper.encrypt("one", PIPELINE).unwrap();
        let second = helper.encrypt("two", PIPELINE).unwrap();

        let haystack = format!("a {first} b {second} c");
        let found = collect_all_envelopes(&haystack);

        assert_eq!(found, vec![first, second]);
    }
}
