// SPDX-License-Identifier: MIT
//! Authenticated encryption for sensitive session fields.
//!
//! Protocol: HKDF-SHA256 key derivation from the configured passphrase →
//! ChaCha20-Poly1305 AEAD per field.  Two independent keys are derived from
//! the passphrase so the cipher and the checksum MAC never share key material:
//!   encryption key (info = "incorp-session-fields-v1")
//!   checksum key   (info = "incorp-backup-checksum-v1")
//!
//! Every envelope carries a fresh random 96-bit nonce, so encrypting the same
//! plaintext twice never yields the same ciphertext.  The 16-byte Poly1305
//! tag is stored as a separate envelope field; tampering with the ciphertext,
//! nonce, or tag makes decryption fail with [`CryptoError::DecryptFailed`]
//! rather than returning garbage.
//!
//! Backup checksums are HMAC-SHA256 hex digests verified in constant time.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use rand_core::{OsRng, RngCore};
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const ENC_KEY_INFO: &[u8] = b"incorp-session-fields-v1";
const MAC_KEY_INFO: &[u8] = b"incorp-backup-checksum-v1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

static SSN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{3}-?\d{2}-?\d{4}$").expect("valid SSN regex"));

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Authentication tag verification failed: the envelope was tampered with
    /// or was produced under a different key.
    #[error("decryption failed: authentication tag mismatch or wrong key")]
    DecryptFailed,

    #[error("encryption failed")]
    EncryptFailed,

    /// An envelope field is not valid base64 or has the wrong length.
    #[error("malformed envelope: {0}")]
    InvalidEnvelope(&'static str),

    /// Decrypted bytes are not the expected UTF-8 / JSON shape.
    #[error("decrypted payload is not valid UTF-8")]
    InvalidPlaintext,

    #[error("invalid SSN format: expected 9 digits with optional dashes")]
    InvalidSsnFormat,

    #[error("empty encryption passphrase")]
    EmptyPassphrase,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ─── Envelope ─────────────────────────────────────────────────────────────────

/// One encrypted value at rest.  All fields are standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub cipher_text: String,
    /// 96-bit AEAD nonce, unique per encryption.
    pub iv: String,
    /// 128-bit Poly1305 authentication tag.
    pub auth_tag: String,
}

// ─── Service ──────────────────────────────────────────────────────────────────

/// Process-wide encryption service.  The derived keys are immutable for the
/// lifetime of the instance — key rotation requires a new instance.
pub struct CryptoService {
    cipher: ChaCha20Poly1305,
    mac_key: [u8; 32],
}

impl CryptoService {
    /// Derive the encryption and checksum keys from `passphrase`.
    ///
    /// Derivation is HKDF-SHA256 with fixed domain-separation info strings
    /// and no stored salt, so the same passphrase always yields the same
    /// keys.  An empty passphrase is a configuration error, not a fallback
    /// to a built-in default key.
    pub fn new(passphrase: &str) -> Result<Self, CryptoError> {
        if passphrase.is_empty() {
            return Err(CryptoError::EmptyPassphrase);
        }
        let hk = Hkdf::<Sha256>::new(None, passphrase.as_bytes());
        let mut enc_key = [0u8; 32];
        hk.expand(ENC_KEY_INFO, &mut enc_key)
            .map_err(|_| CryptoError::EncryptFailed)?;
        let mut mac_key = [0u8; 32];
        hk.expand(MAC_KEY_INFO, &mut mac_key)
            .map_err(|_| CryptoError::EncryptFailed)?;
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&enc_key)),
            mac_key,
        })
    }

    /// Encrypt a string into an [`Envelope`] under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<Envelope, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let mut out = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptFailed)?;

        // AEAD output is ciphertext || tag; store the tag separately so the
        // envelope exposes all three tamper-evident fields.
        let tag = out.split_off(out.len() - TAG_LEN);
        Ok(Envelope {
            cipher_text: BASE64.encode(&out),
            iv: BASE64.encode(nonce_bytes),
            auth_tag: BASE64.encode(&tag),
        })
    }

    /// Decrypt an [`Envelope`] back to the original string.
    ///
    /// Fails with [`CryptoError::DecryptFailed`] on any tag mismatch —
    /// corrupted ciphertext, tampered nonce or tag, or a wrong key.
    pub fn decrypt(&self, envelope: &Envelope) -> Result<String, CryptoError> {
        let ct = BASE64
            .decode(&envelope.cipher_text)
            .map_err(|_| CryptoError::InvalidEnvelope("cipherText is not base64"))?;
        let nonce = BASE64
            .decode(&envelope.iv)
            .map_err(|_| CryptoError::InvalidEnvelope("iv is not base64"))?;
        let tag = BASE64
            .decode(&envelope.auth_tag)
            .map_err(|_| CryptoError::InvalidEnvelope("authTag is not base64"))?;
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::InvalidEnvelope("iv must be 12 bytes"));
        }
        if tag.len() != TAG_LEN {
            return Err(CryptoError::InvalidEnvelope("authTag must be 16 bytes"));
        }

        let mut joined = ct;
        joined.extend_from_slice(&tag);
        let pt = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), joined.as_slice())
            .map_err(|_| CryptoError::DecryptFailed)?;
        String::from_utf8(pt).map_err(|_| CryptoError::InvalidPlaintext)
    }

    /// JSON-serialize a value, then encrypt the serialized form.
    pub fn encrypt_object<T: Serialize>(&self, value: &T) -> Result<Envelope, CryptoError> {
        let json = serde_json::to_string(value)?;
        self.encrypt(&json)
    }

    /// Decrypt an envelope and deserialize the plaintext as JSON.
    pub fn decrypt_object<T: DeserializeOwned>(
        &self,
        envelope: &Envelope,
    ) -> Result<T, CryptoError> {
        let json = self.decrypt(envelope)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Validate, normalize (strip dashes), and encrypt a Social Security
    /// number.  `"123-45-6789"` and `"123456789"` both encrypt to the
    /// normalized nine-digit form.
    pub fn encrypt_ssn(&self, raw: &str) -> Result<Envelope, CryptoError> {
        if !SSN_RE.is_match(raw) {
            return Err(CryptoError::InvalidSsnFormat);
        }
        let normalized: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        self.encrypt(&normalized)
    }

    /// Mask and encrypt payment details.
    ///
    /// The full card number is replaced by `****<last4>` *before* encryption
    /// and the last four digits are returned alongside the envelope, so even
    /// the encrypted payload never contains the full number.
    pub fn encrypt_payment_info(
        &self,
        payment: &PaymentInfo,
    ) -> Result<(Envelope, String), CryptoError> {
        let digits: String = payment
            .card_number
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        let last4 = if digits.len() >= 4 {
            digits[digits.len() - 4..].to_string()
        } else {
            digits.clone()
        };

        let masked = PaymentInfo {
            card_number: format!("****{last4}"),
            ..payment.clone()
        };
        let envelope = self.encrypt_object(&masked)?;
        Ok((envelope, last4))
    }

    /// HMAC-SHA256 hex digest over `data`, keyed by the derived checksum key.
    pub fn create_checksum(&self, data: &[u8]) -> String {
        // Qualified: both Mac and the AEAD KeyInit provide new_from_slice.
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .expect("HMAC accepts any key length");
        mac.update(data);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time checksum verification.  A malformed checksum string
    /// returns `false`, never an error.
    pub fn verify_checksum(&self, data: &[u8], checksum: &str) -> bool {
        let Ok(expected) = hex::decode(checksum) else {
            return false;
        };
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .expect("HMAC accepts any key length");
        mac.update(data);
        // Mac::verify_slice compares in constant time.
        mac.verify_slice(&expected).is_ok()
    }
}

// ─── Payment info ─────────────────────────────────────────────────────────────

/// Payment details as collected from the user.  Only ever persisted after
/// masking + encryption via [`CryptoService::encrypt_payment_info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInfo {
    pub card_holder: String,
    pub card_number: String,
    pub expiry_month: u8,
    pub expiry_year: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn svc() -> CryptoService {
        CryptoService::new("test passphrase").unwrap()
    }

    #[test]
    fn round_trip_basic() {
        let s = svc();
        for input in ["", "hello", "héllo wörld ☃", &"x".repeat(10_000)] {
            let env = s.encrypt(input).unwrap();
            assert_eq!(s.decrypt(&env).unwrap(), input);
        }
    }

    #[test]
    fn identical_plaintexts_yield_distinct_envelopes() {
        let s = svc();
        let a = s.encrypt("same input").unwrap();
        let b = s.encrypt("same input").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.cipher_text, b.cipher_text);
    }

    #[test]
    fn empty_passphrase_is_rejected() {
        assert!(matches!(
            CryptoService::new(""),
            Err(CryptoError::EmptyPassphrase)
        ));
    }

    #[test]
    fn derivation_is_deterministic_per_passphrase() {
        let a = CryptoService::new("passphrase-one").unwrap();
        let b = CryptoService::new("passphrase-one").unwrap();
        let env = a.encrypt("portable").unwrap();
        assert_eq!(b.decrypt(&env).unwrap(), "portable");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let env = svc().encrypt("secret").unwrap();
        let other = CryptoService::new("a different passphrase").unwrap();
        assert!(matches!(other.decrypt(&env), Err(CryptoError::DecryptFailed)));
    }

    /// Flip one byte inside a base64 field and re-encode.
    fn corrupt(field: &str) -> String {
        let mut bytes = BASE64.decode(field).unwrap();
        bytes[0] ^= 0xff;
        BASE64.encode(bytes)
    }

    #[test]
    fn tampered_tag_is_rejected() {
        let s = svc();
        let mut env = s.encrypt("tamper me").unwrap();
        env.auth_tag = corrupt(&env.auth_tag);
        assert!(matches!(s.decrypt(&env), Err(CryptoError::DecryptFailed)));
    }

    #[test]
    fn tampered_nonce_is_rejected() {
        let s = svc();
        let mut env = s.encrypt("tamper me").unwrap();
        env.iv = corrupt(&env.iv);
        assert!(matches!(s.decrypt(&env), Err(CryptoError::DecryptFailed)));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let s = svc();
        let mut env = s.encrypt("tamper me, longer plaintext").unwrap();
        env.cipher_text = corrupt(&env.cipher_text);
        assert!(matches!(s.decrypt(&env), Err(CryptoError::DecryptFailed)));
    }

    #[test]
    fn malformed_envelope_fields_are_rejected() {
        let s = svc();
        let mut env = s.encrypt("x").unwrap();
        env.iv = "not base64!!".to_string();
        assert!(matches!(s.decrypt(&env), Err(CryptoError::InvalidEnvelope(_))));

        let mut env = s.encrypt("x").unwrap();
        env.auth_tag = BASE64.encode([0u8; 4]);
        assert!(matches!(s.decrypt(&env), Err(CryptoError::InvalidEnvelope(_))));
    }

    #[test]
    fn object_round_trip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Thing {
            name: String,
            count: u32,
        }
        let s = svc();
        let thing = Thing {
            name: "acme".to_string(),
            count: 7,
        };
        let env = s.encrypt_object(&thing).unwrap();
        let back: Thing = s.decrypt_object(&env).unwrap();
        assert_eq!(back, thing);
    }

    #[test]
    fn ssn_is_normalized_before_encryption() {
        let s = svc();
        let env = s.encrypt_ssn("123-45-6789").unwrap();
        assert_eq!(s.decrypt(&env).unwrap(), "123456789");

        let env = s.encrypt_ssn("123456789").unwrap();
        assert_eq!(s.decrypt(&env).unwrap(), "123456789");
    }

    #[test]
    fn invalid_ssn_is_rejected() {
        let s = svc();
        for bad in ["12-34", "1234567890", "abc-de-fghi", "", "123 45 6789"] {
            assert!(
                matches!(s.encrypt_ssn(bad), Err(CryptoError::InvalidSsnFormat)),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn payment_info_is_masked_before_encryption() {
        let s = svc();
        let payment = PaymentInfo {
            card_holder: "Jordan Doe".to_string(),
            card_number: "4242 4242 4242 4242".to_string(),
            expiry_month: 12,
            expiry_year: 2030,
        };
        let (env, last4) = s.encrypt_payment_info(&payment).unwrap();
        assert_eq!(last4, "4242");

        let decrypted: PaymentInfo = s.decrypt_object(&env).unwrap();
        assert_eq!(decrypted.card_number, "****4242");
        assert_eq!(decrypted.card_holder, "Jordan Doe");
        // The plaintext inside the envelope must not contain the full number.
        let json = s.decrypt(&env).unwrap();
        assert!(!json.contains("4242 4242 4242 4242"));
    }

    #[test]
    fn checksum_round_trip() {
        let s = svc();
        let data = b"payload bytes";
        let sum = s.create_checksum(data);
        assert!(s.verify_checksum(data, &sum));
        assert!(!s.verify_checksum(b"different payload", &sum));
        assert!(!s.verify_checksum(data, "not-hex-at-all"));
        assert!(!s.verify_checksum(data, ""));
    }

    #[test]
    fn checksum_is_keyed() {
        let a = svc();
        let b = CryptoService::new("another key").unwrap();
        let sum = a.create_checksum(b"data");
        assert!(!b.verify_checksum(b"data", &sum));
    }

    proptest! {
        #[test]
        fn round_trip_arbitrary_strings(input in ".*") {
            let s = svc();
            let env = s.encrypt(&input).unwrap();
            prop_assert_eq!(s.decrypt(&env).unwrap(), input);
        }

        #[test]
        fn nonces_never_repeat(input in ".{0,64}") {
            let s = svc();
            let a = s.encrypt(&input).unwrap();
            let b = s.encrypt(&input).unwrap();
            prop_assert_ne!(a.iv, b.iv);
        }
    }
}
