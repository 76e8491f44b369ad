//! Ed25519 key and signature wrappers
//!
//! Byte-array newtypes over `ed25519_dalek` so that keys and signatures
//! can be serialized, compared, and carried in maps without dragging the
//! dalek types through every signature. Matrix encodes all of these as
//! unpadded standard base64.

use crate::errors::{Error, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

/// An Ed25519 signature in bytes form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "BigArray")] pub [u8; 64]);

impl Signature {
    /// Construct from a fixed-size array.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode as unpadded standard base64.
    pub fn to_base64(&self) -> String {
        STANDARD_NO_PAD.encode(self.0)
    }

    /// Decode from unpadded standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD_NO_PAD
            .decode(encoded)
            .map_err(|e| Error::bad_signature(format!("signature base64: {e}")))?;
        Self::try_from_slice(&bytes)
    }

    /// Try to construct from a slice.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| Error::bad_signature("Ed25519 signature must be exactly 64 bytes"))?;
        Ok(Self(arr))
    }
}

/// An Ed25519 signing key in bytes form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKey(pub [u8; 32]);

impl SigningKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive the matching verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        VerifyingKey(key.verifying_key().to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        Signature(key.sign(message).to_bytes())
    }
}

/// An Ed25519 verifying (public) key in bytes form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyingKey(pub [u8; 32]);

impl VerifyingKey {
    /// Construct from raw bytes, validating the curve point.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self> {
        ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map(|_| Self(bytes))
            .map_err(|e| Error::bad_signature(e.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode as unpadded standard base64.
    pub fn to_base64(&self) -> String {
        STANDARD_NO_PAD.encode(self.0)
    }

    /// Decode from unpadded standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD_NO_PAD
            .decode(encoded)
            .map_err(|e| Error::bad_signature(format!("key base64: {e}")))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::bad_signature("Ed25519 key must be exactly 32 bytes"))?;
        Self::from_bytes(arr)
    }

    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|e| Error::bad_signature(e.to_string()))?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify_strict(message, &sig)
            .map_err(|_| Error::bad_signature("signature verification failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let signing = SigningKey::from_bytes([7u8; 32]);
        let message = b"tessera-core";
        let signature = signing.sign(message);

        let verifying = signing.verifying_key();
        assert!(verifying.verify(message, &signature).is_ok());
        assert!(verifying.verify(b"tampered", &signature).is_err());
    }

    #[test]
    fn base64_roundtrip() {
        let signing = SigningKey::from_bytes([11u8; 32]);
        let signature = signing.sign(b"roundtrip");

        let encoded = signature.to_base64();
        assert!(!encoded.ends_with('='));
        assert_eq!(Signature::from_base64(&encoded).unwrap(), signature);

        let verifying = signing.verifying_key();
        let key_encoded = verifying.to_base64();
        assert_eq!(VerifyingKey::from_base64(&key_encoded).unwrap(), verifying);
    }

    #[test]
    fn invalid_lengths_rejected() {
        assert!(Signature::try_from_slice(&[0u8; 63]).is_err());
        assert!(VerifyingKey::from_base64("AAAA").is_err());
    }
}
