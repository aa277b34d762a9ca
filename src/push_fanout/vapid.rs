//! VAPID key generation for Web Push (RFC 8292).

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::OsRng;
use serde::{Deserialize, Serialize};

/// VAPID keypair for web push authentication.
///
/// The private key is a P-256 ECDSA signing key stored as the raw
/// 32-byte scalar (base64url), not SEC1 or PKCS8 DER: the `web-push`
/// crate's `VapidSignatureBuilder::from_base64()` expects exactly this
/// format, and `from_der()` panics on SEC1 DER from p256 due to a bug
/// in `sec1_decode`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VapidKeys {
    private_key_b64: String,
    public_key_b64: String,
}

impl VapidKeys {
    /// Generates a fresh VAPID keypair, one per relay node at startup.
    pub fn generate() -> Result<Self> {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let public_bytes = verifying_key.to_encoded_point(false);
        let public_key_b64 = BASE64URL.encode(public_bytes.as_bytes());
        let private_key_b64 = BASE64URL.encode(signing_key.to_bytes().as_slice());

        Ok(Self { private_key_b64, public_key_b64 })
    }

    /// Base64url-encoded uncompressed public key (65 bytes decoded),
    /// sent to browsers as the VAPID `applicationServerKey`.
    pub fn public_key_base64url(&self) -> &str {
        &self.public_key_b64
    }

    /// Base64url-encoded raw 32-byte private key scalar, used by
    /// `VapidSignatureBuilder::from_base64()`.
    pub fn private_key_base64url(&self) -> &str {
        &self.private_key_b64
    }

    /// Reconstructs from stored base64url-encoded strings, validating
    /// both the public key format and the private key scalar.
    pub fn from_base64url(public_key_b64: &str, private_key_b64: &str) -> Result<Self> {
        let pub_bytes = BASE64URL
            .decode(public_key_b64)
            .context("Invalid base64url for VAPID public key")?;
        anyhow::ensure!(
            pub_bytes.len() == 65 && pub_bytes[0] == 0x04,
            "VAPID public key must be 65-byte uncompressed P-256 point"
        );

        let priv_bytes = BASE64URL
            .decode(private_key_b64)
            .context("Invalid base64url for VAPID private key")?;
        anyhow::ensure!(
            priv_bytes.len() == 32,
            "VAPID private key must be 32-byte P-256 scalar, got {} bytes",
            priv_bytes.len()
        );
        SigningKey::from_bytes(priv_bytes.as_slice().into())
            .context("VAPID private key is not a valid P-256 scalar")?;

        Ok(Self {
            private_key_b64: private_key_b64.to_string(),
            public_key_b64: public_key_b64.to_string(),
        })
    }

    /// Migrates legacy SEC1/PKCS8 DER private keys to the raw 32-byte
    /// scalar. A no-op if the key is already 32 bytes.
    pub fn migrate_if_needed(self) -> Result<Self> {
        let priv_bytes = BASE64URL
            .decode(&self.private_key_b64)
            .context("Failed to decode VAPID private key")?;

        if priv_bytes.len() == 32 {
            return Ok(self);
        }

        let signing_key = if let Ok(sk) = p256::SecretKey::from_sec1_der(&priv_bytes) {
            SigningKey::from(sk)
        } else {
            use p256::pkcs8::DecodePrivateKey;
            SigningKey::from_pkcs8_der(&priv_bytes)
                .context("VAPID private key is not valid 32-byte scalar, SEC1 DER, or PKCS8 DER")?
        };

        log::info!("[PushFanout] migrated VAPID key from legacy DER ({} bytes) to raw scalar", priv_bytes.len());

        Ok(Self {
            private_key_b64: BASE64URL.encode(signing_key.to_bytes().as_slice()),
            public_key_b64: self.public_key_b64,
        })
    }

    pub fn public_key_bytes(&self) -> Result<Vec<u8>> {
        BASE64URL.decode(&self.public_key_b64).context("Failed to decode VAPID public key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_well_formed_keys() {
        let keys = VapidKeys::generate().expect("should generate keys");
        let pub_bytes = keys.public_key_bytes().expect("decode public key");
        assert_eq!(pub_bytes.len(), 65);
        assert_eq!(pub_bytes[0], 0x04);

        let priv_bytes = BASE64URL.decode(keys.private_key_base64url()).expect("decode private key");
        assert_eq!(priv_bytes.len(), 32);
    }

    #[test]
    fn from_base64url_roundtrips() {
        let keys = VapidKeys::generate().expect("should generate keys");
        let reconstructed =
            VapidKeys::from_base64url(keys.public_key_base64url(), keys.private_key_base64url())
                .expect("should reconstruct from base64url");

        assert_eq!(keys.public_key_base64url(), reconstructed.public_key_base64url());
        assert_eq!(keys.private_key_base64url(), reconstructed.private_key_base64url());
    }

    #[test]
    fn legacy_der_keys_migrate_to_raw_scalar() {
        use p256::SecretKey;

        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let public_bytes = verifying_key.to_encoded_point(false);
        let public_key_b64 = BASE64URL.encode(public_bytes.as_bytes());

        let secret_key: SecretKey = signing_key.into();
        let der = secret_key.to_sec1_der().expect("SEC1 DER");
        let old_private_b64 = BASE64URL.encode(&*der);

        let old_keys = VapidKeys { private_key_b64: old_private_b64, public_key_b64 };
        let migrated = old_keys.migrate_if_needed().expect("migration should succeed");
        let priv_bytes = BASE64URL.decode(migrated.private_key_base64url()).unwrap();
        assert_eq!(priv_bytes.len(), 32);
    }

    #[test]
    fn from_base64url_rejects_invalid_input() {
        assert!(VapidKeys::from_base64url("not-valid-key", "also-bad").is_err());
    }

    #[test]
    fn roundtrips_through_serde() {
        let keys = VapidKeys::generate().expect("should generate keys");
        let json = serde_json::to_string(&keys).expect("serialize");
        let loaded: VapidKeys = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(keys.public_key_base64url(), loaded.public_key_base64url());
        assert_eq!(keys.private_key_base64url(), loaded.private_key_base64url());
    }
}
