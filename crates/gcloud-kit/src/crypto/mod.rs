//! Hashing and RSA signing helpers.
//!
//! SHA-256 and RSASSA-PKCS1-v1_5 signing are provided via the `ring` crate;
//! PEM private keys are decoded with `rustls-pemfile`.

use ring::digest;
use ring::rand::SystemRandom;
use ring::signature::{KeyPair, RsaKeyPair, RSA_PKCS1_SHA256};
use rustls::pki_types::PrivateKeyDer;

use crate::errors::{GcloudError, Result};

/// Compute SHA-256 hash of input bytes, returning a lowercase hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let d = digest::digest(&digest::SHA256, data);
    hex_encode(d.as_ref())
}

/// Encode a byte slice as a lowercase hex string.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// RSA-SHA256 signer built from a service account's PEM private key.
pub struct RsaSigner {
    key_pair: RsaKeyPair,
    rng: SystemRandom,
}

impl RsaSigner {
    /// Parse a PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`)
    /// PEM block.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let der = rustls_pemfile::private_key(&mut pem.as_bytes())
            .map_err(|e| GcloudError::Credential(format!("Unreadable private key PEM: {e}")))?
            .ok_or_else(|| GcloudError::Credential("No private key found in PEM".into()))?;

        let key_pair = match der {
            PrivateKeyDer::Pkcs8(key) => RsaKeyPair::from_pkcs8(key.secret_pkcs8_der()),
            PrivateKeyDer::Pkcs1(key) => RsaKeyPair::from_der(key.secret_pkcs1_der()),
            _ => {
                return Err(GcloudError::Credential(
                    "Private key is not an RSA key".into(),
                ))
            }
        }
        .map_err(|e| GcloudError::Credential(format!("Rejected RSA private key: {e}")))?;

        Ok(Self {
            key_pair,
            rng: SystemRandom::new(),
        })
    }

    /// Sign `message` with RSASSA-PKCS1-v1_5 / SHA-256.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(&RSA_PKCS1_SHA256, &self.rng, message, &mut signature)
            .map_err(|_| GcloudError::Credential("RSA signing failed".into()))?;
        Ok(signature)
    }

    /// DER-encoded `RSAPublicKey` of the signing key.
    pub fn public_key_der(&self) -> Vec<u8> {
        self.key_pair.public_key().as_ref().to_vec()
    }
}

impl std::fmt::Debug for RsaSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaSigner").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use ring::signature::{UnparsedPublicKey, RSA_PKCS1_2048_8192_SHA256};

    use super::*;

    pub(crate) const FIXTURE_KEY: &str = include_str!("../../tests/fixtures/service_account.json");

    pub(crate) fn fixture_pem() -> String {
        let v: serde_json::Value = serde_json::from_str(FIXTURE_KEY).unwrap();
        v["private_key"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_sha256_empty() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_sha256_hello() {
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x0a, 0xbc]), "00ff0abc");
    }

    #[test]
    fn test_sign_verifies_with_public_key() {
        let signer = RsaSigner::from_pem(&fixture_pem()).unwrap();
        let sig = signer.sign(b"payload").unwrap();
        assert_eq!(sig.len(), 256);

        let public = signer.public_key_der();
        let verifier = UnparsedPublicKey::new(&RSA_PKCS1_2048_8192_SHA256, &public);
        assert!(verifier.verify(b"payload", &sig).is_ok());
        assert!(verifier.verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn test_garbage_pem_is_credential_error() {
        let err = RsaSigner::from_pem("not a key").unwrap_err();
        assert!(matches!(err, GcloudError::Credential(_)));
    }
}
