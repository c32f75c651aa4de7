//! Component C — the Auth Engine.
//!
//! Owns the host's persistent RSA-2048 key pair, derives the Android
//! public-key blob from it, and signs authentication tokens the device
//! challenges the host with during the CNXN/AUTH handshake (spec §4.C).

pub mod pubkey;

use std::sync::OnceLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine;
use rsa::pkcs1v15::SigningKey;
use rsa::signature::hazmat::PrehashSigner;
use rsa::signature::SignatureEncoding;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint as RsaBigUint, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

const KEY_BITS: usize = 2048;

/// Opaque persistence contract for the host key pair (spec §6). Values
/// are base64url RSA JWKs; this core only inspects `n`/`d`/`e`.
pub trait KeyStore: Send + Sync {
    fn load_key(&self) -> Result<Option<(String, String)>>;
    fn store_key(&self, private_jwk: &str, public_jwk: &str) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RsaJwk {
    kty: String,
    n: String,
    e: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    d: Option<String>,
}

impl RsaJwk {
    fn from_private(key: &RsaPrivateKey) -> Self {
        Self {
            kty: "RSA".to_string(),
            n: BASE64_URL.encode(key.n().to_bytes_be()),
            e: BASE64_URL.encode(key.e().to_bytes_be()),
            d: Some(BASE64_URL.encode(key.d().to_bytes_be())),
        }
    }

    fn public_only(&self) -> Self {
        Self {
            kty: self.kty.clone(),
            n: self.n.clone(),
            e: self.e.clone(),
            d: None,
        }
    }
}

/// The host's persistent RSA key pair, plus its Android public-key blob
/// (computed once per session and cached, spec §3 "Host Key").
pub struct HostKey {
    private_key: RsaPrivateKey,
    blob: OnceLock<String>,
}

impl HostKey {
    /// Load the host key from `store`, generating and persisting a new
    /// RSA-2048/65537 pair on first use (spec §4.C / §3 lifecycle).
    pub fn load_or_generate(store: &dyn KeyStore) -> Result<Self> {
        if let Some((private_jwk, _public_jwk)) = store.load_key()? {
            return Self::from_jwk(&private_jwk);
        }
        let key = Self::generate()?;
        let (private_jwk, public_jwk) = key.to_jwk();
        store.store_key(&private_jwk, &public_jwk)?;
        Ok(key)
    }

    fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| Error::internal(anyhow::anyhow!("generating RSA host key: {e}")))?;
        Ok(Self {
            private_key,
            blob: OnceLock::new(),
        })
    }

    fn from_jwk(private_jwk: &str) -> Result<Self> {
        let jwk: RsaJwk = serde_json::from_str(private_jwk)
            .map_err(|e| Error::internal(anyhow::anyhow!("parsing stored key JWK: {e}")))?;
        let n = decode_uint(&jwk.n)?;
        let e = decode_uint(&jwk.e)?;
        let d = decode_uint(
            jwk.d
                .as_deref()
                .ok_or_else(|| Error::internal(anyhow::anyhow!("stored private JWK has no 'd'")))?,
        )?;
        let private_key = RsaPrivateKey::from_components(n, e, d, Vec::new())
            .map_err(|e| Error::internal(anyhow::anyhow!("reconstructing RSA key from JWK: {e}")))?;
        Ok(Self {
            private_key,
            blob: OnceLock::new(),
        })
    }

    /// Serialize this key pair to (private_jwk, public_jwk) for the
    /// key-store collaborator (spec §6).
    pub fn to_jwk(&self) -> (String, String) {
        let private = RsaJwk::from_private(&self.private_key);
        let public = private.public_only();
        (
            serde_json::to_string(&private).expect("JWK serialization cannot fail"),
            serde_json::to_string(&public).expect("JWK serialization cannot fail"),
        )
    }

    /// The Android public-key blob for `AUTH_RSAPUBLICKEY`, computed on
    /// first call and cached for the life of this key.
    pub fn pubkey_blob(&self) -> &str {
        self.blob.get_or_init(|| pubkey::encode(&self.private_key))
    }

    /// The public half of this key pair, for verifying a signature this
    /// key produced without exposing the private key itself.
    pub(crate) fn to_public_key(&self) -> rsa::RsaPublicKey {
        self.private_key.to_public_key()
    }

    /// Sign an auth token with PKCS#1 v1.5 SHA-1 padding. Tokens that
    /// aren't already 20 bytes (a SHA-1 digest size) are hashed first
    /// (spec §4.C).
    pub fn sign(&self, token: &[u8]) -> Result<Vec<u8>> {
        let digest: Vec<u8> = if token.len() == 20 {
            token.to_vec()
        } else {
            Sha1::digest(token).to_vec()
        };
        let signing_key = SigningKey::<Sha1>::new(self.private_key.clone());
        let signature = signing_key
            .sign_prehash(&digest)
            .map_err(|e| Error::internal(anyhow::anyhow!("signing auth token: {e}")))?;
        Ok(signature.to_bytes().to_vec())
    }
}

fn decode_uint(field: &str) -> Result<RsaBigUint> {
    let bytes = BASE64_URL
        .decode(field)
        .map_err(|e| Error::internal(anyhow::anyhow!("decoding JWK field: {e}")))?;
    Ok(RsaBigUint::from_bytes_be(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::signature::hazmat::PrehashVerifier;
    use rsa::pkcs1v15::VerifyingKey;
    use std::sync::Mutex;

    struct MemoryKeyStore(Mutex<Option<(String, String)>>);

    impl KeyStore for MemoryKeyStore {
        fn load_key(&self) -> Result<Option<(String, String)>> {
            Ok(self.0.lock().unwrap().clone())
        }
        fn store_key(&self, private_jwk: &str, public_jwk: &str) -> Result<()> {
            *self.0.lock().unwrap() = Some((private_jwk.to_string(), public_jwk.to_string()));
            Ok(())
        }
    }

    #[test]
    fn generates_and_persists_a_key() {
        let store = MemoryKeyStore(Mutex::new(None));
        let key = HostKey::load_or_generate(&store).unwrap();
        assert!(store.0.lock().unwrap().is_some());
        assert_eq!(key.private_key.size(), 256);
    }

    #[test]
    fn reloads_the_same_key_from_a_store() {
        let store = MemoryKeyStore(Mutex::new(None));
        let first = HostKey::load_or_generate(&store).unwrap();
        let second = HostKey::load_or_generate(&store).unwrap();
        assert_eq!(first.private_key.n(), second.private_key.n());
    }

    #[test]
    fn signature_round_trips_through_verification() {
        let store = MemoryKeyStore(Mutex::new(None));
        let key = HostKey::load_or_generate(&store).unwrap();
        let token = [7u8; 20];
        let signature = key.sign(&token).unwrap();

        let verifying_key = VerifyingKey::<Sha1>::new(key.private_key.to_public_key());
        let sig = rsa::pkcs1v15::Signature::try_from(signature.as_slice()).unwrap();
        verifying_key.verify_prehash(&token, &sig).unwrap();
    }

    #[test]
    fn hashes_tokens_that_are_not_already_20_bytes() {
        let store = MemoryKeyStore(Mutex::new(None));
        let key = HostKey::load_or_generate(&store).unwrap();
        let token = b"not a pre-hashed 20 byte value";
        let signature = key.sign(token).unwrap();

        let digest = Sha1::digest(token);
        let verifying_key = VerifyingKey::<Sha1>::new(key.private_key.to_public_key());
        let sig = rsa::pkcs1v15::Signature::try_from(signature.as_slice()).unwrap();
        verifying_key.verify_prehash(&digest, &sig).unwrap();
    }
}
