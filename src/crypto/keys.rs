/// Key types for the three-tier hierarchy.
///
/// A `SecretKey` is derived from a passphrase and seals the user's private
/// key at rest. `KeyPair` is an X25519 keypair used for authenticated
/// public-key encryption between users and groups.
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::crypto::armor::Armored;
use crate::crypto::kdf::{self, KdfParams};
use crate::crypto::sensitive::KeyMaterial;
use crate::error::{Error, Result};

/// Passphrase-derived symmetric key, carrying the parameters it was
/// derived with.
#[derive(Debug, Clone)]
pub struct SecretKey {
    pub value: KeyMaterial,
    pub params: KdfParams,
}

impl SecretKey {
    /// Derive from a passphrase with the given parameters. CPU-bound and
    /// deliberately slow; callers on the request path run this off the
    /// async runtime.
    pub fn derive(passphrase: &str, params: KdfParams) -> Result<Self> {
        let value = kdf::derive_key(passphrase, &params)?;
        Ok(Self { value, params })
    }

    /// Derive with fresh parameters (new salt, current defaults).
    pub fn fresh(passphrase: &str) -> Result<Self> {
        Self::derive(passphrase, KdfParams::fresh())
    }
}

/// X25519 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_armored(&self) -> Armored {
        Armored::encode(&self.0)
    }

    pub fn from_armored(armored: &Armored) -> Result<Self> {
        let bytes = armored.decode()?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Crypto("public key is not 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_armored())
    }
}

/// X25519 private key. Zeroized on drop, never logged.
#[derive(Clone)]
pub struct PrivateKey(KeyMaterial);

impl PrivateKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Rebuild from the payload of an opened box (a sealed user or group
    /// private key).
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self(KeyMaterial::try_from(bytes)?))
    }

    pub(crate) fn to_static_secret(&self) -> StaticSecret {
        StaticSecret::from(*self.0.as_bytes())
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

/// A freshly generated keypair for authenticated public-key encryption.
pub struct KeyPair {
    pub pubk: PublicKey,
    pub privk: PrivateKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self {
            pubk: PublicKey(public.to_bytes()),
            privk: PrivateKey(KeyMaterial::from(secret.to_bytes())),
        }
    }
}
