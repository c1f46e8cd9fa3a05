/// Argon2id passphrase derivation.
///
/// Every user records the parameters their secret key was derived with, so
/// old accounts keep working after the defaults change. `KdfParams` is the
/// persisted form; it is armored as JSON for storage.
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::armor::Armored;
use crate::crypto::sensitive::KeyMaterial;
use crate::error::{Error, Result};

/// Bumped whenever the derivation defaults change shape.
pub const KDF_VERSION: u32 = 1;

const DEFAULT_OPSLIMIT: u32 = 3;
const DEFAULT_MEMLIMIT_KIB: u32 = 65_536; // 64 MiB
const DIGEST_LEN: u32 = 32;
const SALT_LEN: usize = 16;

/// Persisted derivation parameters for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub version: u32,
    /// Base64-encoded random salt.
    pub salt: String,
    /// Argon2 time cost.
    pub opslimit: u32,
    /// Argon2 memory cost in KiB.
    pub memlimit: u32,
    pub digest_size: u32,
}

impl KdfParams {
    /// Fresh parameters with a new random salt and current defaults.
    pub fn fresh() -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self {
            version: KDF_VERSION,
            salt: STANDARD.encode(salt),
            opslimit: DEFAULT_OPSLIMIT,
            memlimit: DEFAULT_MEMLIMIT_KIB,
            digest_size: DIGEST_LEN,
        }
    }

    /// True if these parameters predate the current derivation version;
    /// callers should re-derive and re-encrypt.
    pub fn obsolete(&self) -> bool {
        self.version != KDF_VERSION
    }

    pub fn to_armored(&self) -> Armored {
        let json = serde_json::to_vec(self).expect("KdfParams serialization cannot fail");
        Armored::encode(&json)
    }

    pub fn from_armored(armored: &Armored) -> Result<Self> {
        let bytes = armored.decode()?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Crypto(format!("malformed KDF parameters: {e}")))
    }

    fn salt_bytes(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.salt)
            .map_err(|e| Error::Crypto(format!("malformed KDF salt: {e}")))
    }
}

/// Derive a symmetric key from a passphrase with Argon2id.
pub fn derive_key(passphrase: &str, params: &KdfParams) -> Result<KeyMaterial> {
    if params.digest_size != DIGEST_LEN {
        return Err(Error::Crypto(format!(
            "unsupported KDF digest size {}",
            params.digest_size
        )));
    }

    let a2_params = Params::new(
        params.memlimit,
        params.opslimit,
        1,
        Some(params.digest_size as usize),
    )
    .map_err(|e| Error::Crypto(format!("key derivation failed: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, a2_params);

    let salt = params.salt_bytes()?;
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), &salt, &mut output)
        .map_err(|e| Error::Crypto(format!("key derivation failed: {e}")))?;

    Ok(KeyMaterial::from(output))
}

#[cfg(test)]
pub(crate) fn weak_params() -> KdfParams {
    // 1 MiB, one pass. Fast and insecure, tests only.
    KdfParams {
        version: KDF_VERSION,
        salt: STANDARD.encode([0x42u8; SALT_LEN]),
        opslimit: 1,
        memlimit: 1024,
        digest_size: DIGEST_LEN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let params = weak_params();
        let k1 = derive_key("my passphrase", &params).unwrap();
        let k2 = derive_key("my passphrase", &params).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_derive_key_different_passphrase() {
        let params = weak_params();
        let k1 = derive_key("passphrase1", &params).unwrap();
        let k2 = derive_key("passphrase2", &params).unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_derive_key_different_salt() {
        let mut p1 = weak_params();
        p1.salt = STANDARD.encode([0x01u8; SALT_LEN]);
        let mut p2 = weak_params();
        p2.salt = STANDARD.encode([0x02u8; SALT_LEN]);
        let k1 = derive_key("passphrase", &p1).unwrap();
        let k2 = derive_key("passphrase", &p2).unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_fresh_params_unique_salt() {
        assert_ne!(KdfParams::fresh().salt, KdfParams::fresh().salt);
    }

    #[test]
    fn test_params_armor_roundtrip() {
        let params = KdfParams::fresh();
        let recovered = KdfParams::from_armored(&params.to_armored()).unwrap();
        assert_eq!(params, recovered);
    }

    #[test]
    fn test_obsolete_detection() {
        let mut params = KdfParams::fresh();
        assert!(!params.obsolete());
        params.version = KDF_VERSION + 1;
        assert!(params.obsolete());
    }
}
