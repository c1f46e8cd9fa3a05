/// ASCII armor for binary blobs.
///
/// Everything the crypto layer hands to storage or to the wire is armored:
/// ciphertexts, public keys and serialized KDF parameters all travel as
/// base64 strings. `Armored::encode` and `Armored::decode` round-trip
/// arbitrary byte strings, including non-UTF-8 ones.
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An ASCII-safe envelope around a byte string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Armored(String);

impl Armored {
    pub fn encode(bytes: &[u8]) -> Self {
        Self(STANDARD.encode(bytes))
    }

    pub fn decode(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.0)
            .map_err(|e| Error::CryptoBox(format!("bad armor: {e}")))
    }

    /// Wrap an already-armored string loaded from storage.
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Armored {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A random 128-bit URL-safe token, used for session ids and activation
/// tokens.
pub fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
