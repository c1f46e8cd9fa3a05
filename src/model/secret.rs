/// Secrets and their structured metadata.
///
/// A secret is one logical row plus one independently sealed copy per
/// authorized group. Both the value and the metadata are sealed from the
/// author's keypair to the group keypair; decrypting either requires the
/// author's public key and the group private key from the reader's
/// keychain.
use serde::{Deserialize, Serialize};

use crate::crypto::{self, Armored, Plaintext, PrivateKey, PublicKey};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Secret {
    pub id: i64,
    /// The group through which the current reader reached this secret.
    pub group_id: i64,
    pub value_author_id: i64,
    pub meta_author_id: i64,
    pub ciphertext: Armored,
    pub encrypted_metadata: Armored,
    pub plaintext: Option<Plaintext>,
    pub metadata: Option<SecretMeta>,
}

impl Secret {
    /// Decrypt the value with the value author's public key and the
    /// reader's group private key.
    pub fn unlock_value(
        &mut self,
        author_pubk: &PublicKey,
        group_privk: &PrivateKey,
    ) -> Result<()> {
        let raw = crypto::open_pair(author_pubk, group_privk, &self.ciphertext)?;
        self.plaintext = Some(Plaintext::from(raw));
        Ok(())
    }

    /// Decrypt the metadata with the metadata author's public key and the
    /// reader's group private key.
    pub fn unlock_metadata(
        &mut self,
        author_pubk: &PublicKey,
        group_privk: &PrivateKey,
    ) -> Result<()> {
        let raw = crypto::open_pair(author_pubk, group_privk, &self.encrypted_metadata)?;
        self.metadata = Some(SecretMeta::deserialize_bytes(&raw)?);
        Ok(())
    }

    pub fn lock(&mut self) {
        self.plaintext = None;
        self.metadata = None;
    }
}

/// Structured metadata attached to a secret. All fields optional; absent
/// fields are omitted from the serialized form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl SecretMeta {
    pub fn serialize_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Crypto(format!("metadata encoding: {e}")))
    }

    pub fn deserialize_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Crypto(format!("malformed metadata: {e}")))
    }

    /// Per-field shell-glob match against a pattern. Absent pattern fields
    /// match anything; a pattern field only matches a present value.
    pub fn matches(&self, pattern: &SecretMeta) -> bool {
        field_matches(&pattern.app, &self.app)
            && field_matches(&pattern.database, &self.database)
            && field_matches(&pattern.login, &self.login)
            && field_matches(&pattern.server, &self.server)
            && field_matches(&pattern.url, &self.url)
    }

    /// Shallow merge: fields present in `partial` overwrite, absent fields
    /// keep their current value.
    pub fn merge(&self, partial: &SecretMeta) -> SecretMeta {
        SecretMeta {
            app: partial.app.clone().or_else(|| self.app.clone()),
            database: partial.database.clone().or_else(|| self.database.clone()),
            login: partial.login.clone().or_else(|| self.login.clone()),
            server: partial.server.clone().or_else(|| self.server.clone()),
            url: partial.url.clone().or_else(|| self.url.clone()),
        }
    }
}

fn field_matches(pattern: &Option<String>, value: &Option<String>) -> bool {
    match (pattern, value) {
        (None, _) => true,
        (Some(p), Some(v)) => glob_match(p, v),
        (Some(_), None) => false,
    }
}

/// Shell-style glob: `*` matches any run of characters, `?` a single one.
/// ASCII case-insensitive.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let mut pi = 0;
    let mut ti = 0;
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi].eq_ignore_ascii_case(&t[ti])) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            // Backtrack: let the last `*` swallow one more character.
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
