/// Row types mapping SQL results to domain objects.
///
/// Ciphertext and key columns are stored armored (TEXT); conversion into
/// domain objects parses them and can therefore fail on corrupted rows.
use sqlx::FromRow;

use crate::crypto::{Armored, KdfParams, PublicKey};
use crate::error::Result;
use crate::model::{ActivationToken, Group, Secret, User, UserStatus};

/// One `users` row, left-joined to `users_crypto_data`.
#[derive(Debug, FromRow)]
pub struct UserRow {
    pub id: i64,
    pub login: String,
    pub name: String,
    pub status: String,
    pub kdf_params: Option<String>,
    pub pubk: Option<String>,
    pub encrypted_privk: Option<String>,
}

impl UserRow {
    /// Build a locked user without its keychain (attached separately).
    pub fn into_user(self) -> Result<User> {
        let mut user = User::new(self.id, self.login, self.name, UserStatus::parse(&self.status)?);
        if let Some(params) = self.kdf_params {
            user.kdf_params = Some(KdfParams::from_armored(&Armored::from_string(params))?);
        }
        if let Some(pubk) = self.pubk {
            user.pubk = Some(PublicKey::from_armored(&Armored::from_string(pubk))?);
        }
        user.encrypted_privk = self.encrypted_privk.map(Armored::from_string);
        Ok(user)
    }
}

#[derive(Debug, FromRow)]
pub struct GroupRow {
    pub id: i64,
    pub name: String,
    pub pubk: String,
}

impl GroupRow {
    pub fn into_group(self) -> Result<Group> {
        Ok(Group {
            id: self.id,
            name: self.name,
            pubk: PublicKey::from_armored(&Armored::from_string(self.pubk))?,
        })
    }
}

/// One keychain entry: `group_members` joined to the group's public key.
#[derive(Debug, FromRow)]
pub struct KeychainRow {
    pub group_id: i64,
    pub group_pubk: String,
    pub encrypted_privk: String,
}

/// One reachable secret: a `secrets` row paired with the `secret_values`
/// row of the group the reader reached it through.
#[derive(Debug, FromRow)]
pub struct SecretRow {
    pub id: i64,
    pub group_id: i64,
    pub value_author_id: i64,
    pub meta_author_id: i64,
    pub ciphertext: String,
    pub encrypted_metadata: String,
}

impl SecretRow {
    pub fn into_secret(self) -> Secret {
        Secret {
            id: self.id,
            group_id: self.group_id,
            value_author_id: self.value_author_id,
            meta_author_id: self.meta_author_id,
            ciphertext: Armored::from_string(self.ciphertext),
            encrypted_metadata: Armored::from_string(self.encrypted_metadata),
            plaintext: None,
            metadata: None,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct ActivationRow {
    pub user_id: i64,
    pub token: String,
    pub not_before: i64,
    pub not_after: i64,
}

impl ActivationRow {
    pub fn into_token(self) -> ActivationToken {
        ActivationToken {
            user_id: self.user_id,
            token: self.token,
            not_before: self.not_before,
            not_after: self.not_after,
        }
    }
}
