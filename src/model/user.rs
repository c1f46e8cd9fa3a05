/// Users and their locked/unlocked lifecycle.
///
/// A user is *initialized* once KDF parameters, public key and sealed
/// private key are all present. The private key and the keychain's group
/// keys exist in memory only between `unlock` and `lock`; the dispatcher
/// locks every user before a response leaves the server.
use std::collections::BTreeMap;

use crate::crypto::{self, Armored, KeyPair, KdfParams, PrivateKey, PublicKey, SecretKey};
use crate::error::{Error, Result};
use crate::model::keychain::KeychainItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    New,
    Active,
    Admin,
    Archived,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::New => "new",
            UserStatus::Active => "active",
            UserStatus::Admin => "admin",
            UserStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(UserStatus::New),
            "active" => Ok(UserStatus::Active),
            "admin" => Ok(UserStatus::Admin),
            "archived" => Ok(UserStatus::Archived),
            other => Err(Error::Crypto(format!("unknown user status {other:?}"))),
        }
    }
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub login: String,
    pub name: String,
    pub status: UserStatus,
    pub kdf_params: Option<KdfParams>,
    pub pubk: Option<PublicKey>,
    pub encrypted_privk: Option<Armored>,
    privk: Option<PrivateKey>,
    pub keychain: BTreeMap<i64, KeychainItem>,
}

impl User {
    pub fn new(id: i64, login: String, name: String, status: UserStatus) -> Self {
        Self {
            id,
            login,
            name,
            status,
            kdf_params: None,
            pubk: None,
            encrypted_privk: None,
            privk: None,
            keychain: BTreeMap::new(),
        }
    }

    /// A user can participate in crypto operations only once all three
    /// persisted crypto fields are present.
    pub fn initialized(&self) -> bool {
        self.kdf_params.is_some() && self.pubk.is_some() && self.encrypted_privk.is_some()
    }

    pub fn unlocked(&self) -> bool {
        self.privk.is_some()
    }

    pub fn privk(&self) -> Option<&PrivateKey> {
        self.privk.as_ref()
    }

    /// Derive this user's secret key from a passphrase. An uninitialized
    /// user gets initialized first ([`User::reset_password`]).
    pub fn secret_key(&mut self, password: &str) -> Result<SecretKey> {
        if !self.initialized() {
            return self.reset_password(password);
        }
        let params = self.kdf_params.clone().expect("checked by initialized()");
        SecretKey::derive(password, params)
    }

    /// Decrypt the private key and every keychain item. No-op when already
    /// unlocked.
    pub fn unlock(&mut self, secret_key: &SecretKey) -> Result<()> {
        if self.unlocked() {
            return Ok(());
        }
        let sealed = self
            .encrypted_privk
            .as_ref()
            .ok_or_else(|| Error::Crypto(format!("user {} has no crypto data", self.login)))?;
        let raw = crypto::open_secret(secret_key, sealed)?;
        let privk = PrivateKey::from_slice(&raw)?;
        for item in self.keychain.values_mut() {
            item.unlock(&privk)?;
        }
        self.privk = Some(privk);
        Ok(())
    }

    /// Re-seal the private key and every keychain item under the given
    /// secret key, and adopt its KDF parameters. Requires an unlocked user.
    pub fn encrypt(&mut self, secret_key: &SecretKey) -> Result<()> {
        let privk = self
            .privk
            .as_ref()
            .ok_or_else(|| Error::Crypto(format!("user {} is locked", self.login)))?;
        let pubk = self
            .pubk
            .as_ref()
            .ok_or_else(|| Error::Crypto(format!("user {} has no public key", self.login)))?
            .clone();

        self.encrypted_privk = Some(crypto::seal_secret(secret_key, privk.as_bytes())?);
        self.kdf_params = Some(secret_key.params.clone());
        for item in self.keychain.values_mut() {
            item.reseal(&pubk)?;
        }
        Ok(())
    }

    /// Clear all plaintext key material.
    pub fn lock(&mut self) {
        self.privk = None;
        for item in self.keychain.values_mut() {
            item.lock();
        }
    }

    /// Initialize crypto data from scratch: fresh keypair, fresh KDF
    /// parameters, empty keychain. Prior group memberships are lost since
    /// their keys were sealed under the old keypair. Only reachable for
    /// uninitialized users (first login, activation).
    pub fn reset_password(&mut self, password: &str) -> Result<SecretKey> {
        let pair = KeyPair::generate();
        let secret_key = SecretKey::fresh(password)?;
        self.pubk = Some(pair.pubk);
        self.privk = Some(pair.privk);
        self.keychain.clear();
        self.encrypt(&secret_key)?;
        Ok(secret_key)
    }

    /// Change the passphrase of an initialized user. The keychain survives:
    /// its group keys are decrypted with the old key and re-sealed under
    /// the same keypair.
    pub fn change_password(&mut self, old: &str, new: &str) -> Result<SecretKey> {
        let params = self
            .kdf_params
            .clone()
            .ok_or_else(|| Error::Crypto(format!("user {} is not initialized", self.login)))?;
        let old_key = SecretKey::derive(old, params)?;
        self.unlock(&old_key)?;
        let new_key = SecretKey::fresh(new)?;
        self.encrypt(&new_key)?;
        Ok(new_key)
    }
}
