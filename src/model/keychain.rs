/// A user's sealed copy of one group's private key.
///
/// The group private key is never stored on its own; each member holds it
/// sealed from the group keypair to their own keypair. The plaintext key
/// only exists between `unlock` and `lock`.
use crate::crypto::{self, Armored, PrivateKey, PublicKey};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct KeychainItem {
    pub group_id: i64,
    pub group_pubk: PublicKey,
    pub encrypted_privk: Armored,
    privk: Option<PrivateKey>,
}

impl KeychainItem {
    /// Rebuild from stored ciphertext (locked).
    pub fn from_stored(group_id: i64, group_pubk: PublicKey, encrypted_privk: Armored) -> Self {
        Self {
            group_id,
            group_pubk,
            encrypted_privk,
            privk: None,
        }
    }

    /// Seal a group private key for a member. Used when a group is created
    /// and whenever a member is added.
    pub fn seal(
        group_id: i64,
        group_pubk: &PublicKey,
        group_privk: &PrivateKey,
        member_pubk: &PublicKey,
    ) -> Result<Self> {
        let encrypted_privk =
            crypto::seal_pair(member_pubk, group_privk, group_privk.as_bytes())?;
        Ok(Self {
            group_id,
            group_pubk: group_pubk.clone(),
            encrypted_privk,
            privk: Some(group_privk.clone()),
        })
    }

    /// Decrypt the group private key with the owning user's private key.
    pub fn unlock(&mut self, user_privk: &PrivateKey) -> Result<()> {
        if self.privk.is_some() {
            return Ok(());
        }
        let raw = crypto::open_pair(&self.group_pubk, user_privk, &self.encrypted_privk)?;
        self.privk = Some(PrivateKey::from_slice(&raw)?);
        Ok(())
    }

    /// Re-seal the group private key for the owning user's (possibly new)
    /// public key. Requires an unlocked item.
    pub fn reseal(&mut self, member_pubk: &PublicKey) -> Result<()> {
        let group_privk = self
            .privk
            .as_ref()
            .ok_or(Error::UnknownGroupPrivk(self.group_id))?;
        self.encrypted_privk =
            crypto::seal_pair(member_pubk, group_privk, group_privk.as_bytes())?;
        Ok(())
    }

    pub fn lock(&mut self) {
        self.privk = None;
    }

    pub fn privk(&self) -> Option<&PrivateKey> {
        self.privk.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_seal_unlock_roundtrip() {
        let group = KeyPair::generate();
        let member = KeyPair::generate();

        let mut item = KeychainItem::seal(7, &group.pubk, &group.privk, &member.pubk).unwrap();
        item.lock();
        assert!(item.privk().is_none());

        item.unlock(&member.privk).unwrap();
        assert_eq!(
            item.privk().unwrap().as_bytes(),
            group.privk.as_bytes()
        );
    }

    #[test]
    fn test_unlock_wrong_member_fails() {
        let group = KeyPair::generate();
        let member = KeyPair::generate();
        let other = KeyPair::generate();

        let mut item = KeychainItem::seal(7, &group.pubk, &group.privk, &member.pubk).unwrap();
        item.lock();
        assert!(item.unlock(&other.privk).is_err());
    }

    #[test]
    fn test_reseal_for_new_keypair() {
        let group = KeyPair::generate();
        let member = KeyPair::generate();
        let fresh = KeyPair::generate();

        let mut item = KeychainItem::seal(7, &group.pubk, &group.privk, &member.pubk).unwrap();
        item.reseal(&fresh.pubk).unwrap();
        item.lock();

        assert!(item.unlock(&member.privk).is_err());
        item.unlock(&fresh.privk).unwrap();
        assert!(item.privk().is_some());
    }

    #[test]
    fn test_reseal_locked_fails() {
        let group = KeyPair::generate();
        let member = KeyPair::generate();

        let mut item = KeychainItem::seal(7, &group.pubk, &group.privk, &member.pubk).unwrap();
        item.lock();
        assert!(item.reseal(&member.pubk).is_err());
    }
}
