/// A named group secrets can be shared with.
///
/// Only the public key is persisted here; the private key lives exclusively
/// inside members' keychain items. Deleting the last keychain item for a
/// group destroys all means of reading secrets sealed for it.
use crate::crypto::PublicKey;

#[derive(Debug, Clone)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub pubk: PublicKey,
}
