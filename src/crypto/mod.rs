/// Cryptographic primitives for the key hierarchy.
///
/// Passphrase → secret key (Argon2id) → user keypair → group keypairs →
/// per-secret sealed payloads. All values crossing this module's boundary
/// are armored strings, not raw bytes.
pub mod armor;
pub mod boxes;
pub mod kdf;
pub mod keys;
pub mod sensitive;

pub use armor::{random_token, Armored};
pub use boxes::{open_pair, open_secret, seal_pair, seal_secret};
pub use kdf::KdfParams;
pub use keys::{KeyPair, PrivateKey, PublicKey, SecretKey};
pub use sensitive::{KeyMaterial, Plaintext};
