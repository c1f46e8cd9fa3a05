/// The two sealed-box constructions of the key hierarchy.
///
/// `seal_secret`/`open_secret`: symmetric authenticated encryption under a
/// passphrase-derived key (XChaCha20-Poly1305, random nonce). Seals the
/// user private key at rest.
///
/// `seal_pair`/`open_pair`: authenticated public-key encryption between two
/// X25519 keypairs. The static-static Diffie-Hellman shared secret is run
/// through BLAKE3 key derivation; a successful open proves the ciphertext
/// came from the peer keypair. Seals group private keys into keychains and
/// secret payloads for groups.
///
/// Both envelopes are `[nonce(24) | ciphertext+tag]`, armored. The 24-byte
/// XChaCha20 nonce is large enough for random generation without practical
/// collision risk.
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use zeroize::Zeroize;

use crate::crypto::armor::Armored;
use crate::crypto::keys::{PrivateKey, PublicKey, SecretKey};
use crate::crypto::sensitive::KeyMaterial;
use crate::error::{Error, Result};

const NONCE_LEN: usize = 24;

/// Domain separation for the pair-box wrap key.
const PAIR_BOX_CONTEXT: &str = "kstor 2026-01 pair box wrap key";

/// Symmetric authenticated encryption with a fresh random nonce.
pub fn seal_secret(key: &SecretKey, plaintext: &[u8]) -> Result<Armored> {
    seal_with(&key.value, plaintext)
}

/// Inverse of [`seal_secret`]. Fails on tampering or a wrong key.
pub fn open_secret(key: &SecretKey, sealed: &Armored) -> Result<Vec<u8>> {
    open_with(&key.value, sealed)
}

/// Authenticated public-key encryption from `sender_privk` to
/// `recipient_pubk`.
pub fn seal_pair(
    recipient_pubk: &PublicKey,
    sender_privk: &PrivateKey,
    plaintext: &[u8],
) -> Result<Armored> {
    let key = pair_key(recipient_pubk, sender_privk);
    seal_with(&key, plaintext)
}

/// Inverse of [`seal_pair`], from the recipient's side. A successful open
/// authenticates the sender keypair.
pub fn open_pair(
    sender_pubk: &PublicKey,
    recipient_privk: &PrivateKey,
    sealed: &Armored,
) -> Result<Vec<u8>> {
    let key = pair_key(sender_pubk, recipient_privk);
    open_with(&key, sealed)
}

/// X25519 shared secret, domain-separated into an encryption key.
/// Symmetric in its arguments: DH(a_priv, b_pub) == DH(b_priv, a_pub).
fn pair_key(pubk: &PublicKey, privk: &PrivateKey) -> KeyMaterial {
    let their_public = x25519_dalek::PublicKey::from(*pubk.as_bytes());
    let shared = privk.to_static_secret().diffie_hellman(&their_public);

    let mut output = [0u8; 32];
    let mut deriver = blake3::Hasher::new_derive_key(PAIR_BOX_CONTEXT);
    deriver.update(shared.as_bytes());
    deriver.finalize_xof().fill(&mut output);

    let key = KeyMaterial::from(output);
    output.zeroize();
    key
}

fn seal_with(key: &KeyMaterial, plaintext: &[u8]) -> Result<Armored> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| Error::Crypto(format!("encryption failed: {e}")))?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|e| Error::Crypto(format!("encryption failed: {e}")))?;

    let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(Armored::encode(&envelope))
}

fn open_with(key: &KeyMaterial, sealed: &Armored) -> Result<Vec<u8>> {
    let envelope = sealed.decode()?;
    if envelope.len() < NONCE_LEN {
        return Err(Error::CryptoBox("sealed value too short".to_string()));
    }
    let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| Error::CryptoBox(format!("decryption failed: {e}")))?;

    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::CryptoBox("decryption failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::weak_params;
    use crate::crypto::keys::KeyPair;

    fn secret_key(passphrase: &str) -> SecretKey {
        SecretKey::derive(passphrase, weak_params()).unwrap()
    }

    #[test]
    fn test_seal_open_secret_roundtrip() {
        let key = secret_key("hunter2");
        let sealed = seal_secret(&key, b"attack at dawn").unwrap();
        assert_eq!(open_secret(&key, &sealed).unwrap(), b"attack at dawn");
    }

    #[test]
    fn test_open_secret_wrong_key_fails() {
        let sealed = seal_secret(&secret_key("hunter2"), b"attack at dawn").unwrap();
        assert!(open_secret(&secret_key("hunter3"), &sealed).is_err());
    }

    #[test]
    fn test_open_secret_tampered_fails() {
        let key = secret_key("hunter2");
        let sealed = seal_secret(&key, b"attack at dawn").unwrap();
        let mut bytes = sealed.decode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(open_secret(&key, &Armored::encode(&bytes)).is_err());
    }

    #[test]
    fn test_nonces_are_fresh() {
        let key = secret_key("hunter2");
        let a = seal_secret(&key, b"same plaintext").unwrap();
        let b = seal_secret(&key, b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_seal_open_pair_roundtrip() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let sealed = seal_pair(&bob.pubk, &alice.privk, b"for bob").unwrap();
        let opened = open_pair(&alice.pubk, &bob.privk, &sealed).unwrap();
        assert_eq!(opened, b"for bob");
    }

    #[test]
    fn test_open_pair_wrong_recipient_fails() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mallory = KeyPair::generate();

        let sealed = seal_pair(&bob.pubk, &alice.privk, b"for bob").unwrap();
        assert!(open_pair(&alice.pubk, &mallory.privk, &sealed).is_err());
    }

    #[test]
    fn test_open_pair_wrong_sender_fails() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mallory = KeyPair::generate();

        let sealed = seal_pair(&bob.pubk, &alice.privk, b"for bob").unwrap();
        // Bob checks the sender: pretending it came from mallory fails.
        assert!(open_pair(&mallory.pubk, &bob.privk, &sealed).is_err());
    }

    #[test]
    fn test_open_pair_truncated_fails() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let sealed = seal_pair(&bob.pubk, &alice.privk, b"payload").unwrap();
        let bytes = sealed.decode().unwrap();
        let truncated = Armored::encode(&bytes[..10]);
        assert!(open_pair(&alice.pubk, &bob.privk, &truncated).is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let key = secret_key("hunter2");
        let sealed = seal_secret(&key, b"").unwrap();
        assert!(open_secret(&key, &sealed).unwrap().is_empty());
    }
}
