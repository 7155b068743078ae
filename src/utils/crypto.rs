//! Key material and ciphers behind the secure relay channel.
//!
//! Two layers live here:
//! - sealing: encrypt to a recipient's X25519 public key (ephemeral DH +
//!   HKDF-SHA256 + ChaCha20-Poly1305), bounded to [`MAX_SEALED_PLAINTEXT`]
//! - session ciphers: ChaCha20-Poly1305 keyed per direction, with a counter nonce

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::utils::{P2PError, Result};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Largest plaintext accepted by [`seal`]; the same budget RSA-OAEP gives a
/// 2048-bit modulus with SHA-256.
pub const MAX_SEALED_PLAINTEXT: usize = 190;

const SEAL_INFO: &[u8] = b"peershare-seal-v1";
const INITIATOR_INFO: &[u8] = b"peershare-initiator->responder";
const RESPONDER_INFO: &[u8] = b"peershare-responder->initiator";

/// Per-connection asymmetric identity.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Decrypts a blob produced by [`seal`] for this key pair.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < PUBLIC_KEY_SIZE + TAG_SIZE {
            return Err(P2PError::CryptoError(format!(
                "sealed message too short: {} bytes",
                sealed.len()
            )));
        }
        if sealed.len() > PUBLIC_KEY_SIZE + TAG_SIZE + MAX_SEALED_PLAINTEXT {
            return Err(P2PError::CryptoError(format!(
                "sealed message too long: {} bytes",
                sealed.len()
            )));
        }

        let mut ephemeral = [0u8; PUBLIC_KEY_SIZE];
        ephemeral.copy_from_slice(&sealed[..PUBLIC_KEY_SIZE]);
        let ephemeral = PublicKey::from(ephemeral);

        let shared = self.secret.diffie_hellman(&ephemeral);
        if !shared.was_contributory() {
            return Err(P2PError::CryptoError(
                "low-order ephemeral key in sealed message".to_string(),
            ));
        }

        let key = seal_key(shared.as_bytes(), &ephemeral, &self.public)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(&[0u8; NONCE_SIZE]), &sealed[PUBLIC_KEY_SIZE..])
            .map_err(|_| P2PError::CryptoError("failed to open sealed message".to_string()))
    }
}

/// Encrypts `plaintext` so only the holder of `recipient`'s private key can read it.
///
/// Input longer than [`MAX_SEALED_PLAINTEXT`] is rejected outright.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.len() > MAX_SEALED_PLAINTEXT {
        return Err(P2PError::CryptoError(format!(
            "plaintext of {} bytes exceeds sealing limit of {} bytes",
            plaintext.len(),
            MAX_SEALED_PLAINTEXT
        )));
    }

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(P2PError::CryptoError(
            "recipient public key is a low-order point".to_string(),
        ));
    }

    // Fresh ephemeral key per message, so a fixed nonce never repeats under one key.
    let key = seal_key(shared.as_bytes(), &ephemeral_public, recipient)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&[0u8; NONCE_SIZE]), plaintext)
        .map_err(|_| P2PError::CryptoError("failed to seal message".to_string()))?;

    let mut sealed = Vec::with_capacity(PUBLIC_KEY_SIZE + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn seal_key(
    shared: &[u8; 32],
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> Result<[u8; KEY_SIZE]> {
    let mut salt = [0u8; PUBLIC_KEY_SIZE * 2];
    salt[..PUBLIC_KEY_SIZE].copy_from_slice(ephemeral.as_bytes());
    salt[PUBLIC_KEY_SIZE..].copy_from_slice(recipient.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(SEAL_INFO, &mut key)
        .map_err(|e| P2PError::CryptoError(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

/// Short hex fingerprint of a public key, for logs.
pub fn fingerprint(public: &PublicKey) -> String {
    let digest = Sha256::digest(public.as_bytes());
    hex::encode(&digest[..8])
}

pub fn generate_session_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

pub struct DirectionalKeys {
    pub initiator_to_responder: [u8; KEY_SIZE],
    pub responder_to_initiator: [u8; KEY_SIZE],
}

/// Splits one negotiated session key into a key per direction so the two
/// counter-nonce sequences never share a key.
pub fn derive_directional_keys(session_key: &[u8; KEY_SIZE]) -> Result<DirectionalKeys> {
    let hkdf = Hkdf::<Sha256>::new(None, session_key);

    let mut initiator_to_responder = [0u8; KEY_SIZE];
    let mut responder_to_initiator = [0u8; KEY_SIZE];
    hkdf.expand(INITIATOR_INFO, &mut initiator_to_responder)
        .map_err(|e| P2PError::CryptoError(format!("key derivation failed: {}", e)))?;
    hkdf.expand(RESPONDER_INFO, &mut responder_to_initiator)
        .map_err(|e| P2PError::CryptoError(format!("key derivation failed: {}", e)))?;

    Ok(DirectionalKeys {
        initiator_to_responder,
        responder_to_initiator,
    })
}

/// One direction of an established session.
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl SessionCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| P2PError::CryptoError("failed to encrypt message".to_string()))
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| P2PError::CryptoError("failed to decrypt message".to_string()))
    }

    fn next_nonce(&mut self) -> Result<[u8; NONCE_SIZE]> {
        if self.counter == u64::MAX {
            return Err(P2PError::CryptoError("session nonce space exhausted".to_string()));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[NONCE_SIZE - 8..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        Ok(nonce)
    }
}
