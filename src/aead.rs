//! Symmetric encryption between the client and individual nodes.
//!
//! Every per-node payload travels as AES-256-GCM under a key both sides
//! derive independently (a Diffie-Hellman digest); a random 12-byte nonce
//! is prepended to the ciphertext and the whole frame is base64. A failed
//! decryption is meaningful to callers: on the authentication path it is
//! the first observable sign of a wrong password.
use aes_gcm::aead::{Aead, Nonce};
use aes_gcm::{Aes256Gcm, Key, KeyInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use curve25519_dalek::{EdwardsPoint, Scalar};
use rand_core::{OsRng, RngCore};

use crate::curve;

const NONCE_SIZE: usize = 12;

/// Why a ciphertext could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadError {
    /// The frame was not valid base64 or too short to hold a nonce.
    Malformed,
    /// The key did not open the ciphertext.
    Failed,
}

/// A 256-bit AEAD key.
#[derive(Clone)]
pub struct AeadKey(Key<Aes256Gcm>);

impl AeadKey {
    /// Key from 32 raw bytes, usually a SHA-256 digest.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Key::<Aes256Gcm>::clone_from_slice(&bytes))
    }

    /// Key from a UTF-8 string, via SHA-256.
    pub fn from_text(text: &str) -> Self {
        Self::from_bytes(curve::sha256(&[text.as_bytes()]))
    }

    /// Key from a scalar's 32-byte form.
    pub fn from_scalar(x: &Scalar) -> Self {
        Self::from_bytes(x.to_bytes())
    }
}

/// Encrypt, returning base64(nonce ‖ ciphertext).
pub fn encrypt(plaintext: &[u8], key: &AeadKey) -> String {
    let cipher = Aes256Gcm::new(&key.0);
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::<Aes256Gcm>::from_slice(&nonce), plaintext)
        .expect("AES-GCM encryption failed");
    let mut frame = nonce.to_vec();
    frame.extend_from_slice(&ciphertext);
    STANDARD.encode(frame)
}

/// Open base64(nonce ‖ ciphertext), distinguishing transport damage from a
/// key that simply does not fit.
pub fn decrypt(data: &str, key: &AeadKey) -> Result<Vec<u8>, AeadError> {
    let frame = STANDARD.decode(data).map_err(|_| AeadError::Malformed)?;
    if frame.len() < NONCE_SIZE {
        return Err(AeadError::Malformed);
    }
    let (nonce, ciphertext) = frame.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(&key.0);
    cipher
        .decrypt(Nonce::<Aes256Gcm>::from_slice(nonce), ciphertext)
        .map_err(|_| AeadError::Failed)
}

/// Hybrid ElGamal encryption to a public point, for the vendor
/// decryption-proof test.
///
/// The frame is `g^r ‖ version ‖ length ‖ pad(data) ⊕ SHA-256(pub^r)` for
/// payloads up to 32 bytes, and `g^r ‖ aead` beyond that, base64 encoded.
pub fn elgamal_encrypt(data: &[u8], public: &EdwardsPoint) -> String {
    let r = Scalar::random(&mut OsRng);
    let c1 = curve::point_to_bytes(&curve::base_mul(&r));
    let shared = curve::sha256(&[&curve::point_to_bytes(&(public * r))]);

    let mut frame = c1.to_vec();
    if data.len() <= 32 {
        let mut padded = [0u8; 32];
        padded[..data.len()].copy_from_slice(data);
        for (byte, pad) in padded.iter_mut().zip(shared.iter()) {
            *byte ^= pad;
        }
        frame.push(0); // version
        frame.push(data.len() as u8);
        frame.extend_from_slice(&padded);
    } else {
        let inner = encrypt(data, &AeadKey::from_bytes(shared));
        frame.extend_from_slice(inner.as_bytes());
    }
    STANDARD.encode(frame)
}
