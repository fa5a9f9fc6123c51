//! Cryptographic primitive service consumed by the codecs, the streaming
//! engine, and the Paillier bridge.
//!
//! [`CryptoCore`] bundles every primitive the rest of the crate needs:
//! single-recipient ECIES over secp256k1, AES-256-GCM with optional AAD,
//! SHA-256/512, HMAC-SHA-512, HKDF, raw ECDH shared points, and CSPRNG
//! bytes. It is stateless and immutable, so one instance can be shared by
//! any number of concurrent sessions.

pub mod ecies;
pub mod id;

use aead::Payload;
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use k256::{PublicKey, SecretKey, elliptic_curve::sec1::ToEncodedPoint};
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tracing::warn;
use zeroize::Zeroizing;

/// AES-256 key length in bytes.
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// AES-GCM IV length in bytes.
pub const IV_SIZE: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_SIZE: usize = 16;

/// secp256k1 scalar (private key) length in bytes.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// SEC1 compressed public key length in bytes.
pub const COMPRESSED_PUBLIC_KEY_SIZE: usize = 33;

/// SEC1 uncompressed public key length in bytes.
pub const UNCOMPRESSED_PUBLIC_KEY_SIZE: usize = 65;

/// Errors raised by the primitive layer.
///
/// Authentication failures are deliberately opaque: callers (and attackers)
/// cannot tell which part of the authenticated payload failed to verify.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The private key is not a valid secp256k1 scalar of 32 bytes.
    #[error("invalid secp256k1 private key")]
    InvalidPrivateKey,

    /// The public key is not a valid SEC1 point of 33 or 65 bytes.
    #[error("invalid secp256k1 public key: expected 33 or 65 SEC1 bytes")]
    InvalidPublicKey,

    /// Decrypt-and-verify failed.
    ///
    /// Covers GCM tag mismatches and inconsistent ECIES framing alike, so
    /// the error never reveals which check rejected the data.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The ECIES message is shorter than its fixed overhead.
    #[error("ECIES message too short: expected at least {expected} bytes, got {actual}")]
    MessageTooShort { expected: usize, actual: usize },

    /// HKDF refused the requested output length.
    #[error("key derivation failed")]
    KeyDerivationFailed,
}

/// Stateless primitive provider.
///
/// Cloning or sharing by reference is free; the struct carries no state.
#[derive(Debug, Clone, Copy, Default)]
pub struct CryptoCore;

impl CryptoCore {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Generate a fresh secp256k1 key pair.
    ///
    /// Returns the 32-byte private scalar and the 33-byte SEC1 compressed
    /// public key.
    #[must_use]
    pub fn generate_keypair(&self) -> (Zeroizing<[u8; PRIVATE_KEY_SIZE]>, Vec<u8>) {
        let mut secret = Zeroizing::new([0u8; PRIVATE_KEY_SIZE]);
        // Re-draw on the negligible chance the bytes fall outside the
        // scalar field (zero or >= group order).
        let key = loop {
            rand::rng().fill_bytes(&mut *secret);
            if let Ok(key) = SecretKey::from_slice(&*secret) {
                break key;
            }
        };
        let public = key.public_key().to_encoded_point(true).as_bytes().to_vec();
        (secret, public)
    }

    /// Fill a fresh buffer with `n` CSPRNG bytes.
    #[must_use]
    pub fn random_bytes(&self, n: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; n];
        rand::rng().fill_bytes(&mut bytes);
        bytes
    }

    pub fn sha256(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    pub fn sha512(&self, data: &[u8]) -> [u8; 64] {
        Sha512::digest(data).into()
    }

    pub fn hmac_sha512(&self, key: &[u8], data: &[u8]) -> [u8; 64] {
        let mut mac: Hmac<Sha512> =
            KeyInit::new_from_slice(key).expect("HMAC accepts keys of any length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// HKDF-SHA-512 extract-and-expand.
    pub fn hkdf_sha512(
        &self,
        ikm: &[u8],
        salt: Option<&[u8]>,
        info: &[u8],
        length: usize,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let hk = Hkdf::<Sha512>::new(salt, ikm);
        let mut okm = Zeroizing::new(vec![0u8; length]);
        hk.expand(info, &mut okm)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(okm)
    }

    /// HKDF-SHA-256 extract-and-expand.
    pub fn hkdf_sha256(
        &self,
        ikm: &[u8],
        salt: Option<&[u8]>,
        info: &[u8],
        length: usize,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let hk = Hkdf::<Sha256>::new(salt, ikm);
        let mut okm = Zeroizing::new(vec![0u8; length]);
        hk.expand(info, &mut okm)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(okm)
    }

    /// AES-256-GCM encrypt, returning the ciphertext and the detached
    /// 16-byte authentication tag.
    pub fn aes_gcm_encrypt(
        &self,
        key: &[u8; SYMMETRIC_KEY_SIZE],
        iv: &[u8; IV_SIZE],
        plaintext: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<(Vec<u8>, [u8; TAG_SIZE]), CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let payload = Payload {
            msg: plaintext,
            aad: aad.unwrap_or(&[]),
        };
        let mut combined = cipher
            .encrypt(Nonce::from_slice(iv), payload)
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        let tag_offset = combined.len() - TAG_SIZE;
        let tag: [u8; TAG_SIZE] = combined[tag_offset..].try_into().unwrap();
        combined.truncate(tag_offset);
        Ok((combined, tag))
    }

    /// AES-256-GCM decrypt-and-verify with a detached tag.
    pub fn aes_gcm_decrypt(
        &self,
        key: &[u8; SYMMETRIC_KEY_SIZE],
        iv: &[u8; IV_SIZE],
        ciphertext: &[u8],
        tag: &[u8; TAG_SIZE],
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let mut combined = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(tag);
        let payload = Payload {
            msg: &combined,
            aad: aad.unwrap_or(&[]),
        };
        cipher.decrypt(Nonce::from_slice(iv), payload).map_err(|_| {
            warn!("AES-GCM authentication tag mismatch");
            CryptoError::AuthenticationFailed
        })
    }

    /// Compute the full uncompressed ECDH point `priv * pub` on secp256k1.
    ///
    /// All 65 bytes of the SEC1 uncompressed encoding are returned, not
    /// just the x coordinate: downstream key derivation feeds the whole
    /// point into HKDF.
    pub fn secp256k1_shared_secret(
        &self,
        private_key: &[u8],
        public_key: &[u8],
    ) -> Result<Zeroizing<[u8; UNCOMPRESSED_PUBLIC_KEY_SIZE]>, CryptoError> {
        let secret = parse_private_key(private_key)?;
        let public = parse_public_key(public_key)?;
        let scalar: k256::Scalar = *secret.to_nonzero_scalar().as_ref();
        let shared = (public.to_projective() * scalar).to_affine();
        let encoded = shared.to_encoded_point(false);
        let mut out = Zeroizing::new([0u8; UNCOMPRESSED_PUBLIC_KEY_SIZE]);
        out.copy_from_slice(encoded.as_bytes());
        Ok(out)
    }

    /// Single-recipient ECIES encryption with length-prefixed framing.
    pub fn ecies_encrypt_single(
        &self,
        recipient_public_key: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        ecies::encrypt_single(self, recipient_public_key, plaintext)
    }

    /// Single-recipient ECIES decryption, the dual of
    /// [`Self::ecies_encrypt_single`].
    pub fn ecies_decrypt_single(
        &self,
        private_key: &[u8],
        message: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        ecies::decrypt_single(self, private_key, message)
    }
}

pub(crate) fn parse_private_key(bytes: &[u8]) -> Result<SecretKey, CryptoError> {
    if bytes.len() != PRIVATE_KEY_SIZE {
        return Err(CryptoError::InvalidPrivateKey);
    }
    SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPrivateKey)
}

pub(crate) fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    match bytes.len() {
        COMPRESSED_PUBLIC_KEY_SIZE | UNCOMPRESSED_PUBLIC_KEY_SIZE => {
            PublicKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)
        }
        _ => Err(CryptoError::InvalidPublicKey),
    }
}

/// Check that a byte string has a plausible SEC1 public-key length.
///
/// Point validity is still verified when the key is actually used; this is
/// the cheap eager gate for input validation.
#[must_use]
pub fn is_valid_public_key_length(len: usize) -> bool {
    len == COMPRESSED_PUBLIC_KEY_SIZE || len == UNCOMPRESSED_PUBLIC_KEY_SIZE
}
