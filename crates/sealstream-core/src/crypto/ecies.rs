//! Single-recipient ECIES over secp256k1.
//!
//! # Wire Format
//!
//! ```text
//! ephemeral_pub(33, SEC1 compressed) || iv(12) || ciphertext || tag(16)
//! ```
//!
//! The AES-256-GCM message key is derived with HKDF-SHA-256 from the full
//! 65-byte uncompressed ECDH point (empty salt, fixed info string). Inside
//! the GCM plaintext the payload carries an 8-byte big-endian length prefix,
//! which the decrypt path verifies against the actual payload length.

use rand::RngCore;
use tracing::{instrument, trace};
use zeroize::Zeroizing;

use super::{
    COMPRESSED_PUBLIC_KEY_SIZE, CryptoCore, CryptoError, IV_SIZE, SYMMETRIC_KEY_SIZE, TAG_SIZE,
    parse_private_key, parse_public_key,
};
use k256::{SecretKey, elliptic_curve::sec1::ToEncodedPoint};

/// HKDF info string binding derived keys to this message format.
pub const KDF_INFO: &[u8] = b"EciesMessageKey";

/// Length-prefix field carried inside the GCM plaintext.
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Fixed overhead of an ECIES message around its payload.
pub const MESSAGE_OVERHEAD: usize =
    COMPRESSED_PUBLIC_KEY_SIZE + IV_SIZE + LENGTH_PREFIX_SIZE + TAG_SIZE;

fn derive_message_key(
    crypto: &CryptoCore,
    shared_point: &[u8],
) -> Result<Zeroizing<[u8; SYMMETRIC_KEY_SIZE]>, CryptoError> {
    let okm = crypto.hkdf_sha256(shared_point, None, KDF_INFO, SYMMETRIC_KEY_SIZE)?;
    let mut key = Zeroizing::new([0u8; SYMMETRIC_KEY_SIZE]);
    key.copy_from_slice(&okm);
    Ok(key)
}

#[instrument(level = "trace", skip_all, fields(plaintext_len = plaintext.len()))]
pub fn encrypt_single(
    crypto: &CryptoCore,
    recipient_public_key: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    parse_public_key(recipient_public_key)?;

    // Fresh ephemeral scalar per message.
    let mut scalar_bytes = Zeroizing::new([0u8; 32]);
    let ephemeral = loop {
        rand::rng().fill_bytes(&mut *scalar_bytes);
        if let Ok(key) = SecretKey::from_slice(&*scalar_bytes) {
            break key;
        }
    };
    let ephemeral_public = ephemeral.public_key().to_encoded_point(true);

    let shared = crypto.secp256k1_shared_secret(&*scalar_bytes, recipient_public_key)?;
    let key = derive_message_key(crypto, &*shared)?;

    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);

    let mut framed = Zeroizing::new(Vec::with_capacity(LENGTH_PREFIX_SIZE + plaintext.len()));
    framed.extend_from_slice(&(plaintext.len() as u64).to_be_bytes());
    framed.extend_from_slice(plaintext);

    let (ciphertext, tag) = crypto.aes_gcm_encrypt(&key, &iv, &framed, None)?;

    let mut message =
        Vec::with_capacity(COMPRESSED_PUBLIC_KEY_SIZE + IV_SIZE + ciphertext.len() + TAG_SIZE);
    message.extend_from_slice(ephemeral_public.as_bytes());
    message.extend_from_slice(&iv);
    message.extend_from_slice(&ciphertext);
    message.extend_from_slice(&tag);

    trace!(message_len = message.len(), "ECIES message sealed");
    Ok(message)
}

#[instrument(level = "trace", skip_all, fields(message_len = message.len()))]
pub fn decrypt_single(
    crypto: &CryptoCore,
    private_key: &[u8],
    message: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    parse_private_key(private_key)?;

    if message.len() < MESSAGE_OVERHEAD {
        return Err(CryptoError::MessageTooShort {
            expected: MESSAGE_OVERHEAD,
            actual: message.len(),
        });
    }

    let ephemeral_public = &message[..COMPRESSED_PUBLIC_KEY_SIZE];
    let iv: [u8; IV_SIZE] = message[COMPRESSED_PUBLIC_KEY_SIZE..COMPRESSED_PUBLIC_KEY_SIZE + IV_SIZE]
        .try_into()
        .unwrap();
    let tag_offset = message.len() - TAG_SIZE;
    let ciphertext = &message[COMPRESSED_PUBLIC_KEY_SIZE + IV_SIZE..tag_offset];
    let tag: [u8; TAG_SIZE] = message[tag_offset..].try_into().unwrap();

    let shared = crypto.secp256k1_shared_secret(private_key, ephemeral_public)?;
    let key = derive_message_key(crypto, &*shared)?;

    let framed = Zeroizing::new(crypto.aes_gcm_decrypt(&key, &iv, ciphertext, &tag, None)?);

    // The framing mismatch is reported as a plain authentication failure,
    // indistinguishable from a tag mismatch.
    if framed.len() < LENGTH_PREFIX_SIZE {
        return Err(CryptoError::AuthenticationFailed);
    }
    let declared = u64::from_be_bytes(framed[..LENGTH_PREFIX_SIZE].try_into().unwrap());
    let payload = &framed[LENGTH_PREFIX_SIZE..];
    if declared != payload.len() as u64 {
        return Err(CryptoError::AuthenticationFailed);
    }

    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let crypto = CryptoCore::new();
        let (secret, public) = crypto.generate_keypair();
        let message = encrypt_single(&crypto, &public, b"attack at dawn").unwrap();
        let plaintext = decrypt_single(&crypto, &*secret, &message).unwrap();
        assert_eq!(plaintext, b"attack at dawn");
    }

    #[test]
    fn roundtrip_empty_payload() {
        let crypto = CryptoCore::new();
        let (secret, public) = crypto.generate_keypair();
        let message = encrypt_single(&crypto, &public, b"").unwrap();
        assert_eq!(message.len(), MESSAGE_OVERHEAD);
        let plaintext = decrypt_single(&crypto, &*secret, &message).unwrap();
        assert!(plaintext.is_empty());
    }

    #[test]
    fn fresh_randomness_per_message() {
        let crypto = CryptoCore::new();
        let (_, public) = crypto.generate_keypair();
        let a = encrypt_single(&crypto, &public, b"same input").unwrap();
        let b = encrypt_single(&crypto, &public, b"same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let crypto = CryptoCore::new();
        let (_, public) = crypto.generate_keypair();
        let (other_secret, _) = crypto.generate_keypair();
        let message = encrypt_single(&crypto, &public, b"secret").unwrap();
        let result = decrypt_single(&crypto, &*other_secret, &message);
        assert!(matches!(result, Err(CryptoError::AuthenticationFailed)));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let crypto = CryptoCore::new();
        let (secret, public) = crypto.generate_keypair();
        let mut message = encrypt_single(&crypto, &public, b"secret").unwrap();
        let mid = message.len() / 2;
        message[mid] ^= 0x01;
        assert!(decrypt_single(&crypto, &*secret, &message).is_err());
    }

    #[test]
    fn accepts_uncompressed_recipient_key() {
        let crypto = CryptoCore::new();
        let (secret, public) = crypto.generate_keypair();
        let uncompressed = super::super::parse_public_key(&public)
            .unwrap()
            .to_encoded_point(false);
        let message = encrypt_single(&crypto, uncompressed.as_bytes(), b"hi").unwrap();
        let plaintext = decrypt_single(&crypto, &*secret, &message).unwrap();
        assert_eq!(plaintext, b"hi");
    }
}
