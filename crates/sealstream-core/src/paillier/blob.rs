//! Binary serialization of Paillier keys.
//!
//! # Blob Layouts
//!
//! ```text
//! public:   "BCVK"(4) || version(1) || key_id(32) || n_len(4) || n_hex(n_len)
//! isolated: "BCVK"(4) || version(1) || key_id(32) || instance_id(32) || n_len(4) || n_hex(n_len)
//! private:  "BCVK"(4) || version(1) || lambda_len(4) || lambda_hex || mu_len(4) || mu_hex
//! ```
//!
//! Lengths are big-endian. `n_hex` is lowercase ASCII hex left-padded to
//! the fixed [`PUBLIC_HEX_WIDTH`]; `key_id` is SHA-256 over exactly those
//! padded hex bytes and is recomputed on decode. Private blobs carry only
//! `lambda` and `mu`, so decoding one requires the matching public key.
//! The isolated private blob is wire-identical to the plain one and is
//! distinguished only by its Rust type.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use num_bigint::BigUint;
use num_traits::One;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use super::{PaillierPrivateKey, PaillierPublicKey};

/// Magic marker of every key blob, ASCII "BCVK".
pub const BLOB_MAGIC: [u8; 4] = *b"BCVK";

/// Current blob version. Unknown versions are refused.
pub const BLOB_VERSION: u8 = 1;

/// Fixed hex width the modulus is padded to. Wide enough for a 3072-bit
/// modulus; changing it is a wire break.
pub const PUBLIC_HEX_WIDTH: usize = 768;

/// SHA-256 key fingerprint length.
pub const KEY_ID_SIZE: usize = 32;

/// Instance discriminator length in isolated public blobs.
pub const INSTANCE_ID_SIZE: usize = 32;

const HEADER_SIZE: usize = BLOB_MAGIC.len() + 1;

/// Errors raised while encoding or decoding key blobs.
#[derive(Error, Debug)]
pub enum KeyBlobError {
    #[error("key blob truncated: expected at least {expected} bytes, got {actual}")]
    DataTooShort { expected: usize, actual: usize },

    #[error("invalid key blob magic")]
    InvalidMagic,

    #[error("unsupported key blob version {have}")]
    UnsupportedVersion { have: u8 },

    #[error("key blob length field inconsistent with blob size")]
    InvalidLengthField,

    #[error("key blob carries malformed hex")]
    InvalidHexEncoding,

    /// The recomputed fingerprint does not match the stored one.
    #[error("public key id mismatch")]
    InvalidPublicKeyIdMismatch,

    #[error("modulus hex of {width} chars exceeds the fixed {PUBLIC_HEX_WIDTH}-char field")]
    ModulusTooWide { width: usize },

    #[error("invalid base64 armor")]
    InvalidArmor,
}

/// Paillier public key scoped to one election or tally instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedPublicKey {
    pub instance_id: [u8; INSTANCE_ID_SIZE],
    pub key: PaillierPublicKey,
}

/// Private key decoded from an isolated blob. Wire-identical to
/// [`PaillierPrivateKey`]'s encoding; the type records its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedPrivateKey {
    pub key: PaillierPrivateKey,
}

fn padded_modulus_hex(n: &BigUint) -> Result<Vec<u8>, KeyBlobError> {
    let hex = format!("{n:x}");
    if hex.len() > PUBLIC_HEX_WIDTH {
        return Err(KeyBlobError::ModulusTooWide { width: hex.len() });
    }
    let mut padded = vec![b'0'; PUBLIC_HEX_WIDTH - hex.len()];
    padded.extend_from_slice(hex.as_bytes());
    Ok(padded)
}

fn key_id(n_hex: &[u8]) -> [u8; KEY_ID_SIZE] {
    Sha256::digest(n_hex).into()
}

fn check_header(bytes: &[u8]) -> Result<(), KeyBlobError> {
    if bytes.len() < HEADER_SIZE {
        return Err(KeyBlobError::DataTooShort {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    if bytes[..4] != BLOB_MAGIC {
        return Err(KeyBlobError::InvalidMagic);
    }
    if bytes[4] != BLOB_VERSION {
        return Err(KeyBlobError::UnsupportedVersion { have: bytes[4] });
    }
    Ok(())
}

fn read_field<'a>(bytes: &'a [u8], cursor: &mut usize) -> Result<&'a [u8], KeyBlobError> {
    if *cursor + 4 > bytes.len() {
        return Err(KeyBlobError::DataTooShort {
            expected: *cursor + 4,
            actual: bytes.len(),
        });
    }
    let len = u32::from_be_bytes(bytes[*cursor..*cursor + 4].try_into().unwrap()) as usize;
    *cursor += 4;
    if *cursor + len > bytes.len() {
        return Err(KeyBlobError::InvalidLengthField);
    }
    let field = &bytes[*cursor..*cursor + len];
    *cursor += len;
    Ok(field)
}

fn parse_hex(field: &[u8]) -> Result<BigUint, KeyBlobError> {
    if field.is_empty() {
        return Err(KeyBlobError::InvalidHexEncoding);
    }
    BigUint::parse_bytes(field, 16).ok_or(KeyBlobError::InvalidHexEncoding)
}

/// Serialize a public key.
pub fn encode_public(key: &PaillierPublicKey) -> Result<Vec<u8>, KeyBlobError> {
    let n_hex = padded_modulus_hex(&key.n)?;
    let mut blob =
        Vec::with_capacity(HEADER_SIZE + KEY_ID_SIZE + 4 + n_hex.len());
    blob.extend_from_slice(&BLOB_MAGIC);
    blob.push(BLOB_VERSION);
    blob.extend_from_slice(&key_id(&n_hex));
    blob.extend_from_slice(&(n_hex.len() as u32).to_be_bytes());
    blob.extend_from_slice(&n_hex);
    Ok(blob)
}

/// Deserialize a public key, verifying its fingerprint and reconstructing
/// `g = n + 1`.
pub fn decode_public(bytes: &[u8]) -> Result<PaillierPublicKey, KeyBlobError> {
    check_header(bytes)?;
    let mut cursor = HEADER_SIZE;

    if cursor + KEY_ID_SIZE > bytes.len() {
        return Err(KeyBlobError::DataTooShort {
            expected: cursor + KEY_ID_SIZE,
            actual: bytes.len(),
        });
    }
    let stored_id = &bytes[cursor..cursor + KEY_ID_SIZE];
    cursor += KEY_ID_SIZE;

    let n_hex = read_field(bytes, &mut cursor)?;
    if cursor != bytes.len() {
        return Err(KeyBlobError::InvalidLengthField);
    }

    if !bool::from(key_id(n_hex).ct_eq(stored_id)) {
        return Err(KeyBlobError::InvalidPublicKeyIdMismatch);
    }

    let n = parse_hex(n_hex)?;
    let g = &n + BigUint::one();
    Ok(PaillierPublicKey { n, g })
}

/// Serialize a private key. The public half travels separately.
pub fn encode_private(key: &PaillierPrivateKey) -> Vec<u8> {
    let lambda_hex = format!("{:x}", key.lambda);
    let mu_hex = format!("{:x}", key.mu);
    let mut blob =
        Vec::with_capacity(HEADER_SIZE + 8 + lambda_hex.len() + mu_hex.len());
    blob.extend_from_slice(&BLOB_MAGIC);
    blob.push(BLOB_VERSION);
    blob.extend_from_slice(&(lambda_hex.len() as u32).to_be_bytes());
    blob.extend_from_slice(lambda_hex.as_bytes());
    blob.extend_from_slice(&(mu_hex.len() as u32).to_be_bytes());
    blob.extend_from_slice(mu_hex.as_bytes());
    blob
}

/// Deserialize a private key, rebinding it to `public`.
pub fn decode_private(
    bytes: &[u8],
    public: PaillierPublicKey,
) -> Result<PaillierPrivateKey, KeyBlobError> {
    check_header(bytes)?;
    let mut cursor = HEADER_SIZE;
    let lambda = parse_hex(read_field(bytes, &mut cursor)?)?;
    let mu = parse_hex(read_field(bytes, &mut cursor)?)?;
    if cursor != bytes.len() {
        return Err(KeyBlobError::InvalidLengthField);
    }
    Ok(PaillierPrivateKey { lambda, mu, public })
}

/// Serialize an isolated public key with its instance discriminator.
pub fn encode_isolated_public(key: &IsolatedPublicKey) -> Result<Vec<u8>, KeyBlobError> {
    let n_hex = padded_modulus_hex(&key.key.n)?;
    let mut blob = Vec::with_capacity(
        HEADER_SIZE + KEY_ID_SIZE + INSTANCE_ID_SIZE + 4 + n_hex.len(),
    );
    blob.extend_from_slice(&BLOB_MAGIC);
    blob.push(BLOB_VERSION);
    blob.extend_from_slice(&key_id(&n_hex));
    blob.extend_from_slice(&key.instance_id);
    blob.extend_from_slice(&(n_hex.len() as u32).to_be_bytes());
    blob.extend_from_slice(&n_hex);
    Ok(blob)
}

/// Deserialize an isolated public key.
pub fn decode_isolated_public(bytes: &[u8]) -> Result<IsolatedPublicKey, KeyBlobError> {
    check_header(bytes)?;
    let mut cursor = HEADER_SIZE;

    let fixed = KEY_ID_SIZE + INSTANCE_ID_SIZE;
    if cursor + fixed > bytes.len() {
        return Err(KeyBlobError::DataTooShort {
            expected: cursor + fixed,
            actual: bytes.len(),
        });
    }
    let stored_id = &bytes[cursor..cursor + KEY_ID_SIZE];
    cursor += KEY_ID_SIZE;
    let instance_id: [u8; INSTANCE_ID_SIZE] =
        bytes[cursor..cursor + INSTANCE_ID_SIZE].try_into().unwrap();
    cursor += INSTANCE_ID_SIZE;

    let n_hex = read_field(bytes, &mut cursor)?;
    if cursor != bytes.len() {
        return Err(KeyBlobError::InvalidLengthField);
    }
    if !bool::from(key_id(n_hex).ct_eq(stored_id)) {
        return Err(KeyBlobError::InvalidPublicKeyIdMismatch);
    }

    let n = parse_hex(n_hex)?;
    let g = &n + BigUint::one();
    Ok(IsolatedPublicKey {
        instance_id,
        key: PaillierPublicKey { n, g },
    })
}

/// Serialize an isolated private key. Wire-identical to
/// [`encode_private`].
pub fn encode_isolated_private(key: &IsolatedPrivateKey) -> Vec<u8> {
    encode_private(&key.key)
}

/// Deserialize an isolated private key.
pub fn decode_isolated_private(
    bytes: &[u8],
    public: PaillierPublicKey,
) -> Result<IsolatedPrivateKey, KeyBlobError> {
    Ok(IsolatedPrivateKey {
        key: decode_private(bytes, public)?,
    })
}

/// Base64 armor for transporting blobs as text.
#[must_use]
pub fn armor(blob: &[u8]) -> String {
    BASE64.encode(blob)
}

/// Decode base64-armored blob bytes.
pub fn unarmor(text: &str) -> Result<Vec<u8>, KeyBlobError> {
    BASE64.decode(text).map_err(|_| KeyBlobError::InvalidArmor)
}
