//! Single-recipient chunk codec.
//!
//! # Frame Layout
//!
//! ```text
//! Header(32) || EciesCiphertext(variable) || Checksum(0 or 32)
//! ```
//!
//! Header fields, big-endian:
//!
//! ```text
//! magic: u32 = "ECIE" | version: u16 | index: u32 |
//! original_size: u32 | encrypted_size: u32 | flags: u16 | reserved: [u8; 12]
//! ```
//!
//! The optional checksum is SHA-256 over the plaintext and is verified in
//! constant time on decryption.

use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use super::{
    CHECKSUM_SIZE, FORMAT_VERSION, MAX_CHUNK_PLAINTEXT, MAX_TOTAL_CHUNK_LEN, SINGLE_HEADER_SIZE,
    SINGLE_MAGIC,
};
use crate::crypto::{CryptoCore, CryptoError};

/// Flag bit marking the final chunk of a stream.
pub const FLAG_IS_LAST: u16 = 0b01;

/// Flag bit marking the presence of a trailing plaintext checksum.
pub const FLAG_HAS_CHECKSUM: u16 = 0b10;

const KNOWN_FLAGS: u16 = FLAG_IS_LAST | FLAG_HAS_CHECKSUM;

/// Errors raised while building or parsing single-recipient chunks.
///
/// Every variant is fatal to the chunk at hand and leaves adjacent chunks
/// untouched.
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("chunk too short for header: expected at least {expected} bytes, got {actual}")]
    DataTooShortForHeader { expected: usize, actual: usize },

    #[error("invalid chunk magic {have:#010x}")]
    InvalidMagic { have: u32 },

    #[error("unsupported chunk version {have}")]
    UnsupportedVersion { have: u16 },

    /// Reserved flag bits 2..=15 must be zero.
    #[error("unknown flag bits set: {raw:#06x}")]
    InvalidFlags { raw: u16 },

    /// The `encrypted_size` field disagrees with the bytes actually present.
    #[error("encrypted size field inconsistent with chunk payload: header says {declared}, chunk carries {actual}")]
    EncryptedSizeMismatch { declared: usize, actual: usize },

    /// Decryption produced a different plaintext length than the header
    /// declares.
    #[error("decrypted size does not match header: expected {expected}, got {actual}")]
    DecryptedSizeMismatch { expected: usize, actual: usize },

    /// The trailing checksum does not match the decrypted plaintext.
    #[error("chunk checksum verification failed")]
    ChecksumMismatch,

    #[error("chunk plaintext of {size} bytes exceeds the {MAX_CHUNK_PLAINTEXT}-byte limit")]
    PlaintextTooLarge { size: usize },

    #[error("assembled chunk of {size} bytes exceeds the {MAX_TOTAL_CHUNK_LEN}-byte limit")]
    ChunkTooLarge { size: usize },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Parsed single-recipient chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleChunkHeader {
    pub index: u32,
    pub original_size: u32,
    pub encrypted_size: u32,
    pub is_last: bool,
    pub has_checksum: bool,
}

impl SingleChunkHeader {
    /// Parse and validate the fixed 32-byte header prefix.
    pub fn parse(bytes: &[u8]) -> Result<Self, ChunkError> {
        if bytes.len() < SINGLE_HEADER_SIZE {
            return Err(ChunkError::DataTooShortForHeader {
                expected: SINGLE_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        if magic != SINGLE_MAGIC {
            return Err(ChunkError::InvalidMagic { have: magic });
        }

        let version = u16::from_be_bytes(bytes[4..6].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(ChunkError::UnsupportedVersion { have: version });
        }

        let index = u32::from_be_bytes(bytes[6..10].try_into().unwrap());
        let original_size = u32::from_be_bytes(bytes[10..14].try_into().unwrap());
        let encrypted_size = u32::from_be_bytes(bytes[14..18].try_into().unwrap());

        let flags = u16::from_be_bytes(bytes[18..20].try_into().unwrap());
        if flags & !KNOWN_FLAGS != 0 {
            return Err(ChunkError::InvalidFlags { raw: flags });
        }

        // Reserved bytes are tolerated if non-zero, for forward
        // compatibility with writers that start using them.
        if bytes[20..SINGLE_HEADER_SIZE].iter().any(|&b| b != 0) {
            debug!("chunk header has non-zero reserved bytes");
        }

        Ok(Self {
            index,
            original_size,
            encrypted_size,
            is_last: flags & FLAG_IS_LAST != 0,
            has_checksum: flags & FLAG_HAS_CHECKSUM != 0,
        })
    }

    /// Encode to the fixed 32-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; SINGLE_HEADER_SIZE] {
        let mut out = [0u8; SINGLE_HEADER_SIZE];
        out[0..4].copy_from_slice(&SINGLE_MAGIC.to_be_bytes());
        out[4..6].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        out[6..10].copy_from_slice(&self.index.to_be_bytes());
        out[10..14].copy_from_slice(&self.original_size.to_be_bytes());
        out[14..18].copy_from_slice(&self.encrypted_size.to_be_bytes());
        let mut flags = 0u16;
        if self.is_last {
            flags |= FLAG_IS_LAST;
        }
        if self.has_checksum {
            flags |= FLAG_HAS_CHECKSUM;
        }
        out[18..20].copy_from_slice(&flags.to_be_bytes());
        out
    }

    /// Total frame length of the chunk this header describes.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        SINGLE_HEADER_SIZE
            + self.encrypted_size as usize
            + if self.has_checksum { CHECKSUM_SIZE } else { 0 }
    }
}

/// Length of the frame starting at `bytes`, derived from its header alone.
///
/// Lets a consumer walk a buffer of concatenated frames without decrypting
/// anything.
pub fn frame_length(bytes: &[u8]) -> Result<usize, ChunkError> {
    Ok(SingleChunkHeader::parse(bytes)?.frame_len())
}

/// Split a buffer of concatenated single-recipient frames at their
/// boundaries.
pub fn split_frames(buffer: &[u8]) -> Result<Vec<&[u8]>, ChunkError> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < buffer.len() {
        let len = frame_length(&buffer[offset..])?;
        let end = offset + len;
        if end > buffer.len() {
            return Err(ChunkError::EncryptedSizeMismatch {
                declared: len - SINGLE_HEADER_SIZE,
                actual: buffer.len() - offset - SINGLE_HEADER_SIZE,
            });
        }
        frames.push(&buffer[offset..end]);
        offset = end;
    }
    Ok(frames)
}

/// Build a framed single-recipient chunk.
///
/// Encrypts `plaintext` to `recipient_public_key` with ECIES and appends a
/// SHA-256 plaintext checksum when `include_checksum` is set.
#[instrument(level = "debug", skip(crypto, plaintext, recipient_public_key), fields(index = index, is_last = is_last, plaintext_len = plaintext.len()))]
pub fn encrypt_chunk(
    crypto: &CryptoCore,
    plaintext: &[u8],
    recipient_public_key: &[u8],
    index: u32,
    is_last: bool,
    include_checksum: bool,
) -> Result<Vec<u8>, ChunkError> {
    if plaintext.len() > MAX_CHUNK_PLAINTEXT {
        return Err(ChunkError::PlaintextTooLarge {
            size: plaintext.len(),
        });
    }

    let ciphertext = crypto.ecies_encrypt_single(recipient_public_key, plaintext)?;

    let frame_len = SINGLE_HEADER_SIZE
        + ciphertext.len()
        + if include_checksum { CHECKSUM_SIZE } else { 0 };
    if frame_len > MAX_TOTAL_CHUNK_LEN {
        return Err(ChunkError::ChunkTooLarge { size: frame_len });
    }

    let header = SingleChunkHeader {
        index,
        original_size: plaintext.len() as u32,
        encrypted_size: ciphertext.len() as u32,
        is_last,
        has_checksum: include_checksum,
    };

    let mut frame = Vec::with_capacity(frame_len);
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(&ciphertext);
    if include_checksum {
        frame.extend_from_slice(&crypto.sha256(plaintext));
    }

    trace!(frame_len = frame.len(), "chunk sealed");
    Ok(frame)
}

/// Parse, decrypt, and verify a framed single-recipient chunk.
///
/// Returns the plaintext together with the parsed header so callers can
/// act on `index` and `is_last`.
#[instrument(level = "debug", skip_all, fields(chunk_len = bytes.len()))]
pub fn decrypt_chunk(
    crypto: &CryptoCore,
    bytes: &[u8],
    private_key: &[u8],
) -> Result<(Vec<u8>, SingleChunkHeader), ChunkError> {
    let header = SingleChunkHeader::parse(bytes)?;

    let trailer = if header.has_checksum { CHECKSUM_SIZE } else { 0 };
    let payload = &bytes[SINGLE_HEADER_SIZE..];
    let declared = header.encrypted_size as usize;
    if payload.len() != declared + trailer {
        warn!("chunk payload length disagrees with header");
        return Err(ChunkError::EncryptedSizeMismatch {
            declared,
            actual: payload.len().saturating_sub(trailer),
        });
    }

    let ciphertext = &payload[..declared];
    let plaintext = crypto.ecies_decrypt_single(private_key, ciphertext)?;

    if plaintext.len() != header.original_size as usize {
        warn!("decrypted length disagrees with header");
        return Err(ChunkError::DecryptedSizeMismatch {
            expected: header.original_size as usize,
            actual: plaintext.len(),
        });
    }

    if header.has_checksum {
        let stored = &payload[declared..];
        let computed = crypto.sha256(&plaintext);
        // Accumulator XOR over all 32 bytes, one comparison at the end.
        if !bool::from(computed.ct_eq(stored)) {
            warn!(chunk = header.index, "chunk checksum mismatch");
            return Err(ChunkError::ChecksumMismatch);
        }
    }

    trace!(chunk = header.index, plaintext_len = plaintext.len(), "chunk opened");
    Ok((plaintext, header))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto_and_keys() -> (CryptoCore, Vec<u8>, Vec<u8>) {
        let crypto = CryptoCore::new();
        let (secret, public) = crypto.generate_keypair();
        (crypto, secret.to_vec(), public)
    }

    #[test]
    fn roundtrip_with_checksum() {
        let (crypto, secret, public) = crypto_and_keys();
        let frame = encrypt_chunk(&crypto, b"chunk payload", &public, 3, true, true).unwrap();
        let (plaintext, header) = decrypt_chunk(&crypto, &frame, &secret).unwrap();
        assert_eq!(plaintext, b"chunk payload");
        assert_eq!(header.index, 3);
        assert!(header.is_last);
        assert!(header.has_checksum);
        assert_eq!(header.original_size, 13);
    }

    #[test]
    fn header_wire_format_is_frozen() {
        use hex_literal::hex;
        let header = SingleChunkHeader {
            index: 1,
            original_size: 2,
            encrypted_size: 3,
            is_last: true,
            has_checksum: false,
        };
        assert_eq!(
            header.encode(),
            hex!(
                "45434945" // "ECIE"
                "0001"     // version
                "00000001" // index
                "00000002" // original_size
                "00000003" // encrypted_size
                "0001"     // flags: IS_LAST
                "000000000000000000000000"
            )
        );
    }

    #[test]
    fn header_roundtrip() {
        let header = SingleChunkHeader {
            index: 7,
            original_size: 1024,
            encrypted_size: 1093,
            is_last: false,
            has_checksum: true,
        };
        let parsed = SingleChunkHeader::parse(&header.encode()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn rejects_short_header() {
        let (crypto, secret, _) = crypto_and_keys();
        let result = decrypt_chunk(&crypto, &[0u8; 16], &secret);
        assert!(matches!(
            result,
            Err(ChunkError::DataTooShortForHeader { .. })
        ));
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let (crypto, _, public) = crypto_and_keys();
        let frame = encrypt_chunk(&crypto, b"x", &public, 0, true, false).unwrap();

        let mut bad_magic = frame.clone();
        bad_magic[0] ^= 0xFF;
        assert!(matches!(
            SingleChunkHeader::parse(&bad_magic),
            Err(ChunkError::InvalidMagic { .. })
        ));

        let mut bad_version = frame;
        bad_version[5] = 9;
        assert!(matches!(
            SingleChunkHeader::parse(&bad_version),
            Err(ChunkError::UnsupportedVersion { have: 9 })
        ));
    }

    #[test]
    fn rejects_reserved_flag_bits() {
        let (crypto, _, public) = crypto_and_keys();
        let mut frame = encrypt_chunk(&crypto, b"x", &public, 0, false, false).unwrap();
        frame[18] = 0x80;
        assert!(matches!(
            SingleChunkHeader::parse(&frame),
            Err(ChunkError::InvalidFlags { .. })
        ));
    }

    #[test]
    fn rejects_size_field_mismatch() {
        let (crypto, secret, public) = crypto_and_keys();
        let mut frame = encrypt_chunk(&crypto, b"payload", &public, 0, true, false).unwrap();
        frame.truncate(frame.len() - 1);
        assert!(matches!(
            decrypt_chunk(&crypto, &frame, &secret),
            Err(ChunkError::EncryptedSizeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_flipped_checksum_bit() {
        let (crypto, secret, public) = crypto_and_keys();
        let mut frame = encrypt_chunk(&crypto, b"payload", &public, 0, true, true).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(
            decrypt_chunk(&crypto, &frame, &secret),
            Err(ChunkError::ChecksumMismatch)
        ));
    }

    #[test]
    fn tampered_ciphertext_is_an_auth_failure() {
        let (crypto, secret, public) = crypto_and_keys();
        let mut frame = encrypt_chunk(&crypto, b"payload", &public, 0, true, false).unwrap();
        frame[SINGLE_HEADER_SIZE + 40] ^= 0x01;
        assert!(matches!(
            decrypt_chunk(&crypto, &frame, &secret),
            Err(ChunkError::Crypto(CryptoError::AuthenticationFailed))
        ));
    }

    #[test]
    fn splits_concatenated_frames() {
        let (crypto, _, public) = crypto_and_keys();
        let a = encrypt_chunk(&crypto, b"first", &public, 0, false, true).unwrap();
        let b = encrypt_chunk(&crypto, b"second", &public, 1, true, false).unwrap();
        let mut buffer = a.clone();
        buffer.extend_from_slice(&b);
        let frames = split_frames(&buffer).unwrap();
        assert_eq!(frames, vec![a.as_slice(), b.as_slice()]);
    }
}
