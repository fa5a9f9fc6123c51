//! Multi-recipient chunk codec.
//!
//! One chunk carries a payload encrypted once under a shared AES-256 key,
//! plus a recipient table wrapping that key to every addressee with ECIES.
//!
//! # Frame Layout
//!
//! ```text
//! Header(32) || RecipientTable || IV(12) || Ciphertext || AuthTag(16)
//! ```
//!
//! Header fields, big-endian:
//!
//! ```text
//! magic: u32 = "ECIM" | version: u16 | recipient_count: u16 |
//! chunk_index: u32 | original_size: u32 | encrypted_size: u32 |
//! flags: u8 | reserved: [u8; 11]
//! ```
//!
//! Each table entry is `recipient_id(L) || key_size: u16 ||
//! encrypted_key(key_size)` with `L` fixed by the [`IdProvider`]. The 32
//! header bytes are bound as AAD on the payload, so header tampering fails
//! authentication even though the header itself travels in the clear.
//!
//! The decrypt path walks the entire recipient table in constant time with
//! respect to the matching position: every entry is visited and compared
//! even after the caller's id has matched.

use std::collections::HashSet;

use thiserror::Error;
use tracing::{debug, instrument, trace, warn};
use zeroize::Zeroizing;

use super::{
    FORMAT_VERSION, MAX_RECIPIENTS, MAX_TOTAL_CHUNK_LEN, MAX_WRAPPED_KEY_SIZE,
    MIN_WRAPPED_KEY_SIZE, MULTI_HEADER_SIZE, MULTI_MAGIC,
};
use crate::crypto::{CryptoCore, CryptoError, IV_SIZE, SYMMETRIC_KEY_SIZE, TAG_SIZE, id::IdProvider};

/// Flag bit marking the final chunk of a stream.
pub const FLAG_IS_LAST: u8 = 0b1;

const KNOWN_FLAGS: u8 = FLAG_IS_LAST;

/// Maximum payload of one multi-recipient chunk.
pub const MAX_PLAINTEXT: usize = i32::MAX as usize;

/// A recipient addressable by a multi-recipient chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Opaque fixed-length id, `id_provider.id_byte_length()` bytes.
    pub id: Vec<u8>,
    /// SEC1 public key, 33 or 65 bytes.
    pub public_key: Vec<u8>,
}

/// Errors raised while building or parsing multi-recipient chunks.
#[derive(Error, Debug)]
pub enum MultiRecipientError {
    #[error("chunk too short for header: expected at least {expected} bytes, got {actual}")]
    DataTooShortForHeader { expected: usize, actual: usize },

    #[error("invalid chunk magic {have:#010x}")]
    InvalidMagic { have: u32 },

    #[error("unsupported chunk version {have}")]
    UnsupportedVersion { have: u16 },

    #[error("unknown flag bits set: {raw:#04x}")]
    InvalidFlags { raw: u8 },

    #[error("invalid recipient count {actual}: expected 1 to {MAX_RECIPIENTS}")]
    InvalidRecipientCount { actual: usize },

    #[error("recipient id has wrong length: expected {expected} bytes, got {actual}")]
    InvalidRecipientIdLength { expected: usize, actual: usize },

    #[error("duplicate recipient id in chunk")]
    DuplicateRecipientId,

    #[error("chunk too small to hold the declared encrypted size")]
    ChunkTooSmallForEncryptedSize,

    #[error("chunk length inconsistent with recipient table and encrypted size")]
    ChunkSizeMismatch,

    #[error("chunk truncated inside a recipient id")]
    ChunkTruncatedRecipientId,

    #[error("chunk truncated inside a key size field")]
    ChunkTruncatedKeySize,

    #[error("chunk truncated inside an encrypted key")]
    ChunkTruncatedEncryptedKey,

    #[error("wrapped key size {actual} outside 1 to {MAX_WRAPPED_KEY_SIZE}")]
    InvalidKeySize { actual: usize },

    /// The caller's id does not appear in the recipient table.
    #[error("recipient not found in chunk")]
    RecipientNotFound,

    /// The unwrapped key has the wrong length for AES-256.
    #[error("unwrapped symmetric key has invalid length")]
    InvalidSymmetricKeyLength,

    #[error("chunk plaintext of {size} bytes exceeds the {MAX_PLAINTEXT}-byte limit")]
    PlaintextTooLarge { size: usize },

    #[error("assembled chunk of {size} bytes exceeds the {MAX_TOTAL_CHUNK_LEN}-byte limit")]
    ChunkTooLarge { size: usize },

    #[error("decrypted size does not match header: expected {expected}, got {actual}")]
    DecryptedSizeMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Parsed multi-recipient chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiChunkHeader {
    pub recipient_count: u16,
    pub chunk_index: u32,
    pub original_size: u32,
    pub encrypted_size: u32,
    pub is_last: bool,
}

impl MultiChunkHeader {
    /// Parse and validate the fixed 32-byte header prefix.
    pub fn parse(bytes: &[u8]) -> Result<Self, MultiRecipientError> {
        if bytes.len() < MULTI_HEADER_SIZE {
            return Err(MultiRecipientError::DataTooShortForHeader {
                expected: MULTI_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        if magic != MULTI_MAGIC {
            return Err(MultiRecipientError::InvalidMagic { have: magic });
        }

        let version = u16::from_be_bytes(bytes[4..6].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(MultiRecipientError::UnsupportedVersion { have: version });
        }

        let recipient_count = u16::from_be_bytes(bytes[6..8].try_into().unwrap());
        if recipient_count == 0 {
            return Err(MultiRecipientError::InvalidRecipientCount { actual: 0 });
        }

        let chunk_index = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let original_size = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
        let encrypted_size = u32::from_be_bytes(bytes[16..20].try_into().unwrap());

        let flags = bytes[20];
        if flags & !KNOWN_FLAGS != 0 {
            return Err(MultiRecipientError::InvalidFlags { raw: flags });
        }

        if bytes[21..MULTI_HEADER_SIZE].iter().any(|&b| b != 0) {
            debug!("multi-recipient header has non-zero reserved bytes");
        }

        Ok(Self {
            recipient_count,
            chunk_index,
            original_size,
            encrypted_size,
            is_last: flags & FLAG_IS_LAST != 0,
        })
    }

    /// Encode to the fixed 32-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; MULTI_HEADER_SIZE] {
        let mut out = [0u8; MULTI_HEADER_SIZE];
        out[0..4].copy_from_slice(&MULTI_MAGIC.to_be_bytes());
        out[4..6].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        out[6..8].copy_from_slice(&self.recipient_count.to_be_bytes());
        out[8..12].copy_from_slice(&self.chunk_index.to_be_bytes());
        out[12..16].copy_from_slice(&self.original_size.to_be_bytes());
        out[16..20].copy_from_slice(&self.encrypted_size.to_be_bytes());
        if self.is_last {
            out[20] = FLAG_IS_LAST;
        }
        out
    }
}

/// Build a framed multi-recipient chunk.
///
/// `shared_key` is the session's symmetric key; the caller retains
/// ownership and is responsible for wiping it when the session ends.
#[instrument(
    level = "debug",
    skip_all,
    fields(chunk_index = chunk_index, is_last = is_last, plaintext_len = plaintext.len(), recipients = recipients.len())
)]
pub fn encrypt_chunk_multi(
    crypto: &CryptoCore,
    id_provider: &dyn IdProvider,
    plaintext: &[u8],
    recipients: &[Recipient],
    shared_key: &[u8; SYMMETRIC_KEY_SIZE],
    chunk_index: u32,
    is_last: bool,
) -> Result<Vec<u8>, MultiRecipientError> {
    if recipients.is_empty() || recipients.len() > MAX_RECIPIENTS {
        return Err(MultiRecipientError::InvalidRecipientCount {
            actual: recipients.len(),
        });
    }
    if plaintext.len() > MAX_PLAINTEXT {
        return Err(MultiRecipientError::PlaintextTooLarge {
            size: plaintext.len(),
        });
    }

    let id_len = id_provider.id_byte_length();
    let mut seen = HashSet::with_capacity(recipients.len());
    for recipient in recipients {
        if recipient.id.len() != id_len {
            return Err(MultiRecipientError::InvalidRecipientIdLength {
                expected: id_len,
                actual: recipient.id.len(),
            });
        }
        if !seen.insert(recipient.id.as_slice()) {
            return Err(MultiRecipientError::DuplicateRecipientId);
        }
    }

    let header = MultiChunkHeader {
        recipient_count: recipients.len() as u16,
        chunk_index,
        original_size: plaintext.len() as u32,
        encrypted_size: plaintext.len() as u32,
        is_last,
    };
    let header_bytes = header.encode();

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&crypto.random_bytes(IV_SIZE));
    let (ciphertext, tag) =
        crypto.aes_gcm_encrypt(shared_key, &iv, plaintext, Some(&header_bytes))?;

    let mut table = Vec::new();
    for recipient in recipients {
        let wrapped = crypto.ecies_encrypt_single(&recipient.public_key, shared_key)?;
        if wrapped.is_empty() || wrapped.len() > MAX_WRAPPED_KEY_SIZE {
            return Err(MultiRecipientError::InvalidKeySize {
                actual: wrapped.len(),
            });
        }
        table.extend_from_slice(&recipient.id);
        table.extend_from_slice(&(wrapped.len() as u16).to_be_bytes());
        table.extend_from_slice(&wrapped);
    }

    let frame_len = MULTI_HEADER_SIZE + table.len() + IV_SIZE + ciphertext.len() + TAG_SIZE;
    if frame_len > MAX_TOTAL_CHUNK_LEN {
        return Err(MultiRecipientError::ChunkTooLarge { size: frame_len });
    }

    let mut frame = Vec::with_capacity(frame_len);
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(&table);
    frame.extend_from_slice(&iv);
    frame.extend_from_slice(&ciphertext);
    frame.extend_from_slice(&tag);

    trace!(frame_len = frame.len(), "multi-recipient chunk sealed");
    Ok(frame)
}

struct ParsedTable {
    /// Wrapped key for the caller, if their id matched an entry.
    wrapped_key: Option<Vec<u8>>,
    /// Byte offset of the IV, right past the table.
    payload_offset: usize,
}

/// Walk the recipient table, visiting every entry regardless of where the
/// caller's id matches.
fn walk_recipient_table(
    bytes: &[u8],
    header: &MultiChunkHeader,
    id_provider: &dyn IdProvider,
    recipient_id: &[u8],
) -> Result<ParsedTable, MultiRecipientError> {
    let id_len = id_provider.id_byte_length();
    let mut cursor = MULTI_HEADER_SIZE;
    let mut wrapped_key: Option<Vec<u8>> = None;

    for _ in 0..header.recipient_count {
        if cursor + id_len > bytes.len() {
            return Err(MultiRecipientError::ChunkTruncatedRecipientId);
        }
        let entry_id = &bytes[cursor..cursor + id_len];
        cursor += id_len;

        if cursor + 2 > bytes.len() {
            return Err(MultiRecipientError::ChunkTruncatedKeySize);
        }
        let key_size = u16::from_be_bytes(bytes[cursor..cursor + 2].try_into().unwrap()) as usize;
        cursor += 2;
        if !(MIN_WRAPPED_KEY_SIZE..=MAX_WRAPPED_KEY_SIZE).contains(&key_size) {
            return Err(MultiRecipientError::InvalidKeySize { actual: key_size });
        }

        if cursor + key_size > bytes.len() {
            return Err(MultiRecipientError::ChunkTruncatedEncryptedKey);
        }
        let entry_key = &bytes[cursor..cursor + key_size];
        cursor += key_size;

        // Keep walking after a match so the cursor always reaches the IV
        // and the walk shape does not depend on the matching position.
        if id_provider.equals_ct(entry_id, recipient_id) && wrapped_key.is_none() {
            wrapped_key = Some(entry_key.to_vec());
        }
    }

    Ok(ParsedTable {
        wrapped_key,
        payload_offset: cursor,
    })
}

/// Parse a chunk and decrypt it as the recipient identified by
/// `recipient_id`, whose ECIES private key is `private_key`.
#[instrument(level = "debug", skip_all, fields(chunk_len = bytes.len()))]
pub fn decrypt_chunk_multi(
    crypto: &CryptoCore,
    id_provider: &dyn IdProvider,
    bytes: &[u8],
    recipient_id: &[u8],
    private_key: &[u8],
) -> Result<(Vec<u8>, MultiChunkHeader), MultiRecipientError> {
    let header = MultiChunkHeader::parse(bytes)?;
    let encrypted_size = header.encrypted_size as usize;

    // Early upper bound before touching the table, precise check after.
    if bytes.len() < MULTI_HEADER_SIZE + IV_SIZE + TAG_SIZE + encrypted_size {
        return Err(MultiRecipientError::ChunkTooSmallForEncryptedSize);
    }

    let table = walk_recipient_table(bytes, &header, id_provider, recipient_id)?;

    if bytes.len() != table.payload_offset + IV_SIZE + encrypted_size + TAG_SIZE {
        warn!("chunk length disagrees with recipient table and encrypted size");
        return Err(MultiRecipientError::ChunkSizeMismatch);
    }

    let Some(wrapped) = table.wrapped_key else {
        return Err(MultiRecipientError::RecipientNotFound);
    };

    let unwrapped = Zeroizing::new(crypto.ecies_decrypt_single(private_key, &wrapped)?);
    let shared_key: &[u8; SYMMETRIC_KEY_SIZE] = unwrapped
        .as_slice()
        .try_into()
        .map_err(|_| MultiRecipientError::InvalidSymmetricKeyLength)?;

    let iv_offset = table.payload_offset;
    let ct_offset = iv_offset + IV_SIZE;
    let tag_offset = ct_offset + encrypted_size;
    let iv: [u8; IV_SIZE] = bytes[iv_offset..ct_offset].try_into().unwrap();
    let tag: [u8; TAG_SIZE] = bytes[tag_offset..].try_into().unwrap();

    let plaintext = crypto.aes_gcm_decrypt(
        shared_key,
        &iv,
        &bytes[ct_offset..tag_offset],
        &tag,
        Some(&bytes[..MULTI_HEADER_SIZE]),
    )?;

    if plaintext.len() != header.original_size as usize {
        return Err(MultiRecipientError::DecryptedSizeMismatch {
            expected: header.original_size as usize,
            actual: plaintext.len(),
        });
    }

    trace!(chunk = header.chunk_index, "multi-recipient chunk opened");
    Ok((plaintext, header))
}

/// Length of the frame starting at `bytes`, derived from its header and
/// recipient table without any decryption.
pub fn frame_length(bytes: &[u8], id_len: usize) -> Result<usize, MultiRecipientError> {
    let header = MultiChunkHeader::parse(bytes)?;
    let mut cursor = MULTI_HEADER_SIZE;
    for _ in 0..header.recipient_count {
        if cursor + id_len > bytes.len() {
            return Err(MultiRecipientError::ChunkTruncatedRecipientId);
        }
        cursor += id_len;
        if cursor + 2 > bytes.len() {
            return Err(MultiRecipientError::ChunkTruncatedKeySize);
        }
        let key_size = u16::from_be_bytes(bytes[cursor..cursor + 2].try_into().unwrap()) as usize;
        cursor += 2;
        if !(MIN_WRAPPED_KEY_SIZE..=MAX_WRAPPED_KEY_SIZE).contains(&key_size) {
            return Err(MultiRecipientError::InvalidKeySize { actual: key_size });
        }
        cursor += key_size;
    }
    Ok(cursor + IV_SIZE + header.encrypted_size as usize + TAG_SIZE)
}
