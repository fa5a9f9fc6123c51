//! Wire format for encrypted stream chunks.
//!
//! Two chunk layouts share this module: the single-recipient frame of
//! [`single`] and the multi-recipient frame of [`multi`]. Both are
//! self-describing (magic, version, index, sizes, flags), big-endian, and
//! independently authenticatable, so a damaged chunk never corrupts its
//! neighbours.

pub mod multi;
pub mod single;

/// Magic marker of single-recipient chunks, ASCII "ECIE".
pub const SINGLE_MAGIC: u32 = 0x4543_4945;

/// Magic marker of multi-recipient chunks, ASCII "ECIM".
pub const MULTI_MAGIC: u32 = 0x4543_494D;

/// Current wire version of both chunk layouts. Unknown versions are
/// refused.
pub const FORMAT_VERSION: u16 = 1;

/// Fixed single-recipient header size in bytes.
pub const SINGLE_HEADER_SIZE: usize = 32;

/// Fixed multi-recipient header size in bytes. Changing this is a wire
/// break and requires a version bump.
pub const MULTI_HEADER_SIZE: usize = 32;

/// SHA-256 checksum length appended to checksummed single chunks.
pub const CHECKSUM_SIZE: usize = 32;

/// Upper bound on a chunk's plaintext.
pub const MAX_CHUNK_PLAINTEXT: usize = 1 << 30;

/// Upper bound on a whole assembled chunk frame.
pub const MAX_TOTAL_CHUNK_LEN: usize = i32::MAX as usize;

/// Wrapped-key size bounds in the multi-recipient table.
pub const MIN_WRAPPED_KEY_SIZE: usize = 1;
pub const MAX_WRAPPED_KEY_SIZE: usize = 1000;

/// Maximum recipients addressable by one chunk.
pub const MAX_RECIPIENTS: usize = 65_535;

pub use multi::{MultiChunkHeader, MultiRecipientError, Recipient};
pub use single::{ChunkError, SingleChunkHeader};
