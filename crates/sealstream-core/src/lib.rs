//! Streaming ECIES hybrid encryption with multi-recipient fan-out,
//! resumable checkpoints, and deterministic ECDH-to-Paillier key
//! derivation.

pub mod chunk;
pub mod crypto;
pub mod paillier;
pub mod stream;

pub use chunk::{
    ChunkError, MultiChunkHeader, MultiRecipientError, Recipient, SingleChunkHeader,
};
pub use crypto::{CryptoCore, CryptoError, id::IdProvider};
pub use paillier::{
    DerivationParams, PaillierError, PaillierKeyPair, PaillierPrivateKey, PaillierPublicKey,
    derive_keypair_from_ecdh, derive_keypair_from_seed,
};
pub use stream::{
    CancellationToken, DecryptOptions, DecryptedChunk, EncryptOptions, EncryptedChunk,
    StreamError, decrypt_stream, decrypt_stream_multi, encrypt_stream, encrypt_stream_multi,
    progress::{ProgressSnapshot, ProgressTracker},
    resume::{CheckpointState, EncryptionKind, ResumableEncryptor, ResumeError, ResumeOptions},
};
