//! Resumable encryption with integrity-protected checkpoints.
//!
//! A [`ResumableEncryptor`] wraps the streaming engine and maintains a
//! [`CheckpointState`] value describing how far a session has progressed.
//! The state is a plain serde value; persistence is the caller's concern.
//! JSON via [`CheckpointState::to_json`] is the recommended interchange.
//!
//! # Integrity Tag
//!
//! Saved states carry a position-folding XOR digest over the canonical
//! string `"version|chunk_index|bytes_processed|public_key_hex|chunk_size|
//! include_checksums|timestamp_ms"`. The tag detects accidental corruption
//! of persisted state; it is not keyed and does not resist a deliberate
//! attacker, which is the storage layer's job.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use super::{
    CancellationToken, DEFAULT_CHUNK_SIZE, EncryptOptions, EncryptedChunk, ProgressFn, StreamError,
    encrypt_stream,
};
use crate::crypto::{CryptoCore, is_valid_public_key_length};

/// Current checkpoint schema version.
pub const STATE_VERSION: u32 = 1;

/// States older than this are refused on restore.
pub const MAX_STATE_AGE_MS: u64 = 24 * 60 * 60 * 1000;

/// Length of the integrity digest in bytes.
pub const INTEGRITY_TAG_SIZE: usize = 32;

/// Which codec a checkpointed session was using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionKind {
    Single,
    Multi,
}

/// Serializable snapshot of an encryption session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub version: u32,
    /// Index the next emitted chunk will carry.
    pub chunk_index: u32,
    pub bytes_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    pub public_key_hex: String,
    pub encryption_type: EncryptionKind,
    pub chunk_size: u32,
    pub include_checksums: bool,
    /// Unix milliseconds of the last state update.
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_tag_hex: Option<String>,
}

impl CheckpointState {
    /// Compute the position-folding XOR digest over the canonical fields.
    #[must_use]
    pub fn integrity_tag(&self) -> [u8; INTEGRITY_TAG_SIZE] {
        let canonical = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.version,
            self.chunk_index,
            self.bytes_processed,
            self.public_key_hex,
            self.chunk_size,
            self.include_checksums,
            self.timestamp_ms,
        );
        let mut tag = [0u8; INTEGRITY_TAG_SIZE];
        for (i, byte) in canonical.as_bytes().iter().enumerate() {
            tag[i % INTEGRITY_TAG_SIZE] ^= byte;
        }
        tag
    }

    /// Return a copy carrying a freshly computed integrity tag.
    #[must_use]
    pub fn with_integrity_tag(mut self) -> Self {
        self.integrity_tag_hex = Some(hex::encode(self.integrity_tag()));
        self
    }

    /// Verify the stored tag, if any. States without a tag verify.
    #[must_use]
    pub fn verify_integrity(&self) -> bool {
        match &self.integrity_tag_hex {
            None => true,
            Some(stored) => hex::decode(stored)
                .is_ok_and(|bytes| bytes == self.integrity_tag()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Errors raised while validating or resuming from checkpoint state.
#[derive(Error, Debug)]
pub enum ResumeError {
    #[error("unsupported checkpoint state version {have}")]
    UnsupportedStateVersion { have: u32 },

    #[error("checkpoint state is {age_ms} ms old, exceeding the {MAX_STATE_AGE_MS} ms limit")]
    StateTooOld { age_ms: u64 },

    #[error("checkpoint state integrity check failed")]
    StateIntegrityCheckFailed,

    #[error("checkpoint state carries an invalid public key")]
    InvalidPublicKeyInState,

    #[error("supplied public key does not match checkpoint state")]
    PublicKeyMismatch,

    #[error("supplied chunk size {actual} does not match checkpoint state ({expected})")]
    ChunkSizeMismatch { expected: u32, actual: u32 },

    #[error("supplied checksum setting does not match checkpoint state")]
    IncludeChecksumsMismatch,

    #[error("checkpoint state was recorded for a different encryption type")]
    EncryptionTypeMismatch,

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Callback receiving a defensive, integrity-tagged copy of the state on
/// every auto-save.
pub type StateSavedFn = Box<dyn FnMut(CheckpointState) + Send>;

/// Options for a resumable encryption run.
pub struct ResumeOptions {
    /// Plaintext bytes per chunk. Must match a restored state.
    pub chunk_size: u32,
    /// Must match a restored state.
    pub include_checksums: bool,
    pub total_bytes: Option<u64>,
    /// Invoke `on_state_saved` every this many chunks; 0 disables.
    pub auto_save_interval: u32,
    pub on_state_saved: Option<StateSavedFn>,
    pub cancellation: Option<CancellationToken>,
    pub on_progress: Option<ProgressFn>,
}

impl Default for ResumeOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE as u32,
            include_checksums: false,
            total_bytes: None,
            auto_save_interval: 0,
            on_state_saved: None,
            cancellation: None,
            on_progress: None,
        }
    }
}

impl fmt::Debug for ResumeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumeOptions")
            .field("chunk_size", &self.chunk_size)
            .field("include_checksums", &self.include_checksums)
            .field("total_bytes", &self.total_bytes)
            .field("auto_save_interval", &self.auto_save_interval)
            .field("on_state_saved", &self.on_state_saved.is_some())
            .field("cancellation", &self.cancellation.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Streaming encryptor that checkpoints its progress.
///
/// A fresh encryptor starts a new session; one constructed with a restored
/// state continues from the recorded chunk index, expecting the source to
/// supply bytes from the recorded byte offset.
pub struct ResumableEncryptor {
    crypto: Arc<CryptoCore>,
    state: Option<CheckpointState>,
}

impl fmt::Debug for ResumableEncryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumableEncryptor")
            .field("state", &self.state)
            .finish()
    }
}

impl ResumableEncryptor {
    /// Create a manager, validating any restored state.
    #[instrument(level = "debug", skip(crypto, initial_state), fields(resumed = initial_state.is_some()))]
    pub fn new(
        crypto: Arc<CryptoCore>,
        initial_state: Option<CheckpointState>,
    ) -> Result<Self, ResumeError> {
        if let Some(state) = &initial_state {
            validate_state(state)?;
            debug!(
                chunk_index = state.chunk_index,
                bytes_processed = state.bytes_processed,
                "checkpoint state restored"
            );
        }
        Ok(Self {
            crypto,
            state: initial_state,
        })
    }

    /// Current in-memory state, if a session has started or was restored.
    #[must_use]
    pub fn state(&self) -> Option<&CheckpointState> {
        self.state.as_ref()
    }

    /// Produce a persistable copy of the state with its integrity tag set.
    #[must_use]
    pub fn save(&self) -> Option<CheckpointState> {
        self.state.clone().map(CheckpointState::with_integrity_tag)
    }

    /// Encrypt `source` to `public_key`, continuing from the checkpoint.
    ///
    /// On a restored state the supplied key, chunk size, and checksum
    /// setting must match the recorded ones. The returned stream borrows
    /// the manager mutably; the state is updated after every emitted chunk.
    #[instrument(level = "debug", skip_all)]
    pub fn encrypt<'a, S>(
        &'a mut self,
        public_key: Vec<u8>,
        source: S,
        mut options: ResumeOptions,
    ) -> Result<impl Stream<Item = Result<EncryptedChunk, ResumeError>> + Send + Unpin + 'a, ResumeError>
    where
        S: Stream<Item = std::io::Result<Vec<u8>>> + Send + Unpin + 'a,
    {
        let public_key_hex = hex::encode(&public_key);

        if let Some(state) = &self.state {
            if state.encryption_type != EncryptionKind::Single {
                return Err(ResumeError::EncryptionTypeMismatch);
            }
            if state.public_key_hex != public_key_hex {
                return Err(ResumeError::PublicKeyMismatch);
            }
            if state.chunk_size != options.chunk_size {
                return Err(ResumeError::ChunkSizeMismatch {
                    expected: state.chunk_size,
                    actual: options.chunk_size,
                });
            }
            if state.include_checksums != options.include_checksums {
                return Err(ResumeError::IncludeChecksumsMismatch);
            }
        }

        let total_bytes = options.total_bytes;
        let state = self.state.get_or_insert_with(|| CheckpointState {
            version: STATE_VERSION,
            chunk_index: 0,
            bytes_processed: 0,
            total_bytes,
            public_key_hex: public_key_hex.clone(),
            encryption_type: EncryptionKind::Single,
            chunk_size: options.chunk_size,
            include_checksums: options.include_checksums,
            timestamp_ms: now_ms(),
            integrity_tag_hex: None,
        });
        if let Some(total) = total_bytes {
            state.total_bytes = Some(total);
        }

        let resume_from = state.chunk_index;
        let inner = encrypt_stream(
            Arc::clone(&self.crypto),
            public_key,
            source,
            EncryptOptions {
                chunk_size: options.chunk_size as usize,
                include_checksums: options.include_checksums,
                first_chunk_index: resume_from,
                total_bytes,
                cancellation: options.cancellation.take(),
                on_progress: options.on_progress.take(),
            },
        )?;

        let auto_save_interval = options.auto_save_interval;

        Ok(Box::pin(stream::unfold(
            (inner, state, false, options.on_state_saved),
            move |(mut inner, state, mut failed, mut on_saved)| async move {
                let item = loop {
                    if failed {
                        break None;
                    }
                    match inner.next().await {
                        None => break None,
                        Some(Err(err)) => {
                            failed = true;
                            break Some(Err(ResumeError::from(err)));
                        }
                        Some(Ok(chunk)) => {
                            // Already-checkpointed chunks are skipped.
                            if chunk.index < resume_from {
                                continue;
                            }
                            state.chunk_index = chunk.index + 1;
                            state.bytes_processed += u64::from(chunk.original_size);
                            state.timestamp_ms = now_ms();
                            trace!(
                                chunk = chunk.index,
                                bytes_processed = state.bytes_processed,
                                "checkpoint advanced"
                            );
                            if auto_save_interval > 0
                                && (chunk.index + 1) % auto_save_interval == 0
                                && let Some(callback) = on_saved.as_mut()
                            {
                                callback(state.clone().with_integrity_tag());
                            }
                            break Some(Ok(chunk));
                        }
                    }
                };
                item.map(|item| (item, (inner, state, failed, on_saved)))
            },
        )))
    }
}

fn validate_state(state: &CheckpointState) -> Result<(), ResumeError> {
    if state.version != STATE_VERSION {
        return Err(ResumeError::UnsupportedStateVersion {
            have: state.version,
        });
    }

    let age_ms = now_ms().saturating_sub(state.timestamp_ms);
    if age_ms > MAX_STATE_AGE_MS {
        warn!(age_ms, "checkpoint state expired");
        return Err(ResumeError::StateTooOld { age_ms });
    }

    let key_bytes =
        hex::decode(&state.public_key_hex).map_err(|_| ResumeError::InvalidPublicKeyInState)?;
    if !is_valid_public_key_length(key_bytes.len()) {
        return Err(ResumeError::InvalidPublicKeyInState);
    }

    if !state.verify_integrity() {
        warn!("checkpoint state integrity tag mismatch");
        return Err(ResumeError::StateIntegrityCheckFailed);
    }

    Ok(())
}
