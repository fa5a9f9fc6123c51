//! Streaming encryption and decryption engine.
//!
//! Converts an asynchronous sequence of byte blocks into an ordered stream
//! of self-describing encrypted chunks, and back. Sessions are pull-based
//! [`futures::Stream`]s: the internal buffer, chunk counter, and
//! cancellation state survive across suspension points, and nothing is
//! encrypted until the consumer asks for the next chunk.
//!
//! Within one session chunks are produced and consumed in strictly
//! increasing index order. Sessions are independent; concurrent sessions
//! share only the immutable [`CryptoCore`] service and id provider.

pub mod progress;
pub mod resume;

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{Stream, StreamExt, stream};
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};
use zeroize::Zeroizing;

use crate::chunk::{
    MAX_CHUNK_PLAINTEXT, MAX_RECIPIENTS, multi, multi::MultiRecipientError, multi::Recipient,
    single, single::ChunkError,
};
use crate::crypto::{CryptoCore, PRIVATE_KEY_SIZE, SYMMETRIC_KEY_SIZE, id::IdProvider,
    is_valid_public_key_length};
use progress::{ProgressSnapshot, ProgressTracker};

/// Default plaintext chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest byte block accepted from a source in one read.
pub const MAX_SOURCE_BLOCK: usize = 100 * 1024 * 1024;

/// Cooperative cancellation flag shared between a session and its owner.
///
/// Cancellation is observed between chunks, never inside one: a session
/// that sees the flag raises [`StreamError::Cancelled`] and stops without
/// emitting a partial chunk.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Callback receiving a snapshot after each chunk is yielded.
pub type ProgressFn = Box<dyn FnMut(ProgressSnapshot) + Send>;

/// Options for an encryption session.
pub struct EncryptOptions {
    /// Plaintext bytes per chunk. Defaults to [`DEFAULT_CHUNK_SIZE`].
    pub chunk_size: usize,
    /// Append a SHA-256 plaintext checksum to every single-recipient chunk.
    pub include_checksums: bool,
    /// Index assigned to the first emitted chunk. Non-zero when resuming.
    pub first_chunk_index: u32,
    /// Expected total plaintext size, used for ETA and percent reporting.
    pub total_bytes: Option<u64>,
    pub cancellation: Option<CancellationToken>,
    pub on_progress: Option<ProgressFn>,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            include_checksums: false,
            first_chunk_index: 0,
            total_bytes: None,
            cancellation: None,
            on_progress: None,
        }
    }
}

impl fmt::Debug for EncryptOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptOptions")
            .field("chunk_size", &self.chunk_size)
            .field("include_checksums", &self.include_checksums)
            .field("first_chunk_index", &self.first_chunk_index)
            .field("total_bytes", &self.total_bytes)
            .field("cancellation", &self.cancellation.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Options for a decryption session.
#[derive(Default)]
pub struct DecryptOptions {
    pub total_bytes: Option<u64>,
    pub cancellation: Option<CancellationToken>,
    pub on_progress: Option<ProgressFn>,
}

impl fmt::Debug for DecryptOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptOptions")
            .field("total_bytes", &self.total_bytes)
            .field("cancellation", &self.cancellation.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// One framed chunk produced by an encryption session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedChunk {
    pub index: u32,
    pub is_last: bool,
    /// Plaintext length this chunk carries.
    pub original_size: u32,
    /// The complete wire frame.
    pub bytes: Vec<u8>,
}

/// One plaintext block recovered by a decryption session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedChunk {
    pub index: u32,
    pub is_last: bool,
    pub plaintext: Vec<u8>,
}

/// Errors raised by streaming sessions.
#[derive(Error, Debug)]
pub enum StreamError {
    /// A single source block exceeded [`MAX_SOURCE_BLOCK`].
    #[error("source block of {size} bytes exceeds the {MAX_SOURCE_BLOCK}-byte limit")]
    BufferOverflow { size: usize },

    /// The session observed its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// A chunk arrived out of order.
    #[error("chunk out of sequence: expected index {expected}, got {actual}")]
    ChunkSequenceError { expected: u32, actual: u32 },

    /// The 32-bit chunk index space was exhausted.
    #[error("chunk index space exhausted")]
    ChunkIndexOverflow,

    #[error("invalid public key length {actual}: expected 33 or 65 bytes")]
    InvalidPublicKeyLength { actual: usize },

    #[error("invalid private key length {actual}: expected {PRIVATE_KEY_SIZE} bytes")]
    InvalidPrivateKeyLength { actual: usize },

    #[error("invalid recipient count {actual}: expected 1 to {MAX_RECIPIENTS}")]
    InvalidRecipientCount { actual: usize },

    #[error("recipient id has wrong length: expected {expected} bytes, got {actual}")]
    InvalidRecipientIdLength { expected: usize, actual: usize },

    #[error("invalid chunk size {actual}: expected 1 to {MAX_CHUNK_PLAINTEXT} bytes")]
    InvalidChunkSize { actual: usize },

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    MultiRecipient(#[from] MultiRecipientError),

    #[error("source read failed: {0}")]
    Source(#[from] io::Error),
}

enum SealMode {
    Single {
        public_key: Vec<u8>,
    },
    Multi {
        recipients: Vec<Recipient>,
        id_provider: Arc<dyn IdProvider>,
        /// Session-owned shared key, wiped when the session drops.
        session_key: Zeroizing<[u8; SYMMETRIC_KEY_SIZE]>,
    },
}

struct EncryptSession<S> {
    crypto: Arc<CryptoCore>,
    source: S,
    mode: SealMode,
    chunk_size: usize,
    include_checksums: bool,
    next_index: u32,
    buffer: Zeroizing<Vec<u8>>,
    pending: VecDeque<EncryptedChunk>,
    done_reading: bool,
    failed: bool,
    cancellation: Option<CancellationToken>,
    on_progress: Option<ProgressFn>,
    tracker: ProgressTracker,
}

impl<S> EncryptSession<S>
where
    S: Stream<Item = io::Result<Vec<u8>>> + Unpin,
{
    fn cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    fn fail(&mut self, err: StreamError) -> Result<EncryptedChunk, StreamError> {
        self.failed = true;
        Err(err)
    }

    fn record_progress(&mut self, chunk_bytes: usize) {
        let snapshot = self.tracker.update(chunk_bytes);
        if let Some(callback) = self.on_progress.as_mut() {
            callback(snapshot);
        }
    }

    fn seal(&mut self, plaintext: &[u8], is_last: bool) -> Result<EncryptedChunk, StreamError> {
        let index = self.next_index;
        let bytes = match &self.mode {
            SealMode::Single { public_key } => single::encrypt_chunk(
                &self.crypto,
                plaintext,
                public_key,
                index,
                is_last,
                self.include_checksums,
            )?,
            SealMode::Multi {
                recipients,
                id_provider,
                session_key,
            } => multi::encrypt_chunk_multi(
                &self.crypto,
                id_provider.as_ref(),
                plaintext,
                recipients,
                session_key,
                index,
                is_last,
            )?,
        };
        self.next_index = index
            .checked_add(1)
            .ok_or(StreamError::ChunkIndexOverflow)?;
        trace!(index, is_last, plaintext_len = plaintext.len(), "chunk emitted");
        Ok(EncryptedChunk {
            index,
            is_last,
            original_size: plaintext.len() as u32,
            bytes,
        })
    }

    async fn next_item(&mut self) -> Option<Result<EncryptedChunk, StreamError>> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                self.record_progress(chunk.original_size as usize);
                return Some(Ok(chunk));
            }
            if self.done_reading {
                return None;
            }
            if self.cancelled() {
                return Some(self.fail(StreamError::Cancelled));
            }

            match self.source.next().await {
                Some(Err(err)) => return Some(self.fail(StreamError::Source(err))),
                Some(Ok(block)) => {
                    if block.len() > MAX_SOURCE_BLOCK {
                        warn!(block_len = block.len(), "oversized source block rejected");
                        return Some(self.fail(StreamError::BufferOverflow { size: block.len() }));
                    }
                    self.buffer.extend_from_slice(&block);
                    // Hold the final chunk_size bytes back until the source
                    // ends, so the closing chunk carries the final flag.
                    while self.buffer.len() > self.chunk_size {
                        if self.cancelled() {
                            return Some(self.fail(StreamError::Cancelled));
                        }
                        let segment: Zeroizing<Vec<u8>> =
                            Zeroizing::new(self.buffer.drain(..self.chunk_size).collect());
                        match self.seal(&segment, false) {
                            Ok(chunk) => self.pending.push_back(chunk),
                            Err(err) => return Some(self.fail(err)),
                        }
                    }
                }
                None => {
                    self.done_reading = true;
                    if !self.buffer.is_empty() {
                        if self.cancelled() {
                            return Some(self.fail(StreamError::Cancelled));
                        }
                        let segment = Zeroizing::new(std::mem::take(&mut *self.buffer));
                        match self.seal(&segment, true) {
                            Ok(chunk) => self.pending.push_back(chunk),
                            Err(err) => return Some(self.fail(err)),
                        }
                    }
                    debug!(chunks = self.next_index, "source drained");
                }
            }
        }
    }
}

fn validate_chunk_size(chunk_size: usize) -> Result<(), StreamError> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_PLAINTEXT {
        return Err(StreamError::InvalidChunkSize { actual: chunk_size });
    }
    Ok(())
}

/// Encrypt a byte-block source into single-recipient chunks.
///
/// Input validation happens eagerly; the returned stream performs no
/// cryptographic work until polled. An empty source yields no chunks.
#[instrument(level = "debug", skip(crypto, recipient_public_key, source), fields(chunk_size = options.chunk_size))]
pub fn encrypt_stream<S>(
    crypto: Arc<CryptoCore>,
    recipient_public_key: Vec<u8>,
    source: S,
    options: EncryptOptions,
) -> Result<impl Stream<Item = Result<EncryptedChunk, StreamError>> + Send + Unpin, StreamError>
where
    S: Stream<Item = io::Result<Vec<u8>>> + Send + Unpin,
{
    if !is_valid_public_key_length(recipient_public_key.len()) {
        return Err(StreamError::InvalidPublicKeyLength {
            actual: recipient_public_key.len(),
        });
    }
    validate_chunk_size(options.chunk_size)?;

    Ok(run_encrypt(EncryptSession {
        crypto,
        source,
        mode: SealMode::Single {
            public_key: recipient_public_key,
        },
        chunk_size: options.chunk_size,
        include_checksums: options.include_checksums,
        next_index: options.first_chunk_index,
        buffer: Zeroizing::new(Vec::new()),
        pending: VecDeque::new(),
        done_reading: false,
        failed: false,
        cancellation: options.cancellation,
        on_progress: options.on_progress,
        tracker: ProgressTracker::new(options.total_bytes),
    }))
}

/// Encrypt a byte-block source into multi-recipient chunks.
///
/// A fresh 32-byte session key is generated, wrapped to every recipient in
/// each chunk, and wiped when the session ends.
#[instrument(level = "debug", skip_all, fields(recipients = recipients.len(), chunk_size = options.chunk_size))]
pub fn encrypt_stream_multi<S>(
    crypto: Arc<CryptoCore>,
    recipients: Vec<Recipient>,
    id_provider: Arc<dyn IdProvider>,
    source: S,
    options: EncryptOptions,
) -> Result<impl Stream<Item = Result<EncryptedChunk, StreamError>> + Send + Unpin, StreamError>
where
    S: Stream<Item = io::Result<Vec<u8>>> + Send + Unpin,
{
    if recipients.is_empty() || recipients.len() > MAX_RECIPIENTS {
        return Err(StreamError::InvalidRecipientCount {
            actual: recipients.len(),
        });
    }
    let id_len = id_provider.id_byte_length();
    for recipient in &recipients {
        if recipient.id.len() != id_len {
            return Err(StreamError::InvalidRecipientIdLength {
                expected: id_len,
                actual: recipient.id.len(),
            });
        }
        if !is_valid_public_key_length(recipient.public_key.len()) {
            return Err(StreamError::InvalidPublicKeyLength {
                actual: recipient.public_key.len(),
            });
        }
    }
    validate_chunk_size(options.chunk_size)?;

    // Filled in place so no unwiped copy of the key ever exists.
    let mut session_key = Zeroizing::new([0u8; SYMMETRIC_KEY_SIZE]);
    rand::rng().fill_bytes(&mut *session_key);

    Ok(run_encrypt(EncryptSession {
        crypto,
        source,
        mode: SealMode::Multi {
            recipients,
            id_provider,
            session_key,
        },
        chunk_size: options.chunk_size,
        include_checksums: options.include_checksums,
        next_index: options.first_chunk_index,
        buffer: Zeroizing::new(Vec::new()),
        pending: VecDeque::new(),
        done_reading: false,
        failed: false,
        cancellation: options.cancellation,
        on_progress: options.on_progress,
        tracker: ProgressTracker::new(options.total_bytes),
    }))
}

fn run_encrypt<S>(
    session: EncryptSession<S>,
) -> impl Stream<Item = Result<EncryptedChunk, StreamError>> + Send + Unpin
where
    S: Stream<Item = io::Result<Vec<u8>>> + Send + Unpin,
{
    Box::pin(stream::unfold(session, |mut session| async move {
        session.next_item().await.map(|item| (item, session))
    }))
}

enum OpenMode {
    Single {
        private_key: Zeroizing<Vec<u8>>,
    },
    Multi {
        recipient_id: Vec<u8>,
        private_key: Zeroizing<Vec<u8>>,
        id_provider: Arc<dyn IdProvider>,
    },
}

struct DecryptSession<S> {
    crypto: Arc<CryptoCore>,
    frames: S,
    mode: OpenMode,
    expected_index: u32,
    finished: bool,
    failed: bool,
    cancellation: Option<CancellationToken>,
    on_progress: Option<ProgressFn>,
    tracker: ProgressTracker,
}

impl<S> DecryptSession<S>
where
    S: Stream<Item = io::Result<Vec<u8>>> + Unpin,
{
    fn cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    fn open(&self, frame: &[u8]) -> Result<(Vec<u8>, u32, bool), StreamError> {
        match &self.mode {
            OpenMode::Single { private_key } => {
                let (plaintext, header) = single::decrypt_chunk(&self.crypto, frame, private_key)?;
                Ok((plaintext, header.index, header.is_last))
            }
            OpenMode::Multi {
                recipient_id,
                private_key,
                id_provider,
            } => {
                let (plaintext, header) = multi::decrypt_chunk_multi(
                    &self.crypto,
                    id_provider.as_ref(),
                    frame,
                    recipient_id,
                    private_key,
                )?;
                Ok((plaintext, header.chunk_index, header.is_last))
            }
        }
    }

    async fn next_item(&mut self) -> Option<Result<DecryptedChunk, StreamError>> {
        // Frames past the final chunk are ignored, not read.
        if self.failed || self.finished {
            return None;
        }
        if self.cancelled() {
            self.failed = true;
            return Some(Err(StreamError::Cancelled));
        }

        match self.frames.next().await {
            // A truncated stream simply ends early; every chunk decrypted
            // so far was authenticated on its own.
            None => None,
            Some(Err(err)) => {
                self.failed = true;
                Some(Err(StreamError::Source(err)))
            }
            Some(Ok(frame)) => {
                let (plaintext, index, is_last) = match self.open(&frame) {
                    Ok(opened) => opened,
                    Err(err) => {
                        self.failed = true;
                        return Some(Err(err));
                    }
                };
                if index != self.expected_index {
                    warn!(expected = self.expected_index, actual = index, "chunk out of sequence");
                    self.failed = true;
                    return Some(Err(StreamError::ChunkSequenceError {
                        expected: self.expected_index,
                        actual: index,
                    }));
                }
                self.expected_index += 1;
                if is_last {
                    self.finished = true;
                }
                if self.cancelled() {
                    self.failed = true;
                    return Some(Err(StreamError::Cancelled));
                }
                let snapshot = self.tracker.update(plaintext.len());
                if let Some(callback) = self.on_progress.as_mut() {
                    callback(snapshot);
                }
                Some(Ok(DecryptedChunk {
                    index,
                    is_last,
                    plaintext,
                }))
            }
        }
    }
}

/// Decrypt a stream of single-recipient chunk frames.
///
/// Each stream item must be one complete frame. Frames are validated to
/// arrive in strictly increasing index order starting at 0.
#[instrument(level = "debug", skip_all)]
pub fn decrypt_stream<S>(
    crypto: Arc<CryptoCore>,
    private_key: &[u8],
    frames: S,
    options: DecryptOptions,
) -> Result<impl Stream<Item = Result<DecryptedChunk, StreamError>> + Send + Unpin + use<S>, StreamError>
where
    S: Stream<Item = io::Result<Vec<u8>>> + Send + Unpin,
{
    if private_key.len() != PRIVATE_KEY_SIZE {
        return Err(StreamError::InvalidPrivateKeyLength {
            actual: private_key.len(),
        });
    }

    Ok(run_decrypt(DecryptSession {
        crypto,
        frames,
        mode: OpenMode::Single {
            private_key: Zeroizing::new(private_key.to_vec()),
        },
        expected_index: 0,
        finished: false,
        failed: false,
        cancellation: options.cancellation,
        on_progress: options.on_progress,
        tracker: ProgressTracker::new(options.total_bytes),
    }))
}

/// Decrypt a stream of multi-recipient chunk frames as one recipient.
#[instrument(level = "debug", skip_all)]
pub fn decrypt_stream_multi<S>(
    crypto: Arc<CryptoCore>,
    recipient_id: Vec<u8>,
    private_key: &[u8],
    id_provider: Arc<dyn IdProvider>,
    frames: S,
    options: DecryptOptions,
) -> Result<impl Stream<Item = Result<DecryptedChunk, StreamError>> + Send + Unpin + use<S>, StreamError>
where
    S: Stream<Item = io::Result<Vec<u8>>> + Send + Unpin,
{
    if private_key.len() != PRIVATE_KEY_SIZE {
        return Err(StreamError::InvalidPrivateKeyLength {
            actual: private_key.len(),
        });
    }
    let id_len = id_provider.id_byte_length();
    if recipient_id.len() != id_len {
        return Err(StreamError::InvalidRecipientIdLength {
            expected: id_len,
            actual: recipient_id.len(),
        });
    }

    Ok(run_decrypt(DecryptSession {
        crypto,
        frames,
        mode: OpenMode::Multi {
            recipient_id,
            private_key: Zeroizing::new(private_key.to_vec()),
            id_provider,
        },
        expected_index: 0,
        finished: false,
        failed: false,
        cancellation: options.cancellation,
        on_progress: options.on_progress,
        tracker: ProgressTracker::new(options.total_bytes),
    }))
}

fn run_decrypt<S>(
    session: DecryptSession<S>,
) -> impl Stream<Item = Result<DecryptedChunk, StreamError>> + Send + Unpin
where
    S: Stream<Item = io::Result<Vec<u8>>> + Send + Unpin,
{
    Box::pin(stream::unfold(session, |mut session| async move {
        session.next_item().await.map(|item| (item, session))
    }))
}
