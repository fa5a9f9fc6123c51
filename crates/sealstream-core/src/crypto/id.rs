//! Recipient identifier provider.
//!
//! Multi-recipient chunks address recipients by an opaque fixed-length id.
//! The id layout is deployment-specific, so the codec consumes it through
//! the [`IdProvider`] capability: a byte length, a generator, and a
//! constant-time equality check.

use rand::RngCore;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

/// Id lengths accepted by [`RandomIdProvider`].
pub const SUPPORTED_ID_LENGTHS: [usize; 4] = [12, 16, 20, 32];

#[derive(Error, Debug)]
pub enum IdProviderError {
    #[error("unsupported recipient id length {actual}: expected one of {SUPPORTED_ID_LENGTHS:?}")]
    UnsupportedIdLength { actual: usize },
}

/// Capability for generating and comparing recipient ids.
///
/// `equals_ct` must run in time independent of where (or whether) the two
/// ids differ; the recipient-table walk in the multi-recipient codec relies
/// on it.
pub trait IdProvider: Send + Sync {
    /// Fixed byte length of every id this provider produces.
    fn id_byte_length(&self) -> usize;

    /// Generate a fresh id.
    fn generate(&self) -> Vec<u8>;

    /// Constant-time equality over two ids.
    ///
    /// Ids of differing length compare unequal without examining content.
    fn equals_ct(&self, a: &[u8], b: &[u8]) -> bool {
        if a.len() != b.len() {
            return false;
        }
        a.ct_eq(b).into()
    }
}

/// Random ids of a configurable length.
#[derive(Debug, Clone, Copy)]
pub struct RandomIdProvider {
    length: usize,
}

impl RandomIdProvider {
    pub fn new(length: usize) -> Result<Self, IdProviderError> {
        if !SUPPORTED_ID_LENGTHS.contains(&length) {
            return Err(IdProviderError::UnsupportedIdLength { actual: length });
        }
        Ok(Self { length })
    }
}

impl IdProvider for RandomIdProvider {
    fn id_byte_length(&self) -> usize {
        self.length
    }

    fn generate(&self) -> Vec<u8> {
        let mut id = vec![0u8; self.length];
        rand::rng().fill_bytes(&mut id);
        id
    }
}

/// UUIDv4 recipient ids (16 bytes).
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdProvider;

impl IdProvider for UuidIdProvider {
    fn id_byte_length(&self) -> usize {
        16
    }

    fn generate(&self) -> Vec<u8> {
        Uuid::new_v4().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_provider_rejects_odd_lengths() {
        assert!(RandomIdProvider::new(13).is_err());
        for len in SUPPORTED_ID_LENGTHS {
            let provider = RandomIdProvider::new(len).unwrap();
            assert_eq!(provider.generate().len(), len);
        }
    }

    #[test]
    fn uuid_provider_yields_distinct_ids() {
        let provider = UuidIdProvider;
        assert_eq!(provider.id_byte_length(), 16);
        assert_ne!(provider.generate(), provider.generate());
    }

    #[test]
    fn equality_is_content_based() {
        let provider = RandomIdProvider::new(12).unwrap();
        let id = provider.generate();
        assert!(provider.equals_ct(&id, &id.clone()));
        let mut other = id.clone();
        other[0] ^= 0xFF;
        assert!(!provider.equals_ct(&id, &other));
        assert!(!provider.equals_ct(&id, &id[..8]));
    }
}
