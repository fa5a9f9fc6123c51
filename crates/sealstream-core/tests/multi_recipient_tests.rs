//! End-to-end tests for multi-recipient streaming.

use std::io;
use std::sync::Arc;

use futures::{Stream, StreamExt, stream};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use sealstream_core::crypto::id::{IdProvider, RandomIdProvider, UuidIdProvider};
use sealstream_core::{
    CryptoCore, DecryptOptions, DecryptedChunk, EncryptOptions, EncryptedChunk,
    MultiRecipientError, Recipient, StreamError, decrypt_stream_multi, encrypt_stream_multi,
};

struct Party {
    recipient: Recipient,
    secret: Vec<u8>,
}

fn make_parties(crypto: &CryptoCore, provider: &dyn IdProvider, n: usize) -> Vec<Party> {
    (0..n)
        .map(|_| {
            let (secret, public) = crypto.generate_keypair();
            Party {
                recipient: Recipient {
                    id: provider.generate(),
                    public_key: public,
                },
                secret: secret.to_vec(),
            }
        })
        .collect()
}

fn source_of(blocks: Vec<Vec<u8>>) -> impl Stream<Item = io::Result<Vec<u8>>> + Send + Unpin {
    stream::iter(blocks.into_iter().map(Ok))
}

fn deterministic_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);
    bytes
}

async fn encrypt_to(
    crypto: &Arc<CryptoCore>,
    provider: Arc<dyn IdProvider>,
    parties: &[Party],
    data: &[u8],
    chunk_size: usize,
) -> Vec<EncryptedChunk> {
    let recipients = parties.iter().map(|p| p.recipient.clone()).collect();
    let encrypted = encrypt_stream_multi(
        Arc::clone(crypto),
        recipients,
        provider,
        source_of(vec![data.to_vec()]),
        EncryptOptions {
            chunk_size,
            ..EncryptOptions::default()
        },
    )
    .unwrap();
    encrypted.map(|chunk| chunk.unwrap()).collect().await
}

async fn decrypt_as(
    crypto: &Arc<CryptoCore>,
    provider: Arc<dyn IdProvider>,
    party: &Party,
    chunks: &[EncryptedChunk],
) -> Result<Vec<u8>, StreamError> {
    let frames = source_of(chunks.iter().map(|c| c.bytes.clone()).collect());
    let decrypted = decrypt_stream_multi(
        Arc::clone(crypto),
        party.recipient.id.clone(),
        &party.secret,
        provider,
        frames,
        DecryptOptions::default(),
    )?;
    let blocks: Vec<Result<DecryptedChunk, StreamError>> = decrypted.collect().await;
    let mut out = Vec::new();
    for block in blocks {
        out.extend_from_slice(&block?.plaintext);
    }
    Ok(out)
}

#[tokio::test]
async fn hello_reaches_both_recipients_but_not_an_outsider() {
    let crypto = Arc::new(CryptoCore::new());
    let provider: Arc<dyn IdProvider> = Arc::new(RandomIdProvider::new(12).unwrap());
    let parties = make_parties(&crypto, provider.as_ref(), 2);

    let chunks = encrypt_to(&crypto, Arc::clone(&provider), &parties, b"hello", 1024).await;
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].is_last);

    for party in &parties {
        let plaintext = decrypt_as(&crypto, Arc::clone(&provider), party, &chunks)
            .await
            .unwrap();
        assert_eq!(plaintext, b"hello");
    }

    let (outsider_secret, outsider_public) = crypto.generate_keypair();
    let outsider = Party {
        recipient: Recipient {
            id: provider.generate(),
            public_key: outsider_public,
        },
        secret: outsider_secret.to_vec(),
    };
    let result = decrypt_as(&crypto, Arc::clone(&provider), &outsider, &chunks).await;
    assert!(matches!(
        result,
        Err(StreamError::MultiRecipient(
            MultiRecipientError::RecipientNotFound
        ))
    ));
}

#[tokio::test]
async fn multi_chunk_stream_roundtrips_for_every_recipient() {
    let crypto = Arc::new(CryptoCore::new());
    let provider: Arc<dyn IdProvider> = Arc::new(RandomIdProvider::new(16).unwrap());
    let parties = make_parties(&crypto, provider.as_ref(), 5);
    let data = deterministic_bytes(300 * 1024, 42);

    let chunks = encrypt_to(&crypto, Arc::clone(&provider), &parties, &data, 64 * 1024).await;
    assert_eq!(chunks.len(), 5);
    assert!(chunks.last().unwrap().is_last);

    for party in &parties {
        let plaintext = decrypt_as(&crypto, Arc::clone(&provider), party, &chunks)
            .await
            .unwrap();
        assert_eq!(plaintext, data);
    }
}

#[tokio::test]
async fn uuid_ids_work_end_to_end() {
    let crypto = Arc::new(CryptoCore::new());
    let provider: Arc<dyn IdProvider> = Arc::new(UuidIdProvider);
    let parties = make_parties(&crypto, provider.as_ref(), 3);
    let data = deterministic_bytes(10 * 1024, 77);

    let chunks = encrypt_to(&crypto, Arc::clone(&provider), &parties, &data, 4096).await;
    for party in &parties {
        let plaintext = decrypt_as(&crypto, Arc::clone(&provider), party, &chunks)
            .await
            .unwrap();
        assert_eq!(plaintext, data);
    }
}

#[tokio::test]
async fn rejects_empty_and_malformed_recipient_lists() {
    let crypto = Arc::new(CryptoCore::new());
    let provider: Arc<dyn IdProvider> = Arc::new(RandomIdProvider::new(12).unwrap());

    let err = encrypt_stream_multi(
        Arc::clone(&crypto),
        vec![],
        Arc::clone(&provider),
        source_of(vec![]),
        EncryptOptions::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(
        err,
        StreamError::InvalidRecipientCount { actual: 0 }
    ));

    let (_, public) = crypto.generate_keypair();
    let err = encrypt_stream_multi(
        Arc::clone(&crypto),
        vec![Recipient {
            id: vec![0u8; 20],
            public_key: public,
        }],
        Arc::clone(&provider),
        source_of(vec![]),
        EncryptOptions::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(
        err,
        StreamError::InvalidRecipientIdLength {
            expected: 12,
            actual: 20
        }
    ));

    let err = encrypt_stream_multi(
        Arc::clone(&crypto),
        vec![Recipient {
            id: provider.generate(),
            public_key: vec![0u8; 40],
        }],
        Arc::clone(&provider),
        source_of(vec![]),
        EncryptOptions::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(
        err,
        StreamError::InvalidPublicKeyLength { actual: 40 }
    ));
}

#[tokio::test]
async fn tampered_frame_fails_for_every_recipient() {
    let crypto = Arc::new(CryptoCore::new());
    let provider: Arc<dyn IdProvider> = Arc::new(RandomIdProvider::new(12).unwrap());
    let parties = make_parties(&crypto, provider.as_ref(), 2);
    let data = deterministic_bytes(2048, 3);

    let mut chunks = encrypt_to(&crypto, Arc::clone(&provider), &parties, &data, 4096).await;
    let frame = &mut chunks[0].bytes;
    let last = frame.len() - 1;
    frame[last] ^= 0x01;

    for party in &parties {
        let result = decrypt_as(&crypto, Arc::clone(&provider), party, &chunks).await;
        assert!(result.is_err());
    }
}
