//! End-to-end tests for ECDH-derived Paillier keys.
//!
//! Derivation runs at the smallest accepted parameters (2048-bit modulus,
//! 64 Miller-Rabin rounds) to keep the suite's prime searches affordable.

use num_bigint::BigUint;
use num_traits::One;

use sealstream_core::paillier::blob;
use sealstream_core::{
    CryptoCore, DerivationParams, PaillierError, derive_keypair_from_ecdh,
    derive_keypair_from_seed,
};

fn test_params() -> DerivationParams {
    DerivationParams {
        modulus_bits: 2048,
        miller_rabin_rounds: 64,
        max_attempts: 10_000,
    }
}

/// The fixed seed 00 01 02 .. 3F.
fn fixed_seed() -> Vec<u8> {
    (0u8..64).collect()
}

#[test]
fn derivation_is_deterministic_and_homomorphic() {
    let params = test_params();
    let pair_a = derive_keypair_from_seed(&fixed_seed(), &params).unwrap();
    let pair_b = derive_keypair_from_seed(&fixed_seed(), &params).unwrap();

    // Bit-identical keys from identical seeds.
    assert_eq!(pair_a.public.n, pair_b.public.n);
    assert_eq!(pair_a.private.lambda, pair_b.private.lambda);
    assert_eq!(pair_a.private.mu, pair_b.private.mu);
    assert_eq!(pair_a.public.n.bits(), 2048);
    assert_eq!(pair_a.public.g, &pair_a.public.n + BigUint::one());

    // Additive homomorphism on the derived key.
    let a = BigUint::from(20_260_801u64);
    let b = BigUint::from(123_456_789u64);
    let ca = pair_a.public.encrypt(&a).unwrap();
    let cb = pair_a.public.encrypt(&b).unwrap();
    let sum = pair_a.public.add(&ca, &cb).unwrap();
    assert_eq!(
        pair_a.private.decrypt(&sum).unwrap(),
        (&a + &b) % &pair_a.public.n
    );

    // Scalar homomorphism.
    let k = BigUint::from(1000u32);
    let scaled = pair_a.public.mul_plain(&ca, &k).unwrap();
    assert_eq!(
        pair_a.private.decrypt(&scaled).unwrap(),
        (&a * &k) % &pair_a.public.n
    );

    // Fresh blinding per encryption: ciphertexts differ, plaintexts agree.
    let ca2 = pair_a.public.encrypt(&a).unwrap();
    assert_ne!(ca, ca2);
    assert_eq!(pair_a.private.decrypt(&ca2).unwrap(), a);
}

#[test]
fn both_sides_of_an_agreement_derive_the_same_pair() {
    let crypto = CryptoCore::new();
    let params = test_params();
    let (secret_a, public_a) = crypto.generate_keypair();
    let (secret_b, public_b) = crypto.generate_keypair();

    let pair_from_a = derive_keypair_from_ecdh(&crypto, &secret_a[..], &public_b, &params).unwrap();
    let pair_from_b = derive_keypair_from_ecdh(&crypto, &secret_b[..], &public_a, &params).unwrap();

    assert_eq!(pair_from_a, pair_from_b);
}

#[test]
fn derived_keys_roundtrip_through_blobs() {
    let params = test_params();
    let pair = derive_keypair_from_seed(&fixed_seed(), &params).unwrap();

    let public_blob = blob::encode_public(&pair.public).unwrap();
    let decoded_public = blob::decode_public(&public_blob).unwrap();
    assert_eq!(decoded_public, pair.public);

    let private_blob = blob::encode_private(&pair.private);
    let decoded_private = blob::decode_private(&private_blob, decoded_public).unwrap();
    assert_eq!(decoded_private, pair.private);

    // Decrypt with the decoded key to prove the roundtrip is usable.
    let m = BigUint::from(42u32);
    let c = pair.public.encrypt(&m).unwrap();
    assert_eq!(decoded_private.decrypt(&c).unwrap(), m);

    // Armored transport.
    let armored = blob::armor(&public_blob);
    assert_eq!(blob::unarmor(&armored).unwrap(), public_blob);
}

#[test]
fn distinct_seeds_yield_distinct_moduli() {
    let params = test_params();
    let pair_a = derive_keypair_from_seed(&fixed_seed(), &params).unwrap();
    let other_seed: Vec<u8> = (1u8..65).collect();
    let pair_b = derive_keypair_from_seed(&other_seed, &params).unwrap();
    assert_ne!(pair_a.public.n, pair_b.public.n);
}

#[test]
fn seed_shorter_than_minimum_is_rejected() {
    let params = test_params();
    let result = derive_keypair_from_seed(&[0u8; 16], &params);
    assert!(matches!(
        result,
        Err(PaillierError::SeedTooShort { actual: 16 })
    ));
}
