//! Deterministic Paillier key derivation from an ECDH key pair.
//!
//! The bridge turns a secp256k1 ECDH agreement into a Paillier key pair
//! suitable for additively homomorphic tallying. The pipeline is fully
//! deterministic: shared point -> HKDF-SHA-512 seed -> HMAC-DRBG ->
//! fixed-budget prime search, so both parties derive bit-identical keys
//! from the same agreement on any platform.

pub mod blob;
mod drbg;
mod prime;

use num_bigint::BigUint;
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::crypto::{CryptoCore, CryptoError, PRIVATE_KEY_SIZE, UNCOMPRESSED_PUBLIC_KEY_SIZE,
    is_valid_public_key_length};
use drbg::HmacDrbgSha512;

/// HKDF info string binding derived seeds to Paillier prime generation.
pub const HKDF_INFO: &[u8] = b"PaillierPrimeGen";

/// Smallest accepted modulus size in bits.
pub const MIN_MODULUS_BITS: usize = 2048;

/// Default modulus size in bits.
pub const DEFAULT_MODULUS_BITS: usize = 3072;

/// Fewest accepted Miller-Rabin rounds.
pub const MIN_MILLER_RABIN_ROUNDS: usize = 64;

/// Default Miller-Rabin rounds.
pub const DEFAULT_MILLER_RABIN_ROUNDS: usize = 256;

/// Default per-prime iteration budget.
pub const DEFAULT_MAX_ATTEMPTS: usize = 10_000;

/// Errors raised by key derivation and the Paillier operations.
#[derive(Error, Debug)]
pub enum PaillierError {
    #[error("invalid ECDH private key length {actual}: expected {PRIVATE_KEY_SIZE} bytes")]
    InvalidPrivateKeyLength { actual: usize },

    /// The public key is not a 33-byte compressed or 65-byte `0x04`-prefixed
    /// uncompressed SEC1 encoding. Raw 64-byte coordinate pairs are
    /// rejected.
    #[error("invalid ECDH public key encoding")]
    InvalidPublicKeyEncoding,

    #[error("derivation seed of {actual} bytes is shorter than the {min}-byte minimum", min = drbg::MIN_SEED_LEN)]
    SeedTooShort { actual: usize },

    #[error("invalid modulus size {bits}: must be even and at least {MIN_MODULUS_BITS} bits")]
    InvalidModulusBits { bits: usize },

    #[error("{rounds} Miller-Rabin rounds below the minimum of {MIN_MILLER_RABIN_ROUNDS}")]
    TooFewMillerRabinRounds { rounds: usize },

    /// The iteration budget was exhausted without finding a prime.
    #[error("prime generation failed")]
    PrimeGenerationFailed,

    /// The assembled key pair failed its encrypt/decrypt self-test.
    #[error("key pair validation failed")]
    KeyPairValidationFailed,

    #[error("plaintext out of range for this modulus")]
    PlaintextOutOfRange,

    #[error("ciphertext out of range for this modulus")]
    CiphertextOutOfRange,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Tuning knobs for key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivationParams {
    /// Modulus size in bits; each prime has half this length.
    pub modulus_bits: usize,
    /// Miller-Rabin rounds per candidate.
    pub miller_rabin_rounds: usize,
    /// Exact number of DRBG draws spent per prime.
    pub max_attempts: usize,
}

impl Default for DerivationParams {
    fn default() -> Self {
        Self {
            modulus_bits: DEFAULT_MODULUS_BITS,
            miller_rabin_rounds: DEFAULT_MILLER_RABIN_ROUNDS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Paillier public key `(n, g)` with `g = n + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaillierPublicKey {
    pub n: BigUint,
    pub g: BigUint,
}

/// Paillier private key `(lambda, mu)` bound to its public half.
#[derive(Clone, PartialEq, Eq)]
pub struct PaillierPrivateKey {
    pub lambda: BigUint,
    pub mu: BigUint,
    pub public: PaillierPublicKey,
}

impl std::fmt::Debug for PaillierPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaillierPrivateKey")
            .field("lambda", &"[REDACTED]")
            .field("mu", &"[REDACTED]")
            .field("public", &self.public)
            .finish()
    }
}

/// A derived Paillier key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaillierKeyPair {
    pub public: PaillierPublicKey,
    pub private: PaillierPrivateKey,
}

/// `L(x) = (x - 1) / n`, defined on `x = 1 mod n`.
fn l_function(x: &BigUint, n: &BigUint) -> BigUint {
    (x - BigUint::one()) / n
}

fn random_coprime(n: &BigUint) -> BigUint {
    let byte_len = (n.bits() as usize).div_ceil(8);
    let mut bytes = vec![0u8; byte_len];
    loop {
        rand::rng().fill_bytes(&mut bytes);
        let r = BigUint::from_bytes_be(&bytes) % n;
        if !r.is_zero() && r.gcd(n).is_one() {
            return r;
        }
    }
}

impl PaillierPublicKey {
    /// Encrypt `m < n` with a fresh random blinding factor.
    pub fn encrypt(&self, m: &BigUint) -> Result<BigUint, PaillierError> {
        if m >= &self.n {
            return Err(PaillierError::PlaintextOutOfRange);
        }
        let n_squared = &self.n * &self.n;
        let r = random_coprime(&self.n);
        let gm = self.g.modpow(m, &n_squared);
        let rn = r.modpow(&self.n, &n_squared);
        Ok((gm * rn) % n_squared)
    }

    /// Homomorphic addition: the product of two ciphertexts encrypts the
    /// sum of their plaintexts.
    pub fn add(&self, a: &BigUint, b: &BigUint) -> Result<BigUint, PaillierError> {
        let n_squared = &self.n * &self.n;
        if a >= &n_squared || b >= &n_squared {
            return Err(PaillierError::CiphertextOutOfRange);
        }
        Ok((a * b) % n_squared)
    }

    /// Homomorphic scalar multiplication: `c^k` encrypts `k * m mod n`.
    pub fn mul_plain(&self, c: &BigUint, k: &BigUint) -> Result<BigUint, PaillierError> {
        let n_squared = &self.n * &self.n;
        if c >= &n_squared {
            return Err(PaillierError::CiphertextOutOfRange);
        }
        Ok(c.modpow(k, &n_squared))
    }
}

impl PaillierPrivateKey {
    /// Decrypt a ciphertext in `[1, n^2)`.
    pub fn decrypt(&self, c: &BigUint) -> Result<BigUint, PaillierError> {
        let n = &self.public.n;
        let n_squared = n * n;
        if c.is_zero() || c >= &n_squared {
            return Err(PaillierError::CiphertextOutOfRange);
        }
        let x = c.modpow(&self.lambda, &n_squared);
        Ok((l_function(&x, n) * &self.mu) % n)
    }
}

fn validate_params(params: &DerivationParams) -> Result<(), PaillierError> {
    if params.modulus_bits < MIN_MODULUS_BITS || params.modulus_bits % 2 != 0 {
        return Err(PaillierError::InvalidModulusBits {
            bits: params.modulus_bits,
        });
    }
    if params.miller_rabin_rounds < MIN_MILLER_RABIN_ROUNDS {
        return Err(PaillierError::TooFewMillerRabinRounds {
            rounds: params.miller_rabin_rounds,
        });
    }
    Ok(())
}

pub(crate) fn keypair_from_primes(
    p: BigUint,
    q: BigUint,
) -> Result<PaillierKeyPair, PaillierError> {
    if p == q {
        return Err(PaillierError::PrimeGenerationFailed);
    }
    let n = &p * &q;
    let lambda = (&p - BigUint::one()).lcm(&(&q - BigUint::one()));
    let g = &n + BigUint::one();
    let n_squared = &n * &n;
    let mu = l_function(&g.modpow(&lambda, &n_squared), &n)
        .modinv(&n)
        .ok_or(PaillierError::KeyPairValidationFailed)?;

    let public = PaillierPublicKey { n, g };
    let private = PaillierPrivateKey {
        lambda,
        mu,
        public: public.clone(),
    };
    let pair = PaillierKeyPair { public, private };

    // Round-trip self-test before the pair is handed out.
    let probe = BigUint::from(42u32);
    let decrypted = pair.private.decrypt(&pair.public.encrypt(&probe)?)?;
    if decrypted != probe {
        return Err(PaillierError::KeyPairValidationFailed);
    }

    Ok(pair)
}

/// Derive a Paillier key pair from seed material.
///
/// Identical seeds and parameters produce bit-identical key pairs.
#[instrument(level = "debug", skip(seed), fields(seed_len = seed.len(), bits = params.modulus_bits))]
pub fn derive_keypair_from_seed(
    seed: &[u8],
    params: &DerivationParams,
) -> Result<PaillierKeyPair, PaillierError> {
    validate_params(params)?;
    let mut generator = HmacDrbgSha512::new(seed)?;

    let prime_bits = params.modulus_bits / 2;
    let p = prime::generate_prime(
        &mut generator,
        prime_bits,
        params.miller_rabin_rounds,
        params.max_attempts,
    )?;
    let q = prime::generate_prime(
        &mut generator,
        prime_bits,
        params.miller_rabin_rounds,
        params.max_attempts,
    )?;

    debug!(bits = params.modulus_bits, "Paillier primes derived");
    keypair_from_primes(p, q)
}

/// Derive a Paillier key pair from a secp256k1 ECDH agreement.
///
/// The full 65-byte uncompressed shared point feeds HKDF-SHA-512 to
/// produce the 64-byte DRBG seed.
#[instrument(level = "debug", skip_all, fields(bits = params.modulus_bits))]
pub fn derive_keypair_from_ecdh(
    crypto: &CryptoCore,
    private_key: &[u8],
    public_key: &[u8],
    params: &DerivationParams,
) -> Result<PaillierKeyPair, PaillierError> {
    if private_key.len() != PRIVATE_KEY_SIZE {
        return Err(PaillierError::InvalidPrivateKeyLength {
            actual: private_key.len(),
        });
    }
    if !is_valid_public_key_length(public_key.len()) {
        return Err(PaillierError::InvalidPublicKeyEncoding);
    }
    if public_key.len() == UNCOMPRESSED_PUBLIC_KEY_SIZE && public_key[0] != 0x04 {
        return Err(PaillierError::InvalidPublicKeyEncoding);
    }

    let point = crypto.secp256k1_shared_secret(private_key, public_key)?;
    let seed = crypto.hkdf_sha512(&*point, None, HKDF_INFO, 64)?;
    derive_keypair_from_seed(&seed, params)
}
