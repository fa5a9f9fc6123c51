//! Deterministic random bit generator backing prime derivation.
//!
//! HMAC-DRBG per NIST SP 800-90A, instantiated with HMAC-SHA-512. The
//! generator is deterministic by construction: identical seeds produce
//! identical byte streams on every platform, which is what makes the
//! derived Paillier keys reproducible.

use hmac::{Hmac, Mac};
use sha2::Sha512;
use zeroize::Zeroizing;

use super::PaillierError;

/// Minimum accepted seed length in bytes.
pub const MIN_SEED_LEN: usize = 32;

/// HMAC-SHA-512 output length, the size of both internal registers.
const OUT_LEN: usize = 64;

type HmacSha512 = Hmac<Sha512>;

fn hmac(key: &[u8], parts: &[&[u8]]) -> [u8; OUT_LEN] {
    let mut mac = HmacSha512::new_from_slice(key).expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// HMAC-SHA-512 DRBG with the standard two-register `(K, V)` state.
pub struct HmacDrbgSha512 {
    key: Zeroizing<[u8; OUT_LEN]>,
    value: Zeroizing<[u8; OUT_LEN]>,
}

impl HmacDrbgSha512 {
    /// Instantiate from seed material of at least [`MIN_SEED_LEN`] bytes.
    pub fn new(seed: &[u8]) -> Result<Self, PaillierError> {
        if seed.len() < MIN_SEED_LEN {
            return Err(PaillierError::SeedTooShort { actual: seed.len() });
        }
        let mut drbg = Self {
            key: Zeroizing::new([0x00; OUT_LEN]),
            value: Zeroizing::new([0x01; OUT_LEN]),
        };
        drbg.update(Some(seed));
        Ok(drbg)
    }

    /// The SP 800-90A update function: two rounds when `input` is present,
    /// one when absent.
    fn update(&mut self, input: Option<&[u8]>) {
        let input_bytes = input.unwrap_or(&[]);

        *self.key = hmac(&*self.key, &[&*self.value, &[0x00], input_bytes]);
        *self.value = hmac(&*self.key, &[&*self.value]);

        if input.is_some() {
            *self.key = hmac(&*self.key, &[&*self.value, &[0x01], input_bytes]);
            *self.value = hmac(&*self.key, &[&*self.value]);
        }
    }

    /// Fill `out` with the next bytes of the deterministic stream.
    pub fn generate(&mut self, out: &mut [u8]) {
        let mut filled = 0;
        while filled < out.len() {
            *self.value = hmac(&*self.key, &[&*self.value]);
            let take = (out.len() - filled).min(OUT_LEN);
            out[filled..filled + take].copy_from_slice(&self.value[..take]);
            filled += take;
        }
        self.update(None);
    }
}

impl std::fmt::Debug for HmacDrbgSha512 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacDrbgSha512")
            .field("key", &"[REDACTED]")
            .field("value", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_seed() {
        assert!(matches!(
            HmacDrbgSha512::new(&[0u8; 31]),
            Err(PaillierError::SeedTooShort { actual: 31 })
        ));
        assert!(HmacDrbgSha512::new(&[0u8; 32]).is_ok());
    }

    #[test]
    fn identical_seeds_produce_identical_streams() {
        let seed: Vec<u8> = (0u8..64).collect();
        let mut a = HmacDrbgSha512::new(&seed).unwrap();
        let mut b = HmacDrbgSha512::new(&seed).unwrap();
        let mut out_a = [0u8; 192];
        let mut out_b = [0u8; 192];
        a.generate(&mut out_a);
        b.generate(&mut out_b);
        assert_eq!(out_a, out_b);

        // And stay in lockstep across calls.
        a.generate(&mut out_a);
        b.generate(&mut out_b);
        assert_eq!(out_a, out_b);
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = HmacDrbgSha512::new(&[0u8; 64]).unwrap();
        let mut b = HmacDrbgSha512::new(&[1u8; 64]).unwrap();
        let mut out_a = [0u8; 64];
        let mut out_b = [0u8; 64];
        a.generate(&mut out_a);
        b.generate(&mut out_b);
        assert_ne!(out_a, out_b);
    }

    #[test]
    fn short_and_long_reads_advance_differently() {
        // Each generate call ends with a state update, so two 32-byte
        // reads are not the same stream as one 64-byte read.
        let seed = [7u8; 64];
        let mut split = HmacDrbgSha512::new(&seed).unwrap();
        let mut joined = HmacDrbgSha512::new(&seed).unwrap();
        let mut two = [0u8; 64];
        split.generate(&mut two[..32]);
        split.generate(&mut two[32..]);
        let mut one = [0u8; 64];
        joined.generate(&mut one);
        assert_eq!(two[..32], one[..32]);
        assert_ne!(two[32..], one[32..]);
    }
}
