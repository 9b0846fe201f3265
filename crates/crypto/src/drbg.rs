//! HMAC-DRBG (NIST SP 800-90A) seeded by a cryptographic-quality random
//! source, used to generate ECDSA-P256 private keys.
//!
//! Key generation elsewhere in this codebase leans on `p256`'s own
//! `OsRng`-backed generator directly; this module exists for callers that
//! need a deterministic, reseedable byte stream instead, built on the
//! `hmac`/`sha2` crates already pulled in for TOTP.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A minimal HMAC-DRBG instance: reseed support is intentionally omitted since
/// this crate only needs `generate` for short-lived key generation, matching
/// the scope of the single call site in `ecdsa`.
pub struct HmacDrbg {
    k: [u8; 32],
    v: [u8; 32],
}

impl HmacDrbg {
    pub fn new(seed_material: &[u8]) -> HmacDrbg {
        let mut drbg = HmacDrbg { k: [0u8; 32], v: [1u8; 32] };
        drbg.update(Some(seed_material));
        drbg
    }

    fn update(&mut self, provided_data: Option<&[u8]>) {
        let mut mac = HmacSha256::new_from_slice(&self.k).expect("hmac accepts any key length");
        mac.update(&self.v);
        mac.update(&[0x00]);
        if let Some(data) = provided_data {
            mac.update(data);
        }
        self.k.copy_from_slice(&mac.finalize().into_bytes());

        let mut mac = HmacSha256::new_from_slice(&self.k).expect("hmac accepts any key length");
        mac.update(&self.v);
        self.v.copy_from_slice(&mac.finalize().into_bytes());

        if provided_data.is_some() {
            let mut mac = HmacSha256::new_from_slice(&self.k).expect("hmac accepts any key length");
            mac.update(&self.v);
            mac.update(&[0x01]);
            mac.update(provided_data.unwrap());
            self.k.copy_from_slice(&mac.finalize().into_bytes());

            let mut mac = HmacSha256::new_from_slice(&self.k).expect("hmac accepts any key length");
            mac.update(&self.v);
            self.v.copy_from_slice(&mac.finalize().into_bytes());
        }
    }

    /// Fill `out` with DRBG output, as many 32-byte HMAC blocks as needed.
    pub fn generate(&mut self, out: &mut [u8]) {
        let mut filled = 0;
        while filled < out.len() {
            let mut mac = HmacSha256::new_from_slice(&self.k).expect("hmac accepts any key length");
            mac.update(&self.v);
            self.v.copy_from_slice(&mac.finalize().into_bytes());
            let take = core::cmp::min(self.v.len(), out.len() - filled);
            out[filled..filled + take].copy_from_slice(&self.v[..take]);
            filled += take;
        }
        self.update(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_seed() {
        let mut a = HmacDrbg::new(b"seed material");
        let mut b = HmacDrbg::new(b"seed material");
        let mut out_a = [0u8; 32];
        let mut out_b = [0u8; 32];
        a.generate(&mut out_a);
        b.generate(&mut out_b);
        assert_eq!(out_a, out_b);
    }

    #[test]
    fn differs_for_different_seeds() {
        let mut a = HmacDrbg::new(b"seed one");
        let mut b = HmacDrbg::new(b"seed two");
        let mut out_a = [0u8; 32];
        let mut out_b = [0u8; 32];
        a.generate(&mut out_a);
        b.generate(&mut out_b);
        assert_ne!(out_a, out_b);
    }

    #[test]
    fn successive_calls_differ() {
        let mut drbg = HmacDrbg::new(b"seed");
        let mut first = [0u8; 32];
        let mut second = [0u8; 32];
        drbg.generate(&mut first);
        drbg.generate(&mut second);
        assert_ne!(first, second);
    }
}
