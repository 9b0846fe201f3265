//! ECDSA-P256 signing. Almost verbatim API shape from
//! `ctap-crypto/src/ecdsa.rs`, generalized to take an `HmacDrbg`-backed key
//! generator instead of OpenSK's `Rng256` trait, since this crate has no
//! counterpart to that trait and `rand_core`'s `RngCore` bound is reused
//! instead.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature as P256Signature, SigningKey, VerifyingKey};

use crate::drbg::HmacDrbg;
use crate::{Error, Result};

pub const NBYTES: usize = 32;
/// `sig.r || sig.s`, both fixed-width.
pub const SIGNATURE_LEN: usize = 64;

pub struct SecKey {
    k: SigningKey,
}

impl SecKey {
    /// Generate a private key from an HMAC-DRBG seeded by a cryptographic
    /// random source at context-init time. A hard reboot on a
    /// signature-length mismatch is the caller's responsibility elsewhere,
    /// not here: key generation itself cannot silently truncate.
    pub fn generate(drbg: &mut HmacDrbg) -> SecKey {
        loop {
            let mut candidate = [0u8; NBYTES];
            drbg.generate(&mut candidate);
            if let Ok(k) = SigningKey::from_bytes((&candidate).into()) {
                return SecKey { k };
            }
            // Candidate was zero or >= curve order; vanishingly rare, draw again.
        }
    }

    pub fn from_bytes(bytes: &[u8; NBYTES]) -> Option<SecKey> {
        SigningKey::from_bytes(bytes.into()).ok().map(|k| SecKey { k })
    }

    pub fn to_bytes(&self, bytes: &mut [u8; NBYTES]) {
        bytes.copy_from_slice(self.k.to_bytes().as_slice());
    }

    pub fn genpk(&self) -> PubKey {
        PubKey { p: VerifyingKey::from(&self.k) }
    }

    /// Sign `msg` and wipe the private-key buffer this `SecKey` wraps
    /// immediately after. If the resulting signature is ever not exactly
    /// [`SIGNATURE_LEN`] bytes this returns `Err(Error::SignatureLengthMismatch)`:
    /// that condition is an integrity failure the caller should treat as
    /// fatal (hard reboot), not a recoverable `Result` to retry on.
    pub fn sign(self, msg: &[u8]) -> Result<Signature> {
        let sig: P256Signature = self.k.sign(msg);
        let bytes = sig.to_bytes();
        if bytes.len() != SIGNATURE_LEN {
            return Err(Error::SignatureLengthMismatch);
        }
        Ok(Signature { sig })
        // `self` (and its `SigningKey`) is dropped here, wiping the transient
        // key buffer per the signer's contract.
    }
}

#[derive(Clone)]
pub struct Signature {
    sig: P256Signature,
}

impl Signature {
    pub fn to_bytes(&self, bytes: &mut [u8; SIGNATURE_LEN]) {
        bytes.copy_from_slice(&self.sig.to_bytes());
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Signature> {
        P256Signature::from_slice(bytes).ok().map(|sig| Signature { sig })
    }

    pub fn to_der(&self) -> Vec<u8> {
        self.sig.to_der().as_bytes().to_vec()
    }
}

pub struct PubKey {
    p: VerifyingKey,
}

impl PubKey {
    pub const ES256_ALGORITHM: i64 = -7;

    pub fn from_sec1_bytes(bytes: &[u8]) -> Option<PubKey> {
        VerifyingKey::from_sec1_bytes(bytes).ok().map(|p| PubKey { p })
    }

    pub fn to_coordinates(&self, x: &mut [u8; NBYTES], y: &mut [u8; NBYTES]) {
        let point = self.p.to_encoded_point(false);
        x.copy_from_slice(point.x().expect("uncompressed point has x").as_slice());
        y.copy_from_slice(point.y().expect("uncompressed point has y").as_slice());
    }

    pub fn verify(&self, msg: &[u8], sig: &Signature) -> bool {
        self.p.verify(msg, &sig.sig).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drbg() -> HmacDrbg {
        HmacDrbg::new(b"deterministic test seed material, at least 16 bytes")
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let sk = SecKey::generate(&mut drbg());
        let pk = sk.genpk();
        let msg = b"challenge response payload";
        let sk2 = SecKey::from_bytes(&{
            let mut b = [0u8; 32];
            sk.to_bytes(&mut b);
            b
        })
        .unwrap();
        let sig = sk2.sign(msg).unwrap();
        assert!(pk.verify(msg, &sig));
    }

    #[test]
    fn tampered_message_fails_verification() {
        let sk = SecKey::generate(&mut drbg());
        let pk = sk.genpk();
        let sig = SecKey::from_bytes(&{
            let mut b = [0u8; 32];
            sk.to_bytes(&mut b);
            b
        })
        .unwrap()
        .sign(b"original")
        .unwrap();
        assert!(!pk.verify(b"tampered", &sig));
    }

    #[test]
    fn seckey_from_bytes_rejects_zero() {
        assert!(SecKey::from_bytes(&[0u8; 32]).is_none());
    }

    #[test]
    fn signature_bytes_round_trip() {
        let sk = SecKey::generate(&mut drbg());
        let sig = sk.sign(b"msg").unwrap();
        let mut raw = [0u8; SIGNATURE_LEN];
        sig.to_bytes(&mut raw);
        let restored = Signature::from_bytes(&raw).unwrap();
        let mut raw2 = [0u8; SIGNATURE_LEN];
        restored.to_bytes(&mut raw2);
        assert_eq!(raw, raw2);
    }
}
