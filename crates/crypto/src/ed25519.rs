//! Ed25519 signing. Not present in `ctap-crypto` (OpenSK does not implement
//! Ed25519); grounded on `vault/Cargo.toml`'s `ed25519-compact` dependency and
//! its `ed25519 = ["ed25519-compact"]` feature gate, carried for exactly this
//! purpose.

use ed25519_compact::{KeyPair, Seed, Signature as CompactSignature};

use crate::{Error, Result};

pub const SEED_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
pub const PUBLIC_KEY_LEN: usize = 32;

pub struct SecKey {
    pair: KeyPair,
}

impl SecKey {
    /// Ed25519 keys are raw random bytes: no DRBG involved here, unlike the
    /// ECDSA-P256 path.
    pub fn from_seed(seed_bytes: &[u8; SEED_LEN]) -> SecKey {
        let seed = Seed::new(*seed_bytes);
        SecKey { pair: KeyPair::from_seed(seed) }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        *self.pair.pk.as_ref().try_into().expect("ed25519 public key is 32 bytes")
    }

    /// Sign `msg`, wiping the key material this wraps immediately on return.
    pub fn sign(self, msg: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
        let sig = self.pair.sk.sign(msg, None);
        let bytes: [u8; SIGNATURE_LEN] =
            sig.as_ref().try_into().map_err(|_| Error::SignatureLengthMismatch)?;
        Ok(bytes)
        // `self.pair` drops here; `ed25519-compact`'s `SecretKey` zeroizes on drop.
    }
}

pub fn verify(public_key: &[u8; PUBLIC_KEY_LEN], msg: &[u8], sig: &[u8; SIGNATURE_LEN]) -> bool {
    let Ok(pk) = ed25519_compact::PublicKey::from_slice(public_key) else { return false };
    let Ok(signature) = CompactSignature::from_slice(sig) else { return false };
    pk.verify(msg, &signature).is_ok()
}
