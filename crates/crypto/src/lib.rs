//! Crypto primitives for the credential store: AES-256-CTR per-user encryption,
//! ECDSA-P256 / Ed25519 signing, HMAC-SHA1 TOTP, an HMAC-DRBG for key generation,
//! and the device-authentication challenge/response.

pub mod aes_ctr;
pub mod device_auth;
pub mod drbg;
pub mod ecdsa;
#[cfg(feature = "ed25519")]
pub mod ed25519;
pub mod totp;

/// AES key length in bytes (256 bits).
pub const AES_KEY_LEN: usize = 32;
/// AES block length in bytes.
pub const AES_BLOCK_LEN: usize = 16;
/// Per-user nonce length in bytes.
pub const NONCE_LEN: usize = 16;
/// On-disk CTR length in bytes (24 bits stored big-endian in the low 3 bytes).
pub const CTR_LEN: usize = 3;
/// Number of AES blocks the persisted CTR bound is advanced by whenever the
/// in-RAM counter would cross it.
pub const CTR_FLASH_MIN_INCR: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A signing primitive returned a signature of unexpected length. This is an
    /// integrity failure, not a normal error path: the caller is expected to
    /// hard-reboot rather than propagate it.
    SignatureLengthMismatch,
    /// Key material was malformed (wrong length, not on curve, zero scalar, ...).
    InvalidKey,
    /// A requested TOTP parameter was out of the supported range.
    InvalidTotpParameter,
    /// The Ed25519 signing path was invoked without the `ed25519` feature enabled.
    Ed25519Unsupported,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::SignatureLengthMismatch => write!(f, "signature length mismatch"),
            Error::InvalidKey => write!(f, "invalid key material"),
            Error::InvalidTotpParameter => write!(f, "invalid totp parameter"),
            Error::Ed25519Unsupported => write!(f, "ed25519 support not compiled in"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// `destination += source`, big-endian, both of the same length. Used to fold a
/// per-record CTR into the per-user nonce to build a 128-bit AES-CTR IV.
pub fn add_vectors_big_endian(destination: &mut [u8], source: &[u8]) {
    assert_eq!(destination.len(), source.len());
    let mut carry: u16 = 0;
    for i in (0..destination.len()).rev() {
        carry = destination[i] as u16 + source[i] as u16 + carry;
        destination[i] = carry as u8;
        carry >>= 8;
    }
}

/// `destination ^= source`, both of the same length.
pub fn xor_vectors(destination: &mut [u8], source: &[u8]) {
    assert_eq!(destination.len(), source.len());
    for (d, s) in destination.iter_mut().zip(source.iter()) {
        *d ^= s;
    }
}
