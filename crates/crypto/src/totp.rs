//! RFC 6238 TOTP / RFC 4226 HOTP dynamic truncation, HMAC-SHA1 only: this
//! device's wire contract narrows a wider SHA1/SHA256/SHA512 enum down to
//! SHA1. Grounded on `apps/vault/src/totp.rs`
//! (`generate_hmac_bytes`/`generate_totp_code`) and on
//! `LOGIC/logic_encryption.c`'s `logic_encryption_generate_totp` for the
//! exact digit range and remaining-seconds behavior.

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::{Error, Result};

pub const MIN_DIGITS: u8 = 6;
pub const MAX_DIGITS: u8 = 8;

/// SHA version field on stored TOTP material. Only SHA1 (0) is honoured at
/// read time today; 1 (SHA256) and 2 (SHA512) are reserved for future use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaVersion {
    Sha1 = 0,
    Sha256 = 1,
    Sha512 = 2,
}

impl ShaVersion {
    pub fn from_u8(v: u8) -> Option<ShaVersion> {
        match v {
            0 => Some(ShaVersion::Sha1),
            1 => Some(ShaVersion::Sha256),
            2 => Some(ShaVersion::Sha512),
            _ => None,
        }
    }
}

fn digits_power(digits: u8) -> u32 {
    10u32.pow(digits as u32)
}

fn dynamic_truncate(hmac_output: &[u8]) -> u32 {
    let offset = (hmac_output[hmac_output.len() - 1] & 0x0f) as usize;
    (((hmac_output[offset] & 0x7f) as u32) << 24)
        | ((hmac_output[offset + 1] as u32) << 16)
        | ((hmac_output[offset + 2] as u32) << 8)
        | (hmac_output[offset + 3] as u32)
}

/// Result of a TOTP generation: the formatted digit string and the number of
/// seconds remaining in the current time step.
pub struct TotpOutput {
    pub code: String,
    pub remaining_secs: u8,
}

/// Generate the current TOTP code for `secret`, HMAC-SHA1 only. `sha_ver`
/// other than [`ShaVersion::Sha1`] is rejected: the stored field keeps room
/// for future algorithms but only SHA1 is honoured at read time.
pub fn generate(
    secret: &[u8],
    digits: u8,
    time_step: u8,
    sha_ver: ShaVersion,
    unix_time: u64,
) -> Result<TotpOutput> {
    if !(MIN_DIGITS..=MAX_DIGITS).contains(&digits) {
        return Err(Error::InvalidTotpParameter);
    }
    if sha_ver != ShaVersion::Sha1 {
        return Err(Error::InvalidTotpParameter);
    }
    let step = if time_step == 0 {
        log::warn!("totp time_step was 0, forcing to 1 to avoid a division by zero");
        1
    } else {
        time_step
    } as u64;

    let counter = unix_time / step;
    let remaining_secs = (step - (unix_time % step)) as u8;

    let mut mac = Hmac::<Sha1>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(&counter.to_be_bytes());
    let hmac_output = mac.finalize().into_bytes();

    let truncated = dynamic_truncate(&hmac_output) % digits_power(digits);
    let code = format!("{:01$}", truncated, digits as usize);

    Ok(TotpOutput { code, remaining_secs })
}
