//! Device-authentication challenge/response. The dispatcher in `core` owns
//! message framing and the jitter delay before replying; this module owns
//! only the cryptographic comparison. Built from `logic_encryption.c`'s
//! CTR-construction primitives (`logic_encryption_add_vector_to_other`)
//! applied to the platform-serial challenge/response exchange.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes256;
use subtle::ConstantTimeEq;

const CTR_REQ_B1: u8 = 0x02;
const CTR_RESP_B1: u8 = 0x03;
const BLOCK_LEN: usize = 16;

pub const CIPHERTEXT_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeError {
    /// `suggested_counter` was not strictly greater than the stored counter
    /// (and the stored counter was not the `u32::MAX` lockout sentinel).
    CounterNotMonotonic,
    /// Decrypted plaintext did not match `be32(counter) || be32(serial)`.
    PlaintextMismatch,
}

fn derive_ctr_block(purpose_byte: u8, counter: u32) -> [u8; BLOCK_LEN] {
    let mut block = [0u8; BLOCK_LEN];
    block[1] = purpose_byte;
    block[BLOCK_LEN - 4..].copy_from_slice(&counter.to_be_bytes());
    block
}

fn aes_ctr_block(cipher: &Aes256, ctr_block: &[u8; BLOCK_LEN], data: &mut [u8; CIPHERTEXT_LEN]) {
    let mut keystream = GenericArray::clone_from_slice(ctr_block);
    cipher.encrypt_block(&mut keystream);
    for (d, k) in data.iter_mut().zip(keystream.iter()) {
        *d ^= k;
    }
}

/// Evaluate a device-authentication attempt. On success, returns the
/// response ciphertext and the new value the caller should persist as the
/// stored auth counter. Timing of the reply delay is the dispatcher's
/// responsibility; the plaintext comparison here is constant-time.
pub fn respond(
    device_ops_key: &[u8; 32],
    platform_serial: u32,
    stored_counter: u32,
    suggested_counter: u32,
    request_ciphertext: &[u8; CIPHERTEXT_LEN],
) -> Result<([u8; CIPHERTEXT_LEN], u32), ChallengeError> {
    if !(suggested_counter > stored_counter || stored_counter == u32::MAX) {
        return Err(ChallengeError::CounterNotMonotonic);
    }

    let cipher = Aes256::new(GenericArray::from_slice(device_ops_key));

    let ctr_req = derive_ctr_block(CTR_REQ_B1, suggested_counter);
    let mut plaintext = *request_ciphertext;
    aes_ctr_block(&cipher, &ctr_req, &mut plaintext);

    let mut expected = [0u8; CIPHERTEXT_LEN];
    expected[..4].copy_from_slice(&suggested_counter.to_be_bytes());
    expected[4..8].copy_from_slice(&platform_serial.to_be_bytes());

    if plaintext.ct_eq(&expected).unwrap_u8() != 1 {
        return Err(ChallengeError::PlaintextMismatch);
    }

    let ctr_resp = derive_ctr_block(CTR_RESP_B1, suggested_counter);
    let mut response = expected;
    aes_ctr_block(&cipher, &ctr_resp, &mut response);

    Ok((response, suggested_counter))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt_request(key: &[u8; 32], counter: u32, serial: u32) -> [u8; CIPHERTEXT_LEN] {
        let cipher = Aes256::new(GenericArray::from_slice(key));
        let ctr_req = derive_ctr_block(CTR_REQ_B1, counter);
        let mut plaintext = [0u8; CIPHERTEXT_LEN];
        plaintext[..4].copy_from_slice(&counter.to_be_bytes());
        plaintext[4..8].copy_from_slice(&serial.to_be_bytes());
        aes_ctr_block(&cipher, &ctr_req, &mut plaintext);
        plaintext
    }

    #[test]
    fn accepts_and_round_trips() {
        let key = [0x5au8; 32];
        let serial = 0xdead_beef;
        let ct = encrypt_request(&key, 10, serial);

        let (response, new_counter) = respond(&key, serial, 0, 10, &ct).unwrap();
        assert_eq!(new_counter, 10);

        // Response round-trips: decrypting it under CTR_resp recovers the same plaintext.
        let cipher = Aes256::new(GenericArray::from_slice(&key));
        let ctr_resp = derive_ctr_block(CTR_RESP_B1, 10);
        let mut decrypted = response;
        aes_ctr_block(&cipher, &ctr_resp, &mut decrypted);
        assert_eq!(&decrypted[..4], &10u32.to_be_bytes());
        assert_eq!(&decrypted[4..8], &serial.to_be_bytes());
    }

    #[test]
    fn rejects_non_monotonic_counter() {
        let key = [0x5au8; 32];
        let serial = 42;
        let ct = encrypt_request(&key, 10, serial);
        assert_eq!(respond(&key, serial, 10, 10, &ct), Err(ChallengeError::CounterNotMonotonic));
        assert_eq!(respond(&key, serial, 11, 10, &ct), Err(ChallengeError::CounterNotMonotonic));
    }

    #[test]
    fn max_counter_is_a_lockout_override() {
        let key = [0x5au8; 32];
        let serial = 42;
        let ct = encrypt_request(&key, 10, serial);
        assert!(respond(&key, serial, u32::MAX, 10, &ct).is_ok());
    }

    #[test]
    fn rejects_mismatched_plaintext() {
        let key = [0x5au8; 32];
        let other_key = [0x11u8; 32];
        let serial = 42;
        let ct = encrypt_request(&other_key, 10, serial);
        assert_eq!(respond(&key, serial, 0, 10, &ct), Err(ChallengeError::PlaintextMismatch));
    }

    #[test]
    fn resubmitting_same_request_is_rejected_after_accept() {
        let key = [0x5au8; 32];
        let serial = 7;
        let ct = encrypt_request(&key, 10, serial);
        let (_, stored) = respond(&key, serial, 0, 10, &ct).unwrap();
        assert_eq!(respond(&key, serial, stored, 10, &ct), Err(ChallengeError::CounterNotMonotonic));
    }
}
