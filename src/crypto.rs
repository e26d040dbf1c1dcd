// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Authenticated encryption of block payloads and CSPRNG helpers.
//!
//! Payloads are sealed with AES-256-GCM under a process-wide key generated
//! from the OS CSPRNG on first use. The key is never persisted or rotated;
//! its lifetime is the process's. Sealed output is laid out as
//! `nonce (12 bytes) ‖ ciphertext ‖ tag (16 bytes)`, with a fresh random
//! nonce per call.

use aes_gcm::{aead::Aead, Aes256Gcm, Key, KeyInit, Nonce};
use rand::{rngs::OsRng, RngCore};
use std::sync::OnceLock;

use crate::OramError;

/// Size in bytes of the AES-GCM nonce prefixed to every sealed payload.
pub const NONCE_SIZE: usize = 12;
/// Size in bytes of the GCM authentication tag appended to every sealed payload.
pub const TAG_SIZE: usize = 16;

const KEY_SIZE: usize = 32;

static PROCESS_CIPHER: OnceLock<Aes256Gcm> = OnceLock::new();

fn process_cipher() -> Result<&'static Aes256Gcm, OramError> {
    if let Some(cipher) = PROCESS_CIPHER.get() {
        return Ok(cipher);
    }
    let mut key = [0u8; KEY_SIZE];
    OsRng
        .try_fill_bytes(&mut key)
        .map_err(|e| OramError::Rng(e.to_string()))?;
    // If another thread won the race its key is kept and this one discarded.
    Ok(PROCESS_CIPHER.get_or_init(|| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key))))
}

/// Seals `plaintext` under the process key.
///
/// Returns `nonce ‖ ciphertext ‖ tag`. Every call draws a fresh nonce from
/// the OS CSPRNG, so sealing the same plaintext twice yields distinct output.
///
/// # Errors
///
/// [`OramError::Rng`] if the CSPRNG fails, [`OramError::Crypto`] if the AEAD
/// rejects the input. Both are fatal to the caller.
pub fn seal(plaintext: &[u8]) -> Result<Vec<u8>, OramError> {
    let cipher = process_cipher()?;
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| OramError::Rng(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| OramError::Crypto("encryption failed"))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Opens a payload produced by [`seal`], verifying its authentication tag.
///
/// # Errors
///
/// [`OramError::Crypto`] on truncation, malformed layout, or tag mismatch.
/// Never silently recovered.
pub fn open(sealed: &[u8]) -> Result<Vec<u8>, OramError> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(OramError::Crypto("sealed payload too short"));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    process_cipher()?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| OramError::Crypto("authentication tag mismatch"))
}

/// A uniform random `u32` from the OS CSPRNG.
///
/// # Errors
///
/// [`OramError::Rng`] if the CSPRNG fails.
pub fn secure_random_u32() -> Result<u32, OramError> {
    let mut buf = [0u8; 4];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| OramError::Rng(e.to_string()))?;
    Ok(u32::from_le_bytes(buf))
}

/// A random index in `[0, range)`; returns 0 when `range` is 0.
///
/// Modulo reduction of a 32-bit draw; the bias is negligible for the small
/// ranges (leaf counts) used here.
///
/// # Errors
///
/// [`OramError::Rng`] if the CSPRNG fails.
pub fn secure_random_index(range: u64) -> Result<u64, OramError> {
    if range == 0 {
        return Ok(0);
    }
    Ok(u64::from(secure_random_u32()?) % range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        for plaintext in [
            &b""[..],
            &b"hello"[..],
            &b"/example/route -> eth0"[..],
            &[0xAAu8; 4096][..],
        ] {
            let sealed = seal(plaintext).unwrap();
            assert_eq!(sealed.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);
            assert_eq!(open(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn tampering_is_detected() {
        let sealed = seal(b"hello").unwrap();
        // Flip a single bit in every region: nonce, ciphertext body, tag.
        for index in [0, NONCE_SIZE, NONCE_SIZE + 2, sealed.len() - 1] {
            let mut corrupted = sealed.clone();
            corrupted[index] ^= 0x01;
            assert!(matches!(open(&corrupted), Err(OramError::Crypto(_))));
        }
    }

    #[test]
    fn truncated_input_is_rejected() {
        let sealed = seal(b"hello").unwrap();
        assert!(matches!(
            open(&sealed[..NONCE_SIZE + TAG_SIZE - 1]),
            Err(OramError::Crypto(_))
        ));
        assert!(matches!(open(&[]), Err(OramError::Crypto(_))));
    }

    #[test]
    fn nonces_are_fresh_per_call() {
        let first = seal(b"same plaintext").unwrap();
        let second = seal(b"same plaintext").unwrap();
        assert_ne!(first, second);
        assert_ne!(first[..NONCE_SIZE], second[..NONCE_SIZE]);
    }

    #[test]
    fn random_index_handles_zero_range() {
        assert_eq!(secure_random_index(0).unwrap(), 0);
        assert_eq!(secure_random_index(1).unwrap(), 0);
        for _ in 0..64 {
            assert!(secure_random_index(32).unwrap() < 32);
        }
    }
}
