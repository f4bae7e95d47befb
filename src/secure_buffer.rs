//! # Secure Buffer Module
//!
//! Encrypted-in-memory staging for captured microphone audio. PCM windows are
//! held AES-256-GCM encrypted and only exist in the clear inside a scoped
//! closure; staging copies are wiped on scope exit and the per-buffer key is
//! wiped on drop. Raw audio therefore never sits in the heap in plaintext
//! between scan reads.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use zeroize::Zeroize;

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum SecureBufferError {
    #[error("AES-GCM encryption error")]
    EncryptFailed,
    #[error("AES-GCM decryption error")]
    DecryptFailed,
    #[error("Buffer already wiped")]
    Wiped,
    #[error("Ciphertext truncated")]
    Truncated,
}

/// One encrypted PCM window. The only data accessor is [`with_pcm`]
/// (SecureAudioBuffer::with_pcm), which decrypts into a staging array, hands
/// the slice to the caller, and wipes the staging on exit.
pub struct SecureAudioBuffer {
    key: [u8; 32],
    ciphertext: Vec<u8>,
    sample_count: usize,
    wiped: bool,
}

impl SecureAudioBuffer {
    /// Encrypt `samples` under a fresh random key. The little-endian staging
    /// bytes are wiped before returning.
    pub fn from_pcm(samples: &[i16]) -> Result<Self, SecureBufferError> {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);

        let mut staging: Vec<u8> = Vec::with_capacity(samples.len() * 2);
        for &s in samples {
            staging.extend_from_slice(&s.to_le_bytes());
        }

        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| SecureBufferError::EncryptFailed)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let encrypted = cipher.encrypt(nonce, staging.as_slice());
        staging.zeroize();
        let mut ciphertext = encrypted.map_err(|_| SecureBufferError::EncryptFailed)?;
        ciphertext.splice(0..0, nonce_bytes.iter().cloned());

        Ok(Self {
            key,
            ciphertext,
            sample_count: samples.len(),
            wiped: false,
        })
    }

    /// Number of PCM samples held.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Decrypt, hand the PCM slice to `f`, and wipe the plaintext staging
    /// before returning — on the error paths too.
    pub fn with_pcm<R>(&self, f: impl FnOnce(&[i16]) -> R) -> Result<R, SecureBufferError> {
        if self.wiped {
            return Err(SecureBufferError::Wiped);
        }
        if self.ciphertext.len() < NONCE_LEN {
            return Err(SecureBufferError::Truncated);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| SecureBufferError::DecryptFailed)?;
        let nonce = Nonce::from_slice(&self.ciphertext[..NONCE_LEN]);
        let mut staging = cipher
            .decrypt(nonce, &self.ciphertext[NONCE_LEN..])
            .map_err(|_| SecureBufferError::DecryptFailed)?;

        if staging.len() != self.sample_count * 2 {
            staging.zeroize();
            return Err(SecureBufferError::Truncated);
        }

        let mut samples: Vec<i16> = staging
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        staging.zeroize();

        let result = f(&samples);
        samples.zeroize();
        Ok(result)
    }

    /// Destroy the buffer contents and key. Idempotent; subsequent accessor
    /// calls fail with [`SecureBufferError::Wiped`].
    pub fn wipe(&mut self) {
        self.key.zeroize();
        self.ciphertext.zeroize();
        self.ciphertext.clear();
        self.wiped = true;
    }
}

impl Drop for SecureAudioBuffer {
    fn drop(&mut self) {
        self.wipe();
    }
}

/// Wipe a temporary PCM staging array in place. Capture paths call this after
/// every device read.
pub fn wipe_staging(samples: &mut [i16]) {
    samples.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_scoped_access() {
        let pcm: Vec<i16> = (0..4096).map(|i| ((i % 128) as i16 - 64) * 100).collect();
        let buffer = SecureAudioBuffer::from_pcm(&pcm).unwrap();
        assert_eq!(buffer.sample_count(), 4096);

        let sum: i64 = buffer
            .with_pcm(|samples| samples.iter().map(|&s| s as i64).sum())
            .unwrap();
        let expected: i64 = pcm.iter().map(|&s| s as i64).sum();
        assert_eq!(sum, expected);
    }

    #[test]
    fn test_access_after_wipe_fails() {
        let mut buffer = SecureAudioBuffer::from_pcm(&[1, 2, 3]).unwrap();
        buffer.wipe();
        assert!(matches!(
            buffer.with_pcm(|_| ()),
            Err(SecureBufferError::Wiped)
        ));
        // Wipe is idempotent.
        buffer.wipe();
    }

    #[test]
    fn test_ciphertext_does_not_contain_plaintext() {
        // A recognizable constant pattern must not appear in the ciphertext.
        let pcm = vec![0x5A5Ai16; 512];
        let buffer = SecureAudioBuffer::from_pcm(&pcm).unwrap();
        let pattern = [0x5Au8, 0x5A, 0x5A, 0x5A, 0x5A, 0x5A, 0x5A, 0x5A];
        let found = buffer
            .ciphertext
            .windows(pattern.len())
            .any(|w| w == pattern);
        assert!(!found);
    }

    #[test]
    fn test_wipe_staging_zeroes_samples() {
        let mut staging = vec![123i16; 64];
        wipe_staging(&mut staging);
        assert!(staging.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_empty_window() {
        let buffer = SecureAudioBuffer::from_pcm(&[]).unwrap();
        let len = buffer.with_pcm(|s| s.len()).unwrap();
        assert_eq!(len, 0);
    }
}
