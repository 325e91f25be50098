//! Session secret and acknowledge token generation.
//!
//! Tokens are 8 random bytes rendered in base62. The byte source is injected through
//! [`TokenSource`] so servers, clients and messengers can run on a seeded generator in
//! tests instead of sharing global state.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::error::{ProtocolError, Result};

/// Random bytes per secret or acknowledge token
pub const TOKEN_BYTES: usize = 8;

const BASE62_ALPHABET: &[u8; 62] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Length of an encoded 8-byte token; 62^11 > 2^64
pub const TOKEN_LENGTH: usize = 11;

/// Source of random bytes for secrets and acknowledge tokens
pub trait TokenSource: Send + Sync {
    fn fill(&self, dest: &mut [u8]) -> Result<()>;

    /// A fresh base62 token
    fn token(&self) -> Result<String> {
        let mut bytes = [0u8; TOKEN_BYTES];
        self.fill(&mut bytes)?;
        Ok(encode_base62(&bytes))
    }
}

/// Operating system entropy
#[derive(Debug, Default, Clone, Copy)]
pub struct OsTokenSource;

impl TokenSource for OsTokenSource {
    fn fill(&self, dest: &mut [u8]) -> Result<()> {
        getrandom::fill(dest)
            .map_err(|e| ProtocolError::Custom(format!("Failed to gather entropy: {e}")))
    }
}

/// Deterministic generator for tests and reproducible runs
#[derive(Debug)]
pub struct SeededTokenSource {
    rng: Mutex<StdRng>,
}

impl SeededTokenSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl TokenSource for SeededTokenSource {
    fn fill(&self, dest: &mut [u8]) -> Result<()> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| ProtocolError::Custom("Failed to acquire lock on token generator".to_string()))?;
        rng.fill_bytes(dest);
        Ok(())
    }
}

/// Encode 8 bytes as a fixed-width base62 string (big-endian digit order)
pub fn encode_base62(bytes: &[u8; TOKEN_BYTES]) -> String {
    let mut value = u64::from_be_bytes(*bytes);
    let mut digits = [b'0'; TOKEN_LENGTH];
    for slot in digits.iter_mut().rev() {
        *slot = BASE62_ALPHABET[(value % 62) as usize];
        value /= 62;
    }
    digits.iter().map(|&d| d as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base62_bounds() {
        assert_eq!(encode_base62(&[0; 8]), "00000000000");
        assert_eq!(encode_base62(&[0, 0, 0, 0, 0, 0, 0, 61]), "0000000000z");
        assert_eq!(encode_base62(&[0, 0, 0, 0, 0, 0, 0, 62]), "00000000010");
        assert_eq!(encode_base62(&[0xFF; 8]), "LygHa16AHYF");
    }

    #[test]
    fn test_seeded_source_is_reproducible() {
        let a = SeededTokenSource::new(42);
        let b = SeededTokenSource::new(42);
        let first = a.token().unwrap();
        assert_eq!(first, b.token().unwrap());
        assert_ne!(first, a.token().unwrap());
        assert_eq!(first.len(), TOKEN_LENGTH);
        assert!(first.bytes().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_os_source_tokens_differ() {
        let source = OsTokenSource;
        assert_ne!(source.token().unwrap(), source.token().unwrap());
    }
}
