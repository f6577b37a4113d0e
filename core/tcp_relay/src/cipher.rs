//! Payload cipher boundary
//!
//! The relay treats the cipher as an opaque, possibly stateful byte
//! transform. Output length may differ from input length, and two calls on
//! the same plaintext may produce different ciphertext; the rewriter only
//! tracks the per-call length delta ("hacklen").

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::CipherError;

/// Poly1305 tag length
const TAG_LEN: usize = 16;

/// Byte-stream cipher applied to TCP payloads
///
/// Implementations are shared between the egress and ingress workers, so any
/// internal state must be synchronized by the implementation itself.
pub trait Cipher: Send + Sync {
    /// Transform host plaintext into wire ciphertext
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Transform wire ciphertext back into host plaintext
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// Identity transform
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCipher;

impl Cipher for PassthroughCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(ciphertext.to_vec())
    }
}

/// ChaCha20-Poly1305 with a fresh random nonce per payload
///
/// Frame layout: `nonce (12) || ciphertext || tag (16)`. Every payload grows
/// by [`SealedCipher::OVERHEAD`] bytes.
pub struct SealedCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl SealedCipher {
    /// Bytes added to every payload
    pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

    /// Create from a 32-byte key
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        let unbound =
            UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| CipherError::InvalidKey(key.len()))?;

        Ok(SealedCipher {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }
}

impl Cipher for SealedCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CipherError::Random)?;

        let mut body = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut body,
            )
            .map_err(|_| CipherError::Unauthenticated)?;

        let mut frame = Vec::with_capacity(NONCE_LEN + body.len());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() < Self::OVERHEAD {
            return Err(CipherError::FrameTooShort(ciphertext.len()));
        }

        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CipherError::FrameTooShort(ciphertext.len()))?;

        let mut body = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut body)
            .map_err(|_| CipherError::Unauthenticated)?;

        Ok(plaintext.to_vec())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn test_passthrough_is_identity() {
        let cipher = PassthroughCipher;
        assert_eq!(cipher.encrypt(b"abc").unwrap(), b"abc");
        assert_eq!(cipher.decrypt(b"abc").unwrap(), b"abc");
    }

    #[test]
    fn test_sealed_expands_and_opens() {
        let cipher = SealedCipher::new(&KEY).unwrap();
        let frame = cipher.encrypt(b"GET / HTTP/1.1\r\n").unwrap();

        assert_eq!(frame.len(), 16 + SealedCipher::OVERHEAD);
        assert_eq!(cipher.decrypt(&frame).unwrap(), b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn test_sealed_is_not_deterministic() {
        let cipher = SealedCipher::new(&KEY).unwrap();
        let a = cipher.encrypt(b"same bytes").unwrap();
        let b = cipher.encrypt(b"same bytes").unwrap();

        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
    }

    #[test]
    fn test_sealed_rejects_tampering() {
        let cipher = SealedCipher::new(&KEY).unwrap();
        let mut frame = cipher.encrypt(b"payload").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;

        assert_eq!(cipher.decrypt(&frame).unwrap_err(), CipherError::Unauthenticated);
        assert_eq!(
            cipher.decrypt(&[0u8; 10]).unwrap_err(),
            CipherError::FrameTooShort(10)
        );
    }

    #[test]
    fn test_sealed_rejects_bad_key() {
        assert_eq!(
            SealedCipher::new(&[1u8; 16]).err(),
            Some(CipherError::InvalidKey(16))
        );
    }
}
