//! AES-256-GCM sealing/unsealing of secret material.
//!
//! Blobs carry the nonce, ciphertext, and authentication tag separately,
//! each base64-encoded, matching the records the dashboard writes.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use crate::store::EncryptedBlob;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid base64 in encrypted blob")]
    Encoding,

    #[error("invalid key length, expected 32 bytes")]
    KeyLength,

    #[error("invalid nonce length, expected 12 bytes")]
    NonceLength,

    #[error("authenticated decryption failed")]
    Decrypt,
}

/// Unseal a blob with the given 256-bit key.
pub fn decrypt(blob: &EncryptedBlob, key: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if key.len() != 32 {
        return Err(EnvelopeError::KeyLength);
    }
    let iv = BASE64
        .decode(&blob.iv)
        .map_err(|_| EnvelopeError::Encoding)?;
    if iv.len() != 12 {
        return Err(EnvelopeError::NonceLength);
    }
    let mut ciphertext = BASE64
        .decode(&blob.encrypted)
        .map_err(|_| EnvelopeError::Encoding)?;
    let tag = BASE64
        .decode(&blob.tag)
        .map_err(|_| EnvelopeError::Encoding)?;
    ciphertext.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| EnvelopeError::Decrypt)
}

/// Seal plaintext under a 256-bit key. The proxy only decrypts in the
/// request path; this is for seeding stores and fixtures.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<EncryptedBlob, EnvelopeError> {
    use rand::RngCore;

    if key.len() != 32 {
        return Err(EnvelopeError::KeyLength);
    }
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    let sealed = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|_| EnvelopeError::Decrypt)?;

    // aes-gcm appends the 16-byte tag; the blob stores it separately.
    let (ciphertext, tag) = sealed.split_at(sealed.len() - 16);
    Ok(EncryptedBlob {
        iv: BASE64.encode(nonce),
        encrypted: BASE64.encode(ciphertext),
        tag: BASE64.encode(tag),
    })
}
