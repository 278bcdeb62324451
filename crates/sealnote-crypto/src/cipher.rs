//! AES-256-GCM authenticated encryption
//!
//! The mobile client appends the GCM tag to the ciphertext, so sealed
//! data on the wire is `ciphertext || tag`. This module splits and joins
//! that layout and always runs GCM in detached-tag mode.

use aes_gcm::{
    aead::{generic_array::GenericArray, rand_core::RngCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use thiserror::Error;
use zeroize::Zeroizing;

/// 256-bit key (32 bytes)
pub const KEY_SIZE: usize = 32;
/// 96-bit nonce (12 bytes)
pub const NONCE_SIZE: usize = 12;
/// 128-bit authentication tag (16 bytes)
pub const TAG_SIZE: usize = 16;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed - data may be corrupted or tampered")]
    DecryptionFailed,

    #[error("Invalid key size: expected {KEY_SIZE}, got {0}")]
    InvalidKeySize(usize),

    #[error("Sealed data is {0} bytes, shorter than the {TAG_SIZE}-byte tag")]
    Truncated(usize),
}

/// Generate a cryptographically secure random key
pub fn generate_key() -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(key.as_mut());
    key
}

/// Generate a cryptographically secure random nonce
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Split `ciphertext || tag` into its two parts.
///
/// Fails before any cipher work when there are not even enough bytes for
/// the tag, so GCM never sees a negative-length ciphertext.
pub fn split_tag(sealed: &[u8]) -> Result<(&[u8], &[u8; TAG_SIZE]), CipherError> {
    if sealed.len() < TAG_SIZE {
        return Err(CipherError::Truncated(sealed.len()));
    }

    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);
    let tag: &[u8; TAG_SIZE] = tag
        .try_into()
        .map_err(|_| CipherError::Truncated(sealed.len()))?;

    Ok((ciphertext, tag))
}

/// Encrypt plaintext with AES-256-GCM
///
/// Returns: ciphertext || tag
pub fn seal(
    key: &[u8],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKeySize(key.len()))?;

    let mut buffer = Vec::with_capacity(plaintext.len() + TAG_SIZE);
    buffer.extend_from_slice(plaintext);

    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), b"", &mut buffer)
        .map_err(|_| CipherError::EncryptionFailed)?;

    buffer.extend_from_slice(&tag);
    Ok(buffer)
}

/// Verify and decrypt a detached-tag ciphertext.
///
/// The working buffer is zeroized when verification fails, so no
/// unauthenticated plaintext ever leaves this function.
pub fn open(
    key: &[u8],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    if key.len() != KEY_SIZE {
        return Err(CipherError::InvalidKeySize(key.len()));
    }

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKeySize(key.len()))?;

    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            b"",
            buffer.as_mut_slice(),
            GenericArray::from_slice(tag),
        )
        .map_err(|_| CipherError::DecryptionFailed)?;

    Ok(buffer)
}
