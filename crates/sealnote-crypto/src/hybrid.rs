//! Hybrid envelope: RSA-OAEP wrapped content key + AES-256-GCM body
//!
//! Decryption order is fixed:
//! 1. split `sealed_data` into ciphertext and the trailing 16-byte tag
//! 2. OAEP-unwrap the 32-byte content key
//! 3. verify the tag and decrypt
//!
//! Unwrap failures carry no detail, so a caller can't be used as a
//! padding oracle.

use thiserror::Error;
use zeroize::Zeroizing;

use crate::cipher::{self, CipherError, NONCE_SIZE};
use crate::keys::{KeyError, ReceiverKey, SenderKey};

/// Inner ciphertext container of a stored note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    /// OAEP ciphertext of the AES key
    pub wrapped_key: Vec<u8>,
    pub iv: [u8; NONCE_SIZE],
    /// ciphertext || tag
    pub sealed_data: Vec<u8>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptError {
    #[error("Sealed data is {0} bytes, shorter than the authentication tag")]
    TruncatedCiphertext(usize),

    #[error("Key unwrap failed")]
    KeyUnwrapFailed,

    #[error("Authentication failed")]
    AuthenticationFailed,
}

#[derive(Error, Debug)]
pub enum SealError {
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Open an envelope with the receiver's private key.
///
/// Plaintext is only returned after the GCM tag verifies.
pub fn decrypt(
    envelope: &EncryptedEnvelope,
    key: &ReceiverKey,
) -> Result<Zeroizing<Vec<u8>>, DecryptError> {
    let (ciphertext, tag) = cipher::split_tag(&envelope.sealed_data)
        .map_err(|_| DecryptError::TruncatedCiphertext(envelope.sealed_data.len()))?;

    let content_key = key
        .unwrap_content_key(&envelope.wrapped_key)
        .ok_or(DecryptError::KeyUnwrapFailed)?;

    cipher::open(&content_key, &envelope.iv, ciphertext, tag)
        .map_err(|_| DecryptError::AuthenticationFailed)
}

/// Counterpart of [`decrypt`]: fresh content key and IV per call.
pub fn seal(plaintext: &[u8], recipient: &SenderKey) -> Result<EncryptedEnvelope, SealError> {
    let content_key = cipher::generate_key();
    let iv = cipher::generate_nonce();

    let sealed_data = cipher::seal(content_key.as_ref(), &iv, plaintext)?;
    let wrapped_key = recipient.wrap_content_key(content_key.as_ref())?;

    Ok(EncryptedEnvelope {
        wrapped_key,
        iv,
        sealed_data,
    })
}
