//! SealNote Crypto - hybrid envelope encryption
//!
//! This crate provides:
//! - AES-256-GCM with a detached 16-byte tag (ciphertext || tag layout)
//! - RSA-OAEP (SHA-256, MGF1-SHA256) key wrapping
//! - Receiver/sender key loading from PEM
//! - `decrypt` / `seal` over the encrypted note envelope

pub mod cipher;
pub mod hybrid;
pub mod keys;

pub use hybrid::{decrypt, seal, DecryptError, EncryptedEnvelope, SealError};
pub use keys::{KeyError, ReceiverKey, SenderKey};
