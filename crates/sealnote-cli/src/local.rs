//! `sealnote decrypt` and `sealnote seal`: single files, no cloud

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::Args;
use sealnote_core::dispatch::DecryptedArtifact;
use sealnote_core::envelope::{self, NoteKind, NoteWrapper};
use sealnote_crypto::{ReceiverKey, SenderKey};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Args, Debug)]
pub struct DecryptArgs {
    /// Wrapper (`{"type", "payload"}`) or bare envelope JSON
    pub payload: PathBuf,

    #[arg(long, env = "SEALNOTE_PRIVATE_KEY")]
    pub private_key: PathBuf,

    /// Write the plaintext here instead of printing it
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SealArgs {
    /// Receiver public key (SPKI or PKCS#1 PEM)
    #[arg(long)]
    pub public_key: PathBuf,

    /// text or audio
    #[arg(long)]
    pub kind: NoteKind,

    /// File to encrypt; raw audio bytes for `audio`
    pub input: PathBuf,

    /// Defaults to `<uuid>.json` in the current directory
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub fn decrypt(args: DecryptArgs) -> anyhow::Result<()> {
    let bytes = fs::read(&args.payload)
        .with_context(|| format!("Failed to read {}", args.payload.display()))?;
    let document = envelope::parse_document(&bytes)?;
    let key = ReceiverKey::load(&args.private_key)?;

    let plaintext = sealnote_crypto::decrypt(&document.envelope, &key)?;
    let output = match document.kind {
        Some(kind) => DecryptedArtifact::new(kind, plaintext).content()?,
        None => plaintext,
    };

    match args.out {
        Some(path) => {
            fs::write(&path, output.as_slice())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {} bytes to {}", output.len(), path.display());
        }
        None => match std::str::from_utf8(&output) {
            Ok(text) => println!("{text}"),
            Err(_) => anyhow::bail!(
                "Plaintext is binary ({} bytes); pass --out to save it",
                output.len()
            ),
        },
    }
    Ok(())
}

pub fn seal(args: SealArgs) -> anyhow::Result<()> {
    let recipient = SenderKey::load(&args.public_key)?;
    let raw = fs::read(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;

    // Audio travels as base64 text inside the envelope
    let plaintext = match args.kind {
        NoteKind::Text => {
            std::str::from_utf8(&raw).context("Text notes must be UTF-8")?;
            raw
        }
        NoteKind::Audio => STANDARD.encode(&raw).into_bytes(),
    };

    let wrapper = NoteWrapper {
        kind: args.kind,
        envelope: sealnote_crypto::seal(&plaintext, &recipient)?,
    };

    let out = args
        .out
        .unwrap_or_else(|| PathBuf::from(format!("{}.json", Uuid::new_v4())));
    fs::write(&out, envelope::encode_wrapper(&wrapper)?)
        .with_context(|| format!("Failed to write {}", out.display()))?;

    println!("Sealed {} note into {}", wrapper.kind, out.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::rand_core::OsRng;
    use rsa::RsaPrivateKey;
    use std::path::Path;

    /// Writes a fresh key pair, returns (private, public) paths.
    fn key_pair(dir: &Path) -> (PathBuf, PathBuf) {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let private = dir.join("private_key.pem");
        let public = dir.join("public_key.pem");
        fs::write(&private, key.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes()).unwrap();
        fs::write(&public, key.to_public_key().to_public_key_pem(LineEnding::LF).unwrap()).unwrap();
        (private, public)
    }

    #[test]
    fn test_seal_then_decrypt_audio() {
        let dir = tempfile::tempdir().unwrap();
        let (private, public) = key_pair(dir.path());

        let audio = vec![0x00, 0x00, 0x00, 0x18, b'f', b't', b'y', b'p', 0xFF];
        let input = dir.path().join("memo.m4a");
        fs::write(&input, &audio).unwrap();

        let sealed = dir.path().join("sealed.json");
        seal(SealArgs {
            public_key: public,
            kind: NoteKind::Audio,
            input,
            out: Some(sealed.clone()),
        })
        .unwrap();

        let wrapper = envelope::parse_wrapper(&fs::read(&sealed).unwrap()).unwrap();
        assert_eq!(wrapper.kind, NoteKind::Audio);

        let recovered = dir.path().join("recovered.m4a");
        decrypt(DecryptArgs {
            payload: sealed,
            private_key: private,
            out: Some(recovered.clone()),
        })
        .unwrap();
        assert_eq!(fs::read(recovered).unwrap(), audio);
    }

    #[test]
    fn test_decrypt_bare_envelope_text() {
        let dir = tempfile::tempdir().unwrap();
        let (private, public) = key_pair(dir.path());

        let envelope = sealnote_crypto::seal(b"buy milk", &SenderKey::load(&public).unwrap()).unwrap();
        let document = bare_envelope_json(&envelope);
        let payload = dir.path().join("payload.json");
        fs::write(&payload, document).unwrap();

        let out = dir.path().join("note.txt");
        decrypt(DecryptArgs {
            payload,
            private_key: private,
            out: Some(out.clone()),
        })
        .unwrap();
        assert_eq!(fs::read(out).unwrap(), b"buy milk");
    }

    #[test]
    fn test_seal_rejects_non_utf8_text() {
        let dir = tempfile::tempdir().unwrap();
        let (_, public) = key_pair(dir.path());
        let input = dir.path().join("note.txt");
        fs::write(&input, [0xFF, 0xFE]).unwrap();

        let out = dir.path().join("sealed.json");
        assert!(seal(SealArgs {
            public_key: public,
            kind: NoteKind::Text,
            input,
            out: Some(out.clone()),
        })
        .is_err());
        assert!(!out.exists());
    }

    fn bare_envelope_json(envelope: &sealnote_crypto::EncryptedEnvelope) -> String {
        format!(
            r#"{{"encryptedKey":"{}","iv":"{}","data":"{}"}}"#,
            STANDARD.encode(&envelope.wrapped_key),
            STANDARD.encode(envelope.iv),
            STANDARD.encode(&envelope.sealed_data)
        )
    }
}
