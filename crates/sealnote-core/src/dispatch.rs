//! Content dispatch - decrypted notes become files
//!
//! Text notes are written verbatim. Audio notes arrive as base64 text
//! (the client encodes the recording before encrypting it) and are decoded
//! once more before writing.
//!
//! Names are `received_<kind>_<UTC micros>_<seq>.<ext>`. The sequence is
//! shared by every clone of a sink and names are claimed without
//! replacing, so two artifacts never land on the same path. Content goes
//! to a hidden `.partial` file first and only gets its artifact name once
//! fully synced.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;
use tokio::time::timeout;
use zeroize::Zeroizing;

use crate::envelope::NoteKind;

/// Collisions only happen when another writer shares the directory
const MAX_NAME_ATTEMPTS: usize = 16;

/// Cancellation is checked between chunks
const WRITE_CHUNK: usize = 1 << 20;

/// How long a timed-out dispatch waits for its writer to clean up
const CLEANUP_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Text note is not valid UTF-8: {0}")]
    InvalidTextEncoding(String),

    #[error("Audio note is not valid base64: {0}")]
    InvalidAudioEncoding(String),

    #[error("Failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Write did not finish within {0:?}")]
    TimedOut(Duration),
}

/// A note that has passed decryption, not yet written
pub struct DecryptedArtifact {
    pub kind: NoteKind,
    /// Decrypted payload; base64 text for audio
    pub bytes: Zeroizing<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

impl DecryptedArtifact {
    pub fn new(kind: NoteKind, bytes: Zeroizing<Vec<u8>>) -> Self {
        Self {
            kind,
            bytes,
            created_at: Utc::now(),
        }
    }

    /// The exact bytes that go to disk.
    pub fn content(&self) -> Result<Zeroizing<Vec<u8>>, DispatchError> {
        match self.kind {
            NoteKind::Text => {
                std::str::from_utf8(&self.bytes)
                    .map_err(|e| DispatchError::InvalidTextEncoding(e.to_string()))?;
                Ok(self.bytes.clone())
            }
            NoteKind::Audio => {
                let text = std::str::from_utf8(&self.bytes)
                    .map_err(|e| DispatchError::InvalidAudioEncoding(e.to_string()))?;
                decode_audio(text).map(Zeroizing::new)
            }
        }
    }
}

/// Decode base64 audio text, ignoring line breaks and other ASCII whitespace.
pub fn decode_audio(text: &str) -> Result<Vec<u8>, DispatchError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| DispatchError::InvalidAudioEncoding(e.to_string()))
}

/// Where a note ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub kind: NoteKind,
    pub path: PathBuf,
    pub bytes_written: usize,
    pub created_at: DateTime<Utc>,
}

/// Append-only output directory
#[derive(Debug, Clone)]
pub struct OutputSink {
    dir: PathBuf,
    sequence: Arc<AtomicU64>,
}

impl OutputSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sequence: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Decode by kind and write exactly one new file.
    pub async fn dispatch(&self, kind: NoteKind, plaintext: Zeroizing<Vec<u8>>) -> Result<ArtifactRef, DispatchError> {
        self.persist(&DecryptedArtifact::new(kind, plaintext)).await
    }

    /// [`dispatch`](Self::dispatch), giving up after `limit`.
    pub async fn dispatch_within(
        &self,
        kind: NoteKind,
        plaintext: Zeroizing<Vec<u8>>,
        limit: Duration,
    ) -> Result<ArtifactRef, DispatchError> {
        self.persist_within(&DecryptedArtifact::new(kind, plaintext), limit)
            .await
    }

    pub async fn persist(&self, artifact: &DecryptedArtifact) -> Result<ArtifactRef, DispatchError> {
        // Validate content before touching the filesystem
        let content = artifact.content()?;
        let writer = self.writer(artifact, content, Arc::new(AtomicBool::new(false)));
        self.joined(tokio::task::spawn_blocking(move || writer.write()).await)
    }

    /// Write with a deadline. On expiry the writer is told to stop and its
    /// partial file is removed; no artifact name ever holds a partial note.
    pub async fn persist_within(
        &self,
        artifact: &DecryptedArtifact,
        limit: Duration,
    ) -> Result<ArtifactRef, DispatchError> {
        let content = artifact.content()?;
        let cancelled = Arc::new(AtomicBool::new(false));
        let writer = self.writer(artifact, content, Arc::clone(&cancelled));
        let mut task = tokio::task::spawn_blocking(move || writer.write());

        if let Ok(joined) = timeout(limit, &mut task).await {
            return self.joined(joined);
        }

        cancelled.store(true, Ordering::Release);
        match timeout(CLEANUP_GRACE, &mut task).await {
            // Published before it saw the cancellation
            Ok(Ok(Ok(artifact))) => Ok(artifact),
            Ok(_) => Err(DispatchError::TimedOut(limit)),
            Err(_) => {
                tracing::warn!(
                    dir = %self.dir.display(),
                    "artifact writer still blocked, it removes its partial file once it returns"
                );
                Err(DispatchError::TimedOut(limit))
            }
        }
    }

    fn writer(
        &self,
        artifact: &DecryptedArtifact,
        content: Zeroizing<Vec<u8>>,
        cancelled: Arc<AtomicBool>,
    ) -> ArtifactWriter {
        ArtifactWriter {
            dir: self.dir.clone(),
            kind: artifact.kind,
            created_at: artifact.created_at,
            content,
            sequence: Arc::clone(&self.sequence),
            cancelled,
        }
    }

    fn joined(
        &self,
        joined: Result<Result<ArtifactRef, DispatchError>, JoinError>,
    ) -> Result<ArtifactRef, DispatchError> {
        joined.map_err(|e| DispatchError::Io {
            path: self.dir.clone(),
            source: io::Error::new(io::ErrorKind::Other, e.to_string()),
        })?
    }
}

/// One note's trip to disk, run on the blocking pool
struct ArtifactWriter {
    dir: PathBuf,
    kind: NoteKind,
    created_at: DateTime<Utc>,
    content: Zeroizing<Vec<u8>>,
    sequence: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
}

impl ArtifactWriter {
    /// Fill a hidden `.partial` file, then link it under the first free
    /// artifact name.
    fn write(self) -> Result<ArtifactRef, DispatchError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| DispatchError::Io {
            path: self.dir.clone(),
            source,
        })?;

        for _ in 0..MAX_NAME_ATTEMPTS {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
            let name = artifact_file_name(self.kind, &self.created_at, seq);
            let path = self.dir.join(&name);
            let partial_path = self.dir.join(format!(".{name}.partial"));

            let mut file = match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&partial_path)
            {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => {
                    return Err(DispatchError::Io {
                        path: partial_path,
                        source,
                    })
                }
            };
            let partial = PartialFile(partial_path);
            let filled = self.fill(&mut file);
            drop(file);
            filled.map_err(|source| DispatchError::Io {
                path: partial.0.clone(),
                source,
            })?;

            match publish(&partial.0, &path) {
                Ok(()) => {
                    return Ok(ArtifactRef {
                        kind: self.kind,
                        path,
                        bytes_written: self.content.len(),
                        created_at: self.created_at,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!(path = %path.display(), "artifact name taken, trying next");
                }
                Err(source) => return Err(DispatchError::Io { path, source }),
            }
        }

        Err(DispatchError::Io {
            path: self.dir.clone(),
            source: io::Error::new(io::ErrorKind::AlreadyExists, "no free artifact name"),
        })
    }

    fn fill(&self, file: &mut std::fs::File) -> io::Result<()> {
        for chunk in self.content.chunks(WRITE_CHUNK) {
            self.check_cancelled()?;
            file.write_all(chunk)?;
        }
        file.sync_all()?;
        self.check_cancelled()
    }

    fn check_cancelled(&self) -> io::Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "write abandoned"));
        }
        Ok(())
    }
}

/// Hidden in-progress file, removed on drop. After a successful publish
/// only this extra name goes away.
struct PartialFile(PathBuf);

impl Drop for PartialFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.0.display(), error = %e, "failed to remove partial artifact")
            }
        }
    }
}

/// Give a finished file its artifact name without replacing anything there.
fn publish(partial: &Path, path: &Path) -> io::Result<()> {
    match std::fs::hard_link(partial, path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        Err(e) => {
            // Filesystems without hard links
            tracing::debug!(error = %e, "hard link refused, renaming instead");
            if path.try_exists()? {
                return Err(io::Error::from(io::ErrorKind::AlreadyExists));
            }
            std::fs::rename(partial, path)
        }
    }
}

fn artifact_file_name(kind: NoteKind, created_at: &DateTime<Utc>, seq: u64) -> String {
    format!(
        "received_{}_{}_{:06}.{}",
        kind,
        created_at.format("%Y%m%dT%H%M%S%.6fZ"),
        seq,
        kind.extension()
    )
}
