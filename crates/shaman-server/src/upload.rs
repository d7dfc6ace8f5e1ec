//! Upload coordination.
//!
//! Concurrent uploads of the same blob each stream into their own temp file.
//! They share one rendezvous per [`BlobKey`]: the first upload to be stored
//! signals it, and every other upload still streaming aborts and discards
//! its temp file. Nothing else is shared; the store itself copes with
//! concurrent promotion through atomic renames.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use sha2::{Digest, Sha256};
use shaman_config::{log_upload_debug, log_upload_info, log_upload_warn};
use shaman_store::{BlobKey, FileStatus, Resolved, Storage, StoreError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

use crate::encoding::{BodyDecoder, ContentEncoding};

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("declared size {declared} does not match received size {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("declared checksum {declared} does not match content checksum {actual}")]
    ChecksumMismatch { declared: String, actual: String },

    #[error("unsupported content encoding {0:?}")]
    ContentEncodingUnsupported(String),

    #[error("invalid upload body: {0}")]
    InvalidContent(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, UploadError>;

/// One inbound upload, as declared by the client.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub key: BlobKey,
    /// The client prefers "retry later" over racing an upload in progress
    pub can_defer: bool,
    pub content_encoding: ContentEncoding,
}

impl UploadRequest {
    pub fn new(key: BlobKey) -> Self {
        Self {
            key,
            can_defer: false,
            content_encoding: ContentEncoding::Identity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadOutcome {
    /// This upload's content was stored
    Received,
    /// The blob is (now) stored; any received bytes were discarded
    AlreadyStored,
    /// Another upload is in progress and the client asked to defer
    Deferred,
}

/// Rendezvous of all in-flight uploads of one blob.
#[derive(Debug)]
struct Rendezvous {
    stored: watch::Sender<bool>,
    participants: usize,
}

/// Deduplicates concurrent uploads of identical content.
#[derive(Debug)]
pub struct UploadCoordinator {
    storage: Arc<dyn Storage>,
    in_flight: Mutex<HashMap<BlobKey, Rendezvous>>,
}

impl UploadCoordinator {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Status of a blob, consulting both bins.
    pub fn status(&self, key: &BlobKey) -> FileStatus {
        self.storage.resolve(key, false).status()
    }

    /// Number of distinct blobs currently being uploaded through this coordinator.
    pub fn in_flight(&self) -> usize {
        self.registry().len()
    }

    /// Receive one upload.
    ///
    /// Dropping the returned future (client gone, server shutting down)
    /// removes the temp file and the registration.
    pub async fn receive_file<R>(&self, body: R, request: UploadRequest) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin,
    {
        let key = &request.key;

        match self.storage.resolve(key, false) {
            Resolved::Stored(_) => {
                log_upload_debug!("Already stored", key = tracing::field::display(key));
                return Ok(UploadOutcome::AlreadyStored);
            }
            Resolved::Uploading(_) if request.can_defer => {
                log_upload_debug!("Deferring, upload in progress", key = tracing::field::display(key));
                return Ok(UploadOutcome::Deferred);
            }
            _ => {}
        }

        let Some((registration, mut stored)) = self.register(key) else {
            return Ok(UploadOutcome::AlreadyStored);
        };
        // An upload that finished before we registered left no signal behind.
        if let Resolved::Stored(_) = self.storage.resolve(key, true) {
            log_upload_debug!("Stored while registering", key = tracing::field::display(key));
            return Ok(UploadOutcome::AlreadyStored);
        }

        let upload = self.storage.open_for_upload(key)?;
        let temp = TempUpload {
            storage: self.storage.as_ref(),
            path: upload.path,
            armed: true,
        };
        let mut file = tokio::fs::File::from_std(upload.file);

        let streamed = tokio::select! {
            biased;
            _ = wait_until_stored(&mut stored) => None,
            result = stream_body(body, &mut file, request.content_encoding, key.size()) => Some(result),
        };
        drop(file);

        let (actual_size, actual_checksum) = match streamed {
            None => {
                log_upload_info!(
                    "Aborting upload, another upload stored this blob",
                    key = tracing::field::display(key),
                );
                return Ok(UploadOutcome::AlreadyStored);
            }
            Some(Err(e @ UploadError::SizeMismatch { .. })) => {
                log_upload_warn!(
                    "Body exceeds declared size",
                    key = tracing::field::display(key),
                    error = tracing::field::display(&e),
                );
                return Err(e);
            }
            Some(result) => result?,
        };

        if actual_size != key.size() {
            log_upload_warn!(
                "Size mismatch",
                key = tracing::field::display(key),
                actual_size = actual_size,
            );
            return Err(UploadError::SizeMismatch {
                declared: key.size(),
                actual: actual_size,
            });
        }
        if actual_checksum != key.checksum() {
            log_upload_warn!(
                "Checksum mismatch",
                key = tracing::field::display(key),
                actual_checksum = actual_checksum.as_str(),
            );
            return Err(UploadError::ChecksumMismatch {
                declared: key.checksum().to_string(),
                actual: actual_checksum,
            });
        }

        // A concurrent upload may have finished between our last read and now.
        if let Resolved::Stored(_) = self.storage.resolve(key, true) {
            registration.notify_stored();
            return Ok(UploadOutcome::AlreadyStored);
        }

        let stored_path = self.storage.move_to_stored(key, &temp.path)?;
        temp.disarm();
        registration.notify_stored();

        log_upload_info!(
            "Stored",
            key = tracing::field::display(key),
            path = tracing::field::display(stored_path.display()),
        );
        Ok(UploadOutcome::Received)
    }

    /// Join the rendezvous for `key`, creating it if needed. `None` means a
    /// concurrent upload already stored the blob.
    fn register(&self, key: &BlobKey) -> Option<(Registration<'_>, watch::Receiver<bool>)> {
        let mut registry = self.registry();
        let rendezvous = registry.entry(key.clone()).or_insert_with(|| Rendezvous {
            stored: watch::channel(false).0,
            participants: 0,
        });
        if *rendezvous.stored.borrow() {
            return None;
        }
        rendezvous.participants += 1;
        let receiver = rendezvous.stored.subscribe();

        Some((
            Registration {
                coordinator: self,
                key: key.clone(),
            },
            receiver,
        ))
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<BlobKey, Rendezvous>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Membership of one upload in a rendezvous. Leaving is tied to drop so
/// every exit path releases it.
struct Registration<'a> {
    coordinator: &'a UploadCoordinator,
    key: BlobKey,
}

impl Registration<'_> {
    fn notify_stored(&self) {
        if let Some(rendezvous) = self.coordinator.registry().get(&self.key) {
            rendezvous.stored.send_replace(true);
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut registry = self.coordinator.registry();
        if let Some(rendezvous) = registry.get_mut(&self.key) {
            rendezvous.participants -= 1;
            if rendezvous.participants == 0 {
                registry.remove(&self.key);
            }
        }
    }
}

/// Temp file in the upload bin, deleted on drop unless promoted.
struct TempUpload<'a> {
    storage: &'a dyn Storage,
    path: PathBuf,
    armed: bool,
}

impl TempUpload<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempUpload<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.storage.remove_uploaded(&self.path) {
            log_upload_warn!(
                "Unable to remove temp file",
                path = tracing::field::display(self.path.display()),
                error = tracing::field::display(&e),
            );
        }
    }
}

/// Resolves once another upload signals the blob as stored. Never resolves
/// if the rendezvous goes away without that signal.
async fn wait_until_stored(stored: &mut watch::Receiver<bool>) {
    if stored.wait_for(|stored| *stored).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Copy the decoded body into `file`, hashing on the way. Returns the number
/// of bytes written and their hex SHA-256.
///
/// Gives up with [`UploadError::SizeMismatch`] as soon as the decoded body
/// grows past `limit`; `actual` is then the size received so far.
async fn stream_body<R>(
    mut body: R,
    file: &mut tokio::fs::File,
    encoding: ContentEncoding,
    limit: u64,
) -> Result<(u64, String)>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = BodyDecoder::new(encoding);
    let mut hasher = Sha256::new();
    let mut written = 0u64;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = body.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let decoded = decoder
            .feed(&buf[..n])
            .map_err(|e| UploadError::InvalidContent(e.to_string()))?;
        written = grow_within(written, decoded.len(), limit)?;
        hasher.update(&decoded);
        file.write_all(&decoded).await?;
    }

    let tail = decoder
        .finish()
        .map_err(|e| UploadError::InvalidContent(e.to_string()))?;
    written = grow_within(written, tail.len(), limit)?;
    hasher.update(&tail);
    file.write_all(&tail).await?;

    file.flush().await?;
    Ok((written, hex::encode(hasher.finalize())))
}

fn grow_within(written: u64, len: usize, limit: u64) -> Result<u64> {
    let grown = written.saturating_add(len as u64);
    if grown > limit {
        return Err(UploadError::SizeMismatch {
            declared: limit,
            actual: grown,
        });
    }
    Ok(grown)
}
