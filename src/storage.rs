//! Local upload store for web-form images.
//!
//! Files are content addressed (`<sha256>.<ext>`) so re-uploads of the same
//! image collapse into one file. Posts record them as `/uploads/<file>`.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::render::{is_plain_file_name, UPLOAD_PREFIX};

pub const ALLOWED_MIME: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

#[derive(thiserror::Error, Debug)]
pub enum UploadError {
    #[error("image exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("unsupported image type {0}")]
    Unsupported(String),
    #[error("upload io: {0}")]
    Io(String),
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        UploadError::Io(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    max_bytes: usize,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self { dir: dir.into(), max_bytes }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Size and type check; returns the file extension to store under.
    pub fn check(&self, bytes: &[u8]) -> Result<&'static str, UploadError> {
        if bytes.len() > self.max_bytes {
            return Err(UploadError::TooLarge { limit: self.max_bytes });
        }
        let kind = infer::get(bytes).ok_or_else(|| UploadError::Unsupported("unknown".into()))?;
        if !ALLOWED_MIME.contains(&kind.mime_type()) {
            return Err(UploadError::Unsupported(kind.mime_type().to_string()));
        }
        Ok(kind.extension())
    }

    /// Sniffs, hashes and writes `bytes`; returns the `/uploads/<file>` path.
    pub async fn save(&self, bytes: &[u8]) -> Result<String, UploadError> {
        let ext = self.check(bytes)?;
        let (file, _) = self.write(bytes, ext).await?;
        Ok(format!("{UPLOAD_PREFIX}{file}"))
    }

    /// Stores every image of one submission or none of them: all files are
    /// checked before the first write, and files created by a failed call
    /// are removed again.
    pub async fn save_all(&self, images: &[Vec<u8>]) -> Result<Vec<String>, UploadError> {
        let exts = images.iter().map(|b| self.check(b)).collect::<Result<Vec<_>, _>>()?;
        let mut stored = Vec::with_capacity(images.len());
        let mut created = Vec::new();
        for (bytes, ext) in images.iter().zip(exts) {
            match self.write(bytes, ext).await {
                Ok((file, fresh)) => {
                    if fresh {
                        created.push(file.clone());
                    }
                    stored.push(format!("{UPLOAD_PREFIX}{file}"));
                }
                Err(e) => {
                    for file in created {
                        if let Err(rm) = tokio::fs::remove_file(self.dir.join(&file)).await {
                            warn!(file = %file, error = %rm, "cannot remove partial upload");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(stored)
    }

    /// Writes under the content address; `true` when the file is new.
    async fn write(&self, bytes: &[u8], ext: &str) -> Result<(String, bool), UploadError> {
        let hash = format!("{:x}", Sha256::digest(bytes));
        let file = format!("{hash}.{ext}");
        let path = self.dir.join(&file);

        tokio::fs::create_dir_all(&self.dir).await?;
        if tokio::fs::try_exists(&path).await? {
            debug!(file = %file, "upload already stored");
            return Ok((file, false));
        }
        let tmp = self.dir.join(format!("{file}.part"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!(file = %file, size = bytes.len(), "upload stored");
        Ok((file, true))
    }

    /// Reads a stored file back with its sniffed MIME type.
    pub async fn load(&self, file: &str) -> Result<Option<(Vec<u8>, String)>, UploadError> {
        if !is_plain_file_name(file) {
            return Ok(None);
        }
        match tokio::fs::read(self.dir.join(file)).await {
            Ok(bytes) => {
                let mime = infer::get(&bytes)
                    .map(|t| t.mime_type().to_string())
                    .unwrap_or_else(|| "application/octet-stream".into());
                Ok(Some((bytes, mime)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
