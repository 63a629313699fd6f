//! Blob storage collaborator.
//!
//! The worker only ever needs two operations: pull an object down to a local
//! path, and push a derived artifact (a thumbnail) back up.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::error::Error;

pub mod local;

/// Content to upload.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Bytes(Bytes),
    Path(PathBuf),
}

impl From<Bytes> for UploadSource {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<PathBuf> for UploadSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

pub trait Storage: Send + Sync + 'static {
    /// Copy `bucket/key` to `local_path`, replacing any existing file.
    fn download<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        local_path: &'a Path,
    ) -> BoxFuture<'a, Result<(), Error>>;

    fn upload<'a>(
        &'a self,
        source: UploadSource,
        bucket: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>>;
}
