//! Filesystem-backed storage: each bucket is a directory under a root.

use std::path::{Component, Path, PathBuf};

use futures_util::future::BoxFuture;

use super::{Storage, UploadSource};
use crate::error::Error;

#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `bucket/key` under the root, refusing anything that escapes it.
    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, Error> {
        let relative = Path::new(bucket).join(key);
        let escapes = bucket.is_empty()
            || key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));

        if escapes {
            return Err(Error::validation(format!(
                "invalid object location {bucket}/{key}"
            )));
        }

        Ok(self.root.join(relative))
    }
}

impl Storage for LocalStorage {
    fn download<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        local_path: &'a Path,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let object = self.object_path(bucket, key)?;

            if !tokio::fs::try_exists(&object).await? {
                return Err(Error::not_found(format!("object {bucket}/{key}")));
            }

            let bytes = tokio::fs::copy(&object, local_path).await?;
            tracing::debug!(%bucket, %key, bytes, "Downloaded object");

            Ok(())
        })
    }

    fn upload<'a>(
        &'a self,
        source: UploadSource,
        bucket: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let object = self.object_path(bucket, key)?;
            if let Some(parent) = object.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            match source {
                UploadSource::Bytes(bytes) => tokio::fs::write(&object, &bytes).await?,
                UploadSource::Path(path) => {
                    tokio::fs::copy(&path, &object).await?;
                }
            }
            tracing::debug!(%bucket, %key, "Uploaded object");

            Ok(())
        })
    }
}
