//! Append-only JSON-lines index.
//!
//! Every write appends one `{"id": .., "document": ..}` line. Re-indexing a
//! document appends a newer line; readers take the last line per id.

use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, sync::Mutex};

use super::SearchIndex;
use crate::{error::Error, message::Document};

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub document: Document,
}

pub struct JsonlIndex {
    path: PathBuf,
    // Serializes appends so lines from concurrent workers never interleave.
    write_lock: Mutex<()>,
}

impl JsonlIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(document: &Document, id: &str) -> Result<String, Error> {
        if id.is_empty() {
            return Err(Error::index_schema("document id must not be empty"));
        }

        let mut line = serde_json::to_string(&IndexEntry {
            id: id.to_owned(),
            document: document.clone(),
        })
        .map_err(|e| Error::index_schema(e.to_string()))?;
        line.push('\n');

        Ok(line)
    }

    async fn append(&self, payload: &str) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::index_transient(format!("open {}: {e}", self.path.display())))?;

        file.write_all(payload.as_bytes())
            .await
            .map_err(|e| Error::index_transient(format!("append {}: {e}", self.path.display())))?;
        file.flush().await?;

        Ok(())
    }

    /// Read every entry back, in write order.
    pub async fn entries(&self) -> Result<Vec<IndexEntry>, Error> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Error::from))
            .collect()
    }
}

impl SearchIndex for JsonlIndex {
    fn index_one<'a>(
        &'a self,
        document: &'a Document,
        id: &'a str,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            let line = Self::encode(document, id)?;
            self.append(&line).await?;
            Ok(true)
        })
    }

    fn bulk_index<'a>(
        &'a self,
        documents: &'a [Document],
    ) -> BoxFuture<'a, Result<(usize, Vec<Error>), Error>> {
        Box::pin(async move {
            let mut payload = String::new();
            let mut written = 0;
            let mut errors = Vec::new();

            for document in documents {
                match Self::encode(document, &document.id) {
                    Ok(line) => {
                        payload.push_str(&line);
                        written += 1;
                    }
                    Err(e) => errors.push(e),
                }
            }

            if written > 0 {
                self.append(&payload).await?;
            }

            Ok((written, errors))
        })
    }
}
