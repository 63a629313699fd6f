use std::path::Path;

use futures_util::future::BoxFuture;
use serde_json::json;

use super::{Extracted, FileProcessor};
use crate::error::Error;

/// Extensions handled by [`TextExtractor`].
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "csv", "json", "log"];

/// Extractor for UTF-8 text formats.
#[derive(Debug, Clone, Default)]
pub struct TextExtractor;

impl TextExtractor {
    pub fn new() -> Self {
        Self
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

impl FileProcessor for TextExtractor {
    fn supports(&self, key: &str) -> bool {
        extension(Path::new(key)).is_some_and(|ext| TEXT_EXTENSIONS.contains(&ext.as_str()))
    }

    fn process<'a>(&'a self, local_path: &'a Path) -> BoxFuture<'a, Result<Extracted, Error>> {
        Box::pin(async move {
            let bytes = tokio::fs::read(local_path).await?;
            let size = bytes.len();

            let text = String::from_utf8(bytes).map_err(|e| {
                Error::corruption(format!(
                    "{} is not valid UTF-8 at byte {}",
                    local_path.display(),
                    e.utf8_error().valid_up_to()
                ))
            })?;

            let mut metadata = serde_json::Map::new();
            metadata.insert("size_bytes".to_owned(), json!(size));
            metadata.insert("line_count".to_owned(), json!(text.lines().count()));
            if let Some(ext) = extension(local_path) {
                metadata.insert("format".to_owned(), json!(ext));
            }

            Ok(Extracted {
                text,
                metadata,
                thumbnail: None,
            })
        })
    }
}
