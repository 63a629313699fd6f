//! File processor collaborator.
//!
//! Format-specific extraction lives behind [`FileProcessor`]; the pipeline
//! only asks whether a key is supported and hands over a local path.

use std::path::Path;

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::error::Error;

pub mod text;

/// Output of a successful extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub text: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Optional JPEG preview of the payload.
    pub thumbnail: Option<Bytes>,
}

pub trait FileProcessor: Send + Sync + 'static {
    /// Whether this processor handles objects with the given key.
    fn supports(&self, key: &str) -> bool;

    fn process<'a>(&'a self, local_path: &'a Path) -> BoxFuture<'a, Result<Extracted, Error>>;
}
