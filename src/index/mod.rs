//! Search index collaborator.

use futures_util::future::BoxFuture;

use crate::{error::Error, message::Document};

pub mod jsonl;

pub trait SearchIndex: Send + Sync + 'static {
    /// Index a single document under `id`.
    ///
    /// `Ok(false)` means the index did not acknowledge the write; the
    /// caller treats it as a transient failure.
    fn index_one<'a>(&'a self, document: &'a Document, id: &'a str)
        -> BoxFuture<'a, Result<bool, Error>>;

    /// Index many documents, returning how many were written and the
    /// per-document errors for the rest.
    ///
    /// For backfills and reindexing. The worker indexes one document per
    /// message and never calls this.
    fn bulk_index<'a>(
        &'a self,
        documents: &'a [Document],
    ) -> BoxFuture<'a, Result<(usize, Vec<Error>), Error>>;
}
