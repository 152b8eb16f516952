//! Search index seam. Indexing runs asynchronously off the `indexing`
//! queue; deletion runs inline when a source is removed.

use async_trait::async_trait;
use log::debug;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("{0}")]
pub struct SearchError(pub String);

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn index_emails(&self, email_ids: &[String]) -> Result<(), SearchError>;

    async fn delete_by_source(&self, source_id: &str) -> Result<(), SearchError>;
}

/// Accepts everything and indexes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSearchIndex;

#[async_trait]
impl SearchIndex for NoopSearchIndex {
    async fn index_emails(&self, email_ids: &[String]) -> Result<(), SearchError> {
        debug!("No search index configured; {} email(s) not indexed", email_ids.len());
        Ok(())
    }

    async fn delete_by_source(&self, _source_id: &str) -> Result<(), SearchError> {
        Ok(())
    }
}
