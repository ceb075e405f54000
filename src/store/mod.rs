//! The document store the loader writes to.

pub mod cosmos;

use std::{fmt, sync::Arc};

use async_trait::async_trait;

/// An already parsed document. The loader never looks inside it.
pub type Document = serde_json::Value;

/// Identifies the collection a batch is written to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CollectionRef {
    database: String,
    collection: String,
}

impl CollectionRef {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Resource link of the collection, `dbs/{database}/colls/{collection}`.
    pub fn link(&self) -> String {
        format!("dbs/{}/colls/{}", self.database, self.collection)
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.database, self.collection)
    }
}

/// A store accepting idempotent single-document writes.
///
/// Upserts are keyed by document identity, so sending the same document again
/// after a throttling response is always safe.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Inserts the document, or replaces it if one with the same identity exists.
    async fn upsert(
        &self,
        collection: &CollectionRef,
        document: &Document,
    ) -> Result<(), Self::Error>;
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for Arc<S> {
    type Error = S::Error;

    async fn upsert(
        &self,
        collection: &CollectionRef,
        document: &Document,
    ) -> Result<(), Self::Error> {
        (**self).upsert(collection, document).await
    }
}
