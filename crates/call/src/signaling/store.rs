//! Document store abstraction
//!
//! The signaling channel only needs a small slice of a realtime document
//! database: create/read/merge documents, append to ordered per-document
//! sequences, and push notifications for documents, sequences and simple
//! equality queries.

use crate::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// Equality filter on a top-level document field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub equals: Value,
}

impl FieldFilter {
    pub fn eq(field: impl Into<String>, equals: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            equals: equals.into(),
        }
    }

    pub fn matches(&self, document: &Value) -> bool {
        document.get(&self.field) == Some(&self.equals)
    }
}

/// Push subscription; dropping it or calling [`Subscription::unsubscribe`]
/// stops delivery
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// Next notification, or `None` once the store side has gone away
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.rx.close();
    }
}

/// Realtime document store used for signaling
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document and return its generated id
    async fn create(&self, collection: &str, document: Value) -> Result<String>;

    /// Read a document
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Merge top-level fields into an existing document
    async fn update(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<()>;

    /// Merge fields only if the document still satisfies every precondition,
    /// checked and applied as one step. Returns `false` when a precondition
    /// no longer holds and nothing was written.
    async fn update_where(
        &self,
        collection: &str,
        id: &str,
        preconditions: &[FieldFilter],
        fields: Map<String, Value>,
    ) -> Result<bool>;

    /// Append an item to an ordered sequence owned by a document
    async fn append(&self, collection: &str, id: &str, sequence: &str, item: Value) -> Result<()>;

    /// Current document contents, then every change
    async fn watch_document(&self, collection: &str, id: &str) -> Result<Subscription<Value>>;

    /// Existing sequence items in order, then every appended item
    async fn watch_sequence(
        &self,
        collection: &str,
        id: &str,
        sequence: &str,
    ) -> Result<Subscription<Value>>;

    /// Documents matching all filters, each delivered when it starts matching
    async fn watch_query(
        &self,
        collection: &str,
        filters: Vec<FieldFilter>,
    ) -> Result<Subscription<(String, Value)>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_top_level_field() {
        let filter = FieldFilter::eq("status", "offering");
        assert!(filter.matches(&json!({ "status": "offering" })));
        assert!(!filter.matches(&json!({ "status": "ended" })));
        assert!(!filter.matches(&json!({})));
    }
}
