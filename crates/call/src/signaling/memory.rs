//! In-process document store
//!
//! Implements the same push semantics as the hosted store the app runs
//! against, plus fault injection so tests and the demo can exercise
//! offline and slow-write paths.

use super::store::{DocumentStore, FieldFilter, Subscription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct Document {
    data: Value,
    sequences: HashMap<String, Vec<Value>>,
}

struct DocumentWatcher {
    collection: String,
    id: String,
    tx: mpsc::UnboundedSender<Value>,
}

struct SequenceWatcher {
    collection: String,
    id: String,
    sequence: String,
    tx: mpsc::UnboundedSender<Value>,
}

struct QueryWatcher {
    collection: String,
    filters: Vec<FieldFilter>,
    /// Documents currently in the result set and already delivered
    seen: HashSet<String>,
    tx: mpsc::UnboundedSender<(String, Value)>,
}

impl QueryWatcher {
    fn matches(&self, document: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(document))
    }
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<String, HashMap<String, Document>>,
    document_watchers: Vec<DocumentWatcher>,
    sequence_watchers: Vec<SequenceWatcher>,
    query_watchers: Vec<QueryWatcher>,
}

impl StoreState {
    fn document_mut(&mut self, collection: &str, id: &str) -> Result<&mut Document> {
        self.collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| Error::NotFound(format!("{}/{}", collection, id)))
    }

    /// Merge `fields` into a document if it matches `preconditions`
    fn merge(
        &mut self,
        collection: &str,
        id: &str,
        preconditions: &[FieldFilter],
        fields: Map<String, Value>,
    ) -> Result<bool> {
        let doc = self.document_mut(collection, id)?;
        if !preconditions.iter().all(|f| f.matches(&doc.data)) {
            return Ok(false);
        }
        let Some(data) = doc.data.as_object_mut() else {
            return Err(Error::InvalidData(format!("{}/{} is not an object", collection, id)));
        };
        for (key, value) in fields {
            data.insert(key, value);
        }
        self.notify_document(collection, id);
        Ok(true)
    }

    fn notify_document(&mut self, collection: &str, id: &str) {
        let Some(data) = self
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| doc.data.clone())
        else {
            return;
        };

        self.document_watchers.retain(|w| {
            if w.collection != collection || w.id != id {
                return !w.tx.is_closed();
            }
            w.tx.send(data.clone()).is_ok()
        });

        self.query_watchers.retain_mut(|w| {
            if w.collection != collection {
                return !w.tx.is_closed();
            }
            if w.matches(&data) {
                if w.seen.insert(id.to_string()) {
                    return w.tx.send((id.to_string(), data.clone())).is_ok();
                }
            } else {
                w.seen.remove(id);
            }
            !w.tx.is_closed()
        });
    }
}

/// Document store held entirely in memory
pub struct MemoryDocumentStore {
    state: Mutex<StoreState>,
    fail_writes: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
    read_delay: Mutex<Option<Duration>>,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            fail_writes: AtomicBool::new(false),
            write_delay: Mutex::new(None),
            read_delay: Mutex::new(None),
        }
    }

    /// Make every subsequent write fail with a persistence error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent write before it is applied
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    /// Delay every subsequent read
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock() = delay;
    }

    /// Snapshot of a document
    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        self.state
            .lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| doc.data.clone())
    }

    /// Snapshot of a document sequence
    pub fn sequence(&self, collection: &str, id: &str, sequence: &str) -> Vec<Value> {
        self.state
            .lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .and_then(|doc| doc.sequences.get(sequence))
            .cloned()
            .unwrap_or_default()
    }

    /// Ids of every document in a collection
    pub fn document_ids(&self, collection: &str) -> Vec<String> {
        self.state
            .lock()
            .collections
            .get(collection)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live subscriptions of any kind
    pub fn active_watchers(&self) -> usize {
        let state = self.state.lock();
        state.document_watchers.iter().filter(|w| !w.tx.is_closed()).count()
            + state.sequence_watchers.iter().filter(|w| !w.tx.is_closed()).count()
            + state.query_watchers.iter().filter(|w| !w.tx.is_closed()).count()
    }

    /// Deliver every current query match again, as a reconnecting client
    /// listener would
    pub fn replay_query_matches(&self) {
        let mut state = self.state.lock();
        let StoreState {
            collections,
            query_watchers,
            ..
        } = &mut *state;

        for watcher in query_watchers.iter() {
            let Some(docs) = collections.get(&watcher.collection) else {
                continue;
            };
            for (id, doc) in docs {
                if watcher.matches(&doc.data) {
                    let _ = watcher.tx.send((id.clone(), doc.data.clone()));
                }
            }
        }
    }

    async fn before_write(&self, op: &str) -> Result<()> {
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            trace!("Delaying {} by {:?}", op, delay);
            tokio::time::sleep(delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Persistence(format!("{} rejected: store unreachable", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(&self, collection: &str, document: Value) -> Result<String> {
        self.before_write("create").await?;
        if !document.is_object() {
            return Err(Error::InvalidData("document must be a JSON object".to_string()));
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut state = self.state.lock();
        state.collections.entry(collection.to_string()).or_default().insert(
            id.clone(),
            Document {
                data: document,
                sequences: HashMap::new(),
            },
        );
        state.notify_document(collection, &id);
        debug!("Created {}/{}", collection, id);
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.document(collection, id))
    }

    async fn update(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<()> {
        self.before_write("update").await?;
        self.state.lock().merge(collection, id, &[], fields)?;
        debug!("Updated {}/{}", collection, id);
        Ok(())
    }

    async fn update_where(
        &self,
        collection: &str,
        id: &str,
        preconditions: &[FieldFilter],
        fields: Map<String, Value>,
    ) -> Result<bool> {
        self.before_write("update").await?;
        let applied = self.state.lock().merge(collection, id, preconditions, fields)?;
        if applied {
            debug!("Updated {}/{}", collection, id);
        } else {
            debug!("Skipped update of {}/{}: precondition no longer holds", collection, id);
        }
        Ok(applied)
    }

    async fn append(&self, collection: &str, id: &str, sequence: &str, item: Value) -> Result<()> {
        self.before_write("append").await?;

        let mut state = self.state.lock();
        state
            .document_mut(collection, id)?
            .sequences
            .entry(sequence.to_string())
            .or_default()
            .push(item.clone());

        state.sequence_watchers.retain(|w| {
            if w.collection != collection || w.id != id || w.sequence != sequence {
                return !w.tx.is_closed();
            }
            w.tx.send(item.clone()).is_ok()
        });
        trace!("Appended to {}/{}/{}", collection, id, sequence);
        Ok(())
    }

    async fn watch_document(&self, collection: &str, id: &str) -> Result<Subscription<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let current = state.document_mut(collection, id)?.data.clone();
        let _ = tx.send(current);
        state.document_watchers.push(DocumentWatcher {
            collection: collection.to_string(),
            id: id.to_string(),
            tx,
        });
        Ok(Subscription::new(rx))
    }

    async fn watch_sequence(
        &self,
        collection: &str,
        id: &str,
        sequence: &str,
    ) -> Result<Subscription<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let existing = state
            .document_mut(collection, id)?
            .sequences
            .get(sequence)
            .cloned()
            .unwrap_or_default();
        for item in existing {
            let _ = tx.send(item);
        }
        state.sequence_watchers.push(SequenceWatcher {
            collection: collection.to_string(),
            id: id.to_string(),
            sequence: sequence.to_string(),
            tx,
        });
        Ok(Subscription::new(rx))
    }

    async fn watch_query(
        &self,
        collection: &str,
        filters: Vec<FieldFilter>,
    ) -> Result<Subscription<(String, Value)>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = QueryWatcher {
            collection: collection.to_string(),
            filters,
            seen: HashSet::new(),
            tx,
        };

        let mut state = self.state.lock();
        if let Some(docs) = state.collections.get(collection) {
            for (id, doc) in docs {
                if watcher.matches(&doc.data) {
                    watcher.seen.insert(id.clone());
                    let _ = watcher.tx.send((id.clone(), doc.data.clone()));
                }
            }
        }
        state.query_watchers.push(watcher);
        Ok(Subscription::new(rx))
    }
}
