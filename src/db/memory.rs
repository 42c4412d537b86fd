// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-process document store.
//!
//! Implements the full [`DocumentStore`] contract (optimistic transactions,
//! filtered queries, live listeners) so the session can run offline and the
//! test-suite can observe exact store state.

use super::document::{self, ReadVersion};
use super::{
    ChangeBatch, ChangeSink, DocRef, DocumentChange, DocumentStore, FieldOp, Fields, ListenTarget,
    Query, Snapshot, StoreError, Subscription, SubscriptionId, Transaction, Write,
};
use crate::time_utils::{format_utc_rfc3339, now_micros};
use chrono::{DateTime, Duration, Utc};
use rand::RngExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Alphabet for auto-generated document ids.
const ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 20;

#[derive(Debug, Clone)]
struct StoredDoc {
    data: Fields,
    update_time: DateTime<Utc>,
}

struct Listener {
    target: ListenTarget,
    sink: ChangeSink,
}

#[derive(Default)]
struct State {
    /// collection path -> document id -> document
    collections: BTreeMap<String, BTreeMap<String, StoredDoc>>,
    listeners: BTreeMap<SubscriptionId, Listener>,
    last_commit: Option<DateTime<Utc>>,
    /// Collection names whose writes fail (fault injection).
    failing_collections: HashSet<String>,
    commits: u64,
}

impl State {
    fn current(&self, doc: &DocRef) -> Option<&StoredDoc> {
        self.collections
            .get(doc.collection().path())
            .and_then(|docs| docs.get(doc.id()))
    }

    fn commit_time(&mut self) -> DateTime<Utc> {
        let mut now = now_micros();
        if let Some(last) = self.last_commit {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_commit = Some(now);
        now
    }
}

/// In-memory document store. Cloning shares the underlying data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every commit touching `collection` (by collection id) fail.
    pub fn fail_writes_to(&self, collection: &str) {
        self.lock().failing_collections.insert(collection.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failing_collections.clear();
    }

    /// Current body of a document, if present.
    pub fn document(&self, doc: &DocRef) -> Option<Fields> {
        self.lock().current(doc).map(|d| d.data.clone())
    }

    /// Ids of every document in a collection.
    pub fn document_ids(&self, collection: &super::CollectionRef) -> Vec<String> {
        self.lock()
            .collections
            .get(collection.path())
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> u64 {
        self.lock().commits
    }

    fn commit_locked(state: &mut State, tx: Transaction) -> Result<(), StoreError> {
        let (reads, writes) = tx.into_parts();

        if let Some(write) = writes
            .iter()
            .find(|w| state.failing_collections.contains(w.doc().collection().name()))
        {
            return Err(StoreError::Backend(format!(
                "write to {} rejected",
                write.doc()
            )));
        }

        for (doc, version) in &reads {
            let unchanged = match (version, state.current(doc)) {
                (ReadVersion::Missing, None) => true,
                (ReadVersion::At(seen), Some(current)) => *seen == current.update_time,
                _ => false,
            };
            if !unchanged {
                return Err(StoreError::Aborted(format!("{} changed concurrently", doc)));
            }
        }

        let commit_time = state.commit_time();
        let timestamp = Value::String(format_utc_rfc3339(commit_time));

        // Apply every write to a working copy first so a failing write leaves
        // the store untouched.
        let mut staged: BTreeMap<DocRef, (Option<Fields>, Option<Fields>)> = BTreeMap::new();
        for write in writes {
            let doc = write.doc().clone();
            let entry = staged.entry(doc.clone()).or_insert_with(|| {
                let before = state.current(&doc).map(|d| d.data.clone());
                (before.clone(), before)
            });
            match write {
                Write::Set { data, .. } => entry.1 = Some(data),
                Write::Patch { fields, upsert, .. } => {
                    if entry.1.is_none() && !upsert {
                        return Err(StoreError::Missing(doc.to_string()));
                    }
                    let body = entry.1.get_or_insert_with(Fields::new);
                    for update in fields {
                        match update.op {
                            FieldOp::Set(value) => document::assign(body, &update.path, value),
                            FieldOp::Delete => document::remove(body, &update.path),
                            FieldOp::ServerTimestamp => {
                                document::assign(body, &update.path, timestamp.clone())
                            }
                        }
                    }
                }
                Write::Delete { .. } => entry.1 = None,
            }
        }

        for (doc, (_, after)) in &staged {
            let docs = state
                .collections
                .entry(doc.collection().path().to_string())
                .or_default();
            match after {
                Some(data) => {
                    docs.insert(
                        doc.id().to_string(),
                        StoredDoc {
                            data: data.clone(),
                            update_time: commit_time,
                        },
                    );
                }
                None => {
                    docs.remove(doc.id());
                }
            }
        }
        state.commits += 1;

        notify(state, &staged, commit_time);
        Ok(())
    }
}

/// Fan a commit's effects out to every listener whose target it touches.
fn notify(
    state: &mut State,
    staged: &BTreeMap<DocRef, (Option<Fields>, Option<Fields>)>,
    commit_time: DateTime<Utc>,
) {
    let mut closed = Vec::new();
    for (id, listener) in &state.listeners {
        let changes: Vec<DocumentChange> = staged
            .iter()
            .filter_map(|(doc, (before, after))| {
                let was = before
                    .as_ref()
                    .is_some_and(|d| listener.target.matches(doc, d));
                let is = after
                    .as_ref()
                    .is_some_and(|d| listener.target.matches(doc, d));
                let snapshot = || Snapshot {
                    doc: doc.clone(),
                    data: after.clone().unwrap_or_default(),
                    update_time: commit_time,
                };
                match (was, is) {
                    (false, true) => Some(DocumentChange::Added(snapshot())),
                    (true, true) => Some(DocumentChange::Modified(snapshot())),
                    (true, false) => Some(DocumentChange::Removed(doc.clone())),
                    (false, false) => None,
                }
            })
            .collect();

        if changes.is_empty() {
            continue;
        }
        let batch = ChangeBatch {
            subscription: *id,
            target: listener.target.clone(),
            changes,
        };
        if listener.sink.send(batch).is_err() {
            closed.push(*id);
        }
    }
    for id in closed {
        state.listeners.remove(&id);
    }
}

impl DocumentStore for MemoryStore {
    fn new_id(&self) -> String {
        let mut rng = rand::rng();
        (0..ID_LEN)
            .map(|_| ID_CHARSET[rng.random_range(0..ID_CHARSET.len())] as char)
            .collect()
    }

    async fn get(&self, doc: &DocRef) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.lock().current(doc).map(|stored| Snapshot {
            doc: doc.clone(),
            data: stored.data.clone(),
            update_time: stored.update_time,
        }))
    }

    async fn query(&self, query: &Query, limit: Option<u32>) -> Result<Vec<Snapshot>, StoreError> {
        let state = self.lock();
        let Some(docs) = state.collections.get(query.collection.path()) else {
            return Ok(Vec::new());
        };
        let limit = limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(docs
            .iter()
            .filter_map(|(id, stored)| {
                let doc = query.collection.doc(id.clone());
                query.matches(&doc, &stored.data).then(|| Snapshot {
                    doc,
                    data: stored.data.clone(),
                    update_time: stored.update_time,
                })
            })
            .take(limit)
            .collect())
    }

    async fn commit(&self, tx: Transaction) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::commit_locked(&mut state, tx)
    }

    async fn listen(
        &self,
        target: ListenTarget,
        sink: ChangeSink,
    ) -> Result<Subscription, StoreError> {
        let id = SubscriptionId::next();
        let mut state = self.lock();

        let initial: Vec<DocumentChange> = match &target {
            ListenTarget::Document(doc) => state
                .current(doc)
                .map(|stored| {
                    DocumentChange::Added(Snapshot {
                        doc: doc.clone(),
                        data: stored.data.clone(),
                        update_time: stored.update_time,
                    })
                })
                .into_iter()
                .collect(),
            ListenTarget::Query(query) => state
                .collections
                .get(query.collection.path())
                .map(|docs| {
                    docs.iter()
                        .filter_map(|(doc_id, stored)| {
                            let doc = query.collection.doc(doc_id.clone());
                            query.matches(&doc, &stored.data).then(|| {
                                DocumentChange::Added(Snapshot {
                                    doc,
                                    data: stored.data.clone(),
                                    update_time: stored.update_time,
                                })
                            })
                        })
                        .collect()
                })
                .unwrap_or_default(),
        };

        sink.send(ChangeBatch {
            subscription: id,
            target: target.clone(),
            changes: initial,
        })
        .map_err(|_| StoreError::Backend("listener channel closed".to_string()))?;

        state.listeners.insert(id, Listener { target, sink });
        drop(state);

        let weak: Weak<Mutex<State>> = Arc::downgrade(&self.state);
        Ok(Subscription::new(id, move || {
            if let Some(state) = weak.upgrade() {
                state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .listeners
                    .remove(&id);
            }
        }))
    }
}
