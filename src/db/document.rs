// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Backend-neutral document primitives: addressing, snapshots, writes,
//! transactions and live-feed plumbing.

use super::StoreError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Document body as stored: a JSON object.
pub type Fields = serde_json::Map<String, Value>;

// ─── Addressing ──────────────────────────────────────────────

/// Slash-separated path of a (possibly nested) collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionRef {
    path: String,
}

impl CollectionRef {
    /// A top-level collection such as `users`.
    pub fn root(name: &str) -> Self {
        Self {
            path: name.to_string(),
        }
    }

    pub fn doc(&self, id: impl Into<String>) -> DocRef {
        DocRef {
            collection: self.clone(),
            id: id.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path segment (the collection id).
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Owning document for a sub-collection, `None` for top-level collections.
    pub fn parent(&self) -> Option<DocRef> {
        let (parent_doc, _) = self.path.rsplit_once('/')?;
        let (parent_collection, parent_id) = parent_doc.rsplit_once('/')?;
        Some(DocRef {
            collection: CollectionRef {
                path: parent_collection.to_string(),
            },
            id: parent_id.to_string(),
        })
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Address of a single document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocRef {
    collection: CollectionRef,
    id: String,
}

impl DocRef {
    pub fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sub-collection nested under this document.
    pub fn sub_collection(&self, name: &str) -> CollectionRef {
        CollectionRef {
            path: format!("{}/{}", self.path(), name),
        }
    }

    pub fn path(&self) -> String {
        format!("{}/{}", self.collection.path, self.id)
    }
}

impl fmt::Display for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection.path, self.id)
    }
}

// ─── Snapshots ───────────────────────────────────────────────

/// A document as read from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub doc: DocRef,
    pub data: Fields,
    /// Last commit time; doubles as the version for optimistic transactions.
    pub update_time: DateTime<Utc>,
}

impl Snapshot {
    pub fn id(&self) -> &str {
        self.doc.id()
    }

    /// Deserialize the body into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(Value::Object(self.data.clone()))
            .map_err(|e| StoreError::Decode(format!("{}: {}", self.doc, e)))
    }
}

/// Serialize a typed value into a document body.
pub fn to_fields<T: Serialize>(value: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Decode(format!("expected an object, got {}", other))),
    }
}

// ─── Field paths ─────────────────────────────────────────────

/// Look up a dotted field path (`members.u1.role`).
pub fn lookup<'a>(fields: &'a Fields, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = fields.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Assign a dotted field path, creating intermediate maps as needed.
pub fn assign(fields: &mut Fields, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            fields.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = fields
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Fields::new()));
            if !child.is_object() {
                *child = Value::Object(Fields::new());
            }
            if let Value::Object(map) = child {
                assign(map, rest, value);
            }
        }
    }
}

/// Remove a dotted field path. Missing paths are ignored.
pub fn remove(fields: &mut Fields, path: &str) {
    match path.split_once('.') {
        None => {
            fields.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(map)) = fields.get_mut(head) {
                remove(map, rest);
            }
        }
    }
}

// ─── Writes ──────────────────────────────────────────────────

/// Operation applied to a single field path.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Set(Value),
    Delete,
    /// Replaced with the commit time by the store.
    ServerTimestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub path: String,
    pub op: FieldOp,
}

impl FieldUpdate {
    pub fn set(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            op: FieldOp::Set(value),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: FieldOp::Delete,
        }
    }

    pub fn server_timestamp(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: FieldOp::ServerTimestamp,
        }
    }
}

/// A single mutation inside a transaction or batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Create or fully replace the document.
    Set { doc: DocRef, data: Fields },
    /// Apply field updates. Without `upsert` the document must already exist.
    Patch {
        doc: DocRef,
        fields: Vec<FieldUpdate>,
        upsert: bool,
    },
    Delete { doc: DocRef },
}

impl Write {
    pub fn doc(&self) -> &DocRef {
        match self {
            Write::Set { doc, .. } | Write::Patch { doc, .. } | Write::Delete { doc } => doc,
        }
    }
}

// ─── Transactions ────────────────────────────────────────────

/// Version of a document observed by a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadVersion {
    /// The document did not exist when read.
    Missing,
    At(DateTime<Utc>),
}

/// Observed read versions plus buffered writes, committed all-or-nothing.
///
/// A transaction with no observed reads is a plain batched write.
#[derive(Debug, Default)]
pub struct Transaction {
    reads: BTreeMap<DocRef, ReadVersion>,
    writes: Vec<Write>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the version of `doc` that this transaction's decisions depend on.
    pub fn observe(&mut self, doc: &DocRef, snapshot: Option<&Snapshot>) {
        let version = match snapshot {
            Some(s) => ReadVersion::At(s.update_time),
            None => ReadVersion::Missing,
        };
        self.reads.entry(doc.clone()).or_insert(version);
    }

    pub fn set(&mut self, doc: DocRef, data: Fields) {
        self.writes.push(Write::Set { doc, data });
    }

    pub fn patch(&mut self, doc: DocRef, fields: Vec<FieldUpdate>) {
        self.writes.push(Write::Patch {
            doc,
            fields,
            upsert: false,
        });
    }

    pub fn upsert(&mut self, doc: DocRef, fields: Vec<FieldUpdate>) {
        self.writes.push(Write::Patch {
            doc,
            fields,
            upsert: true,
        });
    }

    pub fn delete(&mut self, doc: DocRef) {
        self.writes.push(Write::Delete { doc });
    }

    pub fn reads(&self) -> impl Iterator<Item = (&DocRef, &ReadVersion)> {
        self.reads.iter()
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn into_parts(self) -> (BTreeMap<DocRef, ReadVersion>, Vec<Write>) {
        (self.reads, self.writes)
    }
}

// ─── Queries & live feeds ────────────────────────────────────

/// Equality filter on a (dotted) field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: CollectionRef,
    pub filter: Option<FieldFilter>,
}

impl Query {
    pub fn all(collection: CollectionRef) -> Self {
        Self {
            collection,
            filter: None,
        }
    }

    pub fn field_eq(collection: CollectionRef, field: &str, value: Value) -> Self {
        Self {
            collection,
            filter: Some(FieldFilter {
                field: field.to_string(),
                value,
            }),
        }
    }

    pub fn matches(&self, doc: &DocRef, data: &Fields) -> bool {
        if doc.collection() != &self.collection {
            return false;
        }
        match &self.filter {
            Some(filter) => lookup(data, &filter.field) == Some(&filter.value),
            None => true,
        }
    }
}

/// What a live listener is attached to.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenTarget {
    Document(DocRef),
    Query(Query),
}

impl ListenTarget {
    pub fn matches(&self, doc: &DocRef, data: &Fields) -> bool {
        match self {
            ListenTarget::Document(target) => target == doc,
            ListenTarget::Query(query) => query.matches(doc, data),
        }
    }
}

/// Identifies one attached listener. Unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    Added(Snapshot),
    Modified(Snapshot),
    /// The document was deleted or no longer matches the listener's filter.
    Removed(DocRef),
}

impl DocumentChange {
    pub fn doc(&self) -> &DocRef {
        match self {
            DocumentChange::Added(s) | DocumentChange::Modified(s) => &s.doc,
            DocumentChange::Removed(doc) => doc,
        }
    }
}

/// Changes delivered to a listener for one commit (or the initial snapshot).
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub subscription: SubscriptionId,
    pub target: ListenTarget,
    pub changes: Vec<DocumentChange>,
}

/// Channel half that listeners push their batches onto.
pub type ChangeSink = mpsc::UnboundedSender<ChangeBatch>;

/// Handle to an attached listener. Detaches on `cancel` or drop.
pub struct Subscription {
    id: SubscriptionId,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(id: SubscriptionId, detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            detach: Some(Box::new(detach)),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn cancel(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_assign_creates_nested_maps() {
        let mut data = Fields::new();
        assign(&mut data, "members.u1.role", json!("member"));
        assert_eq!(lookup(&data, "members.u1.role"), Some(&json!("member")));
    }

    #[test]
    fn test_remove_nested_keeps_siblings() {
        let mut data = fields(json!({"members": {"u1": {"role": "member"}, "u2": {"role": "organizer"}}}));
        remove(&mut data, "members.u1");
        assert!(lookup(&data, "members.u1").is_none());
        assert_eq!(lookup(&data, "members.u2.role"), Some(&json!("organizer")));
    }

    #[test]
    fn test_sub_collection_parent() {
        let family = CollectionRef::root("families").doc("f1");
        let locations = family.sub_collection("memberLocations");
        assert_eq!(locations.path(), "families/f1/memberLocations");
        assert_eq!(locations.name(), "memberLocations");
        assert_eq!(locations.parent(), Some(family));
        assert_eq!(CollectionRef::root("users").parent(), None);
    }

    #[test]
    fn test_query_filter_matches_only_its_collection() {
        let users = CollectionRef::root("users");
        let families = CollectionRef::root("families");
        let query = Query::field_eq(families.clone(), "joinCode", json!("ABC234"));
        let data = fields(json!({"joinCode": "ABC234"}));
        assert!(query.matches(&families.doc("f1"), &data));
        assert!(!query.matches(&users.doc("f1"), &data));
        assert!(!query.matches(&families.doc("f2"), &fields(json!({"joinCode": "ZZZ999"}))));
    }

    #[test]
    fn test_transaction_keeps_first_observed_version() {
        let doc = CollectionRef::root("users").doc("u1");
        let mut tx = Transaction::new();
        tx.observe(&doc, None);
        let snapshot = Snapshot {
            doc: doc.clone(),
            data: Fields::new(),
            update_time: Utc::now(),
        };
        tx.observe(&doc, Some(&snapshot));
        let (reads, _) = tx.into_parts();
        assert_eq!(reads.get(&doc), Some(&ReadVersion::Missing));
    }

    #[test]
    fn test_subscription_detaches_on_drop() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let detached = Arc::new(AtomicBool::new(false));
        let flag = detached.clone();
        let sub = Subscription::new(SubscriptionId::next(), move || {
            flag.store(true, Ordering::SeqCst);
        });
        drop(sub);
        assert!(detached.load(Ordering::SeqCst));
    }
}
