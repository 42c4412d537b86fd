// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore-backed [`DocumentStore`].
//!
//! Transactions are staged client-side: patches are resolved by
//! read-modify-write and every written document carries a precondition on
//! the version that was read, so a concurrent change fails the commit with
//! [`StoreError::Aborted`]. Observed documents that are not written are
//! re-read inside the Firestore transaction. Server timestamps are sent as
//! `REQUEST_TIME` field transforms.

use super::document::{self, ReadVersion};
use super::{
    ChangeBatch, ChangeSink, CollectionRef, DocRef, DocumentChange, DocumentStore, FieldOp, Fields,
    ListenTarget, Query, Snapshot, StoreError, Subscription, SubscriptionId, Transaction, Write,
};
use chrono::{DateTime, Utc};
use firestore::errors::FirestoreError;
use firestore::{
    FirestoreConsistencySelector, FirestoreDb, FirestoreListenEvent, FirestoreListener, FirestoreListenerTarget,
    FirestoreMemListenStateStorage, FirestoreWritePrecondition,
};
use gcloud_sdk::google::firestore::v1::target_change::TargetChangeType;
use gcloud_sdk::google::firestore::v1::Document;
use rand::RngExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

const ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 20;
const LISTENER_TARGET: u32 = 1;

type Listener = FirestoreListener<FirestoreDb, FirestoreMemListenStateStorage>;

/// Firestore document store.
#[derive(Clone)]
pub struct FirestoreStore {
    client: FirestoreDb,
}

impl FirestoreStore {
    /// Connect to Firestore.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self, StoreError> {
        // Emulator connections skip credential discovery entirely.
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = FirestoreDb::new(project_id)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");
        Ok(Self { client })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self, StoreError> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            StoreError::Backend(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );
        Ok(Self { client })
    }

    /// Full parent path for documents of `collection`.
    fn parent_path(&self, collection: &CollectionRef) -> String {
        let root = self.client.get_documents_path();
        match collection.parent() {
            Some(doc) => format!("{}/{}", root, doc.path()),
            None => root.clone(),
        }
    }

    fn snapshot(&self, doc: &Document) -> Result<Snapshot, StoreError> {
        let doc_ref = doc_ref_from_name(self.client.get_documents_path(), &doc.name)?;
        decode_document(doc_ref, doc)
    }

    async fn fetch(&self, client: &FirestoreDb, doc: &DocRef) -> Result<Option<Snapshot>, StoreError> {
        let parent = self.parent_path(doc.collection());
        let found: Option<Document> = client
            .fluent()
            .select()
            .by_id_in(doc.collection().name())
            .parent(&parent)
            .one(doc.id())
            .await
            .map_err(|e| store_error("get", e))?;

        found
            .map(|d| decode_document(doc.clone(), &d))
            .transpose()
    }

    /// Fetch a document and the precondition that pins its current version.
    async fn read_for_write(
        &self,
        client: &FirestoreDb,
        doc: &DocRef,
    ) -> Result<(Option<Fields>, ReadVersion), StoreError> {
        Ok(match self.fetch(client, doc).await? {
            Some(snapshot) => (Some(snapshot.data), ReadVersion::At(snapshot.update_time)),
            None => (None, ReadVersion::Missing),
        })
    }
}

/// Map a driver error, treating contention as a retryable abort.
fn store_error(context: &str, err: FirestoreError) -> StoreError {
    match err {
        FirestoreError::DataConflictError(e) => StoreError::Aborted(format!("{}: {}", context, e)),
        FirestoreError::DatabaseError(ref e) if e.retry_possible => {
            StoreError::Aborted(format!("{}: {}", context, err))
        }
        other => StoreError::Backend(format!("{}: {}", context, other)),
    }
}

fn precondition(version: ReadVersion) -> FirestoreWritePrecondition {
    match version {
        ReadVersion::Missing => FirestoreWritePrecondition::Exists(false),
        ReadVersion::At(at) => FirestoreWritePrecondition::UpdateTime(at),
    }
}

/// Parse `projects/../documents/families/f1/memberLocations/u1` into a [`DocRef`].
fn doc_ref_from_name(documents_path: &str, name: &str) -> Result<DocRef, StoreError> {
    let relative = name
        .strip_prefix(documents_path)
        .map(|rest| rest.trim_start_matches('/'))
        .ok_or_else(|| StoreError::Decode(name.to_string()))?;
    let (collection, id) = relative
        .rsplit_once('/')
        .ok_or_else(|| StoreError::Decode(name.to_string()))?;

    let mut segments = collection.split('/');
    let root = segments
        .next()
        .ok_or_else(|| StoreError::Decode(name.to_string()))?;
    let mut collection_ref = CollectionRef::root(root);
    while let (Some(doc_id), Some(sub)) = (segments.next(), segments.next()) {
        collection_ref = collection_ref.doc(doc_id).sub_collection(sub);
    }
    Ok(collection_ref.doc(id))
}

fn decode_document(doc_ref: DocRef, doc: &Document) -> Result<Snapshot, StoreError> {
    let mut data: Fields = FirestoreDb::deserialize_doc_to(doc)
        .map_err(|e| StoreError::Decode(format!("{}: {}", doc_ref, e)))?;
    data.retain(|key, _| !key.starts_with("_firestore_"));

    let update_time = doc
        .update_time
        .as_ref()
        .and_then(|ts| DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32))
        .ok_or_else(|| StoreError::Decode(format!("{}: missing update time", doc_ref)))?;

    Ok(Snapshot {
        doc: doc_ref,
        data,
        update_time,
    })
}

/// One document's staged outcome.
struct Staged {
    /// Version the write is conditioned on, if any.
    guard: Option<ReadVersion>,
    before_exists: bool,
    after: Option<Fields>,
    /// Field paths set to the commit time by Firestore.
    server_times: Vec<String>,
}

impl DocumentStore for FirestoreStore {
    fn new_id(&self) -> String {
        let mut rng = rand::rng();
        (0..ID_LEN)
            .map(|_| ID_CHARSET[rng.random_range(0..ID_CHARSET.len())] as char)
            .collect()
    }

    async fn get(&self, doc: &DocRef) -> Result<Option<Snapshot>, StoreError> {
        self.fetch(&self.client, doc).await
    }

    async fn query(&self, query: &Query, limit: Option<u32>) -> Result<Vec<Snapshot>, StoreError> {
        let parent = self.parent_path(&query.collection);
        let select = self
            .client
            .fluent()
            .select()
            .from(query.collection.name())
            .parent(&parent);

        let docs: Vec<Document> = match (&query.filter, limit) {
            (Some(filter), limit) => {
                let field = filter.field.clone();
                let value = filter.value.clone();
                let filtered = select.filter(move |q| match &value {
                    Value::String(s) => q.for_all([q.field(field.as_str()).eq(s.clone())]),
                    Value::Bool(b) => q.for_all([q.field(field.as_str()).eq(*b)]),
                    other => q.for_all([q.field(field.as_str()).eq(other.to_string())]),
                });
                match limit {
                    Some(n) => filtered.limit(n).query().await,
                    None => filtered.query().await,
                }
            }
            (None, Some(n)) => select.limit(n).query().await,
            (None, None) => select.query().await,
        }
        .map_err(|e| store_error("query", e))?;

        docs.iter().map(|d| self.snapshot(d)).collect()
    }

    async fn commit(&self, tx: Transaction) -> Result<(), StoreError> {
        let (reads, writes) = tx.into_parts();

        let mut staged: BTreeMap<DocRef, Staged> = BTreeMap::new();
        for write in writes {
            let doc = write.doc().clone();
            if !staged.contains_key(&doc) {
                let observed = reads.get(&doc).copied();
                let entry = match (&write, observed) {
                    // Patches need the current body; anything else is blind.
                    (Write::Patch { .. }, _) => {
                        let (body, version) = self.read_for_write(&self.client, &doc).await?;
                        Staged {
                            guard: Some(observed.unwrap_or(version)),
                            before_exists: body.is_some(),
                            after: body,
                            server_times: Vec::new(),
                        }
                    }
                    (_, observed) => Staged {
                        guard: observed,
                        before_exists: !matches!(observed, Some(ReadVersion::Missing)),
                        after: None,
                        server_times: Vec::new(),
                    },
                };
                staged.insert(doc.clone(), entry);
            }
            let Some(entry) = staged.get_mut(&doc) else {
                continue;
            };

            match write {
                Write::Set { data, .. } => {
                    entry.after = Some(data);
                    entry.server_times.clear();
                }
                Write::Patch { fields, upsert, .. } => {
                    if entry.after.is_none() && !upsert {
                        return Err(StoreError::Missing(doc.to_string()));
                    }
                    let body = entry.after.get_or_insert_with(Fields::new);
                    for update in fields {
                        entry.server_times.retain(|p| p != &update.path);
                        match update.op {
                            FieldOp::Set(value) => document::assign(body, &update.path, value),
                            FieldOp::Delete => document::remove(body, &update.path),
                            FieldOp::ServerTimestamp => {
                                document::remove(body, &update.path);
                                entry.server_times.push(update.path);
                            }
                        }
                    }
                }
                Write::Delete { .. } => {
                    entry.after = None;
                    entry.server_times.clear();
                }
            }
        }

        let unwritten: Vec<_> = reads
            .iter()
            .filter(|(doc, _)| !staged.contains_key(*doc))
            .collect();
        if staged.is_empty() && unwritten.is_empty() {
            return Ok(());
        }

        let mut transaction = self
            .client
            .begin_transaction()
            .await
            .map_err(|e| store_error("Failed to begin transaction", e))?;

        // Observed documents that are not written still have to be unchanged.
        if !unwritten.is_empty() {
            let tx_client = self.client.clone_with_consistency_selector(
                FirestoreConsistencySelector::Transaction(transaction.transaction_id().clone()),
            );
            for (doc, version) in unwritten {
                let changed = match self.read_for_write(&tx_client, doc).await {
                    Ok((_, current)) => (current != *version)
                        .then(|| StoreError::Aborted(format!("{} changed concurrently", doc))),
                    Err(e) => Some(e),
                };
                if let Some(err) = changed {
                    if let Err(rollback) = transaction.rollback().await {
                        tracing::warn!(error = %rollback, "Transaction rollback failed");
                    }
                    return Err(err);
                }
            }
        }

        for (doc, entry) in &staged {
            let parent = self.parent_path(doc.collection());
            let added = match &entry.after {
                Some(data) => {
                    let mut update = self.client.fluent().update().in_col(doc.collection().name());
                    if let Some(version) = entry.guard {
                        update = update.precondition(precondition(version));
                    }
                    let server_times = entry.server_times.clone();
                    update
                        .document_id(doc.id())
                        .parent(&parent)
                        .object(&Value::Object(data.clone()))
                        .transforms(move |t| {
                            let fields: Vec<_> = server_times
                                .iter()
                                .map(|path| t.field(path.as_str()).server_request_time())
                                .collect();
                            t.fields(fields)
                        })
                        .add_to_transaction(&mut transaction)
                        .map(|_| ())
                }
                None if !entry.before_exists => Ok(()),
                None => {
                    let mut delete = self.client.fluent().delete().from(doc.collection().name());
                    if let Some(version) = entry.guard {
                        delete = delete.precondition(precondition(version));
                    }
                    delete
                        .document_id(doc.id())
                        .parent(&parent)
                        .add_to_transaction(&mut transaction)
                        .map(|_| ())
                }
            };
            if let Err(e) = added {
                if let Err(rollback) = transaction.rollback().await {
                    tracing::warn!(error = %rollback, "Transaction rollback failed");
                }
                return Err(store_error(&format!("Failed to stage write to {}", doc), e));
            }
        }

        transaction
            .commit()
            .await
            .map_err(|e| store_error("Failed to commit transaction", e))?;
        tracing::debug!(documents = staged.len(), "Firestore transaction committed");
        Ok(())
    }

    async fn listen(
        &self,
        target: ListenTarget,
        sink: ChangeSink,
    ) -> Result<Subscription, StoreError> {
        let id = SubscriptionId::next();
        let mut listener: Listener = self
            .client
            .create_listener(FirestoreMemListenStateStorage::new())
            .await
            .map_err(|e| store_error("Failed to create listener", e))?;

        let listener_target = FirestoreListenerTarget::new(LISTENER_TARGET);
        match &target {
            ListenTarget::Document(doc) => self
                .client
                .fluent()
                .select()
                .by_id_in(doc.collection().name())
                .parent(self.parent_path(doc.collection()))
                .batch_listen([doc.id().to_string()])
                .add_target(listener_target, &mut listener),
            ListenTarget::Query(query) => {
                let select = self
                    .client
                    .fluent()
                    .select()
                    .from(query.collection.name())
                    .parent(self.parent_path(&query.collection));
                match &query.filter {
                    Some(filter) => {
                        let field = filter.field.clone();
                        let value = filter.value.clone();
                        select
                            .filter(move |q| match &value {
                                Value::String(s) => {
                                    q.for_all([q.field(field.as_str()).eq(s.clone())])
                                }
                                Value::Bool(b) => q.for_all([q.field(field.as_str()).eq(*b)]),
                                other => {
                                    q.for_all([q.field(field.as_str()).eq(other.to_string())])
                                }
                            })
                            .listen()
                            .add_target(listener_target, &mut listener)
                    }
                    None => select.listen().add_target(listener_target, &mut listener),
                }
            }
        }
        .map_err(|e| store_error("Failed to add listener target", e))?;

        let feed = Arc::new(Mutex::new(FeedState {
            known: HashSet::new(),
            pending: Vec::new(),
            initial_sent: false,
        }));
        let documents_path = self.client.get_documents_path().clone();
        let feed_target = target.clone();

        listener
            .start(move |event| {
                let feed = feed.clone();
                let sink = sink.clone();
                let documents_path = documents_path.clone();
                let target = feed_target.clone();
                async move {
                    let mut state = feed.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(batch) = state.on_event(&documents_path, event) {
                        let _ = sink.send(ChangeBatch {
                            subscription: id,
                            target,
                            changes: batch,
                        });
                    }
                    Ok(())
                }
            })
            .await
            .map_err(|e| store_error("Failed to start listener", e))?;

        let listener = Arc::new(tokio::sync::Mutex::new(listener));
        Ok(Subscription::new(id, move || {
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                return;
            };
            runtime.spawn(async move {
                if let Err(e) = listener.lock().await.shutdown().await {
                    tracing::warn!(error = %e, "Listener shutdown failed");
                }
            });
        }))
    }
}

/// Folds listener events into [`ChangeBatch`]es: everything up to the first
/// CURRENT target change is the initial batch, after that each consistent
/// point flushes what accumulated.
struct FeedState {
    known: HashSet<String>,
    pending: Vec<DocumentChange>,
    initial_sent: bool,
}

impl FeedState {
    fn on_event(
        &mut self,
        documents_path: &str,
        event: FirestoreListenEvent,
    ) -> Option<Vec<DocumentChange>> {
        match event {
            FirestoreListenEvent::DocumentChange(change) => {
                let doc = change.document?;
                let decoded = doc_ref_from_name(documents_path, &doc.name)
                    .and_then(|doc_ref| decode_document(doc_ref, &doc));
                match decoded {
                    Ok(snapshot) if self.known.insert(doc.name.clone()) => {
                        self.pending.push(DocumentChange::Added(snapshot))
                    }
                    Ok(snapshot) => self.pending.push(DocumentChange::Modified(snapshot)),
                    Err(e) => tracing::warn!(error = %e, "Skipping undecodable document"),
                }
                None
            }
            FirestoreListenEvent::DocumentDelete(deleted) => {
                self.removed(documents_path, &deleted.document);
                None
            }
            FirestoreListenEvent::DocumentRemove(removed) => {
                self.removed(documents_path, &removed.document);
                None
            }
            FirestoreListenEvent::TargetChange(change) => {
                let current = change.target_change_type == TargetChangeType::Current as i32;
                if !self.initial_sent {
                    if !current {
                        return None;
                    }
                    self.initial_sent = true;
                    return Some(std::mem::take(&mut self.pending));
                }
                (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending))
            }
            _ => None,
        }
    }

    fn removed(&mut self, documents_path: &str, name: &str) {
        if !self.known.remove(name) {
            return;
        }
        match doc_ref_from_name(documents_path, name) {
            Ok(doc) => self.pending.push(DocumentChange::Removed(doc)),
            Err(e) => tracing::warn!(error = %e, "Skipping unparseable document name"),
        }
    }
}
