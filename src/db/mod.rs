// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Document store layer.
//!
//! The session and repository are written against [`DocumentStore`]; the
//! in-process [`MemoryStore`] and the Firestore-backed store implement it.

pub mod document;
#[cfg(feature = "gcp")]
pub mod firestore;
pub mod memory;

pub use document::{
    ChangeBatch, ChangeSink, CollectionRef, DocRef, DocumentChange, FieldOp, FieldUpdate, Fields,
    ListenTarget, Query, ReadVersion, Snapshot, Subscription, SubscriptionId, Transaction, Write,
    to_fields,
};
#[cfg(feature = "gcp")]
pub use firestore::FirestoreStore;
pub use memory::MemoryStore;

use std::future::Future;

/// Collection names as constants.
pub mod collections {
    use super::{CollectionRef, DocRef};

    pub const USERS: &str = "users";
    pub const FAMILIES: &str = "families";
    /// Sub-collection of `families/{id}`, keyed by member uid.
    pub const MEMBER_LOCATIONS: &str = "memberLocations";

    pub fn user(uid: &str) -> DocRef {
        CollectionRef::root(USERS).doc(uid)
    }

    pub fn family(household_id: &str) -> DocRef {
        CollectionRef::root(FAMILIES).doc(household_id)
    }

    pub fn member_locations(household_id: &str) -> CollectionRef {
        family(household_id).sub_collection(MEMBER_LOCATIONS)
    }

    pub fn member_location(household_id: &str, uid: &str) -> DocRef {
        member_locations(household_id).doc(uid)
    }
}

/// Store-level failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// A document observed by the transaction changed before commit.
    #[error("Transaction aborted: {0}")]
    Aborted(String),

    #[error("Document not found: {0}")]
    Missing(String),

    #[error("Could not decode document {0}")]
    Decode(String),

    #[error("Store unavailable: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

/// Generic document store primitives.
///
/// `commit` is the only mutation entry point: single writes and batched
/// writes are transactions without observed reads.
pub trait DocumentStore: Send + Sync + 'static {
    /// Fresh store-assigned document id.
    fn new_id(&self) -> String;

    fn get(
        &self,
        doc: &DocRef,
    ) -> impl Future<Output = Result<Option<Snapshot>, StoreError>> + Send;

    /// Equality-filtered query. Result order is unspecified.
    fn query(
        &self,
        query: &Query,
        limit: Option<u32>,
    ) -> impl Future<Output = Result<Vec<Snapshot>, StoreError>> + Send;

    /// Commit all writes atomically, failing with [`StoreError::Aborted`] if
    /// any observed document changed since it was read.
    fn commit(&self, tx: Transaction) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Attach a live listener. The sink first receives the current matching
    /// documents as `Added`, then one batch per affecting commit.
    fn listen(
        &self,
        target: ListenTarget,
        sink: ChangeSink,
    ) -> impl Future<Output = Result<Subscription, StoreError>> + Send;

    /// Commit a single write.
    fn apply(&self, write: Write) -> impl Future<Output = Result<(), StoreError>> + Send {
        let mut tx = Transaction::new();
        match write {
            Write::Set { doc, data } => tx.set(doc, data),
            Write::Patch {
                doc,
                fields,
                upsert: true,
            } => tx.upsert(doc, fields),
            Write::Patch { doc, fields, .. } => tx.patch(doc, fields),
            Write::Delete { doc } => tx.delete(doc),
        }
        self.commit(tx)
    }
}
