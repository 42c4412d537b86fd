// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Membership repository.
//!
//! Every operation runs as one optimistic transaction that writes both
//! sides of the membership mirror (`families/{id}.members` and
//! `users/{uid}.memberships`) and bumps `updatedAt` on each touched
//! document with a single `now`. Contention aborts are retried.
//!
//! Organizer checks on `acting_uid` are advisory: they are logged, not
//! enforced, and the store applies no rules of its own.

use crate::db::{
    collections, to_fields, DocRef, DocumentStore, FieldUpdate, Query, Snapshot, StoreError,
    Transaction,
};
use crate::error::{AppError, Result};
use crate::models::{
    decode_household, decode_user, DecodedHousehold, DecodedUser, Household, Membership, Role,
    User,
};
use crate::time_utils::now_micros;
use chrono::{DateTime, Utc};
use rand::RngExt;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;

/// Join code characters; no 0/O or 1/I.
pub const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const JOIN_CODE_LEN: usize = 6;

/// Attempts per transaction before contention is reported.
const MAX_ATTEMPTS: u32 = 5;

/// Uniform random join code. Uniqueness is not checked.
pub fn generate_join_code() -> String {
    let mut rng = rand::rng();
    (0..JOIN_CODE_LEN)
        .map(|_| JOIN_CODE_ALPHABET[rng.random_range(0..JOIN_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Upper-cased, trimmed join code as stored.
pub fn normalize_join_code(code: &str) -> String {
    code.trim().to_uppercase()
}

fn membership_value(role: Role, joined_at: DateTime<Utc>) -> Value {
    json!({ "role": role, "joinedAt": joined_at })
}

/// One-sided membership entries found for a user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Households in `user.memberships` whose member map lacks the user.
    pub user_only: Vec<String>,
    /// Households listing the user as a member, absent from `user.memberships`.
    pub household_only: Vec<String>,
    /// Memberships pointing at households that no longer exist.
    pub missing_households: Vec<String>,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.user_only.is_empty() && self.household_only.is_empty() && self.missing_households.is_empty()
    }
}

/// Atomic membership operations over a [`DocumentStore`].
pub struct MembershipRepository<S> {
    store: Arc<S>,
}

impl<S> Clone for MembershipRepository<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: DocumentStore> MembershipRepository<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run `attempt` and commit its transaction, retrying on contention.
    /// An attempt that buffers no writes commits nothing.
    async fn transact<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(Transaction, T)>>,
    {
        let mut tries = 1;
        loop {
            let (tx, value) = attempt().await?;
            if tx.is_empty() {
                return Ok(value);
            }
            match self.store.commit(tx).await {
                Ok(()) => {
                    tracing::debug!(op, tries, "Transaction committed");
                    return Ok(value);
                }
                Err(StoreError::Aborted(reason)) if tries < MAX_ATTEMPTS => {
                    tracing::debug!(op, tries, reason = %reason, "Transaction contention, retrying");
                    tries += 1;
                }
                Err(e) => {
                    tracing::warn!(op, tries, error = %e, "Transaction failed");
                    return Err(e.into());
                }
            }
        }
    }

    /// Read a document and add it to the transaction's read set.
    async fn read(&self, tx: &mut Transaction, doc: &DocRef) -> Result<Option<Snapshot>> {
        let snapshot = self.store.get(doc).await?;
        tx.observe(doc, snapshot.as_ref());
        Ok(snapshot)
    }

    async fn read_household(&self, tx: &mut Transaction, household_id: &str) -> Result<Household> {
        let doc = collections::family(household_id);
        let snapshot = self
            .read(tx, &doc)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Household {}", household_id)))?;
        Ok(decode_household(&snapshot)?.household)
    }

    async fn read_user(&self, tx: &mut Transaction, uid: &str) -> Result<User> {
        let doc = collections::user(uid);
        let snapshot = self
            .read(tx, &doc)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User profile {}", uid)))?;
        Ok(decode_user(&snapshot)?.user)
    }

    // ─── Profile documents ───────────────────────────────────

    pub async fn load_user(&self, uid: &str) -> Result<Option<DecodedUser>> {
        match self.store.get(&collections::user(uid)).await? {
            Some(snapshot) => Ok(Some(decode_user(&snapshot)?)),
            None => Ok(None),
        }
    }

    pub async fn load_household(&self, household_id: &str) -> Result<Option<DecodedHousehold>> {
        match self.store.get(&collections::family(household_id)).await? {
            Some(snapshot) => Ok(Some(decode_household(&snapshot)?)),
            None => Ok(None),
        }
    }

    /// Write a new profile, replacing any existing document.
    pub async fn save_user(&self, user: &User) -> Result<()> {
        self.store
            .apply(crate::db::Write::Set {
                doc: collections::user(&user.id),
                data: to_fields(user)?,
            })
            .await?;
        Ok(())
    }

    /// Apply a field patch to an existing document in one write.
    pub async fn patch(&self, doc: DocRef, fields: Vec<FieldUpdate>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut tx = Transaction::new();
        tx.patch(doc, fields);
        self.store.commit(tx).await?;
        Ok(())
    }

    /// Persist the user's current household. The user must be a member.
    pub async fn set_current_household(&self, uid: &str, household_id: &str) -> Result<()> {
        self.transact("set_current_household", || async move {
            let mut tx = Transaction::new();
            let user = self.read_user(&mut tx, uid).await?;
            if !user.memberships.contains_key(household_id) {
                return Err(AppError::InvalidState(
                    "You are not a member of that household".to_string(),
                ));
            }
            if user.current_family_id.as_deref() != Some(household_id) {
                tx.patch(
                    collections::user(uid),
                    vec![
                        FieldUpdate::set("currentFamilyId", json!(household_id)),
                        FieldUpdate::set("updatedAt", json!(now_micros())),
                    ],
                );
            }
            Ok::<_, AppError>((tx, ()))
        })
        .await
    }

    // ─── Join codes ──────────────────────────────────────────

    /// Case-insensitive exact match. If several households share the code
    /// an arbitrary one is returned.
    ///
    /// Legacy `inviteCode` values were stored as typed; upper and lower case
    /// forms are tried. Mixed-case legacy codes resolve once the household
    /// has been backfilled.
    pub async fn lookup_by_join_code(&self, code: &str) -> Result<Option<Household>> {
        let code = normalize_join_code(code);
        if code.is_empty() {
            return Err(AppError::Validation("Join code is required".to_string()));
        }

        let families = crate::db::CollectionRef::root(collections::FAMILIES);
        let candidates = [
            ("joinCode", code.clone()),
            ("inviteCode", code.clone()),
            ("inviteCode", code.to_lowercase()),
        ];
        for (field, value) in candidates {
            let query = Query::field_eq(families.clone(), field, json!(value));
            if let Some(snapshot) = self.store.query(&query, Some(1)).await?.first() {
                return Ok(Some(decode_household(snapshot)?.household));
            }
        }
        Ok(None)
    }

    pub async fn rotate_join_code(&self, household_id: &str, acting_uid: &str) -> Result<String> {
        self.transact("rotate_join_code", || async move {
            let mut tx = Transaction::new();
            let household = self.read_household(&mut tx, household_id).await?;
            warn_if_not_organizer(&household, acting_uid, "rotate_join_code");

            let code = generate_join_code();
            tx.patch(
                collections::family(household_id),
                vec![
                    FieldUpdate::set("joinCode", json!(code)),
                    FieldUpdate::set("updatedAt", json!(now_micros())),
                ],
            );
            Ok::<_, AppError>((tx, code))
        })
        .await
    }

    // ─── Membership mirror ───────────────────────────────────

    /// Create a household with `organizer_uid` as organizer and make it the
    /// organizer's current household.
    pub async fn create_household(&self, name: &str, organizer_uid: &str) -> Result<Household> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidState(
                "Household name cannot be empty".to_string(),
            ));
        }
        let household_id = self.store.new_id();
        let join_code = generate_join_code();
        let (household_id, join_code) = (household_id.as_str(), join_code.as_str());

        let household = self
            .transact("create_household", || async move {
                let mut tx = Transaction::new();
                self.read_user(&mut tx, organizer_uid).await?;

                let now = now_micros();
                let household =
                    Household::new(household_id, name, organizer_uid, join_code.to_string(), now);
                tx.set(collections::family(household_id), to_fields(&household)?);
                tx.patch(
                    collections::user(organizer_uid),
                    vec![
                        FieldUpdate::set(
                            format!("memberships.{}", household_id),
                            membership_value(Role::Organizer, now),
                        ),
                        FieldUpdate::set("currentFamilyId", json!(household_id)),
                        FieldUpdate::set("updatedAt", json!(now)),
                    ],
                );
                Ok::<_, AppError>((tx, household))
            })
            .await?;

        tracing::info!(
            household_id = %household.id,
            uid = %organizer_uid,
            "Household created"
        );
        Ok(household)
    }

    /// Join the household matching `code` as a member. Existing entries on
    /// either side are kept as they are.
    pub async fn join_by_code(&self, code: &str, uid: &str) -> Result<Household> {
        let found = self
            .lookup_by_join_code(code)
            .await?
            .ok_or_else(|| AppError::NotFound("No household matches that join code".to_string()))?;

        let household_id = found.id.as_str();
        let household = self
            .transact("join_by_code", || async move {
                let mut tx = Transaction::new();
                let mut household = self.read_household(&mut tx, household_id).await?;
                let user = self.read_user(&mut tx, uid).await?;
                let now = now_micros();

                let membership = household
                    .members
                    .get(uid)
                    .or_else(|| user.memberships.get(household_id))
                    .cloned()
                    .unwrap_or(Membership {
                        role: Role::Member,
                        joined_at: now,
                    });

                let mut household_fields = Vec::new();
                if !household.is_member(uid) {
                    household_fields.push(FieldUpdate::set(
                        format!("members.{}", uid),
                        membership_value(membership.role, membership.joined_at),
                    ));
                }
                if household.pending_requests.contains_key(uid) {
                    household_fields.push(FieldUpdate::delete(format!("pendingRequests.{}", uid)));
                }
                if !household_fields.is_empty() {
                    household_fields.push(FieldUpdate::set("updatedAt", json!(now)));
                    tx.patch(collections::family(household_id), household_fields);
                }

                if !user.memberships.contains_key(household_id) {
                    tx.patch(
                        collections::user(uid),
                        vec![
                            FieldUpdate::set(
                                format!("memberships.{}", household_id),
                                membership_value(membership.role, membership.joined_at),
                            ),
                            FieldUpdate::set("updatedAt", json!(now)),
                        ],
                    );
                }

                household.members.insert(uid.to_string(), membership);
                household.pending_requests.remove(uid);
                Ok::<_, AppError>((tx, household))
            })
            .await?;

        tracing::info!(household_id = %household.id, uid = %uid, "Joined household");
        Ok(household)
    }

    /// Add `member_uid` with `role`, writing both mirror sides.
    pub async fn add_member(
        &self,
        household_id: &str,
        member_uid: &str,
        acting_uid: &str,
        role: Role,
    ) -> Result<()> {
        self.transact("add_member", || async move {
            let mut tx = Transaction::new();
            let household = self.read_household(&mut tx, household_id).await?;
            warn_if_not_organizer(&household, acting_uid, "add_member");
            if role == Role::Organizer && member_uid != household.organizer_id {
                return Err(AppError::InvalidState(
                    "A household has a single organizer".to_string(),
                ));
            }
            let user = self.read_user(&mut tx, member_uid).await?;

            let now = now_micros();
            let joined_at = household
                .members
                .get(member_uid)
                .or_else(|| user.memberships.get(household_id))
                .map(|m| m.joined_at)
                .unwrap_or(now);

            tx.patch(
                collections::family(household_id),
                vec![
                    FieldUpdate::set(
                        format!("members.{}", member_uid),
                        membership_value(role, joined_at),
                    ),
                    FieldUpdate::set("updatedAt", json!(now)),
                ],
            );
            tx.patch(
                collections::user(member_uid),
                vec![
                    FieldUpdate::set(
                        format!("memberships.{}", household_id),
                        membership_value(role, joined_at),
                    ),
                    FieldUpdate::set("updatedAt", json!(now)),
                ],
            );
            Ok::<_, AppError>((tx, ()))
        })
        .await?;

        tracing::info!(household_id, uid = %member_uid, acting_uid, "Member added");
        Ok(())
    }

    /// Remove `member_uid` from both mirror sides. The organizer cannot be
    /// removed.
    pub async fn remove_member(
        &self,
        household_id: &str,
        member_uid: &str,
        acting_uid: &str,
    ) -> Result<()> {
        self.transact("remove_member", || async move {
            let mut tx = Transaction::new();
            let household = self.read_household(&mut tx, household_id).await?;
            warn_if_not_organizer(&household, acting_uid, "remove_member");
            if member_uid == household.organizer_id {
                return Err(AppError::PermissionDenied(
                    "Transfer the organizer role before removing the organizer".to_string(),
                ));
            }
            self.detach_member(&mut tx, household_id, member_uid).await?;
            Ok::<_, AppError>((tx, ()))
        })
        .await?;

        tracing::info!(household_id, uid = %member_uid, acting_uid, "Member removed");
        Ok(())
    }

    /// Self-service leave. The organizer cannot leave.
    pub async fn leave_household(&self, household_id: &str, uid: &str) -> Result<()> {
        self.transact("leave_household", || async move {
            let mut tx = Transaction::new();
            let household = self.read_household(&mut tx, household_id).await?;
            if uid == household.organizer_id {
                return Err(AppError::InvalidState(
                    "The organizer cannot leave the household".to_string(),
                ));
            }
            self.detach_member(&mut tx, household_id, uid).await?;
            Ok::<_, AppError>((tx, ()))
        })
        .await?;

        tracing::info!(household_id, uid, "Left household");
        Ok(())
    }

    /// Buffer deletes for both sides of one membership. A user whose current
    /// household is removed falls back to their earliest remaining one.
    async fn detach_member(&self, tx: &mut Transaction, household_id: &str, uid: &str) -> Result<()> {
        let now = now_micros();
        tx.patch(
            collections::family(household_id),
            vec![
                FieldUpdate::delete(format!("members.{}", uid)),
                FieldUpdate::set("updatedAt", json!(now)),
            ],
        );

        let doc = collections::user(uid);
        if let Some(snapshot) = self.read(tx, &doc).await? {
            let user = decode_user(&snapshot)?.user;
            let mut fields = vec![
                FieldUpdate::delete(format!("memberships.{}", household_id)),
                FieldUpdate::set("updatedAt", json!(now)),
            ];
            if user.current_family_id.as_deref() == Some(household_id) {
                fields.push(FieldUpdate::delete("currentFamilyId"));
            }
            tx.patch(doc, fields);
        }
        Ok(())
    }

    // ─── Join requests ───────────────────────────────────────

    pub async fn request_to_join(
        &self,
        household_id: &str,
        uid: &str,
        email: Option<&str>,
    ) -> Result<()> {
        self.transact("request_to_join", || async move {
            let mut tx = Transaction::new();
            let household = self.read_household(&mut tx, household_id).await?;
            if household.is_member(uid) {
                return Err(AppError::InvalidState(
                    "Already a member of this household".to_string(),
                ));
            }
            let now = now_micros();
            tx.patch(
                collections::family(household_id),
                vec![
                    FieldUpdate::set(
                        format!("pendingRequests.{}", uid),
                        json!({"email": email, "requestedAt": now}),
                    ),
                    FieldUpdate::set("updatedAt", json!(now)),
                ],
            );
            Ok::<_, AppError>((tx, ()))
        })
        .await?;

        tracing::info!(household_id, uid, "Join request recorded");
        Ok(())
    }

    /// Promote a pending request to membership on both sides.
    pub async fn approve_join_request(
        &self,
        household_id: &str,
        uid: &str,
        acting_uid: &str,
    ) -> Result<()> {
        self.transact("approve_join_request", || async move {
            let mut tx = Transaction::new();
            let household = self.read_household(&mut tx, household_id).await?;
            warn_if_not_organizer(&household, acting_uid, "approve_join_request");
            if !household.pending_requests.contains_key(uid) {
                return Err(AppError::NotFound("No pending request for that user".to_string()));
            }
            self.read_user(&mut tx, uid).await?;

            let now = now_micros();
            tx.patch(
                collections::family(household_id),
                vec![
                    FieldUpdate::set(
                        format!("members.{}", uid),
                        membership_value(Role::Member, now),
                    ),
                    FieldUpdate::delete(format!("pendingRequests.{}", uid)),
                    FieldUpdate::set("updatedAt", json!(now)),
                ],
            );
            tx.patch(
                collections::user(uid),
                vec![
                    FieldUpdate::set(
                        format!("memberships.{}", household_id),
                        membership_value(Role::Member, now),
                    ),
                    FieldUpdate::set("updatedAt", json!(now)),
                ],
            );
            Ok::<_, AppError>((tx, ()))
        })
        .await?;

        tracing::info!(household_id, uid, acting_uid, "Join request approved");
        Ok(())
    }

    pub async fn reject_join_request(
        &self,
        household_id: &str,
        uid: &str,
        acting_uid: &str,
    ) -> Result<()> {
        self.transact("reject_join_request", || async move {
            let mut tx = Transaction::new();
            let household = self.read_household(&mut tx, household_id).await?;
            warn_if_not_organizer(&household, acting_uid, "reject_join_request");
            if !household.pending_requests.contains_key(uid) {
                return Err(AppError::NotFound("No pending request for that user".to_string()));
            }
            tx.patch(
                collections::family(household_id),
                vec![
                    FieldUpdate::delete(format!("pendingRequests.{}", uid)),
                    FieldUpdate::set("updatedAt", json!(now_micros())),
                ],
            );
            Ok::<_, AppError>((tx, ()))
        })
        .await?;

        tracing::info!(household_id, uid, acting_uid, "Join request rejected");
        Ok(())
    }

    // ─── Reconciliation ──────────────────────────────────────

    /// Compare a user's memberships with the member maps of the households
    /// involved. With `repair`, each one-sided entry is fixed in its own
    /// transaction; the report describes what was found before repair.
    pub async fn reconcile_user(&self, uid: &str, repair: bool) -> Result<ReconcileReport> {
        let user = self
            .load_user(uid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User profile {}", uid)))?
            .user;

        let mut report = ReconcileReport::default();
        for household_id in user.memberships.keys() {
            match self.load_household(household_id).await? {
                None => report.missing_households.push(household_id.clone()),
                Some(decoded) if !decoded.household.is_member(uid) => {
                    report.user_only.push(household_id.clone())
                }
                Some(_) => {}
            }
        }

        let families = crate::db::CollectionRef::root(collections::FAMILIES);
        for role in [Role::Organizer, Role::Member] {
            let query = Query::field_eq(families.clone(), &format!("members.{}.role", uid), json!(role));
            for snapshot in self.store.query(&query, None).await? {
                if !user.memberships.contains_key(snapshot.id()) {
                    report.household_only.push(snapshot.id().to_string());
                }
            }
        }

        if !report.is_consistent() {
            tracing::warn!(
                uid,
                user_only = ?report.user_only,
                household_only = ?report.household_only,
                missing_households = ?report.missing_households,
                "Membership mirror is inconsistent"
            );
        }

        if repair {
            for household_id in &report.user_only {
                self.repair_household_side(household_id, uid).await?;
            }
            for household_id in &report.household_only {
                self.repair_user_side(household_id, uid).await?;
            }
            for household_id in &report.missing_households {
                self.drop_dangling_membership(household_id, uid).await?;
            }
        }
        Ok(report)
    }

    /// Copy the user's membership entry onto the household.
    async fn repair_household_side(&self, household_id: &str, uid: &str) -> Result<()> {
        self.transact("repair_household_side", || async move {
            let mut tx = Transaction::new();
            let household = self.read_household(&mut tx, household_id).await?;
            let user = self.read_user(&mut tx, uid).await?;
            let (Some(membership), false) =
                (user.memberships.get(household_id), household.is_member(uid))
            else {
                return Ok::<_, AppError>((tx, ()));
            };
            let role = if uid == household.organizer_id {
                Role::Organizer
            } else {
                Role::Member
            };
            tx.patch(
                collections::family(household_id),
                vec![
                    FieldUpdate::set(
                        format!("members.{}", uid),
                        membership_value(role, membership.joined_at),
                    ),
                    FieldUpdate::set("updatedAt", json!(now_micros())),
                ],
            );
            Ok::<_, AppError>((tx, ()))
        })
        .await
    }

    /// Copy the household's member entry onto the user.
    async fn repair_user_side(&self, household_id: &str, uid: &str) -> Result<()> {
        self.transact("repair_user_side", || async move {
            let mut tx = Transaction::new();
            let household = self.read_household(&mut tx, household_id).await?;
            let user = self.read_user(&mut tx, uid).await?;
            let (Some(membership), false) = (
                household.members.get(uid),
                user.memberships.contains_key(household_id),
            ) else {
                return Ok::<_, AppError>((tx, ()));
            };
            tx.patch(
                collections::user(uid),
                vec![
                    FieldUpdate::set(
                        format!("memberships.{}", household_id),
                        membership_value(membership.role, membership.joined_at),
                    ),
                    FieldUpdate::set("updatedAt", json!(now_micros())),
                ],
            );
            Ok::<_, AppError>((tx, ()))
        })
        .await
    }

    async fn drop_dangling_membership(&self, household_id: &str, uid: &str) -> Result<()> {
        self.transact("drop_dangling_membership", || async move {
            let mut tx = Transaction::new();
            if self
                .read(&mut tx, &collections::family(household_id))
                .await?
                .is_some()
            {
                return Ok::<_, AppError>((tx, ()));
            }
            let user = self.read_user(&mut tx, uid).await?;
            let mut fields = vec![
                FieldUpdate::delete(format!("memberships.{}", household_id)),
                FieldUpdate::set("updatedAt", json!(now_micros())),
            ];
            if user.current_family_id.as_deref() == Some(household_id) {
                fields.push(FieldUpdate::delete("currentFamilyId"));
            }
            tx.patch(collections::user(uid), fields);
            Ok::<_, AppError>((tx, ()))
        })
        .await
    }
}

fn warn_if_not_organizer(household: &Household, acting_uid: &str, op: &str) {
    if household.organizer_id != acting_uid {
        tracing::warn!(
            household_id = %household.id,
            acting_uid,
            op,
            "Acting user is not the organizer; authorization is advisory only"
        );
    }
}
