// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Household ("family") model.

use super::{Membership, Role, SCHEMA_VERSION};
use crate::db::{FieldUpdate, Snapshot, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Entry in a household's join-request queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub email: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// Household stored at `families/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "camelCase")]
pub struct Household {
    #[serde(skip)]
    pub id: String,
    pub name: String,
    pub organizer_id: String,
    /// Upper-case, from [`crate::services::membership::JOIN_CODE_ALPHABET`]
    pub join_code: String,
    /// uid -> membership; the mirror of `User::memberships`
    pub members: BTreeMap<String, Membership>,
    #[serde(default)]
    pub pending_requests: BTreeMap<String, PendingRequest>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub schema_version: u32,
}

impl Household {
    pub fn new(
        id: &str,
        name: &str,
        organizer_id: &str,
        join_code: String,
        now: DateTime<Utc>,
    ) -> Self {
        let mut members = BTreeMap::new();
        members.insert(
            organizer_id.to_string(),
            Membership {
                role: Role::Organizer,
                joined_at: now,
            },
        );
        Self {
            id: id.to_string(),
            name: name.to_string(),
            organizer_id: organizer_id.to_string(),
            join_code,
            members,
            pending_requests: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            schema_version: SCHEMA_VERSION,
        }
    }

    pub fn is_member(&self, uid: &str) -> bool {
        self.members.contains_key(uid)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHousehold {
    name: Option<String>,
    organizer_id: Option<String>,
    /// Pre-multi-household name of `organizerId`.
    owner_id: Option<String>,
    join_code: Option<String>,
    /// Pre-multi-household name of `joinCode`.
    invite_code: Option<String>,
    members: Option<BTreeMap<String, Membership>>,
    pending_requests: Option<BTreeMap<String, PendingRequest>>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    schema_version: Option<u32>,
}

/// Self-heal a loaded household needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HouseholdBackfill {
    pub missing_join_code: bool,
    /// Stored code is not in canonical upper-case form.
    pub unnormalized_join_code: bool,
    pub empty_members: bool,
    pub stale_schema: bool,
}

impl HouseholdBackfill {
    pub fn is_empty(&self) -> bool {
        !self.missing_join_code
            && !self.unnormalized_join_code
            && !self.empty_members
            && !self.stale_schema
    }

    /// Repair the household in memory and return the matching patch.
    ///
    /// `join_code` is used only if the code is missing. `viewer` is the
    /// member loading the document; with an empty member map they are
    /// re-added next to the organizer.
    pub fn apply(
        &self,
        household: &mut Household,
        join_code: &str,
        viewer: &str,
        now: DateTime<Utc>,
    ) -> Vec<FieldUpdate> {
        let mut patch = Vec::new();

        if self.missing_join_code {
            household.join_code = join_code.to_string();
            patch.push(FieldUpdate::set("joinCode", json!(join_code)));
        }

        if self.empty_members && household.members.is_empty() {
            let mut restore = vec![(household.organizer_id.clone(), Role::Organizer)];
            if viewer != household.organizer_id {
                restore.push((viewer.to_string(), Role::Member));
            }
            for (uid, role) in restore {
                let membership = Membership {
                    role,
                    joined_at: now,
                };
                patch.push(FieldUpdate::set(
                    format!("members.{}", uid),
                    json!({"role": role, "joinedAt": now}),
                ));
                household.members.insert(uid, membership);
            }
        }

        if !self.missing_join_code && (self.stale_schema || self.unnormalized_join_code) {
            patch.push(FieldUpdate::set("joinCode", json!(household.join_code)));
        }

        if self.stale_schema {
            patch.push(FieldUpdate::set("organizerId", json!(household.organizer_id)));
            patch.push(FieldUpdate::set("createdAt", json!(household.created_at)));
            patch.push(FieldUpdate::delete("ownerId"));
            patch.push(FieldUpdate::delete("inviteCode"));
        }

        if !patch.is_empty() {
            household.schema_version = SCHEMA_VERSION;
            household.updated_at = now;
            patch.push(FieldUpdate::set("schemaVersion", json!(SCHEMA_VERSION)));
            patch.push(FieldUpdate::set("updatedAt", json!(now)));
        }
        patch
    }
}

#[derive(Debug, Clone)]
pub struct DecodedHousehold {
    pub household: Household,
    pub backfill: HouseholdBackfill,
}

/// Decode a `families/{id}` snapshot. A household without an organizer
/// cannot be repaired and is a decode error.
pub fn decode_household(snapshot: &Snapshot) -> Result<DecodedHousehold, StoreError> {
    let raw: RawHousehold = snapshot.decode()?;
    let legacy_fields = raw.owner_id.is_some() || raw.invite_code.is_some();
    let organizer_id = raw
        .organizer_id
        .or(raw.owner_id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| StoreError::Decode(format!("{}: no organizer", snapshot.doc)))?;

    let stored_code = raw.join_code.or(raw.invite_code).unwrap_or_default();
    let join_code = stored_code.trim().to_uppercase();
    let members = raw.members.unwrap_or_default();

    let backfill = HouseholdBackfill {
        missing_join_code: join_code.is_empty(),
        unnormalized_join_code: !join_code.is_empty() && stored_code != join_code,
        empty_members: members.is_empty(),
        stale_schema: raw.schema_version.unwrap_or(0) < SCHEMA_VERSION
            || raw.created_at.is_none()
            || legacy_fields,
    };

    let household = Household {
        id: snapshot.id().to_string(),
        name: raw.name.unwrap_or_default(),
        organizer_id,
        join_code,
        members,
        pending_requests: raw.pending_requests.unwrap_or_default(),
        created_at: raw.created_at.unwrap_or(snapshot.update_time),
        updated_at: raw.updated_at.unwrap_or(snapshot.update_time),
        schema_version: raw.schema_version.unwrap_or(0),
    };

    Ok(DecodedHousehold {
        household,
        backfill,
    })
}
