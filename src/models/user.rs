// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! User profile model and its schema-versioned decode step.

use super::{Role, SCHEMA_VERSION};
use crate::db::{FieldUpdate, Snapshot, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Account status; anything but `Active` routes to the pending screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Pending,
    Disabled,
}

/// One side of the membership mirror, keyed by household id on the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

/// User profile stored at `users/{uid}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Principal id (also the document id)
    #[serde(skip)]
    pub id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
    /// Role chosen at signup, independent of any household
    pub role: Role,
    /// household id -> membership
    pub memberships: BTreeMap<String, Membership>,
    pub current_family_id: Option<String>,
    /// Pre-multi-household single membership; read only for migration.
    #[serde(rename = "familyId", skip_serializing_if = "Option::is_none")]
    pub legacy_family_id: Option<String>,
    pub status: UserStatus,
    pub provider_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub schema_version: u32,
}

impl User {
    /// Fresh profile written at signup.
    pub fn new_signup(
        id: &str,
        email: Option<String>,
        display_name: Option<String>,
        role: Role,
        provider_ids: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.to_string(),
            display_name,
            email,
            photo_url: None,
            role,
            memberships: BTreeMap::new(),
            current_family_id: None,
            legacy_family_id: None,
            status: UserStatus::Active,
            provider_ids,
            created_at: now,
            updated_at: now,
            schema_version: SCHEMA_VERSION,
        }
    }
}

/// Stored shape before defaults are applied. Every field may be absent on
/// documents written by older app versions.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUser {
    display_name: Option<String>,
    /// Older documents used `name`.
    name: Option<String>,
    email: Option<String>,
    #[serde(rename = "photoURL")]
    photo_url: Option<String>,
    role: Option<Role>,
    memberships: Option<BTreeMap<String, Membership>>,
    current_family_id: Option<String>,
    family_id: Option<String>,
    status: Option<UserStatus>,
    provider_ids: Option<Vec<String>>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    schema_version: Option<u32>,
}

/// Repairs a loaded user document needs to match the current schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserBackfill {
    /// Legacy single household to move into `memberships`.
    pub legacy_membership: Option<String>,
    pub missing_provider_ids: bool,
    /// Fields were absent and defaulted during decode.
    pub stale_schema: bool,
}

impl UserBackfill {
    pub fn is_empty(&self) -> bool {
        self.legacy_membership.is_none() && !self.missing_provider_ids && !self.stale_schema
    }

    /// Apply the repair to the in-memory profile, returning the matching
    /// field patch for the stored document. Idempotent.
    pub fn apply(
        &self,
        user: &mut User,
        provider_ids: &[String],
        now: DateTime<Utc>,
    ) -> Vec<FieldUpdate> {
        let mut patch = Vec::new();

        if let Some(fid) = &self.legacy_membership {
            if user.memberships.is_empty() {
                let membership = Membership {
                    role: user.role,
                    joined_at: user.created_at,
                };
                patch.push(FieldUpdate::set(
                    format!("memberships.{}", fid),
                    json!({"role": membership.role, "joinedAt": membership.joined_at}),
                ));
                user.memberships.insert(fid.clone(), membership);
            }
            if user.current_family_id.is_none() {
                patch.push(FieldUpdate::set("currentFamilyId", json!(fid)));
                user.current_family_id = Some(fid.clone());
            }
        }

        if self.missing_provider_ids {
            user.provider_ids = provider_ids.to_vec();
            patch.push(FieldUpdate::set("providerIds", json!(provider_ids)));
        }

        if self.stale_schema {
            patch.push(FieldUpdate::set("role", json!(user.role)));
            patch.push(FieldUpdate::set("status", json!(user.status)));
            patch.push(FieldUpdate::set("createdAt", json!(user.created_at)));
            if user.display_name.is_some() {
                patch.push(FieldUpdate::set("displayName", json!(user.display_name)));
            }
        }

        if !patch.is_empty() {
            user.schema_version = SCHEMA_VERSION;
            user.updated_at = now;
            patch.push(FieldUpdate::set("schemaVersion", json!(SCHEMA_VERSION)));
            patch.push(FieldUpdate::set("updatedAt", json!(now)));
        }
        patch
    }
}

/// A user document together with the repairs it needs.
#[derive(Debug, Clone)]
pub struct DecodedUser {
    pub user: User,
    pub backfill: UserBackfill,
}

/// Decode a `users/{uid}` snapshot, reporting defaults instead of hiding them.
pub fn decode_user(snapshot: &Snapshot) -> Result<DecodedUser, StoreError> {
    let raw: RawUser = snapshot.decode()?;
    let mut backfill = UserBackfill {
        stale_schema: raw.schema_version.unwrap_or(0) < SCHEMA_VERSION,
        ..Default::default()
    };

    if raw.role.is_none() || raw.status.is_none() || raw.created_at.is_none() {
        backfill.stale_schema = true;
    }

    let memberships = raw.memberships.unwrap_or_default();
    if memberships.is_empty() {
        backfill.legacy_membership = raw.family_id.clone();
    }
    backfill.missing_provider_ids = raw.provider_ids.is_none();

    let user = User {
        id: snapshot.id().to_string(),
        display_name: raw.display_name.or(raw.name),
        email: raw.email,
        photo_url: raw.photo_url,
        role: raw.role.unwrap_or(Role::Member),
        memberships,
        current_family_id: raw.current_family_id,
        legacy_family_id: raw.family_id,
        status: raw.status.unwrap_or(UserStatus::Active),
        provider_ids: raw.provider_ids.unwrap_or_default(),
        created_at: raw.created_at.unwrap_or(snapshot.update_time),
        updated_at: raw.updated_at.unwrap_or(snapshot.update_time),
        schema_version: raw.schema_version.unwrap_or(0),
    };

    Ok(DecodedUser { user, backfill })
}
