// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Data models for the application.

pub mod household;
pub mod location;
pub mod user;

pub use household::{decode_household, DecodedHousehold, Household, HouseholdBackfill, PendingRequest};
pub use location::{Coordinate, MemberLocation};
pub use user::{decode_user, DecodedUser, Membership, User, UserBackfill, UserStatus};

use serde::{Deserialize, Serialize};
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Version stamped on documents written by this code. Anything older is
/// repaired on load.
pub const SCHEMA_VERSION: u32 = 2;

/// Role of a user, either globally (chosen at signup) or within a household.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Organizer,
    Member,
}
