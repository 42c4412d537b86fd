// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use super::Route;
use crate::models::{Household, User};
use crate::services::MemberLocations;
use serde::Serialize;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Snapshot published to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub route: Route,
    pub user: Option<User>,
    /// Current household
    pub household: Option<Household>,
    /// Every household the user belongs to, current first
    pub households: Vec<Household>,
    /// Sharing members of the current household, by uid
    pub member_locations: MemberLocations,
    pub error_message: Option<String>,
}

impl SessionState {
    pub fn current_household_id(&self) -> Option<&str> {
        self.household.as_ref().map(|h| h.id.as_str())
    }

    /// Drop everything tied to the signed-in user, keeping the error.
    pub(crate) fn clear_user(&mut self) {
        self.user = None;
        self.clear_households();
    }

    pub(crate) fn clear_households(&mut self) {
        self.household = None;
        self.households.clear();
        self.member_locations.clear();
    }
}

/// Current household first, then by case-insensitive name.
pub fn order_households(households: &mut [Household], current_id: Option<&str>) {
    households.sort_by(|a, b| {
        let a_current = Some(a.id.as_str()) == current_id;
        let b_current = Some(b.id.as_str()) == current_id;
        b_current
            .cmp(&a_current)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.id.cmp(&b.id))
    });
}
