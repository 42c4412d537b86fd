// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Route computation and current-household resolution.

use crate::models::{Role, User, UserStatus};
use crate::services::AuthState;
use serde::Serialize;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Screen the presentation layer should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(tag = "route", content = "role", rename_all = "camelCase")]
pub enum Route {
    /// Waiting for the first identity event.
    #[default]
    Splash,
    SignedOut,
    SignedInNoProfile,
    NeedsHouseholdSetup(Role),
    PendingMembership,
    Active,
}

/// Derive the route from identity state and the loaded profile.
pub fn compute_route(auth: &AuthState, user: Option<&User>) -> Route {
    match (auth, user) {
        (AuthState::Probing, _) => Route::Splash,
        (AuthState::SignedOut, _) => Route::SignedOut,
        (AuthState::SignedIn(_), None) => Route::SignedInNoProfile,
        (AuthState::SignedIn(_), Some(user)) if user.status != UserStatus::Active => {
            Route::PendingMembership
        }
        (AuthState::SignedIn(_), Some(user)) if user.memberships.is_empty() => {
            Route::NeedsHouseholdSetup(user.role)
        }
        (AuthState::SignedIn(_), Some(_)) => Route::Active,
    }
}

/// The household a user's session is scoped to, and whether that choice
/// differs from the stored `currentFamilyId` and should be persisted.
///
/// A stored id that is not a membership key falls back like an unset one:
/// earliest `joinedAt`, ties broken by id.
pub fn resolve_current_household(user: &User) -> Option<(String, bool)> {
    if let Some(current) = &user.current_family_id {
        if user.memberships.contains_key(current) {
            return Some((current.clone(), false));
        }
    }
    user.memberships
        .iter()
        .min_by(|(a_id, a), (b_id, b)| a.joined_at.cmp(&b.joined_at).then(a_id.cmp(b_id)))
        .map(|(id, _)| (id.clone(), true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Membership;
    use crate::services::Principal;
    use chrono::{Duration, TimeZone, Utc};

    fn signed_in() -> AuthState {
        AuthState::SignedIn(Principal {
            uid: "u1".into(),
            email: None,
            provider_ids: vec![],
        })
    }

    fn user(status: UserStatus, households: &[(&str, i64)]) -> User {
        let t0 = Utc.with_ymd_and_hms(2025, 8, 10, 0, 0, 0).unwrap();
        let mut user = User::new_signup("u1", None, None, Role::Organizer, vec![], t0);
        user.status = status;
        for (id, offset) in households {
            user.memberships.insert(
                id.to_string(),
                Membership {
                    role: Role::Member,
                    joined_at: t0 + Duration::minutes(*offset),
                },
            );
        }
        user
    }

    #[test]
    fn test_probing_holds_splash() {
        assert_eq!(compute_route(&AuthState::Probing, None), Route::Splash);
        assert_eq!(compute_route(&AuthState::SignedOut, None), Route::SignedOut);
    }

    #[test]
    fn test_route_by_status_and_memberships() {
        let auth = signed_in();
        assert_eq!(compute_route(&auth, None), Route::SignedInNoProfile);

        let active = user(UserStatus::Active, &[("f1", 0)]);
        assert_eq!(compute_route(&auth, Some(&active)), Route::Active);

        let empty = user(UserStatus::Active, &[]);
        assert_eq!(
            compute_route(&auth, Some(&empty)),
            Route::NeedsHouseholdSetup(Role::Organizer)
        );

        for status in [UserStatus::Pending, UserStatus::Disabled] {
            assert_eq!(
                compute_route(&auth, Some(&user(status, &[("f1", 0)]))),
                Route::PendingMembership
            );
            assert_eq!(
                compute_route(&auth, Some(&user(status, &[]))),
                Route::PendingMembership
            );
        }
    }

    #[test]
    fn test_current_household_prefers_stored_id() {
        let mut u = user(UserStatus::Active, &[("f1", 0), ("f2", 5)]);
        u.current_family_id = Some("f2".into());
        assert_eq!(resolve_current_household(&u), Some(("f2".into(), false)));
    }

    #[test]
    fn test_current_household_falls_back_to_earliest() {
        let mut u = user(UserStatus::Active, &[("f2", 5), ("f3", 1), ("f1", 1)]);
        assert_eq!(resolve_current_household(&u), Some(("f1".into(), true)));

        u.current_family_id = Some("gone".into());
        assert_eq!(resolve_current_household(&u), Some(("f1".into(), true)));

        assert_eq!(resolve_current_household(&user(UserStatus::Active, &[])), None);
    }

    #[test]
    fn test_route_serializes_with_role() {
        let json = serde_json::to_value(Route::NeedsHouseholdSetup(Role::Member)).unwrap();
        assert_eq!(json, serde_json::json!({"route": "needsHouseholdSetup", "role": "member"}));
        let json = serde_json::to_value(Route::Active).unwrap();
        assert_eq!(json, serde_json::json!({"route": "active"}));
    }
}
