// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - identity, membership and location logic.

pub mod identity;
pub mod location;
pub mod membership;

pub use identity::{AuthState, FederatedCredential, FirebaseAuth, IdentityProvider, MemoryIdentity, Principal};
pub use location::{LocationCoordinator, MemberLocations, ThrottleConfig, WriteThrottle};
pub use membership::{generate_join_code, MembershipRepository, ReconcileReport};
