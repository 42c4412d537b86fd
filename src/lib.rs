// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Family-Hub: household session core
//!
//! This crate keeps a signed-in user's households, memberships and shared
//! member locations consistent with a document store, and exposes the
//! resulting session state to a UI shell over a small local HTTP bridge.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod session;
pub mod time_utils;

use config::Config;
use session::Session;

/// Shared application state.
pub struct AppState<S, A> {
    pub config: Config,
    pub session: Session<S, A>,
}
