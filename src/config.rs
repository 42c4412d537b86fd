// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.

use crate::services::ThrottleConfig;
use chrono::Duration;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// GCP project ID; without one the in-memory store is used
    pub gcp_project_id: Option<String>,
    /// Firebase Web API key; without one the in-memory identity provider is used
    pub firebase_api_key: Option<String>,
    /// Auth emulator base URL, e.g. `http://localhost:9099`
    pub identity_base_url: Option<String>,
    /// Persisted refresh token used to restore the last session
    pub refresh_token: Option<String>,
    /// File the refresh token is kept in between runs
    pub token_file: Option<PathBuf>,
    /// Presentation bridge port
    pub port: u16,
    pub throttle: ThrottleConfig,
}

impl Default for Config {
    /// Default config for testing only.
    fn default() -> Self {
        Self {
            gcp_project_id: None,
            firebase_api_key: None,
            identity_base_url: None,
            refresh_token: None,
            token_file: None,
            port: 8080,
            throttle: ThrottleConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let gcp_project_id = non_empty_var("GCP_PROJECT_ID");
        let firebase_api_key = non_empty_var("FIREBASE_API_KEY");
        if gcp_project_id.is_some() && firebase_api_key.is_none() {
            return Err(ConfigError::Missing("FIREBASE_API_KEY"));
        }

        let defaults = ThrottleConfig::default();
        let throttle = ThrottleConfig {
            min_distance_meters: parse_var(
                "LOCATION_MIN_DISTANCE_METERS",
                defaults.min_distance_meters,
            )?,
            min_interval: Duration::seconds(parse_var(
                "LOCATION_MIN_INTERVAL_SECS",
                defaults.min_interval.num_seconds(),
            )?),
            hard_min_interval: Duration::seconds(parse_var(
                "LOCATION_HARD_MIN_INTERVAL_SECS",
                defaults.hard_min_interval.num_seconds(),
            )?),
        };

        Ok(Self {
            gcp_project_id,
            firebase_api_key,
            identity_base_url: non_empty_var("IDENTITY_BASE_URL"),
            refresh_token: non_empty_var("FIREBASE_REFRESH_TOKEN"),
            token_file: non_empty_var("FIREBASE_TOKEN_FILE").map(PathBuf::from),
            port: parse_var("PORT", 8080)?,
            throttle,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse `name` if set, falling back to `default`.
fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match non_empty_var(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_env() {
        env::set_var("PORT", "9090");
        env::set_var("LOCATION_MIN_DISTANCE_METERS", "500");

        let config = Config::from_env().expect("Config should load");

        assert_eq!(config.port, 9090);
        assert_eq!(config.throttle.min_distance_meters, 500.0);
        assert_eq!(config.throttle.hard_min_interval, Duration::seconds(20));
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        env::set_var("FAMILY_HUB_TEST_NUMBER", "ten");
        let err = parse_var::<u64>("FAMILY_HUB_TEST_NUMBER", 1).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "FAMILY_HUB_TEST_NUMBER", .. }));
        assert_eq!(parse_var::<u64>("FAMILY_HUB_TEST_UNSET", 7).unwrap(), 7);
    }
}
