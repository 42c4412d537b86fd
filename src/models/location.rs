// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use chrono::{DateTime, Utc};
use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn to_point(self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }

    /// Great-circle distance in meters.
    pub fn distance_meters(self, other: Coordinate) -> f64 {
        Haversine.distance(self.to_point(), other.to_point())
    }
}

/// A member's last shared position in one household, stored at
/// `families/{id}/memberLocations/{uid}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "camelCase")]
pub struct MemberLocation {
    pub uid: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(rename = "photoURL", default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    pub is_sharing: bool,
    pub coord: Coordinate,
    /// Set by the store on write; absent only before the first commit.
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Marker identity: display name and photo changes do not count.
impl PartialEq for MemberLocation {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
            && self.is_sharing == other.is_sharing
            && self.coord == other.coord
            && self.last_updated == other.last_updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(name: &str) -> MemberLocation {
        MemberLocation {
            uid: "u1".into(),
            display_name: name.into(),
            photo_url: None,
            is_sharing: true,
            coord: Coordinate::new(37.3861, -122.0839),
            last_updated: None,
        }
    }

    #[test]
    fn test_equality_ignores_display_fields() {
        let mut other = location("Other");
        other.photo_url = Some("https://example.com/p.png".into());
        assert_eq!(location("Toby"), other);

        other.is_sharing = false;
        assert_ne!(location("Toby"), other);
    }

    #[test]
    fn test_distance_meters() {
        // Roughly 1.1 km per 0.01 degree of latitude.
        let a = Coordinate::new(37.0, -122.0);
        let b = Coordinate::new(37.01, -122.0);
        let d = a.distance_meters(b);
        assert!((1100.0..1120.0).contains(&d), "distance {}", d);
    }

    #[test]
    fn test_decodes_store_field_names() {
        let loc: MemberLocation = serde_json::from_value(serde_json::json!({
            "uid": "u1",
            "displayName": "Toby",
            "photoURL": "https://example.com/p.png",
            "isSharing": true,
            "coord": {"lat": 1.0, "lon": 2.0},
            "lastUpdated": "2025-08-10T12:00:00.000000Z",
        }))
        .unwrap();
        assert_eq!(loc.photo_url.as_deref(), Some("https://example.com/p.png"));
        assert!(loc.last_updated.is_some());
    }
}
