//! Pool site directory
//!
//! Locations come from configuration and stand in for the owning service's
//! location table: a key that is not listed here does not exist as far as the
//! weather cache is concerned.

use serde::{Deserialize, Serialize};

use super::Coordinates;

/// A pool site with weather tracking enabled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Unique identifier, also used as the cache key
    pub id: String,
    /// Human-readable name of the site
    pub name: String,
    /// Latitude coordinate
    pub latitude: f64,
    /// Longitude coordinate
    pub longitude: f64,
}

impl Location {
    pub fn new(id: impl Into<String>, name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            latitude,
            longitude,
        }
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

/// Lookup table of known locations
#[derive(Debug, Clone, Default)]
pub struct LocationDirectory {
    locations: Vec<Location>,
}

impl LocationDirectory {
    pub fn new(locations: Vec<Location>) -> Self {
        Self { locations }
    }

    /// Returns all locations in configuration order
    pub fn all(&self) -> &[Location] {
        &self.locations
    }

    /// Finds a location by its id (case sensitive)
    pub fn get(&self, id: &str) -> Option<&Location> {
        self.locations.iter().find(|l| l.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> LocationDirectory {
        LocationDirectory::new(vec![
            Location::new("kits-pool", "Kitsilano Pool", 49.2743, -123.1544),
            Location::new("trout-lake", "Trout Lake Community Pool", 49.2555, -123.0644),
        ])
    }

    #[test]
    fn test_get_returns_matching_location() {
        let dir = directory();
        let location = dir.get("trout-lake").expect("trout-lake should exist");
        assert_eq!(location.name, "Trout Lake Community Pool");
        assert!((location.coordinates().latitude - 49.2555).abs() < 0.0001);
    }

    #[test]
    fn test_get_returns_none_for_unknown_id() {
        let dir = directory();
        assert!(dir.get("missing").is_none());
        assert!(dir.get("").is_none());
        assert!(dir.get("KITS-POOL").is_none()); // Case sensitive
    }

    #[test]
    fn test_all_preserves_order() {
        let dir = directory();
        let ids: Vec<&str> = dir.all().iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["kits-pool", "trout-lake"]);
    }
}
