//! Places and the place search collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

/// A bookable provider returned by search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    pub id: String,
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LatLng>,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid place directory: {0}")]
    Format(#[from] serde_json::Error),

    #[error("search failed: {0}")]
    Other(String),
}

/// Turns a free-text query into candidate providers.
#[async_trait]
pub trait PlaceSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<Place>, SearchError>;
}

/// A fixed directory of providers, returned for every query.
#[derive(Debug, Clone)]
pub struct StaticDirectory {
    places: Vec<Place>,
}

impl StaticDirectory {
    pub fn new(places: Vec<Place>) -> Self {
        Self { places }
    }

    /// Load a JSON array of places.
    pub fn from_file(path: &Path) -> Result<Self, SearchError> {
        let text = std::fs::read_to_string(path)?;
        let places: Vec<Place> = serde_json::from_str(&text)?;
        info!("Loaded {} places from {}", places.len(), path.display());
        Ok(Self::new(places))
    }

    pub fn places(&self) -> &[Place] {
        &self.places
    }
}

impl Default for StaticDirectory {
    fn default() -> Self {
        let place = |id: &str, name: &str, address: &str, phone: &str, rating, count, lat, lng| Place {
            id: id.to_string(),
            name: name.to_string(),
            address: address.to_string(),
            phone_number: Some(phone.to_string()),
            rating: Some(rating),
            rating_count: Some(count),
            location: Some(LatLng { lat, lng }),
        };
        Self::new(vec![
            place("1", "Chennai Classic Saloon", "12, Anna Salai, Chennai", "+91 98765 43210", 4.5, 120, 13.0827, 80.2707),
            place("2", "Velachery Spa & Saloon", "45, Bypass Rd, Velachery", "044 2244 6688", 4.2, 85, 12.9815, 80.2180),
            place("3", "Style Cuts", "8, T Nagar, Chennai", "+91 91234 56789", 4.8, 340, 13.0418, 80.2341),
            place("4", "Green Trends", "Mylapore, Chennai", "044 2468 1357", 4.3, 210, 13.0368, 80.2676),
            place("5", "Naturals", "Adyar, Chennai", "+91 99887 76655", 4.6, 190, 13.0012, 80.2565),
        ])
    }
}

#[async_trait]
impl PlaceSearch for StaticDirectory {
    async fn search(&self, query: &str) -> Result<Vec<Place>, SearchError> {
        info!("Directory search for {:?} -> {} places", query, self.places.len());
        Ok(self.places.clone())
    }
}
