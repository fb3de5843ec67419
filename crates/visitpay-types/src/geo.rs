//! Location model: points, fences, samples, and evaluation outcomes.

use serde::{Deserialize, Serialize};

/// A WGS-84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    #[must_use]
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Finite and inside the valid latitude/longitude ranges.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Circular proximity policy attached to a place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub center: GeoPoint,
    pub radius_meters: f64,
    /// Samples reporting a worse (larger) accuracy than this are rejected.
    pub max_accuracy_meters: f64,
}

/// A location fix reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub lat: f64,
    pub lng: f64,
    /// Reported horizontal accuracy radius in meters.
    pub accuracy: f64,
}

impl LocationSample {
    #[must_use]
    pub fn new(lat: f64, lng: f64, accuracy: f64) -> Self {
        Self { lat, lng, accuracy }
    }

    #[must_use]
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

/// Why a location sample failed the fence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GeofenceRejection {
    /// Non-finite or out-of-range coordinates, or a negative accuracy.
    InvalidSample,
    /// Reported accuracy is worse than the fence allows.
    AccuracyTooLow { accuracy: f64, max_accuracy: f64 },
    /// The sample lies outside the fence radius.
    OutOfRange { distance: f64, radius: f64 },
}

/// Result of evaluating a sample against a fence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeofenceOutcome {
    pub passed: bool,
    /// Great-circle distance to the fence center. `f64::INFINITY` when the
    /// sample itself is invalid.
    pub distance_meters: f64,
    /// Set whenever `passed` is false.
    pub rejection: Option<GeofenceRejection>,
}
