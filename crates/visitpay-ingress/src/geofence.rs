//! Great-circle geofencing.
//!
//! A sample passes when it is well-formed, its reported accuracy is no worse
//! than the fence allows, and its haversine distance to the fence center is
//! within the radius. Both bounds are inclusive.

use visitpay_types::constants::EARTH_RADIUS_METERS;
use visitpay_types::{GeoPoint, Geofence, GeofenceOutcome, GeofenceRejection, LocationSample};

/// Haversine distance between two points, in meters.
#[must_use]
pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

/// Evaluate one sample against a fence.
#[must_use]
pub fn evaluate(sample: &LocationSample, fence: &Geofence) -> GeofenceOutcome {
    let point = sample.point();
    if !point.is_valid() || !sample.accuracy.is_finite() || sample.accuracy < 0.0 {
        return GeofenceOutcome {
            passed: false,
            distance_meters: f64::INFINITY,
            rejection: Some(GeofenceRejection::InvalidSample),
        };
    }

    let distance = haversine_meters(point, fence.center);

    // NaN fence parameters fail these comparisons and therefore reject.
    let accuracy_ok = sample.accuracy <= fence.max_accuracy_meters;
    let in_range = distance <= fence.radius_meters;
    let rejection = if !accuracy_ok {
        Some(GeofenceRejection::AccuracyTooLow {
            accuracy: sample.accuracy,
            max_accuracy: fence.max_accuracy_meters,
        })
    } else if !in_range {
        Some(GeofenceRejection::OutOfRange {
            distance,
            radius: fence.radius_meters,
        })
    } else {
        None
    };

    GeofenceOutcome {
        passed: rejection.is_none(),
        distance_meters: distance,
        rejection,
    }
}
