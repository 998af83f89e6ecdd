//! WGS84 (EPSG:4326) to Web Mercator (EPSG:3857) reprojection.

use std::f64::consts::FRAC_PI_4;

/// Semi-major axis of the WGS84 ellipsoid, used as the sphere radius by EPSG:3857.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Latitude beyond which Web Mercator is undefined.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// Projects a longitude/latitude pair (degrees, lon first) into Web Mercator meters.
pub fn to_web_mercator(lng: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    let x = EARTH_RADIUS_M * lng.to_radians();
    let y = EARTH_RADIUS_M * (FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
    (x, y)
}

/// Euclidean distance between two projected points.
pub fn planar_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - b.0).hypot(a.1 - b.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_maps_to_origin() {
        let (x, y) = to_web_mercator(0.0, 0.0);
        assert!(x.abs() < 1e-9);
        assert!(y.abs() < 1e-9);
    }

    #[test]
    fn test_new_york_city_hall() {
        // Reference values from pyproj for (-74.0060, 40.7128)
        let (x, y) = to_web_mercator(-74.0060, 40.7128);
        assert!((x - -8_238_310.24).abs() < 1.0, "x = {x}");
        assert!((y - 4_970_071.58).abs() < 1.0, "y = {y}");
    }

    #[test]
    fn test_polar_latitude_is_clamped() {
        let (_, y) = to_web_mercator(0.0, 90.0);
        assert!(y.is_finite());
        let (_, y_limit) = to_web_mercator(0.0, MAX_MERCATOR_LAT);
        assert_eq!(y, y_limit);
    }

    #[test]
    fn test_planar_distance() {
        assert_eq!(planar_distance((0.0, 0.0), (3.0, 4.0)), 5.0);
    }
}
