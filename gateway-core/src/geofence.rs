//! Geofence containment: point-in-polygon and circle-distance tests.
//!
//! Grounded on `mayara-core/src/guard_zones/zone.rs`'s `ZoneShape`
//! containment dispatch (there: Arc/Ring; here: Polygon/Circle). Pure and
//! side-effect free so the Position Updater can call it without touching
//! any I/O.

use crate::model::GeofenceShape;

/// Mean earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Parses the relational store's non-standard `area` column text into a
/// shape. The store writes `POLYGON ((lat lon, lat lon, ...))` and
/// `CIRCLE (lat lon, radius_m)` with lat-first ordering — the opposite of
/// standard WKT's `(x y)` = `(lon, lat)` — so this reads each pair
/// positionally rather than handing the text to a WKT-aware parser that
/// would assume the first number is longitude.
pub fn parse_area(text: &str) -> Option<GeofenceShape> {
    let text = text.trim();
    if let Some(body) = strip_wrapper(text, "POLYGON") {
        let body = body.trim().trim_start_matches('(').trim_end_matches(')');
        let vertices: Vec<(f64, f64)> = body
            .split(',')
            .filter_map(|pair| {
                let mut nums = pair.split_whitespace();
                let lat: f64 = nums.next()?.parse().ok()?;
                let lon: f64 = nums.next()?.parse().ok()?;
                Some((lat, lon))
            })
            .collect();
        if vertices.len() < 3 {
            return None;
        }
        return Some(GeofenceShape::Polygon { vertices, closed: true });
    }
    if let Some(body) = strip_wrapper(text, "CIRCLE") {
        let body = body.trim().trim_start_matches('(').trim_end_matches(')');
        let mut parts = body.splitn(2, ',');
        let mut center = parts.next()?.split_whitespace();
        let lat: f64 = center.next()?.parse().ok()?;
        let lon: f64 = center.next()?.parse().ok()?;
        let radius_m: f64 = parts.next()?.trim().parse().ok()?;
        if radius_m <= 0.0 {
            return None;
        }
        return Some(GeofenceShape::Circle { center: (lat, lon), radius_m });
    }
    None
}

fn strip_wrapper<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(keyword)?;
    if rest.trim_start().starts_with('(') {
        Some(rest)
    } else {
        None
    }
}

impl GeofenceShape {
    /// `true` if `(lat, lon)` lies inside this shape.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        match self {
            GeofenceShape::Polygon { vertices, .. } => point_in_polygon(lat, lon, vertices),
            GeofenceShape::Circle { center, radius_m } => {
                haversine_distance_m(lat, lon, center.0, center.1) <= *radius_m
            }
        }
    }

    /// Cheap axis-aligned bounding box for early rejection before the full
    /// polygon walk.
    pub fn bounding_box(&self) -> Option<(f64, f64, f64, f64)> {
        match self {
            GeofenceShape::Polygon { vertices, .. } => {
                if vertices.is_empty() {
                    return None;
                }
                let mut min_lat = f64::INFINITY;
                let mut max_lat = f64::NEG_INFINITY;
                let mut min_lon = f64::INFINITY;
                let mut max_lon = f64::NEG_INFINITY;
                for (lat, lon) in vertices {
                    min_lat = min_lat.min(*lat);
                    max_lat = max_lat.max(*lat);
                    min_lon = min_lon.min(*lon);
                    max_lon = max_lon.max(*lon);
                }
                Some((min_lat, max_lat, min_lon, max_lon))
            }
            GeofenceShape::Circle { center, radius_m } => {
                // One degree of latitude is ~111,320 m; good enough for a
                // conservative rejection box.
                let delta_lat = radius_m / 111_320.0;
                let delta_lon = delta_lat / center.0.to_radians().cos().max(1e-6);
                Some((
                    center.0 - delta_lat,
                    center.0 + delta_lat,
                    center.1 - delta_lon,
                    center.1 + delta_lon,
                ))
            }
        }
    }
}

/// Ray-casting point-in-polygon test (Shapely-equivalent algorithm).
/// Vertices are `(lat, lon)` pairs; treated as implicitly closed.
fn point_in_polygon(lat: f64, lon: f64, vertices: &[(f64, f64)]) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let mut inside = false;
    let n = vertices.len();
    let mut j = n - 1;
    for i in 0..n {
        let (lat_i, lon_i) = vertices[i];
        let (lat_j, lon_j) = vertices[j];
        let intersects = ((lon_i > lon) != (lon_j > lon))
            && (lat < (lat_j - lat_i) * (lon - lon_i) / (lon_j - lon_i) + lat_i);
        if intersects {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Great-circle distance between two `(lat, lon)` points, in meters.
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_phi = (lat2 - lat1).to_radians();
    let delta_lambda = (lon2 - lon1).to_radians();

    let a = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circle_contains_center() {
        let shape = GeofenceShape::Circle {
            center: (-12.04, -77.03),
            radius_m: 500.0,
        };
        assert!(shape.contains(-12.04, -77.03));
    }

    #[test]
    fn circle_excludes_far_point() {
        let shape = GeofenceShape::Circle {
            center: (-12.04, -77.03),
            radius_m: 500.0,
        };
        assert!(!shape.contains(-12.10, -77.10));
    }

    #[test]
    fn scenario_1_geofence_enter() {
        // Device moves from (-12.05,-77.03), outside, to (-12.04,-77.03), inside.
        let shape = GeofenceShape::Circle {
            center: (-12.04, -77.03),
            radius_m: 500.0,
        };
        assert!(!shape.contains(-12.05, -77.03));
        assert!(shape.contains(-12.04, -77.03));
    }

    #[test]
    fn square_polygon_containment() {
        let shape = GeofenceShape::Polygon {
            vertices: vec![(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0)],
            closed: true,
        };
        assert!(shape.contains(0.5, 0.5));
        assert!(!shape.contains(2.0, 2.0));
    }

    #[test]
    fn parse_area_reads_polygon_lat_first() {
        let shape = parse_area("POLYGON ((0.0 0.0, 0.0 1.0, 1.0 1.0, 1.0 0.0))").unwrap();
        match shape {
            GeofenceShape::Polygon { vertices, .. } => {
                assert_eq!(vertices[1], (0.0, 1.0));
            }
            _ => panic!("expected polygon"),
        }
    }

    #[test]
    fn parse_area_reads_circle_lat_first() {
        let shape = parse_area("CIRCLE (-12.04 -77.03, 500)").unwrap();
        match shape {
            GeofenceShape::Circle { center, radius_m } => {
                assert_eq!(center, (-12.04, -77.03));
                assert_eq!(radius_m, 500.0);
            }
            _ => panic!("expected circle"),
        }
    }

    #[test]
    fn parse_area_rejects_garbage() {
        assert!(parse_area("not a shape").is_none());
        assert!(parse_area("POLYGON ((0.0 0.0, 1.0 1.0))").is_none());
    }

    #[test]
    fn haversine_known_distance() {
        // Roughly 1 degree of latitude ~ 111.2 km.
        let d = haversine_distance_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 1000.0);
    }

    #[test]
    fn enter_exit_parity_over_trajectory() {
        let shape = GeofenceShape::Circle {
            center: (0.0, 0.0),
            radius_m: 1000.0,
        };
        let trajectory = [(0.1, 0.1), (0.0, 0.0), (0.1, 0.1), (0.0, 0.0)];
        let mut prev_inside = shape.contains(1.0, 1.0); // start far outside
        let mut enters = 0;
        let mut exits = 0;
        for (lat, lon) in trajectory {
            let inside = shape.contains(lat, lon);
            if !prev_inside && inside {
                enters += 1;
            } else if prev_inside && !inside {
                exits += 1;
            }
            prev_inside = inside;
        }
        assert!((enters as i64 - exits as i64).abs() <= 1);
    }
}
