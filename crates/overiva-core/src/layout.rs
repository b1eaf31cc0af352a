//! Source and microphone placement helpers
//!
//! All positions are in metres in the room frame, one `[x, y, z]` per point.

use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A point in the room.
pub type Point = [f64; 3];

/// `n` points on a horizontal arc of `angle` radians and radius `distance`
/// around `center`, starting at `rot` and including both ends.
///
/// A single point sits in the middle of the arc.
pub fn semi_circle_layout(center: Point, angle: f64, distance: f64, n: usize, rot: f64) -> Vec<Point> {
    let angles: Vec<f64> = match n {
        0 => Vec::new(),
        1 => vec![rot + angle / 2.0],
        _ => (0..n)
            .map(|i| rot + angle * i as f64 / (n - 1) as f64)
            .collect(),
    };
    angles
        .into_iter()
        .map(|theta| {
            [
                center[0] + distance * theta.cos(),
                center[1] + distance * theta.sin(),
                center[2],
            ]
        })
        .collect()
}

/// `n` points drawn uniformly in the box `[0, dims)` shifted by `offset`.
///
/// The same seed always yields the same layout.
pub fn random_layout(dims: Point, n: usize, offset: Point, seed: u64) -> Vec<Point> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let mut p = [0.0; 3];
            for k in 0..3 {
                p[k] = offset[k] + dims[k] * rng.gen::<f64>();
            }
            p
        })
        .collect()
}

/// `n` points on a regular grid filling the `width × depth` rectangle at
/// `offset`, each at the centre of its cell, height `offset[2]`.
pub fn grid_layout(size: [f64; 2], n: usize, offset: Point) -> Vec<Point> {
    if n == 0 {
        return Vec::new();
    }
    let cols = (n as f64).sqrt().ceil() as usize;
    let rows = n.div_ceil(cols);
    let dx = size[0] / cols as f64;
    let dy = size[1] / rows as f64;
    (0..n)
        .map(|i| {
            let (r, c) = (i / cols, i % cols);
            [
                offset[0] + dx * (c as f64 + 0.5),
                offset[1] + dy * (r as f64 + 0.5),
                offset[2],
            ]
        })
        .collect()
}

/// Uniform circular array of `m` elements in the plane, first element at `phi0`.
pub fn circular_2d_array(center: [f64; 2], m: usize, phi0: f64, radius: f64) -> Vec<[f64; 2]> {
    (0..m)
        .map(|i| {
            let phi = phi0 + 2.0 * PI * i as f64 / m as f64;
            [center[0] + radius * phi.cos(), center[1] + radius * phi.sin()]
        })
        .collect()
}

/// Lift planar points to height `z`.
pub fn at_height(points: &[[f64; 2]], z: f64) -> Vec<Point> {
    points.iter().map(|p| [p[0], p[1], z]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn dist(a: &Point, b: &Point) -> f64 {
        ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
    }

    #[test]
    fn test_semi_circle_endpoints_and_radius() {
        let c = [4.1, 3.755, 1.2];
        let pts = semi_circle_layout(c, PI / 1.5, 2.0, 3, 0.743 * PI);
        assert_eq!(pts.len(), 3);
        for p in &pts {
            assert_relative_eq!(dist(p, &c), 2.0, epsilon = 1e-12);
            assert_relative_eq!(p[2], 1.2);
        }
        let first = (pts[0][1] - c[1]).atan2(pts[0][0] - c[0]);
        let last = (pts[2][1] - c[1]).atan2(pts[2][0] - c[0]);
        assert_relative_eq!(first, 0.743 * PI, epsilon = 1e-12);
        let span = (last - first).rem_euclid(2.0 * PI);
        assert_relative_eq!(span, PI / 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_semi_circle_single_point_centered() {
        let pts = semi_circle_layout([0.0, 0.0, 0.0], PI, 1.0, 1, 0.0);
        assert_relative_eq!(pts[0][0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(pts[0][1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_random_layout_seeded_and_bounded() {
        let a = random_layout([3.0, 5.5, 1.5], 11, [6.5, 1.0, 0.5], 1);
        let b = random_layout([3.0, 5.5, 1.5], 11, [6.5, 1.0, 0.5], 1);
        assert_eq!(a, b);
        for p in &a {
            assert!(p[0] >= 6.5 && p[0] < 9.5);
            assert!(p[1] >= 1.0 && p[1] < 6.5);
            assert!(p[2] >= 0.5 && p[2] < 2.0);
        }
        assert_ne!(a, random_layout([3.0, 5.5, 1.5], 11, [6.5, 1.0, 0.5], 2));
    }

    #[test]
    fn test_grid_layout_cells() {
        let pts = grid_layout([3.0, 5.5], 5, [6.5, 1.0, 1.7]);
        assert_eq!(pts.len(), 5);
        // 3 columns, 2 rows
        assert_relative_eq!(pts[0][0], 7.0);
        assert_relative_eq!(pts[3][1], 1.0 + 5.5 * 0.75);
        assert!(pts.iter().all(|p| p[2] == 1.7));
    }

    #[test]
    fn test_circular_array() {
        let pts = circular_2d_array([4.1, 3.76], 4, PI / 2.0, 0.02);
        assert_relative_eq!(pts[0][0], 4.1, epsilon = 1e-12);
        assert_relative_eq!(pts[0][1], 3.78, epsilon = 1e-12);
        assert_relative_eq!(pts[2][1], 3.74, epsilon = 1e-12);
        let lifted = at_height(&pts, 1.2);
        assert_eq!(lifted[1][2], 1.2);
    }
}
