//! A spot: a point detection at one timepoint, with an ellipsoid extent.

use serde::{Deserialize, Serialize};

/// Point-like tracked object at a single timepoint.
///
/// The covariance matrix describes the detection ellipsoid in physical
/// (calibrated) coordinates; its eigenvalues are squared semi-axis radii.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    pub timepoint: u32,
    pub position: [f64; 3],
    pub covariance: [[f64; 3]; 3],
}

impl Spot {
    /// Smallest eigenvalue of the covariance matrix — the squared radius
    /// along the ellipsoid's shortest axis. Drives the Gaussian kernel
    /// sigma for intensity sampling.
    pub fn min_variance(&self) -> f64 {
        min_eigenvalue_sym3(&self.covariance)
    }
}

/// Spherical covariance with the given radius.
pub fn unit_covariance(radius: f64) -> [[f64; 3]; 3] {
    let r2 = radius * radius;
    [[r2, 0.0, 0.0], [0.0, r2, 0.0], [0.0, 0.0, r2]]
}

/// Smallest eigenvalue of a symmetric 3x3 matrix, by the trigonometric
/// closed form (Smith 1961). Falls back to the diagonal for matrices that
/// are numerically diagonal already.
pub fn min_eigenvalue_sym3(m: &[[f64; 3]; 3]) -> f64 {
    let p1 = m[0][1] * m[0][1] + m[0][2] * m[0][2] + m[1][2] * m[1][2];
    if p1 < 1e-24 {
        return m[0][0].min(m[1][1]).min(m[2][2]);
    }

    let q = (m[0][0] + m[1][1] + m[2][2]) / 3.0;
    let p2 = (m[0][0] - q).powi(2) + (m[1][1] - q).powi(2) + (m[2][2] - q).powi(2) + 2.0 * p1;
    let p = (p2 / 6.0).sqrt();

    // B = (1/p) * (M - q*I); r = det(B) / 2, clamped into [-1, 1].
    let b = |i: usize, j: usize| {
        let d = if i == j { q } else { 0.0 };
        (m[i][j] - d) / p
    };
    let det_b = b(0, 0) * (b(1, 1) * b(2, 2) - b(1, 2) * b(2, 1))
        - b(0, 1) * (b(1, 0) * b(2, 2) - b(1, 2) * b(2, 0))
        + b(0, 2) * (b(1, 0) * b(2, 1) - b(1, 1) * b(2, 0));
    let r = (det_b / 2.0).clamp(-1.0, 1.0);

    let phi = r.acos() / 3.0;
    // Eigenvalues are q + 2p cos(phi + 2k*pi/3); with phi in [0, pi/3]
    // the smallest is the k = 1 branch.
    q + 2.0 * p * (phi + 2.0 * std::f64::consts::FRAC_PI_3).cos()
}
