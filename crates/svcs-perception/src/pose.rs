//! Pose Transform.
//!
//! Converts a device orientation sample (alpha / beta / gamma, degrees) into
//! the homogeneous 4×4 pose matrix consumed by the external 3-D
//! back-projector.
//!
//! The rotation is composed as
//!
//! ```text
//! R = Rz(alpha) · Rx(beta) · Ry(gamma)
//! ```
//!
//! and embedded as the upper-left 3×3 block of a matrix with zero
//! translation.  This ordering mirrors the browser `DeviceOrientation` axes
//! but is **not** derived from a calibrated IMU model; treat the result as an
//! approximation of the device attitude, not ground truth.
//!
//! # Example
//!
//! ```rust
//! use svcs_perception::pose::pose_matrix;
//! use svcs_types::Orientation;
//!
//! let pose = pose_matrix(Orientation::default());
//! assert_eq!(pose.as_pose_string(), "1,0,0,0,0,1,0,0,0,0,1,0,0,0,0,1");
//! ```

use svcs_types::Orientation;

type Mat3 = [[f64; 3]; 3];

// ────────────────────────────────────────────────────────────────────────────
// PoseMatrix
// ────────────────────────────────────────────────────────────────────────────

/// A 4×4 homogeneous pose matrix flattened row-major into 16 values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseMatrix(pub [f64; 16]);

impl PoseMatrix {
    /// The identity pose (no rotation, no translation).
    pub fn identity() -> Self {
        let mut m = [0.0; 16];
        for i in 0..4 {
            m[i * 4 + i] = 1.0;
        }
        Self(m)
    }

    /// Element at `row`, `col` (both `0..4`).
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.0[row * 4 + col]
    }

    /// The 16 values in row-major order.
    pub fn values(&self) -> &[f64; 16] {
        &self.0
    }

    /// Comma-separated rendering used on the detector wire.
    pub fn as_pose_string(&self) -> String {
        self.0
            .iter()
            // Adding 0.0 folds -0.0 into 0.0 so the text stays stable.
            .map(|v| format!("{}", v + 0.0))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn from_rotation(r: Mat3) -> Self {
        let mut m = Self::identity();
        for (row, values) in r.iter().enumerate() {
            for (col, v) in values.iter().enumerate() {
                m.0[row * 4 + col] = *v;
            }
        }
        m
    }
}

impl Default for PoseMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Public API
// ────────────────────────────────────────────────────────────────────────────

/// Build the pose matrix for `orientation`.
///
/// Never fails for finite input.
pub fn pose_matrix(orientation: Orientation) -> PoseMatrix {
    let rz = rot_z(orientation.alpha.to_radians());
    let rx = rot_x(orientation.beta.to_radians());
    let ry = rot_y(orientation.gamma.to_radians());
    PoseMatrix::from_rotation(mul3(&mul3(&rz, &rx), &ry))
}

// ────────────────────────────────────────────────────────────────────────────
// Elemental rotations
// ────────────────────────────────────────────────────────────────────────────

fn rot_z(a: f64) -> Mat3 {
    let (s, c) = a.sin_cos();
    [[c, -s, 0.0], [s, c, 0.0], [0.0, 0.0, 1.0]]
}

fn rot_x(a: f64) -> Mat3 {
    let (s, c) = a.sin_cos();
    [[1.0, 0.0, 0.0], [0.0, c, -s], [0.0, s, c]]
}

fn rot_y(a: f64) -> Mat3 {
    let (s, c) = a.sin_cos();
    [[c, 0.0, s], [0.0, 1.0, 0.0], [-s, 0.0, c]]
}

fn mul3(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
