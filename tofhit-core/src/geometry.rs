//! Local-to-global coordinate mapping for counters.

use crate::address::TofAddress;
use serde::{Deserialize, Serialize};

/// Maps counter-local positions to global coordinates.
///
/// `counter` is the counter identity (see [`TofAddress::counter`]); `local`
/// is the position inside the counter with the origin at its centre.
pub trait Geometry: Send + Sync {
    fn to_global(&self, counter: TofAddress, local: [f64; 3]) -> [f64; 3];
}

/// Affine transformation of one counter into the global frame.
///
/// Formula:
/// global = rotation * local + translation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcTransform {
    pub rotation: [[f64; 3]; 3],
    pub translation: [f64; 3],
}

impl Default for RpcTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl RpcTransform {
    /// Create an identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [0.0; 3],
        }
    }

    /// Pure translation.
    pub fn translation(x: f64, y: f64, z: f64) -> Self {
        Self {
            translation: [x, y, z],
            ..Self::identity()
        }
    }

    /// Apply transform to a local position.
    #[inline]
    pub fn apply(&self, local: [f64; 3]) -> [f64; 3] {
        let mut global = self.translation;
        for (g, row) in global.iter_mut().zip(&self.rotation) {
            *g += row[0] * local[0] + row[1] * local[1] + row[2] * local[2];
        }
        global
    }

    /// Check that the transform is finite and invertible.
    pub fn validate(&self) -> Result<(), String> {
        let finite = self
            .rotation
            .iter()
            .flatten()
            .chain(&self.translation)
            .all(|v| v.is_finite());
        if !finite {
            return Err("transform contains non-finite values".to_string());
        }
        let r = &self.rotation;
        let det = r[0][0] * (r[1][1] * r[2][2] - r[1][2] * r[2][1])
            - r[0][1] * (r[1][0] * r[2][2] - r[1][2] * r[2][0])
            + r[0][2] * (r[1][0] * r[2][1] - r[1][1] * r[2][0]);
        if det.abs() < 1e-12 {
            return Err(format!("transform rotation is singular (det={det})"));
        }
        Ok(())
    }
}
