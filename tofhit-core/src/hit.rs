//! Reconstructed hits and their digi match records.

use crate::address::TofAddress;
use serde::{Deserialize, Serialize};

/// Default position uncertainty assigned to every hit coordinate (cm).
pub const DEFAULT_POSITION_ERROR: f64 = 0.5;

/// Reconstructed TOF hit (a cluster of strip hits).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TofHit {
    /// Address of the representative channel (side 0).
    pub address: TofAddress,
    /// Global position (cm).
    pub position: [f64; 3],
    /// Position uncertainty (cm).
    pub position_error: [f64; 3],
    /// Tot-weighted mean time (ns).
    pub time: f64,
    /// Accumulated Tot of all contributing digis.
    pub tot: f64,
    /// Number of contributing digis.
    pub n_digis: usize,
    /// Index of this hit in the output of its processing unit.
    pub index: usize,
}

impl TofHit {
    /// Global x coordinate.
    #[inline]
    pub fn x(&self) -> f64 {
        self.position[0]
    }

    /// Global y coordinate.
    #[inline]
    pub fn y(&self) -> f64 {
        self.position[1]
    }

    /// Global z coordinate.
    #[inline]
    pub fn z(&self) -> f64 {
        self.position[2]
    }
}

/// Link from a hit to one contributing calibrated digi.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DigiLink {
    /// Tot of the digi, used as its weight in the hit.
    pub weight: f64,
    /// Index into the calibrated digis of the processing unit.
    pub digi: usize,
}

/// All digis that contributed to one hit.
///
/// Match records are kept index aligned with the hit collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DigiMatch {
    pub links: Vec<DigiLink>,
}

impl DigiMatch {
    /// Creates an empty match.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a link.
    #[inline]
    pub fn add_link(&mut self, weight: f64, digi: usize) {
        self.links.push(DigiLink { weight, digi });
    }

    /// Moves all links of `other` into this match.
    pub fn absorb(&mut self, other: DigiMatch) {
        self.links.extend(other.links);
    }

    /// Sum of all link weights.
    pub fn total_weight(&self) -> f64 {
        self.links.iter().map(|l| l.weight).sum()
    }

    /// Number of linked digis.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Returns true if no digi is linked.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
