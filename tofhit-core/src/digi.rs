//! Digis: single-side timing and charge measurements.

use crate::address::TofAddress;
use serde::{Deserialize, Serialize};

/// One measurement on one readout side of one channel.
///
/// Digis are never modified in place; calibration produces new values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Digi {
    /// Readout address.
    pub address: TofAddress,
    /// Time in nanoseconds.
    pub time: f64,
    /// Time over threshold (charge proxy, arbitrary units).
    pub tot: f64,
}

impl Digi {
    /// Creates a new digi.
    #[inline]
    pub fn new(address: TofAddress, time: f64, tot: f64) -> Self {
        Self { address, time, tot }
    }

    /// Readout side (0 or 1).
    #[inline]
    pub fn side(&self) -> u8 {
        self.address.side
    }

    /// Copy of this digi on the opposite side of the same channel.
    #[inline]
    #[must_use]
    pub fn mirrored(&self) -> Self {
        Self {
            address: self.address.mirrored(),
            ..*self
        }
    }

    /// Whether time and Tot are finite numbers.
    #[inline]
    pub fn is_finite(&self) -> bool {
        self.time.is_finite() && self.tot.is_finite()
    }
}

/// Digis of one processing unit (one event or one time slice).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingUnit {
    /// Unit identifier (event number or slice index).
    pub id: u64,
    /// Raw digis in arrival order.
    pub digis: Vec<Digi>,
}

impl ProcessingUnit {
    /// Creates an empty unit.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            digis: Vec::new(),
        }
    }

    /// Number of digis in the unit.
    pub fn len(&self) -> usize {
        self.digis.len()
    }

    /// Returns true if the unit carries no digis.
    pub fn is_empty(&self) -> bool {
        self.digis.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirrored_keeps_measurement() {
        let digi = Digi::new(TofAddress::new(5, 0, 0, 0, 0).unwrap(), 12.5, 3.0);
        let twin = digi.mirrored();
        assert_eq!(twin.side(), 1);
        assert_eq!(twin.address.channel_address(), digi.address);
        assert!((twin.time - digi.time).abs() < f64::EPSILON);
        assert!((twin.tot - digi.tot).abs() < f64::EPSILON);
    }

    #[test]
    fn test_finite_check() {
        let addr = TofAddress::default();
        assert!(Digi::new(addr, 1.0, 1.0).is_finite());
        assert!(!Digi::new(addr, f64::NAN, 1.0).is_finite());
        assert!(!Digi::new(addr, 1.0, f64::INFINITY).is_finite());
    }

    #[test]
    fn test_unit_len() {
        let mut unit = ProcessingUnit::new(7);
        assert!(unit.is_empty());
        unit.digis.push(Digi::new(TofAddress::default(), 0.0, 1.0));
        assert_eq!(unit.len(), 1);
        assert_eq!(unit.id, 7);
    }
}
