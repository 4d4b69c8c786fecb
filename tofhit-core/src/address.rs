//! TOF detector addresses.
//!
//! An address identifies one readout side of one channel:
//! station type (`sm_type`), module (`sm`), RPC, channel and side.
//! It packs into a 32 bit word:
//!
//! | field   | bits    |
//! |---------|---------|
//! | system  | 0..=3   |
//! | sm      | 4..=10  |
//! | sm_type | 11..=14 |
//! | rpc     | 15..=20 |
//! | side    | 21      |
//! | channel | 22..=27 |
//! | rpc type| 28..=31 |

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// System id stored in the lowest bits of every packed TOF address.
pub const TOF_SYSTEM_ID: u32 = 6;

const SYSTEM_BITS: u32 = 4;
const SM_BITS: u32 = 7;
const SM_TYPE_BITS: u32 = 4;
const RPC_BITS: u32 = 6;
const SIDE_BITS: u32 = 1;
const CHANNEL_BITS: u32 = 6;

const SM_SHIFT: u32 = SYSTEM_BITS;
const SM_TYPE_SHIFT: u32 = SM_SHIFT + SM_BITS;
const RPC_SHIFT: u32 = SM_TYPE_SHIFT + SM_TYPE_BITS;
const SIDE_SHIFT: u32 = RPC_SHIFT + RPC_BITS;
const CHANNEL_SHIFT: u32 = SIDE_SHIFT + SIDE_BITS;

const fn mask(bits: u32) -> u32 {
    (1 << bits) - 1
}

/// Largest module index representable in an address.
pub const MAX_SM: u8 = mask(SM_BITS) as u8;
/// Largest station type representable in an address.
pub const MAX_SM_TYPE: u8 = mask(SM_TYPE_BITS) as u8;
/// Largest RPC index representable in an address.
pub const MAX_RPC: u8 = mask(RPC_BITS) as u8;
/// Largest channel index representable in an address.
pub const MAX_CHANNEL: u8 = mask(CHANNEL_BITS) as u8;

/// Unpacked TOF address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TofAddress {
    pub sm_type: u8,
    pub sm: u8,
    pub rpc: u8,
    pub channel: u8,
    pub side: u8,
}

impl TofAddress {
    /// Create an address, checking every field against its bit width.
    pub fn new(sm_type: u8, sm: u8, rpc: u8, channel: u8, side: u8) -> Result<Self> {
        check("sm_type", sm_type, MAX_SM_TYPE)?;
        check("sm", sm, MAX_SM)?;
        check("rpc", rpc, MAX_RPC)?;
        check("channel", channel, MAX_CHANNEL)?;
        check("side", side, 1)?;
        Ok(Self {
            sm_type,
            sm,
            rpc,
            channel,
            side,
        })
    }

    /// Pack into the 32 bit detector word.
    #[must_use]
    pub fn pack(&self) -> u32 {
        TOF_SYSTEM_ID
            | (u32::from(self.sm) & mask(SM_BITS)) << SM_SHIFT
            | (u32::from(self.sm_type) & mask(SM_TYPE_BITS)) << SM_TYPE_SHIFT
            | (u32::from(self.rpc) & mask(RPC_BITS)) << RPC_SHIFT
            | (u32::from(self.side) & mask(SIDE_BITS)) << SIDE_SHIFT
            | (u32::from(self.channel) & mask(CHANNEL_BITS)) << CHANNEL_SHIFT
    }

    /// Decode a packed detector word.
    #[allow(clippy::cast_possible_truncation)]
    pub fn unpack(word: u32) -> Result<Self> {
        if word & mask(SYSTEM_BITS) != TOF_SYSTEM_ID {
            return Err(Error::ForeignAddress(word));
        }
        let field = |shift: u32, bits: u32| ((word >> shift) & mask(bits)) as u8;
        Ok(Self {
            sm_type: field(SM_TYPE_SHIFT, SM_TYPE_BITS),
            sm: field(SM_SHIFT, SM_BITS),
            rpc: field(RPC_SHIFT, RPC_BITS),
            channel: field(CHANNEL_SHIFT, CHANNEL_BITS),
            side: field(SIDE_SHIFT, SIDE_BITS),
        })
    }

    /// Same channel, given side.
    #[inline]
    #[must_use]
    pub fn with_side(self, side: u8) -> Self {
        Self { side, ..self }
    }

    /// Same channel, opposite side.
    #[inline]
    #[must_use]
    pub fn mirrored(self) -> Self {
        self.with_side(1 - (self.side & 1))
    }

    /// Channel address as used for hits: side forced to 0.
    #[inline]
    #[must_use]
    pub fn channel_address(self) -> Self {
        self.with_side(0)
    }

    /// Identity of the counter (one RPC of one module): channel and side zeroed.
    #[inline]
    #[must_use]
    pub fn counter(self) -> Self {
        Self {
            channel: 0,
            side: 0,
            ..self
        }
    }
}

impl fmt::Display for TofAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.sm_type, self.sm, self.rpc, self.channel, self.side
        )
    }
}

fn check(field: &'static str, value: u8, max: u8) -> Result<()> {
    if value > max {
        return Err(Error::InvalidAddress {
            field,
            value: u32::from(value),
            max: u32::from(max),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout() {
        let addr = TofAddress::new(5, 3, 2, 17, 1).unwrap();
        let word = addr.pack();
        assert_eq!(word & 0xF, TOF_SYSTEM_ID);
        assert_eq!((word >> 4) & 0x7F, 3);
        assert_eq!((word >> 11) & 0xF, 5);
        assert_eq!((word >> 15) & 0x3F, 2);
        assert_eq!((word >> 21) & 0x1, 1);
        assert_eq!((word >> 22) & 0x3F, 17);
        assert_eq!(word >> 28, 0);
        assert_eq!(TofAddress::unpack(word).unwrap(), addr);
    }

    #[test]
    fn test_field_limits() {
        assert!(TofAddress::new(16, 0, 0, 0, 0).is_err());
        assert!(TofAddress::new(0, 128, 0, 0, 0).is_err());
        assert!(TofAddress::new(0, 0, 64, 0, 0).is_err());
        assert!(TofAddress::new(0, 0, 0, 64, 0).is_err());
        assert!(TofAddress::new(0, 0, 0, 0, 2).is_err());
        assert!(TofAddress::new(15, 127, 63, 63, 1).is_ok());
    }

    #[test]
    fn test_unpack_rejects_other_systems() {
        let word = TofAddress::new(0, 1, 0, 0, 0).unwrap().pack() & !0xF | 0x3;
        assert!(matches!(
            TofAddress::unpack(word),
            Err(Error::ForeignAddress(_))
        ));
    }

    #[test]
    fn test_side_helpers() {
        let addr = TofAddress::new(0, 1, 2, 3, 1).unwrap();
        assert_eq!(addr.mirrored().side, 0);
        assert_eq!(addr.mirrored().mirrored(), addr);
        assert_eq!(addr.channel_address().side, 0);
        let counter = addr.counter();
        assert_eq!((counter.channel, counter.side), (0, 0));
        assert_eq!(counter.rpc, 2);
    }
}
