//! Reduction-order patterns
//!
//! A pattern names the nesting of the four looped axes, outermost first:
//! `o` is the outer axis, `q`, `r`, `s` are the three filter (or batch) axes.
//! Every axis lands on exactly one hardware loop slot.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::attr::LoopSlot;
use crate::error::{DescError, DescResult};

/// Looped axes of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopAxis {
    S,
    R,
    Q,
    O,
}

impl LoopAxis {
    /// Filter dimension index of a filter axis
    pub fn filter_dim(&self) -> Option<usize> {
        match self {
            LoopAxis::S => Some(0),
            LoopAxis::R => Some(1),
            LoopAxis::Q => Some(2),
            LoopAxis::O => None,
        }
    }
}

/// Slot bit mask of every axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMasks {
    /// Indexed by filter dimension (s, r, q)
    pub filter: [u8; 3],
    pub outer: u8,
}

impl PatternMasks {
    pub fn axis(&self, axis: LoopAxis) -> u8 {
        match axis.filter_dim() {
            Some(i) => self.filter[i],
            None => self.outer,
        }
    }

    /// Slot of an axis; only meaningful after `check_one_hot`
    pub fn slot(&self, axis: LoopAxis) -> LoopSlot {
        LoopSlot::from_mask(self.axis(axis)).unwrap_or(LoopSlot::Outer)
    }
}

/// The eight supported loop nestings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReductionOrder {
    Oqrs,
    QOrs,
    QrOs,
    QrsO,
    Osrq,
    SOrq,
    SrOq,
    SrqO,
}

impl Default for ReductionOrder {
    fn default() -> Self {
        ReductionOrder::Oqrs
    }
}

impl fmt::Display for ReductionOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

use LoopAxis::{O, Q, R, S};

const fn masks(order: [LoopAxis; 4]) -> PatternMasks {
    let mut m = PatternMasks {
        filter: [0; 3],
        outer: 0,
    };
    let mut pos = 0;
    while pos < 4 {
        let bit = 1u8 << (3 - pos);
        match order[pos] {
            S => m.filter[0] |= bit,
            R => m.filter[1] |= bit,
            Q => m.filter[2] |= bit,
            O => m.outer |= bit,
        }
        pos += 1;
    }
    m
}

/// Slot masks per pattern, in `ReductionOrder` declaration order
pub const PATTERN_TABLE: [(ReductionOrder, PatternMasks); 8] = [
    (ReductionOrder::Oqrs, masks([O, Q, R, S])),
    (ReductionOrder::QOrs, masks([Q, O, R, S])),
    (ReductionOrder::QrOs, masks([Q, R, O, S])),
    (ReductionOrder::QrsO, masks([Q, R, S, O])),
    (ReductionOrder::Osrq, masks([O, S, R, Q])),
    (ReductionOrder::SOrq, masks([S, O, R, Q])),
    (ReductionOrder::SrOq, masks([S, R, O, Q])),
    (ReductionOrder::SrqO, masks([S, R, Q, O])),
];

impl ReductionOrder {
    pub const ALL: [ReductionOrder; 8] = [
        ReductionOrder::Oqrs,
        ReductionOrder::QOrs,
        ReductionOrder::QrOs,
        ReductionOrder::QrsO,
        ReductionOrder::Osrq,
        ReductionOrder::SOrq,
        ReductionOrder::SrOq,
        ReductionOrder::SrqO,
    ];

    pub fn masks(&self) -> PatternMasks {
        PATTERN_TABLE[*self as usize].1
    }

    pub fn code(&self) -> u32 {
        *self as u32
    }
}

/// Reject masks that do not put every axis on its own single slot
pub fn check_one_hot(name: &str, masks: &PatternMasks) -> DescResult<()> {
    let all = [masks.filter[0], masks.filter[1], masks.filter[2], masks.outer];
    let mut seen = 0u8;
    for (axis, mask) in [S, R, Q, O].iter().zip(all) {
        if mask.count_ones() != 1 {
            return Err(DescError::PatternNotOneHot {
                pattern: name.to_string(),
                message: format!("axis {:?} has mask {:#06b}", axis, mask),
            });
        }
        if seen & mask != 0 {
            return Err(DescError::PatternNotOneHot {
                pattern: name.to_string(),
                message: format!("axis {:?} shares slot mask {:#06b}", axis, mask),
            });
        }
        seen |= mask;
    }
    if seen != 0b1111 {
        return Err(DescError::PatternNotOneHot {
            pattern: name.to_string(),
            message: format!("slots {:#06b} left unassigned", !seen & 0b1111),
        });
    }
    Ok(())
}

/// Masks of a pattern, validated
pub fn pattern_masks(order: ReductionOrder) -> DescResult<PatternMasks> {
    let masks = order.masks();
    check_one_hot(&order.to_string(), &masks)?;
    Ok(masks)
}
