//! Chip-independent AGU attributes
//!
//! These are the values the synthesizer computes and the chip writers encode:
//! one strided-access description per operand, a grid of per-port offsets and
//! the binding of hardware loops to operand dimensions.

use serde::{Deserialize, Serialize};

use crate::params::{OperandSet, MAX_DIMS};

/// Offset written for ports the current operation does not use
pub const INVALID_PORT_OFFSET: i64 = i32::MIN as i64;

/// Strided-access description of one operand
///
/// The synthesizer fills this in element units and converts it to address
/// units (scaled by the tensor strides) as its last step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandAttr {
    pub roi_size: [u64; MAX_DIMS],
    pub valid_elements: [u64; MAX_DIMS],
    pub loop_stride: [i64; MAX_DIMS],
    pub spatial_strides: [u64; MAX_DIMS],
    pub base_offset: [i64; MAX_DIMS],
    pub start_offset: [i64; MAX_DIMS],
    pub last_spatial_step: u64,
    pub last_fcd_step: u64,
}

/// Offset vector of one physical port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOffsets {
    pub offsets: [i64; MAX_DIMS],
    pub valid: bool,
}

impl PortOffsets {
    pub fn zero() -> Self {
        Self {
            offsets: [0; MAX_DIMS],
            valid: true,
        }
    }

    pub fn invalid() -> Self {
        Self {
            offsets: [INVALID_PORT_OFFSET; MAX_DIMS],
            valid: false,
        }
    }
}

/// Extents of a port grid, outermost level first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridShape {
    pub cores: usize,
    pub cd_ports: usize,
    pub batch_ports: usize,
    pub fcd_ports: usize,
    pub sp_ports: usize,
}

impl GridShape {
    /// Ports per core
    pub fn ports_per_core(&self) -> usize {
        self.cd_ports * self.batch_ports * self.fcd_ports * self.sp_ports
    }
}

/// Position of one cell inside a port grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortIndex {
    pub core: usize,
    pub cd: usize,
    pub batch: usize,
    pub fcd: usize,
    pub sp: usize,
}

/// Per-port offsets indexed `[core][cd][batch][fcd][sp]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortGrid {
    shape: GridShape,
    cells: Vec<PortOffsets>,
}

impl PortGrid {
    pub fn new(shape: GridShape) -> Self {
        let total = shape.cores * shape.ports_per_core();
        Self {
            shape,
            cells: vec![PortOffsets::zero(); total],
        }
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    fn flat(&self, idx: PortIndex) -> usize {
        let s = &self.shape;
        debug_assert!(idx.core < s.cores && idx.cd < s.cd_ports && idx.batch < s.batch_ports);
        debug_assert!(idx.fcd < s.fcd_ports && idx.sp < s.sp_ports);
        (((idx.core * s.cd_ports + idx.cd) * s.batch_ports + idx.batch) * s.fcd_ports + idx.fcd)
            * s.sp_ports
            + idx.sp
    }

    pub fn get(&self, idx: PortIndex) -> &PortOffsets {
        &self.cells[self.flat(idx)]
    }

    pub fn get_mut(&mut self, idx: PortIndex) -> &mut PortOffsets {
        let flat = self.flat(idx);
        &mut self.cells[flat]
    }

    /// All cell indices of one core, in `[cd][batch][fcd][sp]` order
    pub fn core_indices(&self, core: usize) -> Vec<PortIndex> {
        let s = self.shape;
        let mut out = Vec::with_capacity(s.ports_per_core());
        for cd in 0..s.cd_ports {
            for batch in 0..s.batch_ports {
                for fcd in 0..s.fcd_ports {
                    for sp in 0..s.sp_ports {
                        out.push(PortIndex {
                            core,
                            cd,
                            batch,
                            fcd,
                            sp,
                        });
                    }
                }
            }
        }
        out
    }

    pub fn indices(&self) -> Vec<PortIndex> {
        (0..self.shape.cores)
            .flat_map(|core| self.core_indices(core))
            .collect()
    }

    pub fn num_valid(&self) -> usize {
        self.cells.iter().filter(|c| c.valid).count()
    }
}

/// Hardware loop slots, innermost first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopSlot {
    Conv0,
    Conv1,
    Conv2,
    Outer,
}

impl LoopSlot {
    pub const ALL: [LoopSlot; 4] = [LoopSlot::Conv0, LoopSlot::Conv1, LoopSlot::Conv2, LoopSlot::Outer];

    pub fn index(&self) -> usize {
        match self {
            LoopSlot::Conv0 => 0,
            LoopSlot::Conv1 => 1,
            LoopSlot::Conv2 => 2,
            LoopSlot::Outer => 3,
        }
    }

    pub fn from_mask(mask: u8) -> Option<LoopSlot> {
        match mask {
            0b0001 => Some(LoopSlot::Conv0),
            0b0010 => Some(LoopSlot::Conv1),
            0b0100 => Some(LoopSlot::Conv2),
            0b1000 => Some(LoopSlot::Outer),
            _ => None,
        }
    }
}

/// One hardware loop: iteration count and the dimension each operand walks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopBinding {
    pub size_minus1: u64,
    /// `None` means the operand does not move on this loop
    pub dims: OperandSet<Option<usize>>,
}

impl Default for LoopBinding {
    fn default() -> Self {
        Self {
            size_minus1: 0,
            dims: OperandSet::new(None, None, None),
        }
    }
}

impl LoopBinding {
    pub fn size(&self) -> u64 {
        self.size_minus1 + 1
    }
}

/// All loop bindings of one descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopBindings {
    pub slots: [LoopBinding; 4],
    /// Spatial steps per port, minus one
    pub spatial_size_minus1: u64,
}

impl LoopBindings {
    pub fn slot(&self, slot: LoopSlot) -> &LoopBinding {
        &self.slots[slot.index()]
    }

    pub fn slot_mut(&mut self, slot: LoopSlot) -> &mut LoopBinding {
        &mut self.slots[slot.index()]
    }

    /// Total number of loop iterations of one descriptor
    pub fn iterations(&self) -> u64 {
        self.slots.iter().map(|s| s.size()).product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_indexing() {
        let shape = GridShape {
            cores: 2,
            cd_ports: 1,
            batch_ports: 2,
            fcd_ports: 2,
            sp_ports: 3,
        };
        let mut grid = PortGrid::new(shape);
        let idx = PortIndex {
            core: 1,
            cd: 0,
            batch: 1,
            fcd: 0,
            sp: 2,
        };
        grid.get_mut(idx).offsets[1] = 7;
        assert_eq!(grid.get(idx).offsets[1], 7);
        assert_eq!(grid.indices().len(), 24);
        assert_eq!(grid.core_indices(1)[0].core, 1);

        *grid.get_mut(idx) = PortOffsets::invalid();
        assert_eq!(grid.num_valid(), 23);
    }

    #[test]
    fn test_slot_masks() {
        for slot in LoopSlot::ALL {
            assert_eq!(LoopSlot::from_mask(1 << slot.index()), Some(slot));
        }
        assert_eq!(LoopSlot::from_mask(0b0011), None);
    }
}
