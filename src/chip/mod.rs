//! Chip descriptor writers
//!
//! The synthesizer's attributes are chip independent. A writer copies them
//! into the descriptor layout of one chip generation, checking every value
//! against the width of the field that carries it.

mod gen2;
mod gen3;

use std::fmt;
use std::str::FromStr;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::agu::{is_port_start_offset, MmeAguConfig};
use crate::attr::{LoopSlot, OperandAttr, INVALID_PORT_OFFSET};
use crate::error::{DescError, DescResult};
use crate::params::{DataType, Operand, OperandSet, Operation, MAX_DIMS};

pub use gen2::Gen2Writer;
pub use gen3::Gen3Writer;

/// Dim value of a loop an operand does not move on
pub const NO_MOVE_DIM: u8 = 7;

/// Supported chip generations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChipGen {
    Gen2,
    Gen3,
}

impl ChipGen {
    pub fn layout(&self) -> FieldLayout {
        match self {
            ChipGen::Gen2 => FieldLayout {
                max_ports: 4,
                conv_loop_bits: 8,
                outer_loop_bits: 16,
                spatial_loop_bits: 16,
            },
            ChipGen::Gen3 => FieldLayout {
                max_ports: 8,
                conv_loop_bits: 16,
                outer_loop_bits: 16,
                spatial_loop_bits: 20,
            },
        }
    }

    pub fn writer(&self) -> Box<dyn ChipDescriptorWriter> {
        match self {
            ChipGen::Gen2 => Box::new(Gen2Writer),
            ChipGen::Gen3 => Box::new(Gen3Writer),
        }
    }
}

impl fmt::Display for ChipGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChipGen::Gen2 => write!(f, "gen2"),
            ChipGen::Gen3 => write!(f, "gen3"),
        }
    }
}

impl FromStr for ChipGen {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gen2" => Ok(ChipGen::Gen2),
            "gen3" => Ok(ChipGen::Gen3),
            other => Err(format!("unknown chip generation: {}", other)),
        }
    }
}

/// Field widths that differ between generations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    /// AGU ports per core per operand
    pub max_ports: usize,
    pub conv_loop_bits: u32,
    pub outer_loop_bits: u32,
    pub spatial_loop_bits: u32,
}

/// Descriptor-wide settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescHeader {
    pub op_code: u32,
    pub dtype: u32,
    pub pattern: u32,
    pub transposed_a: bool,
    pub transposed_b: bool,
    pub memset: bool,
    pub reduction_add: bool,
    pub pad_value: u32,
    pub partial_height_mask_a: u8,
    pub partial_height_mask_b: u8,
    pub spatial_size_minus1: u64,
}

/// Tensor part of one operand
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub attr: OperandAttr,
    /// Port offsets are added to the start rather than the base
    pub port_start_relative: bool,
}

/// One hardware loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopDesc {
    pub size_minus1: u64,
    pub dims: [u8; 3],
}

/// One AGU port slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AguPort {
    pub offsets: [i64; MAX_DIMS],
}

impl AguPort {
    pub fn unused() -> Self {
        Self {
            offsets: [INVALID_PORT_OFFSET; MAX_DIMS],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.offsets[0] != INVALID_PORT_OFFSET
    }
}

/// The descriptor of one core for one activation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmeDescriptor {
    pub chip: ChipGen,
    pub core: usize,
    pub header: DescHeader,
    pub tensors: OperandSet<TensorDesc>,
    pub loops: [LoopDesc; 4],
    /// AGU slots per operand, `max_ports` each
    pub agu: OperandSet<Vec<AguPort>>,
}

impl MmeDescriptor {
    pub fn new(chip: ChipGen, core: usize) -> Self {
        let ports = vec![AguPort::unused(); chip.layout().max_ports];
        Self {
            chip,
            core,
            header: DescHeader::default(),
            tensors: OperandSet::default(),
            loops: [LoopDesc::default(); 4],
            agu: OperandSet::new(ports.clone(), ports.clone(), ports),
        }
    }

    /// Pack into little-endian 32-bit words
    pub fn encode(&self) -> DescResult<Vec<u32>> {
        let layout = self.chip.layout();
        let mut w = BitWriter::new();
        let h = &self.header;

        w.put("op_code", h.op_code as u64, 3)?;
        w.put("dtype", h.dtype as u64, 3)?;
        w.put("pattern", h.pattern as u64, 3)?;
        w.put("transposed_a", h.transposed_a as u64, 1)?;
        w.put("transposed_b", h.transposed_b as u64, 1)?;
        w.put("memset", h.memset as u64, 1)?;
        w.put("reduction_add", h.reduction_add as u64, 1)?;
        for operand in Operand::ALL {
            w.put("port_start_relative", self.tensors[operand].port_start_relative as u64, 1)?;
        }
        w.put("partial_height_mask_a", h.partial_height_mask_a as u64, 4)?;
        w.put("partial_height_mask_b", h.partial_height_mask_b as u64, 4)?;
        w.align();
        w.put("pad_value", h.pad_value as u64, 32)?;
        w.put("spatial_size_minus1", h.spatial_size_minus1, layout.spatial_loop_bits)?;
        w.align();

        for slot in LoopSlot::ALL {
            let l = &self.loops[slot.index()];
            let bits = if slot == LoopSlot::Outer {
                layout.outer_loop_bits
            } else {
                layout.conv_loop_bits
            };
            w.put("loop_size_minus1", l.size_minus1, bits)?;
            for dim in l.dims {
                w.put("loop_dim", dim as u64, 3)?;
            }
            w.align();
        }

        for operand in Operand::ALL {
            let a = &self.tensors[operand].attr;
            for d in 0..MAX_DIMS {
                w.put("roi_size", a.roi_size[d], 32)?;
                w.put("valid_elements", a.valid_elements[d], 32)?;
                w.put_signed("loop_stride", a.loop_stride[d], 32)?;
                w.put("spatial_strides", a.spatial_strides[d], 32)?;
                w.put_signed("base_offset", a.base_offset[d], 32)?;
                w.put_signed("start_offset", a.start_offset[d], 32)?;
            }
            w.put("last_spatial_step", a.last_spatial_step, 32)?;
            w.put("last_fcd_step", a.last_fcd_step, 32)?;
        }

        for operand in Operand::ALL {
            for port in &self.agu[operand] {
                for v in port.offsets {
                    w.put_signed("port_offset", v, 32)?;
                }
            }
        }
        Ok(w.finish())
    }
}

/// Sequential little-endian bit packer
struct BitWriter {
    words: Vec<u32>,
    bit: u32,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            words: Vec::new(),
            bit: 32,
        }
    }

    fn put(&mut self, field: &'static str, value: u64, bits: u32) -> DescResult<()> {
        if bits < 64 && value >> bits != 0 {
            return Err(DescError::overflow(field, value as i64, bits));
        }
        let mut value = value;
        let mut left = bits;
        while left > 0 {
            if self.bit == 32 {
                self.words.push(0);
                self.bit = 0;
            }
            let take = left.min(32 - self.bit);
            let mask = if take == 32 { u32::MAX } else { (1u32 << take) - 1 };
            let chunk = (value as u32) & mask;
            if let Some(word) = self.words.last_mut() {
                *word |= chunk << self.bit;
            }
            self.bit += take;
            left -= take;
            value >>= take;
        }
        Ok(())
    }

    fn put_signed(&mut self, field: &'static str, value: i64, bits: u32) -> DescResult<()> {
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        if value < min || value > max {
            return Err(DescError::overflow(field, value, bits));
        }
        let raw = (value as u64) & ((1u64 << bits) - 1);
        self.put(field, raw, bits)
    }

    fn align(&mut self) {
        self.bit = 32;
    }

    fn finish(self) -> Vec<u32> {
        self.words
    }
}

fn check_fits(field: &'static str, value: u64, bits: u32) -> DescResult<()> {
    if value >> bits != 0 {
        return Err(DescError::overflow(field, value as i64, bits));
    }
    Ok(())
}

/// Writes chip-independent attributes into one generation's descriptor
pub trait ChipDescriptorWriter {
    fn chip(&self) -> ChipGen;

    /// Common-dim elements one read must be aligned to
    fn num_elements_for_common_dim_alignment(&self, dtype: DataType, op: &Operation) -> u64;

    /// AGU slot of the `port`-th of `ports` ports of an operand
    fn agu_slot(&self, port: usize, _ports: usize, _transposed: bool) -> usize {
        port
    }

    fn layout(&self) -> FieldLayout {
        self.chip().layout()
    }

    /// Descriptor of one core
    fn configure_descriptor(&self, op: &Operation, cfg: &MmeAguConfig, core: usize) -> DescResult<MmeDescriptor> {
        let mut desc = MmeDescriptor::new(self.chip(), core);
        desc.header = DescHeader {
            op_code: op.op.code(),
            dtype: op.a.dtype.code(),
            pattern: 0,
            transposed_a: op.is_transposed(Operand::A),
            transposed_b: op.is_transposed(Operand::B),
            memset: cfg.memset,
            reduction_add: cfg.reduction_add,
            pad_value: cfg.pad_value,
            ..DescHeader::default()
        };
        let attrs = cfg
            .attrs
            .get(core)
            .ok_or_else(|| DescError::geometry(format!("no attributes for core {}", core)))?;
        for operand in Operand::ALL {
            desc.tensors[operand] = TensorDesc {
                attr: attrs[operand].clone(),
                port_start_relative: is_port_start_offset(op, operand),
            };
        }
        self.set_agu_ports(&mut desc, op, cfg)?;
        self.set_associated_dim_and_size(&mut desc, cfg)?;
        self.set_spatial_loop_size(&mut desc, cfg)?;
        self.set_partial_height_loop_mask_a(&mut desc, cfg);
        self.set_partial_height_loop_mask_b(&mut desc, cfg);
        trace!("{} descriptor for core {}: {:?}", self.chip(), core, desc.header);
        Ok(desc)
    }

    /// Copy this core's port offsets into AGU slots
    fn set_agu_ports(&self, desc: &mut MmeDescriptor, op: &Operation, cfg: &MmeAguConfig) -> DescResult<()> {
        let max_ports = self.layout().max_ports;
        for operand in Operand::ALL {
            let grid = &cfg.grids[operand];
            let cells = grid.core_indices(desc.core);
            if cells.len() > max_ports {
                return Err(DescError::unsupported(format!(
                    "{} needs {} ports per core for operand {}, {} has {}",
                    op.op,
                    cells.len(),
                    operand,
                    self.chip(),
                    max_ports
                )));
            }
            let transposed = op.is_transposed(operand);
            for (i, idx) in cells.iter().enumerate() {
                let cell = grid.get(*idx);
                let slot = self.agu_slot(i, cells.len(), transposed);
                desc.agu[operand][slot] = if cell.valid {
                    AguPort { offsets: cell.offsets }
                } else {
                    AguPort::unused()
                };
            }
        }
        Ok(())
    }

    /// Loop sizes and the dim each operand walks on every slot
    fn set_associated_dim_and_size(&self, desc: &mut MmeDescriptor, cfg: &MmeAguConfig) -> DescResult<()> {
        let layout = self.layout();
        for slot in LoopSlot::ALL {
            let binding = cfg.loops.slot(slot);
            let bits = if slot == LoopSlot::Outer {
                layout.outer_loop_bits
            } else {
                layout.conv_loop_bits
            };
            check_fits("loop_size_minus1", binding.size_minus1, bits)?;
            let dim = |d: Option<usize>| d.map(|d| d as u8).unwrap_or(NO_MOVE_DIM);
            desc.loops[slot.index()] = LoopDesc {
                size_minus1: binding.size_minus1,
                dims: [dim(binding.dims.a), dim(binding.dims.b), dim(binding.dims.c)],
            };
        }
        desc.header.pattern = pattern_code(&cfg.masks)?;
        Ok(())
    }

    fn set_spatial_loop_size(&self, desc: &mut MmeDescriptor, cfg: &MmeAguConfig) -> DescResult<()> {
        check_fits(
            "spatial_size_minus1",
            cfg.loops.spatial_size_minus1,
            self.layout().spatial_loop_bits,
        )?;
        desc.header.spatial_size_minus1 = cfg.loops.spatial_size_minus1;
        Ok(())
    }

    fn set_partial_height_loop_mask_a(&self, desc: &mut MmeDescriptor, cfg: &MmeAguConfig) {
        desc.header.partial_height_mask_a = cfg.move_masks.a;
    }

    fn set_partial_height_loop_mask_b(&self, desc: &mut MmeDescriptor, cfg: &MmeAguConfig) {
        desc.header.partial_height_mask_b = cfg.move_masks.b;
    }
}

/// Pattern code of a set of slot masks
fn pattern_code(masks: &[u8; 4]) -> DescResult<u32> {
    crate::pattern::PATTERN_TABLE
        .iter()
        .find(|(_, m)| [m.filter[0], m.filter[1], m.filter[2], m.outer] == *masks)
        .map(|(order, _)| order.code())
        .ok_or_else(|| DescError::PatternNotOneHot {
            pattern: format!("{:?}", masks),
            message: "slot masks match no reduction order".to_string(),
        })
}
