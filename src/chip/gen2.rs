//! Second-generation descriptor layout

use crate::params::{DataType, Operation};

use super::{ChipDescriptorWriter, ChipGen};

/// Four AGU ports per operand, 8-bit convolution loop counters
#[derive(Debug, Clone, Copy, Default)]
pub struct Gen2Writer;

impl ChipDescriptorWriter for Gen2Writer {
    fn chip(&self) -> ChipGen {
        ChipGen::Gen2
    }

    fn num_elements_for_common_dim_alignment(&self, dtype: DataType, op: &Operation) -> u64 {
        if op.op.is_dma() {
            return 1;
        }
        match dtype {
            DataType::Fp8 => 4,
            _ => 1,
        }
    }
}
