//! Third-generation descriptor layout
//!
//! Transposed operands are read by two AGU banks. Even ports fill the first
//! half of the slots and odd ports the second half.

use crate::params::{DataType, Operation};

use super::{ChipDescriptorWriter, ChipGen};

#[derive(Debug, Clone, Copy, Default)]
pub struct Gen3Writer;

impl ChipDescriptorWriter for Gen3Writer {
    fn chip(&self) -> ChipGen {
        ChipGen::Gen3
    }

    fn num_elements_for_common_dim_alignment(&self, dtype: DataType, op: &Operation) -> u64 {
        if op.op.is_dma() {
            return 1;
        }
        match dtype {
            DataType::Fp8 => 8,
            DataType::Bf16 | DataType::Fp16 => 2,
            DataType::Fp32 | DataType::Tf32 => 1,
        }
    }

    fn agu_slot(&self, port: usize, ports: usize, transposed: bool) -> usize {
        if !transposed || ports % 2 != 0 {
            return port;
        }
        (port % 2) * (ports / 2) + port / 2
    }
}
