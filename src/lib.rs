//! Matrix-engine descriptor compiler
//!
//! This library turns a convolution (forward, input gradient, weight
//! gradient), a batched GEMM or a copy/transpose into the sequence of AGU
//! descriptors a matrix engine executes.
//!
//! # Example
//!
//! ```rust
//! use mme_desc::{compile, ChipGen, ConvParams, DataType, Geometry, Operation, Strategy, Tensor};
//!
//! let x = Tensor::dense(&[4, 5, 5, 1, 1], DataType::Fp32);
//! let w = Tensor::dense(&[8, 4, 3, 3, 1], DataType::Fp32);
//! let y = Tensor::dense(&[8, 3, 3, 1, 1], DataType::Fp32);
//! let op = Operation::fwd(x, w, y, ConvParams::default());
//! let strategy = Strategy::new(Geometry::single(8, 16));
//! let program = compile(&op, &strategy, ChipGen::Gen3).unwrap();
//! println!("{}", program);
//! ```

pub mod agu;
pub mod attr;
pub mod chip;
pub mod codegen;
pub mod error;
pub mod geometry;
pub mod hardware;
pub mod params;
pub mod pattern;
pub mod recipe;
pub mod subproblem;

use serde::{Deserialize, Serialize};

pub use agu::{calc_last_step_size, AguSynthesizer, MmeAguConfig};
pub use attr::{LoopBindings, LoopSlot, OperandAttr, PortGrid, PortIndex, PortOffsets};
pub use chip::{ChipDescriptorWriter, ChipGen, Gen2Writer, Gen3Writer, MmeDescriptor};
pub use codegen::CodeGenerator;
pub use error::{DescError, DescResult};
pub use geometry::{Geometry, Interleave, Strategy};
pub use hardware::{Activation, ActivationKind, DescriptorProgram, TargetConfig};
pub use params::{ConvParams, DataType, OpType, Operand, OperandSet, Operation, Tensor};
pub use pattern::ReductionOrder;
pub use recipe::{Recipe, TilingPlanner};
pub use subproblem::{SubProblem, SubProblemContainer, SubProblemDecomposer};

/// Compile one operation for a chip generation
pub fn compile(op: &Operation, strategy: &Strategy, chip: ChipGen) -> DescResult<DescriptorProgram> {
    let target = TargetConfig::new(chip, strategy.clone());
    let mut codegen = CodeGenerator::new(target);
    codegen.generate(op)
}

/// A compilation request as read from a job file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub chip: ChipGen,
    pub strategy: Strategy,
    pub operation: Operation,
}

impl Job {
    pub fn from_json(source: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(source)
    }

    pub fn compile(&self) -> DescResult<DescriptorProgram> {
        compile(&self.operation, &self.strategy, self.chip)
    }
}
