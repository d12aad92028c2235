//! Error types for the descriptor compiler
//!
//! Every variant is a configuration error: the caller handed the compiler
//! something it cannot express. None of them is recovered inside the crate.

use thiserror::Error;

/// Result type for descriptor compilation
pub type DescResult<T> = Result<T, DescError>;

/// Descriptor compilation errors
#[derive(Debug, Error)]
pub enum DescError {
    #[error("Operand {operand} has rank {got}, expected {expected}")]
    RankMismatch {
        operand: String,
        expected: usize,
        got: usize,
    },

    #[error("Operand {operand} has stride {stride} on its fastest dimension, expected 1")]
    NonUnitLeadingStride { operand: String, stride: u64 },

    #[error("Common dimension {size} is not aligned to {alignment} on a non-final window")]
    MisalignedCommonDim { size: u64, alignment: u64 },

    #[error("Reduction order {pattern} is not one-hot: {message}")]
    PatternNotOneHot { pattern: String, message: String },

    #[error("Unsupported configuration: {message}")]
    Unsupported { message: String },

    #[error("Invalid geometry: {message}")]
    Geometry { message: String },

    #[error("Field {field} value {value} does not fit in {bits} bits")]
    FieldOverflow {
        field: &'static str,
        value: i64,
        bits: u32,
    },

    #[error("Decomposition produced no sub-problems")]
    NoSubProblems,

    #[error("Tiling error: {message}")]
    TilingError { message: String },
}

impl DescError {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        DescError::Unsupported { message: msg.into() }
    }

    pub fn geometry(msg: impl Into<String>) -> Self {
        DescError::Geometry { message: msg.into() }
    }

    pub fn tiling(msg: impl Into<String>) -> Self {
        DescError::TilingError { message: msg.into() }
    }

    pub fn rank(operand: impl Into<String>, expected: usize, got: usize) -> Self {
        DescError::RankMismatch {
            operand: operand.into(),
            expected,
            got,
        }
    }

    pub fn overflow(field: &'static str, value: i64, bits: u32) -> Self {
        DescError::FieldOverflow { field, value, bits }
    }
}
