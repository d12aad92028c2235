//! Logical operation parameters
//!
//! Tensors are described fastest dimension first. Convolution tensors use
//! `[C, W, H, D, N]` for activations and `[K, C, S, R, Q]` for weights.

use std::fmt;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

use crate::error::{DescError, DescResult};

/// Maximum tensor rank understood by the address generators
pub const MAX_DIMS: usize = 5;

/// Number of filter dimensions (S, R, Q)
pub const MAX_CONV_DIMS: usize = 3;

/// One of the three matrix-engine operands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    A,
    B,
    C,
}

impl Operand {
    pub const ALL: [Operand; 3] = [Operand::A, Operand::B, Operand::C];
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operand::A => "A",
            Operand::B => "B",
            Operand::C => "C",
        };
        write!(f, "{}", name)
    }
}

/// One value per operand
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandSet<T> {
    pub a: T,
    pub b: T,
    pub c: T,
}

impl<T> OperandSet<T> {
    pub fn new(a: T, b: T, c: T) -> Self {
        Self { a, b, c }
    }

    pub fn map<U>(&self, mut f: impl FnMut(Operand, &T) -> U) -> OperandSet<U> {
        OperandSet {
            a: f(Operand::A, &self.a),
            b: f(Operand::B, &self.b),
            c: f(Operand::C, &self.c),
        }
    }
}

impl<T> Index<Operand> for OperandSet<T> {
    type Output = T;

    fn index(&self, operand: Operand) -> &T {
        match operand {
            Operand::A => &self.a,
            Operand::B => &self.b,
            Operand::C => &self.c,
        }
    }
}

impl<T> IndexMut<Operand> for OperandSet<T> {
    fn index_mut(&mut self, operand: Operand) -> &mut T {
        match operand {
            Operand::A => &mut self.a,
            Operand::B => &mut self.b,
            Operand::C => &mut self.c,
        }
    }
}

/// Operation family executed by the matrix engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Dma,
    Transpose,
    Fwd,
    Dedx,
    Dedw,
    Bgemm,
}

impl OpType {
    pub fn is_conv(&self) -> bool {
        matches!(self, OpType::Fwd | OpType::Dedx | OpType::Dedw)
    }

    /// Copy-like operations read A against an implicit identity B
    pub fn is_dma(&self) -> bool {
        matches!(self, OpType::Dma | OpType::Transpose)
    }

    pub fn code(&self) -> u32 {
        match self {
            OpType::Dma => 0,
            OpType::Transpose => 1,
            OpType::Fwd => 2,
            OpType::Dedx => 3,
            OpType::Dedw => 4,
            OpType::Bgemm => 5,
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpType::Dma => "dma",
            OpType::Transpose => "transpose",
            OpType::Fwd => "fwd",
            OpType::Dedx => "dedx",
            OpType::Dedw => "dedw",
            OpType::Bgemm => "bgemm",
        };
        write!(f, "{}", name)
    }
}

/// Element datatype. Only size and alignment matter here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Fp32,
    Tf32,
    Bf16,
    Fp16,
    Fp8,
}

impl DataType {
    pub fn code(&self) -> u32 {
        match self {
            DataType::Fp32 => 0,
            DataType::Tf32 => 1,
            DataType::Bf16 => 2,
            DataType::Fp16 => 3,
            DataType::Fp8 => 4,
        }
    }
}

/// A strided tensor view. Strides are in elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tensor {
    pub sizes: [u64; MAX_DIMS],
    pub strides: [u64; MAX_DIMS],
    pub dtype: DataType,
}

impl Tensor {
    /// Densely packed tensor; missing trailing dims are 1
    pub fn dense(sizes: &[u64], dtype: DataType) -> Self {
        let mut padded = [1u64; MAX_DIMS];
        for (dst, src) in padded.iter_mut().zip(sizes) {
            *dst = *src;
        }
        let mut strides = [1u64; MAX_DIMS];
        for d in 1..MAX_DIMS {
            strides[d] = strides[d - 1] * padded[d - 1].max(1);
        }
        Self {
            sizes: padded,
            strides,
            dtype,
        }
    }

    pub fn with_strides(sizes: [u64; MAX_DIMS], strides: [u64; MAX_DIMS], dtype: DataType) -> Self {
        Self {
            sizes,
            strides,
            dtype,
        }
    }

    /// Tensor of any rank up to `MAX_DIMS`; missing trailing dims are 1
    pub fn from_dims(sizes: &[u64], strides: &[u64], dtype: DataType) -> DescResult<Self> {
        if sizes.len() > MAX_DIMS {
            return Err(DescError::rank("tensor", MAX_DIMS, sizes.len()));
        }
        if strides.len() != sizes.len() {
            return Err(DescError::rank("tensor strides", sizes.len(), strides.len()));
        }
        let mut t = Self::dense(sizes, dtype);
        for (d, stride) in strides.iter().enumerate() {
            t.strides[d] = *stride;
        }
        let span = t.span().max(1);
        for d in strides.len()..MAX_DIMS {
            t.strides[d] = span;
        }
        Ok(t)
    }

    pub fn num_elements(&self) -> u64 {
        self.sizes.iter().product()
    }

    /// Number of addressable elements spanned by the view
    pub fn span(&self) -> u64 {
        if self.num_elements() == 0 {
            return 0;
        }
        self.sizes
            .iter()
            .zip(&self.strides)
            .map(|(size, stride)| (size - 1) * stride)
            .sum::<u64>()
            + 1
    }

    /// Element offset of a coordinate
    pub fn offset(&self, coord: &[u64; MAX_DIMS]) -> u64 {
        coord.iter().zip(&self.strides).map(|(c, s)| c * s).sum()
    }
}

/// Convolution parameters, indexed by filter dimension (S, R, Q)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvParams {
    pub stride: [u32; MAX_CONV_DIMS],
    pub dilation: [u32; MAX_CONV_DIMS],
    pub padding: [i32; MAX_CONV_DIMS],
}

impl Default for ConvParams {
    fn default() -> Self {
        Self {
            stride: [1; MAX_CONV_DIMS],
            dilation: [1; MAX_CONV_DIMS],
            padding: [0; MAX_CONV_DIMS],
        }
    }
}

impl ConvParams {
    pub fn new(stride: [u32; 3], dilation: [u32; 3], padding: [i32; 3]) -> Self {
        Self {
            stride,
            dilation,
            padding,
        }
    }

    /// Strides and dilations must be at least one in every filter dim
    pub fn validate(&self) -> DescResult<()> {
        for i in 0..MAX_CONV_DIMS {
            if self.stride[i] == 0 || self.dilation[i] == 0 {
                return Err(DescError::unsupported(format!(
                    "filter dim {} has stride {} and dilation {}, both must be at least 1",
                    i, self.stride[i], self.dilation[i]
                )));
            }
        }
        Ok(())
    }

    /// Output extent of one spatial dimension
    pub fn out_size(&self, dim: usize, input: u64, kernel: u64) -> u64 {
        let padded = input as i64 + 2 * self.padding[dim] as i64;
        let reach = self.dilation[dim] as i64 * (kernel as i64 - 1) + 1;
        if padded < reach {
            return 0;
        }
        ((padded - reach) / self.stride[dim] as i64 + 1) as u64
    }
}

/// A complete logical operation handed to the compiler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op: OpType,
    pub a: Tensor,
    pub b: Tensor,
    pub c: Tensor,
    #[serde(default)]
    pub conv: ConvParams,
    #[serde(default)]
    pub transpose_a: bool,
    #[serde(default)]
    pub transpose_b: bool,
    /// Raw value observed by reads outside the tensor bounds
    #[serde(default)]
    pub pad_value: u32,
}

impl Operation {
    pub fn fwd(x: Tensor, w: Tensor, y: Tensor, conv: ConvParams) -> Self {
        Self::build(OpType::Fwd, x, w, y, conv)
    }

    pub fn dedx(dy: Tensor, w: Tensor, dx: Tensor, conv: ConvParams) -> Self {
        Self::build(OpType::Dedx, dy, w, dx, conv)
    }

    pub fn dedw(x: Tensor, dy: Tensor, dw: Tensor, conv: ConvParams) -> Self {
        Self::build(OpType::Dedw, x, dy, dw, conv)
    }

    pub fn bgemm(a: Tensor, b: Tensor, c: Tensor, transpose_a: bool, transpose_b: bool) -> Self {
        let mut op = Self::build(OpType::Bgemm, a, b, c, ConvParams::default());
        op.transpose_a = transpose_a;
        op.transpose_b = transpose_b;
        op
    }

    pub fn dma(src: Tensor, dst: Tensor) -> Self {
        let b = Tensor::dense(&[1], src.dtype);
        Self::build(OpType::Dma, src, b, dst, ConvParams::default())
    }

    pub fn transpose(src: Tensor, dst: Tensor) -> Self {
        let b = Tensor::dense(&[1], src.dtype);
        Self::build(OpType::Transpose, src, b, dst, ConvParams::default())
    }

    fn build(op: OpType, a: Tensor, b: Tensor, c: Tensor, conv: ConvParams) -> Self {
        Self {
            op,
            a,
            b,
            c,
            conv,
            transpose_a: false,
            transpose_b: false,
            pad_value: 0,
        }
    }

    pub fn tensor(&self, operand: Operand) -> &Tensor {
        match operand {
            Operand::A => &self.a,
            Operand::B => &self.b,
            Operand::C => &self.c,
        }
    }

    pub fn is_transposed(&self, operand: Operand) -> bool {
        match (self.op, operand) {
            (OpType::Dedx, Operand::B) => true,
            (OpType::Dedw, Operand::A) => true,
            (OpType::Transpose, Operand::A) => true,
            (OpType::Bgemm, Operand::A) => self.transpose_a,
            (OpType::Bgemm, Operand::B) => self.transpose_b,
            _ => false,
        }
    }

    /// Filter extents (S, R, Q) taken from the weight tensor
    pub fn kernel(&self) -> [u64; MAX_CONV_DIMS] {
        let w = match self.op {
            OpType::Dedw => &self.c,
            _ => &self.b,
        };
        [w.sizes[2], w.sizes[3], w.sizes[4]]
    }

    /// Size of the reduction dimension of the whole operation
    pub fn common_dim(&self) -> u64 {
        match self.op {
            OpType::Fwd | OpType::Dedx => self.a.sizes[0],
            OpType::Dedw => self.b.sizes[1..MAX_DIMS].iter().product(),
            OpType::Bgemm => {
                if self.transpose_a {
                    self.a.sizes[1]
                } else {
                    self.a.sizes[0]
                }
            }
            OpType::Dma | OpType::Transpose => self.c.sizes[0],
        }
    }

    /// Check ranks, strides and shape agreement between operands
    pub fn validate(&self) -> DescResult<()> {
        for operand in Operand::ALL {
            if self.op.is_dma() && operand == Operand::B {
                continue;
            }
            let t = self.tensor(operand);
            if t.strides[0] != 1 {
                return Err(DescError::NonUnitLeadingStride {
                    operand: operand.to_string(),
                    stride: t.strides[0],
                });
            }
        }
        if self.a.dtype != self.b.dtype && !self.op.is_dma() {
            return Err(DescError::unsupported(format!(
                "mixed input datatypes {:?} and {:?}",
                self.a.dtype, self.b.dtype
            )));
        }

        if self.op.is_conv() {
            self.conv.validate()?;
        }

        let (a, b, c) = (&self.a.sizes, &self.b.sizes, &self.c.sizes);
        let mismatch = |what: &str| {
            DescError::unsupported(format!(
                "{} shape mismatch ({}): A={:?} B={:?} C={:?}",
                self.op, what, a, b, c
            ))
        };
        match self.op {
            OpType::Fwd => {
                if a[0] != b[1] || b[0] != c[0] || a[4] != c[4] {
                    return Err(mismatch("channels or batch"));
                }
                let kernel = self.kernel();
                for i in 0..MAX_CONV_DIMS {
                    if self.conv.out_size(i, a[1 + i], kernel[i]) != c[1 + i] {
                        return Err(mismatch("output spatial size"));
                    }
                }
            }
            OpType::Dedx => {
                if a[0] != b[0] || b[1] != c[0] || a[4] != c[4] {
                    return Err(mismatch("channels or batch"));
                }
                let kernel = self.kernel();
                for i in 0..MAX_CONV_DIMS {
                    if self.conv.out_size(i, c[1 + i], kernel[i]) != a[1 + i] {
                        return Err(mismatch("gradient spatial size"));
                    }
                }
            }
            OpType::Dedw => {
                if a[0] != c[1] || b[0] != c[0] || a[4] != b[4] {
                    return Err(mismatch("channels or batch"));
                }
                let kernel = self.kernel();
                for i in 0..MAX_CONV_DIMS {
                    if self.conv.out_size(i, a[1 + i], kernel[i]) != b[1 + i] {
                        return Err(mismatch("gradient spatial size"));
                    }
                }
            }
            OpType::Bgemm => {
                let (m, k_a) = if self.transpose_a { (a[0], a[1]) } else { (a[1], a[0]) };
                let (k_b, n) = if self.transpose_b { (b[0], b[1]) } else { (b[1], b[0]) };
                if k_a != k_b || c[0] != n || c[1] != m {
                    return Err(mismatch("matrix dims"));
                }
                for d in 2..MAX_DIMS {
                    let ok_a = a[d] == c[d] || a[d] == 1;
                    let ok_b = b[d] == c[d] || b[d] == 1;
                    if !ok_a || !ok_b {
                        return Err(mismatch("batch dims"));
                    }
                }
            }
            OpType::Dma => {
                if a != c {
                    return Err(mismatch("copy extents"));
                }
            }
            OpType::Transpose => {
                if a[0] != c[1] || a[1] != c[0] || a[2..] != c[2..] {
                    return Err(mismatch("transposed extents"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_strides() {
        let t = Tensor::dense(&[4, 5, 5, 1, 2], DataType::Bf16);
        assert_eq!(t.strides, [1, 4, 20, 100, 100]);
        assert_eq!(t.span(), 200);
    }

    #[test]
    fn test_from_dims() {
        let t = Tensor::from_dims(&[4, 3], &[1, 8], DataType::Fp16).unwrap();
        assert_eq!(t.sizes, [4, 3, 1, 1, 1]);
        assert_eq!(t.strides[..2], [1, 8]);
        assert_eq!(t.span(), 20);

        let err = Tensor::from_dims(&[1, 2, 3, 4, 5, 6], &[1; 6], DataType::Fp32);
        assert!(matches!(err, Err(DescError::RankMismatch { .. })));
        assert!(Tensor::from_dims(&[4, 3], &[1], DataType::Fp32).is_err());
    }

    #[test]
    fn test_out_size() {
        let conv = ConvParams::new([2, 1, 1], [1, 2, 1], [1, 0, 0]);
        // (7 + 2 - 3) / 2 + 1
        assert_eq!(conv.out_size(0, 7, 3), 4);
        // dilated 3-tap filter reaches 5 elements
        assert_eq!(conv.out_size(1, 5, 3), 1);
        assert_eq!(conv.out_size(1, 4, 3), 0);
    }

    #[test]
    fn test_fwd_validation() {
        let x = Tensor::dense(&[4, 5, 5, 1, 1], DataType::Fp32);
        let w = Tensor::dense(&[8, 4, 3, 3, 1], DataType::Fp32);
        let y = Tensor::dense(&[8, 3, 3, 1, 1], DataType::Fp32);
        let op = Operation::fwd(x.clone(), w.clone(), y, ConvParams::default());
        assert!(op.validate().is_ok());

        let bad_y = Tensor::dense(&[8, 4, 3, 1, 1], DataType::Fp32);
        let op = Operation::fwd(x, w, bad_y, ConvParams::default());
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_zero_stride_or_dilation_rejected() {
        let x = Tensor::dense(&[4, 5, 5, 1, 1], DataType::Fp32);
        let w = Tensor::dense(&[8, 4, 3, 3, 1], DataType::Fp32);
        let y = Tensor::dense(&[8, 3, 3, 1, 1], DataType::Fp32);
        for conv in [
            ConvParams::new([0, 1, 1], [1, 1, 1], [0, 0, 0]),
            ConvParams::new([1, 1, 1], [1, 0, 1], [0, 0, 0]),
        ] {
            let op = Operation::fwd(x.clone(), w.clone(), y.clone(), conv);
            assert!(matches!(op.validate(), Err(DescError::Unsupported { .. })));
        }
    }

    #[test]
    fn test_non_unit_leading_stride_rejected() {
        let mut x = Tensor::dense(&[4, 5], DataType::Fp32);
        x.strides[0] = 2;
        let op = Operation::dma(x.clone(), x);
        assert!(matches!(
            op.validate(),
            Err(DescError::NonUnitLeadingStride { .. })
        ));
    }
}
