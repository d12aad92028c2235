//! Sub-problem decomposition
//!
//! Some convolutions cannot be expressed by one descriptor. The input
//! gradient of a strided convolution is the main case: every output
//! position only sees the filter taps congruent to it modulo the stride, so
//! the output is split into residue classes and each class becomes an
//! independent, unit-stride sub-problem.

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::error::{DescError, DescResult};
use crate::geometry::Strategy;
use crate::params::{ConvParams, OpType, Operand, OperandSet, Operation, MAX_CONV_DIMS, MAX_DIMS};

/// Parameters of one sub-problem, per filter dimension
///
/// Activation position of output step `j` and tap `t` is
/// `a_base + j * a_step + t * a_tap_stride`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubParams {
    /// Convolution parameters after adjustment
    pub conv: ConvParams,
    /// Filter taps walked by the loops
    pub taps: [u64; MAX_CONV_DIMS],
    /// Weight distance between consecutive taps
    pub tap_step: [u64; MAX_CONV_DIMS],
    pub a_base: [i64; MAX_CONV_DIMS],
    pub a_step: [u64; MAX_CONV_DIMS],
    pub a_tap_stride: [i64; MAX_CONV_DIMS],
    /// Spatial positions walked, and the output distance between them
    pub out_sizes: [u64; MAX_CONV_DIMS],
    pub out_step: [u64; MAX_CONV_DIMS],
}

impl SubParams {
    /// Plain convolution: `a = j * stride + t * dilation - padding`
    pub fn direct(conv: &ConvParams, kernel: [u64; MAX_CONV_DIMS], out_sizes: [u64; MAX_CONV_DIMS]) -> Self {
        let mut p = Self {
            conv: conv.clone(),
            taps: kernel,
            tap_step: [1; MAX_CONV_DIMS],
            a_base: [0; MAX_CONV_DIMS],
            a_step: [1; MAX_CONV_DIMS],
            a_tap_stride: [1; MAX_CONV_DIMS],
            out_sizes,
            out_step: [1; MAX_CONV_DIMS],
        };
        for i in 0..MAX_CONV_DIMS {
            p.a_base[i] = -(conv.padding[i] as i64);
            p.a_step[i] = conv.stride[i] as u64;
            p.a_tap_stride[i] = conv.dilation[i] as i64;
        }
        p
    }

    pub fn num_taps(&self) -> u64 {
        self.taps.iter().product()
    }

    pub fn num_positions(&self) -> u64 {
        self.out_sizes.iter().product()
    }
}

/// One independent descriptor-generation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubProblem {
    pub params: SubParams,
    /// Element offsets added to each operand's descriptor offsets
    pub offset_correction: OperandSet<[i64; MAX_DIMS]>,
    pub ordering_key: usize,
    /// Only zero-fills its output view
    pub is_memset_only: bool,
}

impl SubProblem {
    pub fn new(params: SubParams) -> Self {
        Self {
            params,
            offset_correction: OperandSet::default(),
            ordering_key: 0,
            is_memset_only: false,
        }
    }

    /// Produces only padding: no tap or no common dim to reduce over
    pub fn is_memset_desc(sub: &SubProblem, op: &Operation) -> bool {
        sub.is_memset_only || sub.params.num_taps() == 0 || op.common_dim() == 0
    }

    pub fn is_compute_desc(sub: &SubProblem, op: &Operation) -> bool {
        !Self::is_memset_desc(sub, op) && !Self::is_out_of_bounds(sub, op)
    }

    /// Every activation read of the sub-problem lands outside the tensor
    pub fn is_out_of_bounds(sub: &SubProblem, op: &Operation) -> bool {
        if !op.op.is_conv() || op.op == OpType::Dedw {
            return false;
        }
        let p = &sub.params;
        (0..MAX_CONV_DIMS).any(|i| {
            if p.out_sizes[i] == 0 || p.taps[i] == 0 {
                return false;
            }
            let last_step = (p.out_sizes[i] - 1) as i64 * p.a_step[i] as i64;
            let last_tap = (p.taps[i] - 1) as i64 * p.a_tap_stride[i];
            let lo = p.a_base[i] + last_tap.min(0);
            let hi = p.a_base[i] + last_step + last_tap.max(0);
            hi < 0 || lo >= op.a.sizes[1 + i] as i64
        })
    }
}

/// Ordered stack of sub-problems; the last pushed one is current
#[derive(Debug, Clone, Default)]
pub struct SubProblemContainer {
    items: Vec<SubProblem>,
}

impl SubProblemContainer {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Append the single sub-problem that covers the whole convolution
    pub fn create_conv_sub_problem(&mut self, op: &Operation) {
        let params = SubParams::direct(&op.conv, op.kernel(), spatial_positions(op));
        self.push(SubProblem::new(params));
    }

    pub fn push(&mut self, mut sub: SubProblem) {
        sub.ordering_key = self.items.len();
        self.items.push(sub);
    }

    pub fn pop(&mut self) -> Option<SubProblem> {
        self.items.pop()
    }

    pub fn current(&self) -> Option<&SubProblem> {
        self.items.last()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubProblem> {
        self.items.iter()
    }
}

/// Spatial positions walked by the rows or the common dim of a convolution
fn spatial_positions(op: &Operation) -> [u64; MAX_CONV_DIMS] {
    let t = match op.op {
        OpType::Fwd => &op.c,
        OpType::Dedx => &op.c,
        _ => &op.b,
    };
    [t.sizes[1], t.sizes[2], t.sizes[3]]
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Residue class of one filter dimension of an input-gradient convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DimClass {
    /// First output position and the distance between positions
    residue: u64,
    out_step: u64,
    out_size: u64,
    taps: u64,
    first_tap: u64,
    tap_step: u64,
    a_base: i64,
    a_tap_stride: i64,
}

impl DimClass {
    fn positions(residue: u64, out_step: u64, extent: u64) -> Self {
        Self {
            residue,
            out_step,
            out_size: if residue < extent {
                (extent - residue).div_ceil(out_step)
            } else {
                0
            },
            taps: 0,
            first_tap: 0,
            tap_step: 1,
            a_base: 0,
            a_tap_stride: -1,
        }
    }
}

/// Splits an operation into the sub-problems it needs
pub struct SubProblemDecomposer<'a> {
    op: &'a Operation,
    strategy: &'a Strategy,
}

impl<'a> SubProblemDecomposer<'a> {
    pub fn new(op: &'a Operation, strategy: &'a Strategy) -> Self {
        Self { op, strategy }
    }

    pub fn decompose(&self) -> DescResult<SubProblemContainer> {
        let mut subs = SubProblemContainer::new();

        if self.op.common_dim() == 0 {
            debug!("{}: empty common dimension, output is zero-filled", self.op.op);
            subs.push(self.whole_output_memset());
        } else if self.op.op == OpType::Dedx {
            self.decompose_dedx(&mut subs);
        } else if self.op.op.is_conv() {
            subs.create_conv_sub_problem(self.op);
        } else {
            let params = SubParams::direct(&ConvParams::default(), [1; MAX_CONV_DIMS], [1; MAX_CONV_DIMS]);
            subs.push(SubProblem::new(params));
        }

        if subs.is_empty() {
            return Err(DescError::NoSubProblems);
        }
        debug!("{}: {} sub-problem(s)", self.op.op, subs.len());
        Ok(subs)
    }

    fn whole_output_memset(&self) -> SubProblem {
        let mut params = SubParams::direct(&self.op.conv, [0; MAX_CONV_DIMS], [1; MAX_CONV_DIMS]);
        if matches!(self.op.op, OpType::Fwd | OpType::Dedx) {
            params.out_sizes = [self.op.c.sizes[1], self.op.c.sizes[2], self.op.c.sizes[3]];
        }
        let mut sub = SubProblem::new(params);
        sub.is_memset_only = true;
        sub
    }

    /// Output positions `residue + stride * j` of one dim and the taps that
    /// reach them. Taps are searched with stride and dilation divided by
    /// `g`, which requires `residue + pad` to be a multiple of `g`.
    fn dim_class(&self, dim: usize, residue: u64, g: u64) -> DimClass {
        let conv = &self.op.conv;
        let stride = conv.stride[dim] as u64 / g;
        let dilation = conv.dilation[dim] as u64 / g;
        let kernel = self.op.kernel()[dim];
        let mut class = DimClass::positions(residue, conv.stride[dim] as u64, self.op.c.sizes[1 + dim]);
        let target = residue as i64 + conv.padding[dim] as i64;
        if target.rem_euclid(g as i64) != 0 {
            return class;
        }
        let target = target / g as i64;

        let tap_step = stride / gcd(stride, dilation);
        class.tap_step = tap_step;
        class.a_tap_stride = -((tap_step * dilation / stride) as i64);
        let first = (0..kernel.min(tap_step)).find(|f| (target - (f * dilation) as i64).rem_euclid(stride as i64) == 0);
        if let Some(f0) = first {
            class.first_tap = f0;
            class.taps = (kernel - 1 - f0) / tap_step + 1;
            class.a_base = (target - (f0 * dilation) as i64).div_euclid(stride as i64);
        }
        class
    }

    fn decompose_dedx(&self, subs: &mut SubProblemContainer) {
        let mut all = if self.strategy.recurring_misalignment_opt {
            self.dedx_gcd_split()
        } else {
            let stride = self.op.conv.stride;
            let classes: Vec<Vec<DimClass>> = (0..MAX_CONV_DIMS)
                .map(|d| (0..stride[d] as u64).map(|r| self.dim_class(d, r, 1)).collect())
                .collect();
            self.dedx_combinations(&classes, true)
        };
        // residue order writes the output front to back
        all.sort_by_key(|s| residue_key(&s.offset_correction.c));
        for sub in all {
            subs.push(sub);
        }
    }

    /// Recurring misalignment: output positions whose `residue + pad` is not
    /// a multiple of `g = gcd(stride, dilation)` never meet a tap. Every such
    /// gcd residue becomes one memset over its whole lattice, and only the
    /// aligned lattice is split into the `stride / g` tap classes.
    fn dedx_gcd_split(&self) -> Vec<SubProblem> {
        let conv = &self.op.conv;
        let mut lattices = Vec::with_capacity(MAX_CONV_DIMS);
        let mut classes = Vec::with_capacity(MAX_CONV_DIMS);
        for d in 0..MAX_CONV_DIMS {
            let stride = conv.stride[d] as u64;
            let g = gcd(stride, conv.dilation[d] as u64);
            let extent = self.op.c.sizes[1 + d];
            let aligned = (-(conv.padding[d] as i64)).rem_euclid(g as i64) as u64;
            lattices.push(
                (0..g)
                    .map(|r| (r == aligned, DimClass::positions(r, g, extent)))
                    .collect::<Vec<_>>(),
            );
            classes.push(
                (0..stride / g)
                    .map(|k| self.dim_class(d, aligned + g * k, g))
                    .collect::<Vec<_>>(),
            );
        }

        let mut out = self.dedx_combinations(&classes, true);
        let memset_lattices: Vec<Vec<DimClass>> = lattices
            .iter()
            .map(|l| l.iter().map(|(_, c)| *c).collect())
            .collect();
        for sub in self.dedx_combinations(&memset_lattices, false) {
            let aligned_everywhere = (0..MAX_CONV_DIMS).all(|d| {
                let r = sub.offset_correction.c[1 + d] as u64;
                lattices[d].iter().any(|(aligned, c)| *aligned && c.residue == r)
            });
            if !aligned_everywhere {
                out.push(sub);
            }
        }
        debug!(
            "dedx: gcd split gives {} sub-problem(s), {} of them memset",
            out.len(),
            out.iter().filter(|s| s.is_memset_only).count()
        );
        out
    }

    /// One sub-problem per combination of per-dim classes. With `compute`
    /// unset every combination is a memset.
    fn dedx_combinations(&self, classes: &[Vec<DimClass>], compute: bool) -> Vec<SubProblem> {
        let mut out = Vec::new();
        for c2 in &classes[2] {
            for c1 in &classes[1] {
                for c0 in &classes[0] {
                    let dims = [*c0, *c1, *c2];
                    let residues = [c0.residue, c1.residue, c2.residue];
                    if dims.iter().any(|c| c.out_size == 0) {
                        trace!("dedx class {:?} has no output positions", residues);
                        continue;
                    }
                    let mut sub = self.dedx_class(&dims);
                    if !compute || !SubProblem::is_compute_desc(&sub, self.op) {
                        trace!("dedx class {:?} only writes padding", residues);
                        sub.is_memset_only = true;
                    }
                    out.push(sub);
                }
            }
        }
        out
    }

    fn dedx_class(&self, dims: &[DimClass; 3]) -> SubProblem {
        let mut conv = self.op.conv.clone();
        let mut params = SubParams::direct(&conv, [0; 3], [0; 3]);
        let mut correction = OperandSet::<[i64; MAX_DIMS]>::default();
        for i in 0..MAX_CONV_DIMS {
            let c = &dims[i];
            conv.stride[i] = 1;
            conv.dilation[i] = (-c.a_tap_stride) as u32;
            conv.padding[i] = -c.a_base as i32;
            params.taps[i] = c.taps;
            params.tap_step[i] = c.tap_step;
            params.a_base[i] = c.a_base;
            params.a_step[i] = 1;
            params.a_tap_stride[i] = c.a_tap_stride;
            params.out_sizes[i] = c.out_size;
            params.out_step[i] = c.out_step;
            correction.c[1 + i] = c.residue as i64;
            correction.b[2 + i] = c.first_tap as i64;
        }
        params.conv = conv;
        let mut sub = SubProblem::new(params);
        sub.offset_correction = correction;
        sub
    }
}

fn residue_key(c: &[i64; MAX_DIMS]) -> (i64, i64, i64) {
    (c[3], c[2], c[1])
}

/// Which operand a correction of the given dimension belongs to, for logging
pub fn describe_correction(sub: &SubProblem) -> String {
    Operand::ALL
        .iter()
        .filter(|o| sub.offset_correction[**o].iter().any(|v| *v != 0))
        .map(|o| format!("{}{:?}", o, sub.offset_correction[*o]))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::params::{DataType, Tensor};

    fn dedx_op(x: u64, k: u64, stride: u32, dilation: u32, pad: i32) -> Operation {
        let conv = ConvParams::new([stride, 1, 1], [dilation, 1, 1], [pad, 0, 0]);
        let y = conv.out_size(0, x, k);
        let dy = Tensor::dense(&[2, y, 1, 1, 1], DataType::Fp32);
        let w = Tensor::dense(&[2, 3, k, 1, 1], DataType::Fp32);
        let dx = Tensor::dense(&[3, x, 1, 1, 1], DataType::Fp32);
        Operation::dedx(dy, w, dx, conv)
    }

    fn strategy() -> Strategy {
        Strategy::new(Geometry::single(8, 8))
    }

    #[test]
    fn test_stack_order() {
        let mut subs = SubProblemContainer::new();
        let p = SubParams::direct(&ConvParams::default(), [1; 3], [1; 3]);
        subs.push(SubProblem::new(p.clone()));
        subs.push(SubProblem::new(p));
        assert_eq!(subs.current().map(|s| s.ordering_key), Some(1));
        subs.pop();
        assert_eq!(subs.current().map(|s| s.ordering_key), Some(0));
        subs.pop();
        assert!(subs.current().is_none());
        assert!(subs.pop().is_none());
    }

    #[test]
    fn test_unit_stride_dedx_is_single() {
        let op = dedx_op(6, 3, 1, 1, 1);
        let s = strategy();
        let subs = SubProblemDecomposer::new(&op, &s).decompose().unwrap();
        assert_eq!(subs.len(), 1);
        let sub = subs.current().unwrap();
        assert_eq!(sub.params.taps[0], 3);
        assert_eq!(sub.params.a_base[0], 1);
        assert_eq!(sub.params.a_tap_stride[0], -1);
    }

    #[test]
    fn test_strided_dedx_classes() {
        // stride 2, kernel 3: even outputs see taps 0 and 2, odd outputs tap 1
        let op = dedx_op(7, 3, 2, 1, 0);
        let s = strategy();
        let subs = SubProblemDecomposer::new(&op, &s).decompose().unwrap();
        assert_eq!(subs.len(), 2);
        let classes: Vec<&SubProblem> = subs.iter().collect();
        assert_eq!(classes[0].offset_correction.c[1], 0);
        assert_eq!(classes[0].params.taps[0], 2);
        assert_eq!(classes[0].params.out_sizes[0], 4);
        assert_eq!(classes[1].offset_correction.c[1], 1);
        assert_eq!(classes[1].params.taps[0], 1);
        assert_eq!(classes[1].offset_correction.b[2], 1);
        assert_eq!(classes[1].params.out_sizes[0], 3);
        let covered: u64 = classes.iter().map(|c| c.params.num_positions()).sum();
        assert_eq!(covered, 7);
    }

    #[test]
    fn test_tapless_classes_become_memset() {
        // stride 2, dilation 2: odd outputs never meet a tap
        let op = dedx_op(8, 2, 2, 2, 0);
        let s = strategy();
        let subs = SubProblemDecomposer::new(&op, &s).decompose().unwrap();
        assert_eq!(subs.len(), 2);
        let memsets: Vec<&SubProblem> = subs.iter().filter(|s| s.is_memset_only).collect();
        assert_eq!(memsets.len(), 1);
        assert_eq!(memsets[0].offset_correction.c[1], 1);
    }

    #[test]
    fn test_gcd_split_memsets_whole_lattices() {
        // stride 4, dilation 2: odd outputs are off the gcd lattice
        let op = dedx_op(9, 3, 4, 2, 0);
        let plain = SubProblemDecomposer::new(&op, &strategy()).decompose().unwrap();
        assert_eq!(plain.len(), 4);
        assert_eq!(plain.iter().filter(|s| s.is_memset_only).count(), 2);

        let mut s = strategy();
        s.recurring_misalignment_opt = true;
        let split = SubProblemDecomposer::new(&op, &s).decompose().unwrap();
        let all: Vec<&SubProblem> = split.iter().collect();
        assert_eq!(all.len(), 3);
        assert!(all[1].is_memset_only);
        assert_eq!(all[1].offset_correction.c[1], 1);
        assert_eq!(all[1].params.out_step[0], 2);
        assert_eq!(all[1].params.out_sizes[0], 4);

        // tap classes come out identical either way
        let compute = |subs: &SubProblemContainer| -> Vec<(SubParams, OperandSet<[i64; MAX_DIMS]>)> {
            subs.iter()
                .filter(|s| !s.is_memset_only)
                .map(|s| (s.params.clone(), s.offset_correction.clone()))
                .collect()
        };
        assert_eq!(compute(&plain), compute(&split));
        assert_eq!(all[2].params.taps[0], 1);
        assert_eq!(all[2].offset_correction.b[2], 1);
    }

    #[test]
    fn test_gcd_split_without_common_divisor_matches_plain() {
        let op = dedx_op(7, 3, 2, 1, 0);
        let mut s = strategy();
        s.recurring_misalignment_opt = true;
        let split = SubProblemDecomposer::new(&op, &s).decompose().unwrap();
        let plain = SubProblemDecomposer::new(&op, &strategy()).decompose().unwrap();
        let split: Vec<&SubProblem> = split.iter().collect();
        let plain: Vec<&SubProblem> = plain.iter().collect();
        assert_eq!(split, plain);
    }

    #[test]
    fn test_empty_common_dim_is_memset() {
        let a = Tensor::dense(&[0, 4, 1], DataType::Bf16);
        let b = Tensor::dense(&[5, 0, 1], DataType::Bf16);
        let c = Tensor::dense(&[5, 4, 1], DataType::Bf16);
        let op = Operation::bgemm(a, b, c, false, false);
        let s = strategy();
        let subs = SubProblemDecomposer::new(&op, &s).decompose().unwrap();
        assert_eq!(subs.len(), 1);
        assert!(SubProblem::is_memset_desc(subs.current().unwrap(), &op));
    }

    #[test]
    fn test_out_of_bounds_detection() {
        let op = dedx_op(6, 3, 1, 1, 1);
        let mut sub = SubProblem::new(SubParams::direct(&op.conv, [3, 1, 1], [6, 1, 1]));
        assert!(!SubProblem::is_out_of_bounds(&sub, &op));
        sub.params.a_base[0] = 50;
        assert!(SubProblem::is_out_of_bounds(&sub, &op));
    }
}
