//! Batched GEMM and data-movement configurators

use crate::params::{OpType, Operand, OperandSet};
use crate::pattern::LoopAxis;

use super::AguSynthesizer;

/// Batch dims 2, 3 and 4 ride on the three filter loop slots
const BATCH_AXES: [LoopAxis; 3] = [LoopAxis::S, LoopAxis::R, LoopAxis::Q];

impl AguSynthesizer<'_> {
    /// Each operand walks rows, dense elements or the common dim as its
    /// transpose flag decides; see [`super::walk`]
    pub(crate) fn config_bgemm(&mut self) {
        for operand in Operand::ALL {
            let plan = self.plan_for(operand);
            self.set_plan(operand, plan);
        }
        set_associated_dims_bgemm_dedw(self);
        self.set_spatial_loop_size();
    }

    /// Copy and transpose: the source walks the destination's rows, on its
    /// steps for a copy and on its fastest dim for a transpose
    pub(crate) fn config_dma_transpose(&mut self) {
        let a = self.plan_for(Operand::A);
        let c = self.plan_for(Operand::C);
        self.set_plan(Operand::A, a);
        self.set_plan(Operand::C, c);
        set_associated_dims_dma(self);
        self.set_spatial_loop_size();
    }
}

/// Weight gradient: filter loops walk the activations by the dilation and the
/// weight gradient by one tap, the outer loop reduces over the batch.
///
/// Batched GEMM: the filter loop slots walk batch dims 2.., skipping the
/// operands broadcast along them. With batch concurrency the dim-2 loop runs
/// `ceil(b2 / ports)` times.
pub fn set_associated_dims_bgemm_dedw(syn: &mut AguSynthesizer<'_>) {
    let op = syn.op();
    if op.op == OpType::Dedw {
        let p = syn.sub().params.clone();
        let kernel = op.kernel();
        let memset = syn.is_memset();
        for (i, axis) in BATCH_AXES.iter().enumerate() {
            let size = if memset { kernel[i] } else { p.taps[i] };
            syn.bind(
                *axis,
                size,
                OperandSet::new(Some(1 + i), None, Some(2 + i)),
                OperandSet::new(p.a_tap_stride[i], 0, 1),
            );
        }
        let batch = syn.recipe().cur_non_spatial().size;
        syn.bind(
            LoopAxis::O,
            batch,
            OperandSet::new(Some(4), Some(4), None),
            OperandSet::new(1, 1, 0),
        );
        return;
    }

    let strategy = syn.strategy();
    let bp = strategy.batch_ports(op.op) as u64;
    for (i, axis) in BATCH_AXES.iter().enumerate() {
        let dim = 2 + i;
        let mut size = op.c.sizes[dim];
        if i == 0 {
            size = size.div_ceil(bp);
        }
        let moves = |operand: Operand| (!strategy.is_operand_broadcasted(op, operand, dim)).then_some(dim);
        syn.bind(
            *axis,
            size,
            OperandSet::new(moves(Operand::A), moves(Operand::B), Some(dim)),
            OperandSet::new(1, 1, 1),
        );
    }
    syn.bind(LoopAxis::O, 1, OperandSet::new(None, None, None), OperandSet::new(0, 0, 0));
}

/// Data movement: source and destination walk batch dims 2.. together
pub fn set_associated_dims_dma(syn: &mut AguSynthesizer<'_>) {
    let op = syn.op();
    for (i, axis) in BATCH_AXES.iter().enumerate() {
        let dim = 2 + i;
        syn.bind(
            *axis,
            op.c.sizes[dim],
            OperandSet::new(Some(dim), None, Some(dim)),
            OperandSet::new(1, 0, 1),
        );
    }
    syn.bind(LoopAxis::O, 1, OperandSet::new(None, None, None), OperandSet::new(0, 0, 0));
}

#[cfg(test)]
mod tests {
    use crate::agu::AguSynthesizer;
    use crate::attr::LoopSlot;
    use crate::geometry::{Geometry, Strategy};
    use crate::params::{DataType, Operation, Tensor};
    use crate::recipe::TilingPlanner;
    use crate::subproblem::SubProblemDecomposer;

    #[test]
    fn test_bgemm_batch_concurrency() {
        // A is broadcast along dim 2
        let a = Tensor::dense(&[4, 6, 1], DataType::Bf16);
        let b = Tensor::dense(&[8, 4, 5], DataType::Bf16);
        let c = Tensor::dense(&[8, 6, 5], DataType::Bf16);
        let op = Operation::bgemm(a, b, c, false, false);
        let mut strategy = Strategy::new(Geometry::single(8, 8));
        strategy.batch_concurrency = 2;
        let subs = SubProblemDecomposer::new(&op, &strategy).decompose().unwrap();
        let sub = subs.current().unwrap();
        let recipes = TilingPlanner::new(&strategy).plan(&op, sub, 1).unwrap();
        let cfg = AguSynthesizer::new(&op, &strategy, sub, &recipes[0], 1)
            .synthesize()
            .unwrap();

        let batch = cfg.loops.slot(LoopSlot::Conv0);
        assert_eq!(batch.size(), 3);
        assert_eq!(batch.dims.a, None);
        assert_eq!(batch.dims.b, Some(2));
        // dim-2 stride of C is two batches in address units
        assert_eq!(cfg.attrs[0].c.loop_stride[2], 2 * 48);
        assert_eq!(cfg.attrs[0].a.loop_stride[2], 0);
        assert_eq!(cfg.grids.c.num_valid(), 2);
    }

    #[test]
    fn test_dma_leaves_b_unused() {
        let src = Tensor::dense(&[16, 3, 2], DataType::Fp32);
        let op = Operation::dma(src.clone(), src);
        let strategy = Strategy::new(Geometry::single(8, 4));
        let subs = SubProblemDecomposer::new(&op, &strategy).decompose().unwrap();
        let sub = subs.current().unwrap();
        let recipes = TilingPlanner::new(&strategy).plan(&op, sub, 1).unwrap();
        assert_eq!(recipes.len(), 2);
        let cfg = AguSynthesizer::new(&op, &strategy, sub, &recipes[1], 1)
            .synthesize()
            .unwrap();
        assert_eq!(cfg.grids.b.num_valid(), 0);
        assert_eq!(cfg.grids.c.num_valid(), 1);
        // second dense window starts at element 8
        let cell = cfg.grids.c.get(cfg.grids.c.core_indices(0)[0]);
        assert_eq!(cell.offsets[0], 8);
        assert!(!cfg.memset);
    }
}
