//! Convolution configurators: forward, input gradient and weight gradient

use crate::params::{Operand, OperandSet, MAX_CONV_DIMS};
use crate::pattern::LoopAxis;

use super::{set_associated_dims_bgemm_dedw, AguSynthesizer};

const FILTER_AXES: [LoopAxis; MAX_CONV_DIMS] = [LoopAxis::S, LoopAxis::R, LoopAxis::Q];

impl AguSynthesizer<'_> {
    /// Forward, and input gradient of one residue class. Output rows carry
    /// the positions of the sub-problem; the input gradient reads its weights
    /// transposed and its class corrections place the rows and first tap.
    pub(crate) fn config_fwd_dedx(&mut self) {
        self.config_row_conv();
        set_associated_dims_fwd_dedx(self);
        self.set_spatial_loop_size();
    }

    /// Weight gradient: both inputs walk the output positions as common dim
    pub(crate) fn config_dedw(&mut self) {
        let p = &self.sub().params;
        let outer_base = self.recipe().cur_non_spatial().base as i64;

        let mut a = self.plan_for(Operand::A);
        for i in 0..MAX_CONV_DIMS {
            a.step_stride[1 + i] = p.a_step[i];
            a.base[1 + i] = p.a_base[i];
        }
        a.base[4] = outer_base;
        self.set_plan(Operand::A, a);

        let mut b = self.plan_for(Operand::B);
        b.base[4] = outer_base;
        self.set_plan(Operand::B, b);

        let c = self.plan_for(Operand::C);
        self.set_plan(Operand::C, c);

        set_associated_dims_bgemm_dedw(self);
        self.set_spatial_loop_size();
    }

    fn config_row_conv(&mut self) {
        let p = &self.sub().params;
        let outer_base = self.recipe().cur_non_spatial().base as i64;

        let mut a = self.plan_for(Operand::A);
        let mut c = self.plan_for(Operand::C);
        for i in 0..MAX_CONV_DIMS {
            a.step_stride[1 + i] = p.a_step[i];
            a.base[1 + i] = p.a_base[i];
            c.step_stride[1 + i] = p.out_step[i];
        }
        a.base[4] = outer_base;
        c.base[4] = outer_base;
        self.set_plan(Operand::A, a);
        self.set_plan(Operand::C, c);

        let b = self.plan_for(Operand::B);
        self.set_plan(Operand::B, b);
    }
}

/// Filter loops move the activations by the tap stride and the weights by
/// the tap step; the outer loop walks the batch of activations and output
pub fn set_associated_dims_fwd_dedx(syn: &mut AguSynthesizer<'_>) {
    let p = syn.sub().params.clone();
    for (i, axis) in FILTER_AXES.iter().enumerate() {
        syn.bind(
            *axis,
            p.taps[i],
            OperandSet::new(Some(1 + i), Some(2 + i), None),
            OperandSet::new(p.a_tap_stride[i], p.tap_step[i] as i64, 0),
        );
    }
    let batch = syn.recipe().cur_non_spatial().size;
    syn.bind(
        LoopAxis::O,
        batch,
        OperandSet::new(Some(4), None, Some(4)),
        OperandSet::new(1, 0, 1),
    );
}
