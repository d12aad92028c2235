//! Code generator for descriptor programs
//!
//! Drives one operation through the pipeline: sub-problem decomposition,
//! tiling, AGU synthesis and the chip writer.

use log::{debug, info};

use crate::agu::{common_dim_alignment, AguSynthesizer};
use crate::chip::ChipDescriptorWriter;
use crate::error::DescResult;
use crate::hardware::{Activation, ActivationKind, DescriptorProgram, TargetConfig};
use crate::params::Operation;
use crate::recipe::{Recipe, TilingPlanner};
use crate::subproblem::{describe_correction, SubProblem, SubProblemDecomposer};

/// Code generator for one target
pub struct CodeGenerator {
    target: TargetConfig,
    writer: Box<dyn ChipDescriptorWriter>,
    activation_counter: usize,
}

impl CodeGenerator {
    pub fn new(target: TargetConfig) -> Self {
        let writer = target.chip.writer();
        Self {
            target,
            writer,
            activation_counter: 0,
        }
    }

    /// Generate the descriptor program of an operation
    pub fn generate(&mut self, op: &Operation) -> DescResult<DescriptorProgram> {
        op.validate()?;
        self.target.strategy.validate(op.op)?;

        let mut program = DescriptorProgram::new(self.target.clone(), op.op);
        if op.c.num_elements() == 0 {
            info!("{}: empty output, nothing to generate", op.op);
            program.generate_summary();
            return Ok(program);
        }

        let strategy = self.target.strategy.clone();
        let dtype_alignment = self.writer.num_elements_for_common_dim_alignment(op.a.dtype, op);
        let alignment = common_dim_alignment(op, &strategy, dtype_alignment);
        let subs = SubProblemDecomposer::new(op, &strategy).decompose()?;
        program.num_sub_problems = subs.len();

        let planner = TilingPlanner::new(&strategy);
        for sub in subs.iter() {
            debug!(
                "sub-problem {}: taps {:?}, positions {:?}, correction [{}]",
                sub.ordering_key,
                sub.params.taps,
                sub.params.out_sizes,
                describe_correction(sub)
            );
            for recipe in planner.plan(op, sub, alignment)? {
                let activation = self.generate_activation(op, sub, recipe, dtype_alignment)?;
                program.add_activation(activation);
            }
        }

        info!(
            "{}: {} activation(s), {} descriptor(s) for {}",
            op.op,
            program.activations.len(),
            program.total_descriptors,
            self.target.chip
        );
        program.generate_summary();
        Ok(program)
    }

    /// Synthesize one activation and write a descriptor per core
    fn generate_activation(
        &mut self,
        op: &Operation,
        sub: &SubProblem,
        recipe: Recipe,
        dtype_alignment: u64,
    ) -> DescResult<Activation> {
        let strategy = &self.target.strategy;
        let agu = AguSynthesizer::new(op, strategy, sub, &recipe, dtype_alignment).synthesize()?;
        let descriptors = (0..strategy.geometry.num_cores())
            .map(|core| self.writer.configure_descriptor(op, &agu, core))
            .collect::<DescResult<Vec<_>>>()?;

        let kind = if agu.memset {
            ActivationKind::Memset
        } else if agu.reduction_add {
            ActivationKind::Accumulate
        } else {
            ActivationKind::Compute
        };
        let id = self.activation_counter;
        self.activation_counter += 1;

        Ok(Activation {
            id,
            sub_problem: sub.ordering_key,
            description: format!(
                "{} {:?}: rows [{}, +{}), dense [{}, +{}), cd [{}, +{})",
                op.op,
                kind,
                recipe.sp.base,
                recipe.sp.size,
                recipe.fcd.base,
                recipe.fcd.size,
                recipe.cd.base,
                recipe.cd.size
            ),
            kind,
            recipe,
            agu,
            descriptors,
        })
    }
}
