//! AGU attribute synthesis
//!
//! Turns one sub-problem and one tiling recipe into the chip-independent
//! attributes of a descriptor: per-core operand attributes, per-port
//! offsets and loop bindings.
//!
//! Every operand is walked as *steps* over its dims 1.. times a vector of
//! elements on its fastest dim. Which matrix axis each of the two carries
//! depends on the operation family and the transpose flags, see [`walk`].
//!
//! The synthesizer works in element units until [`AguSynthesizer::synthesize`]
//! scales everything by the tensor strides as its last step.

mod conv;
mod gemm;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::attr::{LoopBindings, OperandAttr, PortGrid, PortIndex, PortOffsets};
use crate::error::{DescError, DescResult};
use crate::geometry::{Lane, Strategy};
use crate::params::{OpType, Operand, OperandSet, Operation, MAX_DIMS};
use crate::pattern::{pattern_masks, LoopAxis, PatternMasks};
use crate::recipe::{Recipe, View};
use crate::subproblem::SubProblem;

pub use conv::set_associated_dims_fwd_dedx;
pub use gemm::{set_associated_dims_bgemm_dedw, set_associated_dims_dma};

/// Matrix axis carried by one side of an operand's walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalkAxis {
    /// Output rows, split over cores and spatial ports
    Rows,
    /// Output dense axis, split over cores and FCD ports
    Dense,
    /// Common (reduction) dim
    Cd,
}

/// Axes carried by an operand's fastest dim and by its steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Walk {
    pub fcd: WalkAxis,
    pub steps: WalkAxis,
}

pub fn walk(op: &Operation, operand: Operand) -> Walk {
    let transposed = op.is_transposed(operand);
    match operand {
        Operand::A if transposed => Walk {
            fcd: WalkAxis::Rows,
            steps: WalkAxis::Cd,
        },
        Operand::A => Walk {
            fcd: WalkAxis::Cd,
            steps: WalkAxis::Rows,
        },
        Operand::B if transposed => Walk {
            fcd: WalkAxis::Cd,
            steps: WalkAxis::Dense,
        },
        Operand::B => Walk {
            fcd: WalkAxis::Dense,
            steps: WalkAxis::Cd,
        },
        Operand::C => Walk {
            fcd: WalkAxis::Dense,
            steps: WalkAxis::Rows,
        },
    }
}

/// Whether per-port offsets are ROI-relative (added to the start) for an
/// operand. When they are not, ports add their offsets to the base and
/// descriptor corrections go to the start instead.
pub fn is_port_start_offset(op: &Operation, operand: Operand) -> bool {
    operand != Operand::B || op.is_transposed(Operand::B) || op.op == OpType::Dedw
}

/// Raw value out-of-range reads of A observe
///
/// Only the activations of fwd and dedw are spatially padded. B reads zero
/// outside its valid elements, so padded common-dim elements add nothing to
/// a product whatever A reads there.
pub fn pad_value(op: &Operation) -> u32 {
    match op.op {
        OpType::Fwd | OpType::Dedw => op.pad_value,
        _ => 0,
    }
}

/// Elements a unit walks on a split axis
///
/// `working_set` elements are shared out, the unit owns `lane.offset +
/// k * lane.stride` and holds at most `step` of them. A unit past the end of
/// the working set still reports one step; callers mark it invalid.
pub fn calc_last_step_size(working_set: u64, step: u64, lane: Lane) -> u64 {
    if lane.offset >= working_set {
        return 1;
    }
    let remaining = (working_set - lane.offset).div_ceil(lane.stride.max(1));
    step.min(remaining)
}

/// Round a common dim up to `max(readers, dtype_alignment) * concurrency`
pub fn padded_common_dim(size: u64, readers: u64, dtype_alignment: u64, concurrency: u64) -> u64 {
    let unit = readers.max(dtype_alignment).max(1) * concurrency.max(1);
    size.div_ceil(unit) * unit
}

/// Alignment every non-final common-dim window must honor
pub fn common_dim_alignment(op: &Operation, strategy: &Strategy, dtype_alignment: u64) -> u64 {
    if op.op.is_dma() {
        return 1;
    }
    padded_common_dim(1, 1, dtype_alignment, strategy.cd_ports(op.op) as u64)
}

/// Step and FCD element counts of one port, derived from its core's counts
pub fn port_counts(
    strategy: &Strategy,
    op: &Operation,
    operand: Operand,
    core_attr: &OperandAttr,
    idx: PortIndex,
) -> (u64, u64) {
    let w = walk(op, operand);
    let count = |axis: WalkAxis, core_count: u64| {
        let geo = &strategy.geometry;
        match axis {
            WalkAxis::Rows => calc_last_step_size(
                core_count,
                geo.port_height,
                geo.port_row_lane(idx.sp, strategy.effective_interleave(op)),
            ),
            WalkAxis::Dense => calc_last_step_size(core_count, geo.port_width, geo.port_dense_lane(idx.fcd)),
            WalkAxis::Cd => core_count,
        }
    };
    (
        count(w.steps, core_attr.last_spatial_step),
        count(w.fcd, core_attr.last_fcd_step),
    )
}

/// Chip-independent attributes of one descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmeAguConfig {
    pub op: OpType,
    /// Operand attributes per core, in address units
    pub attrs: Vec<OperandSet<OperandAttr>>,
    pub grids: OperandSet<PortGrid>,
    pub loops: LoopBindings,
    /// Slot masks of the loop axes
    pub masks: [u8; 4],
    /// Loop slots each operand moves on
    pub move_masks: OperandSet<u8>,
    pub padded_cd: u64,
    /// Value A observes outside its valid elements
    pub pad_value: u32,
    pub memset: bool,
    /// Add to the output instead of overwriting it
    pub reduction_add: bool,
}

/// Element-unit walk of one operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OperandPlan {
    /// Dim 0: FCD elements of the region; dims 1..: ROI extents in steps
    pub extents: [u64; MAX_DIMS],
    pub step_stride: [u64; MAX_DIMS],
    pub base: [i64; MAX_DIMS],
}

impl OperandPlan {
    pub fn new() -> Self {
        Self {
            extents: [1; MAX_DIMS],
            step_stride: [1; MAX_DIMS],
            base: [0; MAX_DIMS],
        }
    }
}

/// Builds the attributes of one descriptor
pub struct AguSynthesizer<'a> {
    op: &'a Operation,
    strategy: &'a Strategy,
    sub: &'a SubProblem,
    recipe: &'a Recipe,
    dtype_alignment: u64,
    masks: PatternMasks,
    padded_cd: u64,
    attr: OperandSet<OperandAttr>,
    plans: OperandSet<OperandPlan>,
    grids: OperandSet<PortGrid>,
    loops: LoopBindings,
}

impl<'a> AguSynthesizer<'a> {
    pub fn new(
        op: &'a Operation,
        strategy: &'a Strategy,
        sub: &'a SubProblem,
        recipe: &'a Recipe,
        dtype_alignment: u64,
    ) -> Self {
        let grids = OperandSet::new(
            PortGrid::new(strategy.grid_shape(op.op, Operand::A)),
            PortGrid::new(strategy.grid_shape(op.op, Operand::B)),
            PortGrid::new(strategy.grid_shape(op.op, Operand::C)),
        );
        Self {
            op,
            strategy,
            sub,
            recipe,
            dtype_alignment,
            masks: strategy.pattern.masks(),
            padded_cd: 0,
            attr: OperandSet::default(),
            plans: OperandSet::new(OperandPlan::new(), OperandPlan::new(), OperandPlan::new()),
            grids,
            loops: LoopBindings::default(),
        }
    }

    pub fn is_memset(&self) -> bool {
        SubProblem::is_memset_desc(self.sub, self.op)
    }

    /// Operands the descriptor reads or writes
    pub fn is_active(&self, operand: Operand) -> bool {
        match operand {
            Operand::C => true,
            Operand::A => !self.is_memset(),
            Operand::B => !self.is_memset() && !self.op.op.is_dma(),
        }
    }

    /// Common-dim window of the recipe rounded up for the readers
    pub fn get_padded_common_dim(&self) -> DescResult<u64> {
        let window = self.recipe.cd.size;
        if self.op.op.is_dma() || window == 0 {
            return Ok(window);
        }
        let alignment = common_dim_alignment(self.op, self.strategy, self.dtype_alignment);
        if !self.recipe.is_last_partial() && window % alignment != 0 {
            return Err(DescError::MisalignedCommonDim {
                size: window,
                alignment,
            });
        }
        let cdp = self.strategy.cd_ports(self.op.op) as u64;
        Ok(padded_common_dim(window, 1, self.dtype_alignment, cdp))
    }

    /// Run every synthesis stage
    pub fn synthesize(mut self) -> DescResult<MmeAguConfig> {
        self.strategy.validate(self.op.op)?;
        self.masks = pattern_masks(self.strategy.pattern)?;
        self.padded_cd = self.get_padded_common_dim()?;

        match self.op.op {
            OpType::Fwd | OpType::Dedx => self.config_fwd_dedx(),
            OpType::Dedw => self.config_dedw(),
            OpType::Bgemm => self.config_bgemm(),
            OpType::Dma | OpType::Transpose => self.config_dma_transpose(),
        }
        for operand in Operand::ALL {
            if self.is_active(operand) {
                self.apply_plan(operand);
                self.set_port_offsets(operand);
            } else {
                self.attr[operand] = OperandAttr::default();
                self.invalidate_ports(operand);
            }
        }
        self.multiply_strides();
        self.finalize_sizes();
        let attrs = self.core_attrs();

        let move_masks = self.move_masks();
        let memset = self.is_memset();
        debug!(
            "{} sub-problem {}: cd {} padded to {}, {} loop iteration(s){}",
            self.op.op,
            self.sub.ordering_key,
            self.recipe.cd.size,
            self.padded_cd,
            self.loops.iterations(),
            if memset { ", memset" } else { "" }
        );
        Ok(MmeAguConfig {
            op: self.op.op,
            attrs,
            grids: self.grids,
            loops: self.loops,
            masks: [
                self.masks.filter[0],
                self.masks.filter[1],
                self.masks.filter[2],
                self.masks.outer,
            ],
            move_masks,
            padded_cd: self.padded_cd,
            pad_value: pad_value(self.op),
            memset,
            reduction_add: !memset && !self.recipe.first_partial,
        })
    }

    fn window(&self, axis: WalkAxis) -> View {
        match axis {
            WalkAxis::Rows => self.recipe.cur_sp(),
            WalkAxis::Dense => self.recipe.cur_fcd(),
            WalkAxis::Cd => View::new(self.recipe.cd.base, self.padded_cd),
        }
    }

    /// Elements of an axis held by a core, and whether the core holds any
    fn core_count(&self, axis: WalkAxis, core: usize) -> (u64, bool) {
        let geo = &self.strategy.geometry;
        match axis {
            WalkAxis::Rows => {
                let lane = geo.core_row_lane(core, self.strategy.effective_interleave(self.op));
                let size = self.recipe.sp.size;
                (calc_last_step_size(size, geo.core_height(), lane), lane.offset < size)
            }
            WalkAxis::Dense => {
                let lane = geo.core_dense_lane(core);
                let size = self.recipe.fcd.size;
                (calc_last_step_size(size, geo.core_width(), lane), lane.offset < size)
            }
            WalkAxis::Cd => {
                let cdp = self.strategy.cd_ports(self.op.op) as u64;
                ((self.padded_cd / cdp).max(1), self.padded_cd > 0)
            }
        }
    }

    /// Window-relative first element a port owns on an axis
    fn port_axis_offset(&self, axis: WalkAxis, idx: PortIndex) -> Option<u64> {
        let geo = &self.strategy.geometry;
        let (core_count, core_valid) = self.core_count(axis, idx.core);
        if !core_valid {
            return None;
        }
        let (core_lane, port_lane) = match axis {
            WalkAxis::Rows => {
                let il = self.strategy.effective_interleave(self.op);
                (geo.core_row_lane(idx.core, il), geo.port_row_lane(idx.sp, il))
            }
            WalkAxis::Dense => (geo.core_dense_lane(idx.core), geo.port_dense_lane(idx.fcd)),
            // cd port j starts at step j
            WalkAxis::Cd => return Some(idx.cd as u64),
        };
        if port_lane.offset >= core_count {
            return None;
        }
        Some(core_lane.offset + port_lane.offset * core_lane.stride)
    }

    fn apply_plan(&mut self, operand: Operand) {
        let plan = self.plans[operand];
        let tensor = self.op.tensor(operand);
        let attr = &mut self.attr[operand];
        attr.roi_size[0] = plan.extents[0];
        attr.spatial_strides[0] = 1;
        for d in 1..MAX_DIMS {
            attr.roi_size[d] = plan.extents[d].max(1) * plan.step_stride[d];
            attr.spatial_strides[d] = plan.step_stride[d];
        }
        attr.valid_elements = tensor.sizes;
        attr.base_offset = plan.base;
        attr.start_offset = [0; MAX_DIMS];
    }

    /// Dim an operand's batch ports are spread over, when there are several
    /// and the operand is not broadcast along it
    fn batch_port_dim(&self, operand: Operand) -> Option<usize> {
        if self.strategy.batch_ports(self.op.op) <= 1 {
            return None;
        }
        let dim = self.strategy.concurrent_dim(self.op.op)?;
        (!self.strategy.is_operand_broadcasted(self.op, operand, dim)).then_some(dim)
    }

    /// Fill the port grid of an operand
    pub fn set_port_offsets(&mut self, operand: Operand) {
        let w = walk(self.op, operand);
        let plan = self.plans[operand];
        let batch_ports = self.strategy.batch_ports(self.op.op);
        let batch_dim = self.batch_port_dim(operand);
        let batch_extent = self
            .strategy
            .concurrent_dim(self.op.op)
            .map_or(1, |d| self.op.c.sizes[d]);

        for idx in self.grids[operand].indices() {
            let fcd = self.port_axis_offset(w.fcd, idx);
            let steps = self.port_axis_offset(w.steps, idx);
            let (Some(fcd), Some(steps)) = (fcd, steps) else {
                *self.grids[operand].get_mut(idx) = PortOffsets::invalid();
                continue;
            };
            if batch_ports > 1 && idx.batch as u64 >= batch_extent {
                *self.grids[operand].get_mut(idx) = PortOffsets::invalid();
                continue;
            }

            let mut cell = PortOffsets::zero();
            cell.offsets[0] = (self.window(w.fcd).base + fcd) as i64;
            let flat = self.window(w.steps).base + steps;
            let pos = match w.steps {
                WalkAxis::Rows => self.recipe.calc_sp_pos(flat),
                WalkAxis::Cd => self.recipe.calc_cd_pos(flat),
                WalkAxis::Dense => [0, flat, 0, 0, 0],
            };
            for d in 1..MAX_DIMS {
                cell.offsets[d] = (pos[d] * plan.step_stride[d]) as i64;
            }
            if let Some(d) = batch_dim {
                cell.offsets[d] += (idx.batch as u64 * plan.step_stride[d]) as i64;
            }
            trace!("{} port {:?}: {:?}", operand, idx, cell.offsets);
            *self.grids[operand].get_mut(idx) = cell;
        }
    }

    fn invalidate_ports(&mut self, operand: Operand) {
        for idx in self.grids[operand].indices() {
            *self.grids[operand].get_mut(idx) = PortOffsets::invalid();
        }
    }

    /// Scale step strides by the number of units sharing an axis
    pub fn multiply_strides(&mut self) {
        let geo = &self.strategy.geometry;
        let il = self.strategy.effective_interleave(self.op);
        let row_stride = geo.core_row_lane(0, il).stride * geo.port_row_lane(0, il).stride;
        let cdp = self.strategy.cd_ports(self.op.op) as u64;
        let bp = self.strategy.batch_ports(self.op.op) as i64;

        for operand in Operand::ALL {
            if !self.is_active(operand) {
                continue;
            }
            let w = walk(self.op, operand);
            match w.steps {
                WalkAxis::Rows => self.attr[operand].spatial_strides[1] *= row_stride,
                WalkAxis::Cd => self.attr[operand].spatial_strides[1] *= cdp,
                WalkAxis::Dense => {}
            }
            if let Some(d) = self.batch_port_dim(operand) {
                self.attr[operand].loop_stride[d] *= bp;
            }
        }
    }

    /// Convert every size and offset to address units
    pub fn finalize_sizes(&mut self) {
        for operand in Operand::ALL {
            if !self.is_active(operand) {
                continue;
            }
            let strides = self.op.tensor(operand).strides;
            let attr = &mut self.attr[operand];
            for d in 0..MAX_DIMS {
                let s = strides[d];
                attr.roi_size[d] *= s;
                attr.valid_elements[d] *= s;
                attr.spatial_strides[d] *= s;
                attr.loop_stride[d] *= s as i64;
                attr.base_offset[d] *= s as i64;
                attr.start_offset[d] *= s as i64;
            }
            for idx in self.grids[operand].indices() {
                let cell = self.grids[operand].get_mut(idx);
                if cell.valid {
                    for d in 0..MAX_DIMS {
                        cell.offsets[d] *= strides[d] as i64;
                    }
                }
            }
            self.fix_desc_offsets(operand);
        }
    }

    /// Apply the sub-problem's offset correction of an operand
    fn fix_desc_offsets(&mut self, operand: Operand) {
        let correction = self.sub.offset_correction[operand];
        if correction.iter().all(|c| *c == 0) {
            return;
        }
        let strides = self.op.tensor(operand).strides;
        let to_base = is_port_start_offset(self.op, operand);
        let attr = &mut self.attr[operand];
        for d in 0..MAX_DIMS {
            let v = correction[d] * strides[d] as i64;
            if to_base {
                attr.base_offset[d] += v;
            } else {
                attr.start_offset[d] += v;
            }
        }
    }

    /// Per-core copies carrying each core's valid step counts
    fn core_attrs(&self) -> Vec<OperandSet<OperandAttr>> {
        (0..self.strategy.geometry.num_cores())
            .map(|core| {
                self.attr.map(|operand, attr| {
                    let mut attr = attr.clone();
                    if self.is_active(operand) {
                        let w = walk(self.op, operand);
                        attr.last_spatial_step = self.core_count(w.steps, core).0;
                        attr.last_fcd_step = self.core_count(w.fcd, core).0;
                    }
                    attr
                })
            })
            .collect()
    }

    fn move_masks(&self) -> OperandSet<u8> {
        let mut masks = OperandSet::new(0u8, 0u8, 0u8);
        for slot in crate::attr::LoopSlot::ALL {
            let binding = self.loops.slot(slot);
            for operand in Operand::ALL {
                if binding.dims[operand].is_some() {
                    masks[operand] |= 1 << slot.index();
                }
            }
        }
        masks
    }

    /// Bind one loop axis to its slot
    pub(crate) fn bind(&mut self, axis: LoopAxis, size: u64, dims: OperandSet<Option<usize>>, strides: OperandSet<i64>) {
        let slot = self.masks.slot(axis);
        let binding = self.loops.slot_mut(slot);
        binding.size_minus1 = size.saturating_sub(1);
        binding.dims = dims.clone();
        for operand in Operand::ALL {
            if !self.is_active(operand) {
                self.loops.slot_mut(slot).dims[operand] = None;
                continue;
            }
            if let Some(d) = dims[operand] {
                self.attr[operand].loop_stride[d] = strides[operand];
            }
        }
    }

    /// Step capacity of one port, over every active operand
    pub(crate) fn set_spatial_loop_size(&mut self) {
        let geo = &self.strategy.geometry;
        let cdp = self.strategy.cd_ports(self.op.op) as u64;
        let steps = Operand::ALL
            .iter()
            .filter(|o| self.is_active(**o))
            .map(|o| match walk(self.op, *o).steps {
                WalkAxis::Rows => geo.port_height,
                WalkAxis::Dense => geo.port_width,
                WalkAxis::Cd => (self.padded_cd / cdp).max(1),
            })
            .max()
            .unwrap_or(1);
        self.loops.spatial_size_minus1 = steps - 1;
    }

    /// ROI extents of the axis an operand steps over
    pub(crate) fn step_extents(&self, axis: WalkAxis) -> [u64; MAX_DIMS] {
        let mut extents = [1u64; MAX_DIMS];
        match axis {
            WalkAxis::Rows => extents = self.recipe.row_extents,
            WalkAxis::Cd if self.op.op == OpType::Dedw => extents = self.recipe.cd_extents,
            WalkAxis::Cd => extents[1] = self.recipe.cd.base + self.padded_cd,
            WalkAxis::Dense => extents[1] = self.recipe.fcd.base + self.recipe.fcd.size,
        }
        extents[0] = 1;
        extents
    }

    /// FCD elements of the region an operand covers
    pub(crate) fn fcd_extent(&self, axis: WalkAxis) -> u64 {
        self.window(axis).size
    }

    /// Plan skeleton for an operand: extents from its walk, unit strides.
    /// The region spans every batch port, so a port's batch shift stays
    /// inside it.
    pub(crate) fn plan_for(&self, operand: Operand) -> OperandPlan {
        let w = walk(self.op, operand);
        let mut plan = OperandPlan::new();
        plan.extents = self.step_extents(w.steps);
        plan.extents[0] = self.fcd_extent(w.fcd);
        if let Some(d) = self.batch_port_dim(operand) {
            plan.extents[d] = plan.extents[d].max(1) * self.strategy.batch_ports(self.op.op) as u64;
        }
        plan
    }

    pub(crate) fn set_plan(&mut self, operand: Operand, plan: OperandPlan) {
        self.plans[operand] = plan;
    }

    pub(crate) fn op(&self) -> &'a Operation {
        self.op
    }

    pub(crate) fn strategy(&self) -> &'a Strategy {
        self.strategy
    }

    pub(crate) fn sub(&self) -> &'a SubProblem {
        self.sub
    }

    pub(crate) fn recipe(&self) -> &'a Recipe {
        self.recipe
    }
}
