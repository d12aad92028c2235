//! Tiling recipes for descriptor execution
//!
//! Splits one sub-problem into activations that each fit the geometry:
//! - rows larger than the geometry height are split into row windows
//! - dense sizes larger than the geometry width are split into dense windows
//! - a common dim larger than the strategy's limit is split into windows
//!   whose partial results accumulate in the output
//!
//! Each activation is described by a [`Recipe`].

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{DescError, DescResult};
use crate::geometry::Strategy;
use crate::params::{OpType, Operation, MAX_DIMS};
use crate::subproblem::SubProblem;

/// A sub-range `[base, base + size)` of one axis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub base: u64,
    pub size: u64,
}

impl View {
    pub fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }
}

/// Windows of one activation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    /// Dense window of the output
    pub fcd: View,
    /// Row window, flattened over `row_extents`
    pub sp: View,
    /// Outer-loop window
    pub non_spatial: View,
    /// Common-dim window
    pub cd: View,
    /// Extents of the row space on dims 1..
    pub row_extents: [u64; MAX_DIMS],
    /// Extents of a step-walked common dim on dims 1..
    pub cd_extents: [u64; MAX_DIMS],
    pub first_partial: bool,
    pub last_partial: bool,
}

impl Recipe {
    pub fn cur_fcd(&self) -> View {
        self.fcd
    }

    pub fn cur_sp(&self) -> View {
        self.sp
    }

    pub fn cur_non_spatial(&self) -> View {
        self.non_spatial
    }

    pub fn is_last_partial(&self) -> bool {
        self.last_partial
    }

    /// Per-dimension position of a flattened row
    pub fn calc_sp_pos(&self, row: u64) -> [u64; MAX_DIMS] {
        unflatten(row, &self.row_extents)
    }

    /// Per-dimension position of a flattened common-dim step
    pub fn calc_cd_pos(&self, step: u64) -> [u64; MAX_DIMS] {
        unflatten(step, &self.cd_extents)
    }
}

/// Mixed-radix split over dims 1..; whatever overflows lands on the last dim
fn unflatten(mut flat: u64, extents: &[u64; MAX_DIMS]) -> [u64; MAX_DIMS] {
    let mut pos = [0u64; MAX_DIMS];
    for d in 1..MAX_DIMS {
        let extent = extents[d].max(1);
        if d == MAX_DIMS - 1 {
            pos[d] = flat;
        } else {
            pos[d] = flat % extent;
            flat /= extent;
        }
    }
    pos
}

/// Axis sizes of one sub-problem in matrix terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GemmShape {
    pub row_extents: [u64; MAX_DIMS],
    pub dense: u64,
    pub cd: u64,
    pub cd_extents: [u64; MAX_DIMS],
    pub outer: u64,
}

impl GemmShape {
    pub fn of(op: &Operation, sub: &SubProblem) -> Self {
        let mut row_extents = [1u64; MAX_DIMS];
        let mut cd_extents = [1u64; MAX_DIMS];
        let p = &sub.params;
        let (cd, outer) = match op.op {
            OpType::Fwd | OpType::Dedx => {
                row_extents[1..4].copy_from_slice(&p.out_sizes);
                (op.a.sizes[0], op.c.sizes[4])
            }
            OpType::Dedw => {
                row_extents[1] = op.a.sizes[0];
                cd_extents[1..4].copy_from_slice(&p.out_sizes);
                (p.num_positions(), op.a.sizes[4])
            }
            OpType::Bgemm => {
                row_extents[1] = op.c.sizes[1];
                (op.common_dim(), 1)
            }
            OpType::Dma | OpType::Transpose => {
                row_extents[1] = op.c.sizes[1];
                (op.c.sizes[0], 1)
            }
        };
        if op.op != OpType::Dedw {
            cd_extents[1] = cd.max(1);
        }
        Self {
            row_extents,
            dense: op.c.sizes[0],
            cd: if sub.is_memset_only { 0 } else { cd },
            cd_extents,
            outer,
        }
    }

    pub fn rows(&self) -> u64 {
        self.row_extents[1..].iter().product()
    }
}

/// Tiling planner for one sub-problem
pub struct TilingPlanner<'a> {
    strategy: &'a Strategy,
}

impl<'a> TilingPlanner<'a> {
    pub fn new(strategy: &'a Strategy) -> Self {
        Self { strategy }
    }

    /// Plan the activations of a sub-problem
    pub fn plan(&self, op: &Operation, sub: &SubProblem, cd_alignment: u64) -> DescResult<Vec<Recipe>> {
        let shape = GemmShape::of(op, sub);
        let geo = &self.strategy.geometry;
        let tile_w = geo.geometry_width();
        let tile_h = geo.geometry_height();
        if tile_w == 0 || tile_h == 0 {
            return Err(DescError::tiling("geometry covers no elements"));
        }

        let rows = shape.rows();
        let row_tiles = rows.div_ceil(tile_h).max(1);
        let dense_tiles = shape.dense.div_ceil(tile_w).max(1);

        let cd_window = self.cd_window(&shape, cd_alignment)?;
        let cd_tiles = if shape.cd == 0 || op.op.is_dma() {
            1
        } else {
            shape.cd.div_ceil(cd_window)
        };

        let mut recipes = Vec::new();
        for i in 0..row_tiles {
            for j in 0..dense_tiles {
                let sp = View::new(i * tile_h, tile_h.min(rows - (i * tile_h).min(rows)));
                let fcd = View::new(j * tile_w, tile_w.min(shape.dense - (j * tile_w).min(shape.dense)));
                for kk in 0..cd_tiles {
                    let cd = if op.op.is_dma() {
                        fcd
                    } else {
                        let base = kk * cd_window;
                        View::new(base, cd_window.min(shape.cd - base.min(shape.cd)))
                    };
                    recipes.push(Recipe {
                        fcd,
                        sp,
                        non_spatial: View::new(0, shape.outer),
                        cd,
                        row_extents: shape.row_extents,
                        cd_extents: shape.cd_extents,
                        first_partial: kk == 0,
                        last_partial: kk == cd_tiles - 1,
                    });
                }
            }
        }

        debug!(
            "{} sub-problem {}: {} row x {} dense x {} cd window(s)",
            op.op, sub.ordering_key, row_tiles, dense_tiles, cd_tiles
        );
        Ok(recipes)
    }

    fn cd_window(&self, shape: &GemmShape, alignment: u64) -> DescResult<u64> {
        let alignment = alignment.max(1);
        match self.strategy.max_cd_window {
            None => Ok(shape.cd.max(1)),
            Some(limit) => {
                let window = limit / alignment * alignment;
                if window == 0 {
                    return Err(DescError::tiling(format!(
                        "common-dim window {} is below the alignment {}",
                        limit, alignment
                    )));
                }
                Ok(window.min(shape.cd.max(1)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::params::{ConvParams, DataType, Tensor};
    use crate::subproblem::SubProblemDecomposer;

    fn fwd_op() -> Operation {
        let x = Tensor::dense(&[4, 5, 5, 1, 1], DataType::Fp32);
        let w = Tensor::dense(&[8, 4, 3, 3, 1], DataType::Fp32);
        let y = Tensor::dense(&[8, 3, 3, 1, 1], DataType::Fp32);
        Operation::fwd(x, w, y, ConvParams::default())
    }

    #[test]
    fn test_single_activation() {
        let op = fwd_op();
        let strategy = Strategy::new(Geometry::single(8, 9));
        let subs = SubProblemDecomposer::new(&op, &strategy).decompose().unwrap();
        let recipes = TilingPlanner::new(&strategy)
            .plan(&op, subs.current().unwrap(), 1)
            .unwrap();
        assert_eq!(recipes.len(), 1);
        let r = &recipes[0];
        assert_eq!(r.cur_fcd(), View::new(0, 8));
        assert_eq!(r.cur_sp(), View::new(0, 9));
        assert_eq!(r.cd, View::new(0, 4));
        assert!(r.is_last_partial());
        assert_eq!(r.calc_sp_pos(7), [0, 1, 2, 0, 0]);
    }

    #[test]
    fn test_row_dense_and_cd_windows() {
        let op = fwd_op();
        let mut strategy = Strategy::new(Geometry::single(4, 4));
        strategy.max_cd_window = Some(3);
        let subs = SubProblemDecomposer::new(&op, &strategy).decompose().unwrap();
        let recipes = TilingPlanner::new(&strategy)
            .plan(&op, subs.current().unwrap(), 2)
            .unwrap();
        // 9 rows in 3 windows, 8 dense in 2 windows, cd 4 in windows of 2
        assert_eq!(recipes.len(), 3 * 2 * 2);
        let last_rows = recipes.last().unwrap();
        assert_eq!(last_rows.sp, View::new(8, 1));
        assert_eq!(last_rows.cd, View::new(2, 2));
        assert!(recipes[0].first_partial && !recipes[0].last_partial);
    }

    #[test]
    fn test_cd_window_below_alignment() {
        let op = fwd_op();
        let mut strategy = Strategy::new(Geometry::single(4, 4));
        strategy.max_cd_window = Some(1);
        let subs = SubProblemDecomposer::new(&op, &strategy).decompose().unwrap();
        let err = TilingPlanner::new(&strategy).plan(&op, subs.current().unwrap(), 2);
        assert!(err.is_err());
    }
}
