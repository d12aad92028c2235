//! Execution strategy and port geometry
//!
//! The geometry splits the output of one activation over compute units
//! (MMEs), cores inside a unit and ports inside a core. Rows (the spatial
//! axis of the output) and the dense axis are split independently.
//!
//! A split level is either *blocked* (unit `u` takes a contiguous run of the
//! parent's elements) or *interleaved* (unit `u` takes every `n`-th element
//! starting at `u`). A [`Lane`] is the result: the first element a unit owns
//! and the distance between consecutive elements it owns.

use serde::{Deserialize, Serialize};

use crate::attr::GridShape;
use crate::error::{DescError, DescResult};
use crate::params::{OpType, Operand, Operation, MAX_DIMS};
use crate::pattern::ReductionOrder;

/// Elements owned by one unit: `offset + k * stride` for `k < capacity`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lane {
    pub offset: u64,
    pub stride: u64,
}

impl Lane {
    pub fn new(offset: u64, stride: u64) -> Self {
        Self { offset, stride }
    }
}

/// One split level: `count` units, this unit is `index`
#[derive(Debug, Clone, Copy)]
struct Level {
    count: usize,
    index: usize,
    interleaved: bool,
}

fn compose(levels: &[Level], unit_capacity: u64) -> Lane {
    let mut capacity: u64 = levels.iter().map(|l| l.count as u64).product::<u64>() * unit_capacity;
    let mut lane = Lane::new(0, 1);
    for level in levels {
        capacity /= level.count as u64;
        if level.interleaved {
            lane.offset += level.index as u64 * lane.stride;
            lane.stride *= level.count as u64;
        } else {
            lane.offset += level.index as u64 * capacity * lane.stride;
        }
    }
    lane
}

/// Row interleaving policies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interleave {
    #[serde(default)]
    pub across_mmes: bool,
    #[serde(default)]
    pub across_cores: bool,
    #[serde(default)]
    pub inside_core: bool,
}

/// Position of a core in the geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreCoords {
    pub mme_w: usize,
    pub mme_h: usize,
    pub core_w: usize,
    pub core_h: usize,
}

/// Split of the compute grid over units, cores and ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub mmes_w: usize,
    pub mmes_h: usize,
    pub cores_w: usize,
    pub cores_h: usize,
    pub fcd_ports: usize,
    pub sp_ports: usize,
    /// Dense elements per port
    pub port_width: u64,
    /// Rows per port
    pub port_height: u64,
}

impl Geometry {
    /// One unit, one core, one port per axis
    pub fn single(port_width: u64, port_height: u64) -> Self {
        Self {
            mmes_w: 1,
            mmes_h: 1,
            cores_w: 1,
            cores_h: 1,
            fcd_ports: 1,
            sp_ports: 1,
            port_width,
            port_height,
        }
    }

    pub fn validate(&self) -> DescResult<()> {
        let counts = [
            self.mmes_w,
            self.mmes_h,
            self.cores_w,
            self.cores_h,
            self.fcd_ports,
            self.sp_ports,
        ];
        if counts.contains(&0) || self.port_width == 0 || self.port_height == 0 {
            return Err(DescError::geometry(format!("empty split in {:?}", self)));
        }
        Ok(())
    }

    pub fn num_mmes(&self) -> usize {
        self.mmes_w * self.mmes_h
    }

    pub fn cores_per_mme(&self) -> usize {
        self.cores_w * self.cores_h
    }

    pub fn num_cores(&self) -> usize {
        self.num_mmes() * self.cores_per_mme()
    }

    /// Dense elements covered by one activation
    pub fn geometry_width(&self) -> u64 {
        (self.mmes_w * self.cores_w * self.fcd_ports) as u64 * self.port_width
    }

    /// Rows covered by one activation
    pub fn geometry_height(&self) -> u64 {
        (self.mmes_h * self.cores_h * self.sp_ports) as u64 * self.port_height
    }

    pub fn mme_height(&self) -> u64 {
        (self.cores_h * self.sp_ports) as u64 * self.port_height
    }

    pub fn core_width(&self) -> u64 {
        self.fcd_ports as u64 * self.port_width
    }

    pub fn core_height(&self) -> u64 {
        self.sp_ports as u64 * self.port_height
    }

    pub fn core_coords(&self, core: usize) -> CoreCoords {
        let mme = core / self.cores_per_mme();
        let local = core % self.cores_per_mme();
        CoreCoords {
            mme_w: mme % self.mmes_w,
            mme_h: mme / self.mmes_w,
            core_w: local % self.cores_w,
            core_h: local / self.cores_w,
        }
    }

    /// Rows owned by a core inside the activation's row window
    pub fn core_row_lane(&self, core: usize, interleave: Interleave) -> Lane {
        let c = self.core_coords(core);
        compose(
            &[
                Level {
                    count: self.mmes_h,
                    index: c.mme_h,
                    interleaved: interleave.across_mmes,
                },
                Level {
                    count: self.cores_h,
                    index: c.core_h,
                    interleaved: interleave.across_cores,
                },
            ],
            self.core_height(),
        )
    }

    /// Core-local rows owned by a spatial port
    pub fn port_row_lane(&self, sp_port: usize, interleave: Interleave) -> Lane {
        compose(
            &[Level {
                count: self.sp_ports,
                index: sp_port,
                interleaved: interleave.inside_core,
            }],
            self.port_height,
        )
    }

    /// Dense elements owned by a core; the dense axis is always blocked
    pub fn core_dense_lane(&self, core: usize) -> Lane {
        let c = self.core_coords(core);
        compose(
            &[
                Level {
                    count: self.mmes_w,
                    index: c.mme_w,
                    interleaved: false,
                },
                Level {
                    count: self.cores_w,
                    index: c.core_w,
                    interleaved: false,
                },
            ],
            self.core_width(),
        )
    }

    /// Core-local dense elements owned by an FCD port
    pub fn port_dense_lane(&self, fcd_port: usize) -> Lane {
        Lane::new(fcd_port as u64 * self.port_width, 1)
    }
}

/// The execution strategy chosen for one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub geometry: Geometry,
    #[serde(default)]
    pub pattern: ReductionOrder,
    #[serde(default)]
    pub interleave: Interleave,
    /// Batch ports computing independent batches concurrently (bgemm)
    #[serde(default = "one")]
    pub batch_concurrency: usize,
    /// CD ports splitting the common dim (dedw)
    #[serde(default = "one")]
    pub cd_concurrency: usize,
    #[serde(default)]
    pub recurring_misalignment_opt: bool,
    /// Largest common-dim window of one activation
    #[serde(default)]
    pub max_cd_window: Option<u64>,
}

fn one() -> usize {
    1
}

impl Strategy {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            pattern: ReductionOrder::default(),
            interleave: Interleave::default(),
            batch_concurrency: 1,
            cd_concurrency: 1,
            recurring_misalignment_opt: false,
            max_cd_window: None,
        }
    }

    pub fn with_pattern(mut self, pattern: ReductionOrder) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_interleave(mut self, interleave: Interleave) -> Self {
        self.interleave = interleave;
        self
    }

    /// Dimension split by the concurrency ports of an operation family
    pub fn concurrent_dim(&self, op: OpType) -> Option<usize> {
        match op {
            OpType::Bgemm => Some(2),
            OpType::Dedw => Some(1),
            _ => None,
        }
    }

    pub fn batch_ports(&self, op: OpType) -> usize {
        if op == OpType::Bgemm {
            self.batch_concurrency
        } else {
            1
        }
    }

    pub fn cd_ports(&self, op: OpType) -> usize {
        if op == OpType::Dedw {
            self.cd_concurrency
        } else {
            1
        }
    }

    pub fn validate(&self, op: OpType) -> DescResult<()> {
        self.geometry.validate()?;
        if self.batch_concurrency == 0 || self.cd_concurrency == 0 {
            return Err(DescError::geometry("concurrency factor of zero"));
        }
        if self.batch_concurrency > 1 && op != OpType::Bgemm {
            return Err(DescError::unsupported(format!(
                "batch concurrency is not supported for {}",
                op
            )));
        }
        if self.cd_concurrency > 1 && op != OpType::Dedw {
            return Err(DescError::unsupported(format!(
                "cd concurrency is not supported for {}",
                op
            )));
        }
        Ok(())
    }

    /// Row interleaving actually applied. Rows carried on A's dense dimension
    /// (transposed A) cannot be interleaved.
    pub fn effective_interleave(&self, op: &Operation) -> Interleave {
        if op.is_transposed(Operand::A) {
            Interleave::default()
        } else {
            self.interleave
        }
    }

    pub fn core_fcd_ports(&self, operand: Operand) -> usize {
        match operand {
            Operand::A => 1,
            _ => self.geometry.fcd_ports,
        }
    }

    pub fn core_spatial_ports(&self, operand: Operand) -> usize {
        match operand {
            Operand::B => 1,
            _ => self.geometry.sp_ports,
        }
    }

    pub fn grid_shape(&self, op: OpType, operand: Operand) -> GridShape {
        GridShape {
            cores: self.geometry.num_cores(),
            cd_ports: if operand == Operand::C { 1 } else { self.cd_ports(op) },
            batch_ports: self.batch_ports(op),
            fcd_ports: self.core_fcd_ports(operand),
            sp_ports: self.core_spatial_ports(operand),
        }
    }

    /// A batch dimension the operand does not have but the output does
    pub fn is_operand_broadcasted(&self, op: &Operation, operand: Operand, dim: usize) -> bool {
        debug_assert!(dim < MAX_DIMS);
        op.op == OpType::Bgemm
            && operand != Operand::C
            && dim >= 2
            && op.tensor(operand).sizes[dim] == 1
            && op.c.sizes[dim] > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry {
            mmes_w: 1,
            mmes_h: 2,
            cores_w: 1,
            cores_h: 2,
            fcd_ports: 2,
            sp_ports: 2,
            port_width: 8,
            port_height: 4,
        }
    }

    #[test]
    fn test_sizes() {
        let g = geo();
        assert_eq!(g.num_cores(), 4);
        assert_eq!(g.geometry_width(), 16);
        assert_eq!(g.geometry_height(), 32);
        assert_eq!(g.mme_height(), 16);
        assert_eq!(g.core_height(), 8);
    }

    #[test]
    fn test_blocked_rows() {
        let g = geo();
        let lanes: Vec<Lane> = (0..4).map(|c| g.core_row_lane(c, Interleave::default())).collect();
        assert_eq!(lanes[0], Lane::new(0, 1));
        assert_eq!(lanes[1], Lane::new(8, 1));
        assert_eq!(lanes[2], Lane::new(16, 1));
        assert_eq!(lanes[3], Lane::new(24, 1));
    }

    #[test]
    fn test_interleaved_rows() {
        let g = geo();
        let il = Interleave {
            across_mmes: true,
            across_cores: false,
            inside_core: true,
        };
        // units alternate rows, cores take halves of their unit's rows
        assert_eq!(g.core_row_lane(0, il), Lane::new(0, 2));
        assert_eq!(g.core_row_lane(1, il), Lane::new(16, 2));
        assert_eq!(g.core_row_lane(2, il), Lane::new(1, 2));
        assert_eq!(g.core_row_lane(3, il), Lane::new(17, 2));
        assert_eq!(g.port_row_lane(1, il), Lane::new(1, 2));
        assert_eq!(g.port_row_lane(1, Interleave::default()), Lane::new(4, 1));
    }

    #[test]
    fn test_dense_lanes_are_blocked() {
        let g = Geometry {
            mmes_w: 2,
            cores_w: 2,
            ..geo()
        };
        assert_eq!(g.core_dense_lane(0), Lane::new(0, 1));
        assert_eq!(g.core_dense_lane(1), Lane::new(16, 1));
        // second unit starts after the first unit's two cores
        assert_eq!(g.core_dense_lane(g.cores_per_mme()), Lane::new(32, 1));
        assert_eq!(g.port_dense_lane(1), Lane::new(8, 1));
    }
}
