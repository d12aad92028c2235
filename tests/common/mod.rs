//! Descriptor emulator and naive references shared by the integration tests
//!
//! The emulator executes the chip-independent attributes of every activation
//! over integer tensors: each port walks its steps with mixed-radix carry
//! over the region of interest. Reads of A outside its valid elements observe
//! the descriptor's pad value, reads of B there observe zero, and writes
//! there are dropped.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};

use mme_desc::agu::{is_port_start_offset, port_counts, walk, WalkAxis};
use mme_desc::attr::PortOffsets;
use mme_desc::{
    Activation, DescriptorProgram, LoopSlot, MmeAguConfig, OpType, Operand, OperandAttr, Operation, PortIndex,
    Strategy, Tensor,
};

/// Value of never-written output memory
pub const UNWRITTEN: i64 = 999_999;

/// Flat memory of the three operands, indexed by element address
#[derive(Debug, Clone)]
pub struct Buffers {
    pub a: Vec<i64>,
    pub b: Vec<i64>,
    pub c: Vec<i64>,
}

impl Buffers {
    pub fn for_op(op: &Operation) -> Self {
        Self {
            a: pattern_values(&op.a, 1),
            b: pattern_values(&op.b, 2),
            c: vec![UNWRITTEN; op.c.span() as usize],
        }
    }
}

/// Small deterministic values for every address of a tensor
pub fn pattern_values(t: &Tensor, seed: i64) -> Vec<i64> {
    (0..t.span() as i64)
        .map(|addr| (addr * 7919 + seed * 104_729) % 17 - 8)
        .collect()
}

/// Every coordinate of a shape, dim 0 fastest
pub fn coords(sizes: &[u64; 5]) -> Vec<[u64; 5]> {
    let total: u64 = sizes.iter().product();
    (0..total)
        .map(|mut flat| {
            let mut c = [0u64; 5];
            for d in 0..5 {
                c[d] = flat % sizes[d];
                flat /= sizes[d];
            }
            c
        })
        .collect()
}

/// Run a whole program; returns, per activation, how many port positions
/// wrote each output address
pub fn run_program(
    op: &Operation,
    strategy: &Strategy,
    program: &DescriptorProgram,
    bufs: &mut Buffers,
) -> Vec<HashMap<u64, usize>> {
    program
        .activations
        .iter()
        .map(|act| run_activation(op, strategy, act, bufs))
        .collect()
}

/// Output memory and per-activation write counts of a program
pub fn emulate(op: &Operation, strategy: &Strategy, program: &DescriptorProgram) -> (Vec<i64>, Vec<HashMap<u64, usize>>) {
    let mut bufs = Buffers::for_op(op);
    let coverage = run_program(op, strategy, program, &mut bufs);
    (bufs.c, coverage)
}

fn loop_combos(cfg: &MmeAguConfig) -> Vec<[u64; 4]> {
    let sizes: Vec<u64> = LoopSlot::ALL.iter().map(|s| cfg.loops.slot(*s).size()).collect();
    let mut out = Vec::new();
    for c3 in 0..sizes[3] {
        for c2 in 0..sizes[2] {
            for c1 in 0..sizes[1] {
                for c0 in 0..sizes[0] {
                    out.push([c0, c1, c2, c3]);
                }
            }
        }
    }
    out
}

fn loop_offset(cfg: &MmeAguConfig, attr: &OperandAttr, operand: Operand, counters: [u64; 4]) -> [i64; 5] {
    let mut off = [0i64; 5];
    for slot in LoopSlot::ALL {
        if let Some(d) = cfg.loops.slot(slot).dims[operand] {
            off[d] += counters[slot.index()] as i64 * attr.loop_stride[d];
        }
    }
    off
}

/// Addresses one port touches, `[step][fcd element]`; `None` where the
/// access falls outside the region or the tensor
fn walk_port(
    attr: &OperandAttr,
    cell: &PortOffsets,
    start_relative: bool,
    steps: u64,
    fcd: u64,
    loop_off: [i64; 5],
) -> Vec<Vec<Option<u64>>> {
    let mut base = attr.base_offset;
    let mut r = attr.start_offset;
    for d in 0..5 {
        if start_relative {
            r[d] += cell.offsets[d];
        } else {
            base[d] += cell.offsets[d];
        }
    }
    let roi: Vec<i64> = attr.roi_size.iter().map(|v| *v as i64).collect();
    let ss: Vec<i64> = attr.spatial_strides.iter().map(|v| *v as i64).collect();

    let mut out = Vec::with_capacity(steps as usize);
    for _ in 0..steps {
        let inside = r[4] < roi[4];
        let mut row = Vec::with_capacity(fcd as usize);
        for e in 0..fcd as i64 {
            let mut addr = 0i64;
            let mut valid = inside;
            for d in 0..5 {
                let mut abs = base[d] + r[d] + loop_off[d];
                if d == 0 {
                    abs += e;
                }
                if abs < 0 || abs >= attr.valid_elements[d] as i64 {
                    valid = false;
                }
                addr += abs;
            }
            row.push(valid.then_some(addr as u64));
        }
        out.push(row);

        r[1] += ss[1];
        for d in 1..4 {
            while roi[d] > 0 && r[d] >= roi[d] {
                r[d] -= roi[d];
                r[d + 1] += ss[d + 1];
            }
        }
    }
    out
}

fn read(mem: &[i64], addr: Option<u64>, pad: i64) -> i64 {
    addr.map(|a| mem[a as usize]).unwrap_or(pad)
}

struct PortWalk {
    addrs: Vec<Vec<Option<u64>>>,
    steps: u64,
    fcd: u64,
}

fn port_walk(
    op: &Operation,
    strategy: &Strategy,
    cfg: &MmeAguConfig,
    core: usize,
    operand: Operand,
    idx: PortIndex,
    counters: [u64; 4],
) -> Option<PortWalk> {
    let cell = cfg.grids[operand].get(idx);
    if !cell.valid {
        return None;
    }
    let attr = &cfg.attrs[core][operand];
    let (steps, fcd) = port_counts(strategy, op, operand, attr, idx);
    let addrs = walk_port(
        attr,
        cell,
        is_port_start_offset(op, operand),
        steps,
        fcd,
        loop_offset(cfg, attr, operand, counters),
    );
    Some(PortWalk { addrs, steps, fcd })
}

/// Execute one activation against the buffers
pub fn run_activation(op: &Operation, strategy: &Strategy, act: &Activation, bufs: &mut Buffers) -> HashMap<u64, usize> {
    let cfg = &act.agu;
    let pad = cfg.pad_value as i64;
    let mut acc: HashMap<u64, i64> = HashMap::new();
    let mut writers: HashMap<u64, HashSet<(PortIndex, u64, u64, [u64; 4])>> = HashMap::new();

    for core in 0..strategy.geometry.num_cores() {
        for c_idx in cfg.grids.c.core_indices(core) {
            for counters in loop_combos(cfg) {
                let Some(c) = port_walk(op, strategy, cfg, core, Operand::C, c_idx, counters) else {
                    continue;
                };
                let values = if cfg.memset {
                    vec![vec![0i64; c.fcd as usize]; c.steps as usize]
                } else if op.op.is_dma() {
                    movement_values(op, strategy, act, core, c_idx, counters, &c, bufs, pad)
                } else {
                    gemm_values(op, strategy, cfg, core, c_idx, counters, &c, bufs, pad)
                };

                let mut moving = [0u64; 4];
                for s in 0..4 {
                    if cfg.move_masks.c & (1 << s) != 0 {
                        moving[s] = counters[s];
                    }
                }
                for k in 0..c.steps {
                    for e in 0..c.fcd {
                        if let Some(addr) = c.addrs[k as usize][e as usize] {
                            *acc.entry(addr).or_insert(0) += values[k as usize][e as usize];
                            writers.entry(addr).or_default().insert((c_idx, k, e, moving));
                        }
                    }
                }
            }
        }
    }

    for (addr, v) in acc {
        let slot = &mut bufs.c[addr as usize];
        if cfg.memset {
            *slot = 0;
        } else if cfg.reduction_add {
            *slot += v;
        } else {
            *slot = v;
        }
    }
    writers.into_iter().map(|(addr, w)| (addr, w.len())).collect()
}

#[allow(clippy::too_many_arguments)]
fn gemm_values(
    op: &Operation,
    strategy: &Strategy,
    cfg: &MmeAguConfig,
    core: usize,
    c_idx: PortIndex,
    counters: [u64; 4],
    c: &PortWalk,
    bufs: &Buffers,
    pad: i64,
) -> Vec<Vec<i64>> {
    let mut out = vec![vec![0i64; c.fcd as usize]; c.steps as usize];
    let a_rows_on_steps = walk(op, Operand::A).steps == WalkAxis::Rows;
    let b_cd_on_steps = walk(op, Operand::B).steps == WalkAxis::Cd;

    for j in 0..strategy.cd_ports(op.op) {
        let a_idx = PortIndex {
            core,
            cd: j,
            batch: c_idx.batch,
            fcd: 0,
            sp: c_idx.sp,
        };
        let b_idx = PortIndex {
            core,
            cd: j,
            batch: c_idx.batch,
            fcd: c_idx.fcd,
            sp: 0,
        };
        let a = port_walk(op, strategy, cfg, core, Operand::A, a_idx, counters)
            .unwrap_or_else(|| panic!("A port {:?} invalid under a valid output port", a_idx));
        let b = port_walk(op, strategy, cfg, core, Operand::B, b_idx, counters)
            .unwrap_or_else(|| panic!("B port {:?} invalid under a valid output port", b_idx));

        let (a_rows, cd) = if a_rows_on_steps { (a.steps, a.fcd) } else { (a.fcd, a.steps) };
        let (b_cd, b_dense) = if b_cd_on_steps { (b.steps, b.fcd) } else { (b.fcd, b.steps) };
        assert_eq!(a_rows, c.steps, "rows of A and C ports differ");
        assert_eq!(b_dense, c.fcd, "dense sizes of B and C ports differ");
        assert_eq!(cd, b_cd, "common dims of A and B ports differ");

        for i in 0..c.steps as usize {
            for e in 0..c.fcd as usize {
                let mut sum = 0i64;
                for t in 0..cd as usize {
                    let a_addr = if a_rows_on_steps { a.addrs[i][t] } else { a.addrs[t][i] };
                    let b_addr = if b_cd_on_steps { b.addrs[t][e] } else { b.addrs[e][t] };
                    sum += read(&bufs.a, a_addr, pad) * read(&bufs.b, b_addr, 0);
                }
                out[i][e] += sum;
            }
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn movement_values(
    op: &Operation,
    strategy: &Strategy,
    act: &Activation,
    core: usize,
    c_idx: PortIndex,
    counters: [u64; 4],
    c: &PortWalk,
    bufs: &Buffers,
    pad: i64,
) -> Vec<Vec<i64>> {
    let a_idx = PortIndex {
        core,
        cd: 0,
        batch: c_idx.batch,
        fcd: 0,
        sp: c_idx.sp,
    };
    let a = port_walk(op, strategy, &act.agu, core, Operand::A, a_idx, counters)
        .unwrap_or_else(|| panic!("A port {:?} invalid under a valid output port", a_idx));
    let rows_on_steps = walk(op, Operand::A).steps == WalkAxis::Rows;
    // dense window index of the port's first element
    let first = act.agu.grids.c.get(c_idx).offsets[0] as u64 - act.recipe.fcd.base;

    let mut out = vec![vec![0i64; c.fcd as usize]; c.steps as usize];
    for i in 0..c.steps as usize {
        for e in 0..c.fcd as usize {
            let t = first as usize + e;
            let addr = if rows_on_steps { a.addrs[i][t] } else { a.addrs[t][i] };
            out[i][e] = read(&bufs.a, addr, pad);
        }
    }
    out
}

fn at(mem: &[i64], t: &Tensor, coord: [u64; 5]) -> i64 {
    mem[t.offset(&coord) as usize]
}

/// Output memory a correct program leaves behind
pub fn reference(op: &Operation) -> Vec<i64> {
    let a_mem = pattern_values(&op.a, 1);
    let b_mem = pattern_values(&op.b, 2);
    let mut out = vec![UNWRITTEN; op.c.span() as usize];
    let pad = op.pad_value as i64;
    let (a, b, c) = (&op.a, &op.b, &op.c);
    let kernel = op.kernel();
    let conv = &op.conv;

    for coord in coords(&c.sizes) {
        let value = match op.op {
            OpType::Fwd => {
                let mut sum = 0;
                for ch in 0..a.sizes[0] {
                    for f in coords(&[kernel[0], kernel[1], kernel[2], 1, 1]) {
                        let mut x = [ch, 0, 0, 0, coord[4]];
                        let mut inside = true;
                        for i in 0..3 {
                            let pos = coord[1 + i] as i64 * conv.stride[i] as i64 + f[i] as i64 * conv.dilation[i] as i64
                                - conv.padding[i] as i64;
                            inside &= pos >= 0 && pos < a.sizes[1 + i] as i64;
                            x[1 + i] = pos.max(0) as u64;
                        }
                        let xv = if inside { at(&a_mem, a, x) } else { pad };
                        sum += xv * at(&b_mem, b, [coord[0], ch, f[0], f[1], f[2]]);
                    }
                }
                sum
            }
            OpType::Dedx => {
                let mut sum = 0;
                for k in 0..a.sizes[0] {
                    for f in coords(&[kernel[0], kernel[1], kernel[2], 1, 1]) {
                        let mut y = [k, 0, 0, 0, coord[4]];
                        let mut hit = true;
                        for i in 0..3 {
                            let num = coord[1 + i] as i64 + conv.padding[i] as i64 - f[i] as i64 * conv.dilation[i] as i64;
                            let s = conv.stride[i] as i64;
                            hit &= num >= 0 && num % s == 0 && num / s < a.sizes[1 + i] as i64;
                            y[1 + i] = (num.max(0) / s) as u64;
                        }
                        if hit {
                            sum += at(&a_mem, a, y) * at(&b_mem, b, [k, coord[0], f[0], f[1], f[2]]);
                        }
                    }
                }
                sum
            }
            OpType::Dedw => {
                let mut sum = 0;
                for n in 0..a.sizes[4] {
                    for o in coords(&[b.sizes[1], b.sizes[2], b.sizes[3], 1, 1]) {
                        let mut x = [coord[1], 0, 0, 0, n];
                        let mut inside = true;
                        for i in 0..3 {
                            let pos = o[i] as i64 * conv.stride[i] as i64 + coord[2 + i] as i64 * conv.dilation[i] as i64
                                - conv.padding[i] as i64;
                            inside &= pos >= 0 && pos < a.sizes[1 + i] as i64;
                            x[1 + i] = pos.max(0) as u64;
                        }
                        let xv = if inside { at(&a_mem, a, x) } else { pad };
                        sum += xv * at(&b_mem, b, [coord[0], o[0], o[1], o[2], n]);
                    }
                }
                sum
            }
            OpType::Bgemm => {
                let k_size = op.common_dim();
                let batch = |t: &Tensor, d: usize| if t.sizes[d] == 1 { 0 } else { coord[d] };
                let mut sum = 0;
                for k in 0..k_size {
                    let (n, m) = (coord[0], coord[1]);
                    let a_coord = if op.transpose_a { [m, k] } else { [k, m] };
                    let b_coord = if op.transpose_b { [k, n] } else { [n, k] };
                    let av = at(&a_mem, a, [a_coord[0], a_coord[1], batch(a, 2), batch(a, 3), batch(a, 4)]);
                    let bv = at(&b_mem, b, [b_coord[0], b_coord[1], batch(b, 2), batch(b, 3), batch(b, 4)]);
                    sum += av * bv;
                }
                sum
            }
            OpType::Dma => at(&a_mem, a, coord),
            OpType::Transpose => at(&a_mem, a, [coord[1], coord[0], coord[2], coord[3], coord[4]]),
        };
        out[c.offset(&coord) as usize] = value;
    }
    out
}

/// Compile, emulate and compare against the reference; returns the program
pub fn check(op: &Operation, strategy: &Strategy, chip: mme_desc::ChipGen) -> DescriptorProgram {
    let program = mme_desc::compile(op, strategy, chip).unwrap_or_else(|e| panic!("compilation failed: {}", e));
    let (got, coverage) = emulate(op, strategy, &program);
    let want = reference(op);
    for coord in coords(&op.c.sizes) {
        let addr = op.c.offset(&coord) as usize;
        assert_eq!(got[addr], want[addr], "{} output mismatch at {:?}", op.op, coord);
    }
    for (i, writes) in coverage.iter().enumerate() {
        for (addr, count) in writes {
            assert_eq!(*count, 1, "activation {} writes address {} {} times", i, addr, count);
        }
    }
    program
}
