//! The gravity tree: construction, moment aggregation and the serial walk.
//!
//! Build produces a pool of cells in build form; `update_moments` rewrites
//! every node into its `(mass, com)` + threading form. From then on a walk
//! is a flat loop over `first_child` / `next_sibling` with no stack, which
//! is also what lets the parallel walk suspend and resume mid-particle.

use std::time::Instant;

use log::debug;
use rayon::prelude::*;

use crate::config::{SplitKind, TreeConfig};
use crate::error::{GravityError, Result};
use crate::interaction::{Acceleration, Interaction};
use crate::particles::{ParticleSet, ParticleTag};
use crate::partition::PartitionTree;
use crate::pool::{Moments, Node, NodeFlags, NodePool, Payload, MAX_SPLITS, NONE};
use crate::remote::RemoteNodeTable;
use crate::splitter::{AccelOpening, BarnesHutOpening, Splitter};

/// Pool index of the root cell.
pub(crate) const ROOT: usize = 0;

/// Z-order octant of `x` relative to `center`: bit `k` is set iff
/// `x[k] >= center[k]`.
#[inline]
pub(crate) fn child_octant(center: &[f64; 3], x: &[f64; 3], dim: usize) -> usize {
    let mut idx = 0;
    for k in 0..dim {
        if x[k] >= center[k] {
            idx |= 1 << k;
        }
    }
    idx
}

pub struct GravityTree {
    pub(crate) cfg: TreeConfig,
    pub(crate) pool: NodePool,
    pub(crate) partition: Option<Box<dyn PartitionTree>>,
    /// Per-top-leaf exchange table; empty for serial trees.
    pub(crate) table: RemoteNodeTable,
    /// Partition leaf array index -> remote-node-table row.
    pub(crate) leaf_row: Vec<usize>,
}

impl GravityTree {
    pub fn new(cfg: TreeConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(GravityTree {
            cfg,
            pool: NodePool::new(),
            partition: None,
            table: RemoteNodeTable::default(),
            leaf_row: Vec::new(),
        })
    }

    pub fn config(&self) -> &TreeConfig {
        &self.cfg
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    pub fn node(&self, idx: usize) -> &Node {
        self.pool.node(idx)
    }

    /// Attach the load-balance partition tree. Required before any parallel
    /// build.
    pub fn attach(&mut self, partition: Box<dyn PartitionTree>) {
        self.partition = Some(partition);
    }

    /// Reset the pool and allocate the root cell from the domain bounds.
    pub(crate) fn make_root(&mut self) {
        self.pool.reset();
        let root = self.pool.acquire(1);
        debug_assert_eq!(root, ROOT);
        let node = self.pool.node_mut(root);
        node.width = self.cfg.domain.max_extent(self.cfg.dim);
        node.center = self.cfg.domain.center(self.cfg.dim);
    }

    /// Split a leaf cell into its `2^dim` children, acquired as one
    /// contiguous Z-ordered block.
    pub(crate) fn subdivide(&mut self, idx: usize) -> usize {
        let parent = *self.pool.node(idx);
        let fanout = self.cfg.fanout();
        let first = self.pool.acquire(fanout);

        let child_width = 0.5 * parent.width;
        let offset = 0.25 * parent.width;
        for z in 0..fanout {
            let child = self.pool.node_mut(first + z);
            child.width = child_width;
            for k in 0..self.cfg.dim {
                child.center[k] = parent.center[k]
                    + if z & (1 << k) != 0 { offset } else { -offset };
            }
        }

        let node = self.pool.node_mut(idx);
        node.flags.clear(NodeFlags::LEAF);
        node.flags.clear(NodeFlags::HAS_PARTICLE);
        node.payload = Payload::Children { first };
        first
    }

    /// Walk `pid` down from `start`, subdividing as needed.
    pub(crate) fn insert_particle(
        &mut self,
        positions: &[[f64; 3]],
        pid: usize,
        start: usize,
    ) -> Result<()> {
        let dim = self.cfg.dim;
        let x = positions[pid];
        let mut current = start;
        let mut splits = 0usize;
        loop {
            let node = *self.pool.node(current);
            if !node.flags.is_leaf() {
                current = node.children_first() + child_octant(&node.center, &x, dim);
                continue;
            }
            match node.payload {
                Payload::Leaf { pid: None } => {
                    let leaf = self.pool.node_mut(current);
                    leaf.payload = Payload::Leaf { pid: Some(pid) };
                    leaf.flags.set(NodeFlags::HAS_PARTICLE);
                    return Ok(());
                }
                Payload::Leaf {
                    pid: Some(resident),
                } => {
                    splits += 1;
                    if splits > MAX_SPLITS {
                        return Err(GravityError::DegenerateParticles {
                            first: resident,
                            second: pid,
                            position: x,
                            splits: MAX_SPLITS,
                        });
                    }
                    let first = self.subdivide(current);
                    let rx = positions[resident];
                    let rchild = first + child_octant(&node.center, &rx, dim);
                    let leaf = self.pool.node_mut(rchild);
                    leaf.payload = Payload::Leaf {
                        pid: Some(resident),
                    };
                    leaf.flags.set(NodeFlags::HAS_PARTICLE);
                    // re-enter the loop: pid may land in a distinct child or
                    // force another split
                }
                Payload::Moments(_) => {
                    panic!("insertion into a tree already in moment form")
                }
                Payload::Children { .. } => {
                    unreachable!("leaf node cannot hold a Children payload")
                }
            }
        }
    }

    /// Construction half of a serial build: root from domain bounds, every
    /// Real particle inserted from the root. Leaves the tree in build form.
    pub fn assemble(&mut self, pc: &ParticleSet) -> Result<()> {
        if self.cfg.parallel {
            return Err(GravityError::Config(
                "tree is configured parallel; use build_distributed".to_string(),
            ));
        }
        self.make_root();
        for pid in 0..pc.len() {
            if pc.tag[pid] == ParticleTag::Real {
                self.insert_particle(&pc.position, pid, ROOT)?;
            }
        }
        Ok(())
    }

    /// Build the serial tree: [`assemble`](Self::assemble) followed by the
    /// moment pass.
    pub fn build(&mut self, pc: &ParticleSet) -> Result<()> {
        let t0 = Instant::now();
        self.assemble(pc)?;
        self.update_moments(pc);
        debug!(
            "built serial tree: {} nodes, {} leaves, {:.3} ms",
            self.pool.count_nodes(),
            self.pool.count_leaves(),
            t0.elapsed().as_secs_f64() * 1e3
        );
        Ok(())
    }

    /// Post-order moment pass: rewrites every node from build form into
    /// `(mass, com)` + `first_child` / `next_sibling` threading.
    pub fn update_moments(&mut self, pc: &ParticleSet) {
        if self.pool.count_nodes() == 0 {
            return;
        }
        self.aggregate(pc, ROOT, NONE);
    }

    fn aggregate(&mut self, pc: &ParticleSet, idx: usize, sibling: usize) {
        let node = *self.pool.node(idx);

        if node.flags.is_leaf() {
            let (mass, com) = match node.payload {
                Payload::Leaf { pid: Some(p) } => (pc.mass[p], pc.position[p]),
                _ => (0.0, [0.0; 3]),
            };
            self.pool.node_mut(idx).payload = Payload::Moments(Moments {
                mass,
                com,
                first_child: NONE,
                next_sibling: sibling,
            });
            return;
        }

        let first = node.children_first();
        let fanout = self.cfg.fanout();
        for z in 0..fanout {
            let child_sibling = if z + 1 < fanout { first + z + 1 } else { sibling };
            self.aggregate(pc, first + z, child_sibling);
        }

        let mut mass = 0.0;
        let mut weighted = [0.0; 3];
        let mut populated = 0usize;
        let mut single = NONE;
        let mut all_skip = true;
        for z in 0..fanout {
            let child = self.pool.node(first + z);
            if !child.flags.is_skip_branch() {
                all_skip = false;
            }
            let cm = child.moments();
            if cm.mass == 0.0 {
                continue;
            }
            populated += 1;
            single = first + z;
            mass += cm.mass;
            for k in 0..self.cfg.dim {
                weighted[k] += cm.mass * cm.com[k];
            }
        }

        // A single populated child passes its moments through verbatim, so
        // chains of singly-occupied cells stay bit-exact copies of the
        // particle they summarize.
        let com = if populated == 1 {
            let cm = self.pool.node(single).moments();
            mass = cm.mass;
            cm.com
        } else if mass > 0.0 {
            let mut c = [0.0; 3];
            for k in 0..self.cfg.dim {
                c[k] = weighted[k] / mass;
            }
            c
        } else {
            [0.0; 3]
        };

        let node = self.pool.node_mut(idx);
        if all_skip {
            node.flags.set(NodeFlags::SKIP_BRANCH);
        }
        node.payload = Payload::Moments(Moments {
            mass,
            com,
            first_child: first,
            next_sibling: sibling,
        });
    }

    /// Serial walk: one threaded traversal per Real particle.
    pub fn walk(&self, pc: &mut ParticleSet) -> Result<()> {
        if self.cfg.parallel {
            return Err(GravityError::Config(
                "tree is configured parallel; use walk_distributed".to_string(),
            ));
        }
        if self.pool.count_nodes() == 0 {
            return Err(GravityError::Config("walk before build".to_string()));
        }
        let dim = self.cfg.dim;
        match self.cfg.split {
            SplitKind::BarnesHut => self.walk_with(
                pc,
                BarnesHutOpening::new(dim, self.cfg.opening_angle),
                Acceleration::new(dim),
            ),
            SplitKind::Acceleration => self.walk_with(
                pc,
                AccelOpening::new(dim, self.cfg.accel_tol),
                Acceleration::new(dim),
            ),
        }
        Ok(())
    }

    /// Serial walk with caller-supplied splitter and interaction.
    pub fn walk_with<S: Splitter, I: Interaction>(
        &self,
        pc: &mut ParticleSet,
        mut splitter: S,
        mut inter: I,
    ) {
        let t0 = Instant::now();
        while inter.advance(pc) {
            let pid = inter.current();
            pc.accel[pid] = [0.0; 3];
            splitter.focus(inter.target());
            let mut idx = ROOT;
            while idx != NONE {
                let node = self.pool.node(idx);
                let m = node.moments();
                if m.mass == 0.0 {
                    idx = m.next_sibling;
                } else if node.flags.is_leaf() {
                    inter.interact(node);
                    idx = m.next_sibling;
                } else if splitter.split(node) {
                    idx = m.first_child;
                } else {
                    inter.interact(node);
                    idx = m.next_sibling;
                }
            }
            inter.commit(&mut pc.accel);
        }
        debug!(
            "serial walk over {} particles, {:.3} ms",
            pc.len(),
            t0.elapsed().as_secs_f64() * 1e3
        );
    }

    /// Accelerations at arbitrary query points. No self-exclusion is
    /// applied; a query point coinciding with a particle sees that particle.
    pub fn accelerations_at_points(&self, points: &[[f64; 3]], out: &mut [[f64; 3]]) {
        assert_eq!(points.len(), out.len());
        if self.pool.count_nodes() == 0 {
            out.fill([0.0; 3]);
            return;
        }
        if points.len() < 1024 {
            for (p, o) in points.iter().zip(out.iter_mut()) {
                *o = self.accel_at_point(*p);
            }
        } else {
            out.par_iter_mut()
                .zip(points.par_iter())
                .for_each(|(o, p)| *o = self.accel_at_point(*p));
        }
    }

    fn accel_at_point(&self, p: [f64; 3]) -> [f64; 3] {
        let dim = self.cfg.dim;
        let mut out = [0.0; 3];
        match self.cfg.split {
            SplitKind::BarnesHut => {
                let mut s = BarnesHutOpening::new(dim, self.cfg.opening_angle);
                s.focus(p);
                self.point_walk(&s, &p, &mut out);
            }
            SplitKind::Acceleration => {
                let mut s = AccelOpening::new(dim, self.cfg.accel_tol);
                s.focus(p);
                self.point_walk(&s, &p, &mut out);
            }
        }
        out
    }

    fn point_walk<S: Splitter>(&self, splitter: &S, target: &[f64; 3], out: &mut [f64; 3]) {
        let dim = self.cfg.dim;
        let mut idx = ROOT;
        while idx != NONE {
            let node = self.pool.node(idx);
            let m = node.moments();
            if m.mass == 0.0 {
                idx = m.next_sibling;
            } else if node.flags.is_leaf() || !splitter.split(node) {
                // query points are not tree residents: no cell skip
                let mut dr = [0.0; 3];
                let mut r2 = 0.0;
                for k in 0..dim {
                    dr[k] = m.com[k] - target[k];
                    r2 += dr[k] * dr[k];
                }
                let inv_r = 1.0 / (r2 + crate::interaction::R2_TINY).sqrt();
                let inv_r3 = inv_r * inv_r * inv_r;
                for k in 0..dim {
                    out[k] += m.mass * dr[k] * inv_r3;
                }
                idx = m.next_sibling;
            } else {
                idx = m.first_child;
            }
        }
    }
}
