//! Distributed build and walk.
//!
//! Every rank holds the same top tree, whose leaves are the partition units
//! of the load-balance tree; only the subtrees below locally owned top
//! leaves are refined with particles. After the local moment pass the
//! per-leaf moments are all-gathered so the upper tree summarizes the full
//! global mass distribution, and the walk exports a particle to a rank
//! exactly when it has to open that rank's region.

use std::time::Instant;

use log::debug;

use crate::config::SplitKind;
use crate::error::{GravityError, Result};
use crate::interaction::monopole_accel;
use crate::particles::{ParticleSet, ParticleTag};
use crate::partition::PartitionTree;
use crate::pool::{NodeFlags, NONE};
use crate::remote::RemoteNodeTable;
use crate::splitter::{AccelOpening, BarnesHutOpening, Splitter};
use crate::transport::Comm;
use crate::tree::{GravityTree, ROOT};

/// Outcome of a distributed walk.
#[derive(Clone, Copy, Debug, Default)]
pub struct WalkStats {
    /// Export/import rounds until global termination.
    pub rounds: usize,
    /// Total `(particle, rank)` pairs this rank exported.
    pub exported: usize,
}

/// Saved position of a particle whose export walk hit the buffer cap. The
/// scratch accumulator travels with it so the summation grouping does not
/// depend on where the cap lands.
struct PausedWalk {
    pid: usize,
    resume: usize,
    acc: [f64; 3],
}

enum Segment {
    Completed,
    Paused(usize),
}

impl GravityTree {
    /// Distributed build: replicate the top tree, insert local Real
    /// particles below their top-tree leaves, aggregate local moments, then
    /// exchange and re-aggregate remote moments.
    pub fn build_distributed<C: Comm>(&mut self, pc: &ParticleSet, comm: &C) -> Result<()> {
        if !self.cfg.parallel {
            return Err(GravityError::Config(
                "tree is configured serial; use build".to_string(),
            ));
        }
        let t0 = Instant::now();
        self.make_root();
        self.replicate_top_tree(comm.rank(), comm.size())?;

        // Identical replication everywhere is a precondition for every
        // exchange that follows.
        let local_nodes = self.pool.count_nodes();
        let total = comm.all_reduce_sum(local_nodes);
        if total != local_nodes * comm.size() {
            return Err(GravityError::Protocol(format!(
                "top-tree node counts differ across ranks (local {local_nodes}, global sum {total})"
            )));
        }

        for pid in 0..pc.len() {
            if pc.tag[pid] == ParticleTag::Real {
                let start = self.top_leaf_for(pc.key[pid])?;
                self.insert_particle(&pc.position, pid, start)?;
            }
        }
        self.update_moments(pc);
        self.exchange_moments(comm);
        debug!(
            "built distributed tree on rank {}: {} nodes, {} top leaves, {:.3} ms",
            comm.rank(),
            self.pool.count_nodes(),
            self.table.len(),
            t0.elapsed().as_secs_f64() * 1e3
        );
        Ok(())
    }

    /// Copy the load-balance tree into the pool, reordering each child block
    /// from Hilbert order to Z order, and build the remote-node table.
    fn replicate_top_tree(&mut self, rank: usize, num_ranks: usize) -> Result<()> {
        let part = self.partition.take().ok_or(GravityError::NoPartition)?;
        self.pool.reserve(part.node_count());

        let mut leaves: Vec<(usize, usize, usize)> = Vec::with_capacity(part.leaf_count());
        self.copy_top(part.as_ref(), 0, ROOT, rank, &mut leaves);

        if let Some(&(_, _, owner)) = leaves.iter().find(|l| l.2 >= num_ranks) {
            self.partition = Some(part);
            return Err(GravityError::Protocol(format!(
                "partition assigns a leaf to rank {owner}, but only {num_ranks} ranks exist"
            )));
        }
        let (table, leaf_row) = RemoteNodeTable::build(&leaves, num_ranks);

        for (row, r) in table.rows.iter().enumerate() {
            self.pool.node_mut(r.map).table_row = row;
        }
        self.leaf_row = leaf_row;
        self.table = table;
        self.partition = Some(part);
        Ok(())
    }

    fn copy_top(
        &mut self,
        part: &dyn PartitionTree,
        pidx: usize,
        gidx: usize,
        rank: usize,
        leaves: &mut Vec<(usize, usize, usize)>,
    ) {
        let pn = part.node(pidx);
        let node = self.pool.node_mut(gidx);
        node.flags.set(NodeFlags::TOP_TREE);

        if pn.is_leaf() {
            node.flags.set(NodeFlags::TOP_TREE_LEAF);
            let owner = part.owner(pn.array_index);
            if owner != rank {
                node.flags.set(NodeFlags::TOP_TREE_LEAF_REMOTE);
                node.flags.set(NodeFlags::SKIP_BRANCH);
            }
            leaves.push((pn.array_index, gidx, owner));
            return;
        }

        let first = self.subdivide(gidx);
        for z in 0..self.cfg.fanout() {
            let child = pn.children_start + pn.zorder_to_hilbert[z] as usize;
            self.copy_top(part, child, first + z, rank, leaves);
        }
    }

    /// Pool index of the top-tree leaf whose key range contains `key`:
    /// partition lookup, then translation through the `map` column of the
    /// remote-node table.
    pub(crate) fn top_leaf_for(&self, key: u64) -> Result<usize> {
        let part = self.partition.as_ref().ok_or(GravityError::NoPartition)?;
        let row = self.leaf_row[part.find_leaf(key)];
        Ok(self.table.rows[row].map)
    }

    /// All-gather the per-top-leaf moments and refresh the upper tree from
    /// them, so every node above any top leaf carries global moments.
    fn exchange_moments<C: Comm>(&mut self, comm: &C) {
        let rank = comm.rank();
        let nrows = self.table.len();
        if nrows == 0 {
            return;
        }

        let lo = self.table.send_displs[rank];
        let hi = lo + self.table.send_counts[rank];
        for row in &mut self.table.rows[lo..hi] {
            let m = *self.pool.node(row.map).moments();
            row.mass = m.mass;
            row.com = m.com;
        }

        let counts = self.table.send_counts.clone();
        let displs = self.table.send_displs.clone();
        let mut field = vec![0.0f64; nrows];

        for i in lo..hi {
            field[i] = self.table.rows[i].mass;
        }
        comm.all_gather(&mut field, &counts, &displs);
        for (row, &v) in self.table.rows.iter_mut().zip(field.iter()) {
            row.mass = v;
        }

        for k in 0..self.cfg.dim {
            for i in lo..hi {
                field[i] = self.table.rows[i].com[k];
            }
            comm.all_gather(&mut field, &counts, &displs);
            for (row, &v) in self.table.rows.iter_mut().zip(field.iter()) {
                row.com[k] = v;
            }
        }

        for i in 0..nrows {
            let row = self.table.rows[i];
            if row.proc == rank {
                continue;
            }
            let m = self.pool.node_mut(row.map).payload_moments_mut();
            m.mass = row.mass;
            m.com = row.com;
        }

        self.update_remote_moments(ROOT);
    }

    /// Post-order refresh above the top leaves. Top-tree leaves keep their
    /// just-received values authoritative; everything above is recomputed
    /// from its children through the sibling thread.
    fn update_remote_moments(&mut self, idx: usize) {
        let node = *self.pool.node(idx);
        if node.flags.is_top_leaf() || node.flags.is_leaf() {
            return;
        }
        let m = *node.moments();
        let end = m.next_sibling;

        let mut child = m.first_child;
        while child != end {
            self.update_remote_moments(child);
            child = self.pool.node(child).moments().next_sibling;
        }

        let mut mass = 0.0;
        let mut weighted = [0.0; 3];
        let mut populated = 0usize;
        let mut single = NONE;
        let mut child = m.first_child;
        while child != end {
            let cm = *self.pool.node(child).moments();
            if cm.mass != 0.0 {
                populated += 1;
                single = child;
                mass += cm.mass;
                for k in 0..self.cfg.dim {
                    weighted[k] += cm.mass * cm.com[k];
                }
            }
            child = cm.next_sibling;
        }

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

        let out = self.pool.node_mut(idx).payload_moments_mut();
        out.mass = mass;
        out.com = com;
    }

    /// Distributed walk: alternate bounded-buffer export walks and import
    /// walks until every rank has drained its particles.
    pub fn walk_distributed<C: Comm>(&self, pc: &mut ParticleSet, comm: &C) -> Result<WalkStats> {
        if !self.cfg.parallel {
            return Err(GravityError::Config(
                "tree is configured serial; use walk".to_string(),
            ));
        }
        if self.pool.count_nodes() == 0 {
            return Err(GravityError::Config("walk before build".to_string()));
        }
        let dim = self.cfg.dim;
        match self.cfg.split {
            SplitKind::BarnesHut => self.walk_rounds(
                pc,
                comm,
                BarnesHutOpening::new(dim, self.cfg.opening_angle),
            ),
            SplitKind::Acceleration => {
                self.walk_rounds(pc, comm, AccelOpening::new(dim, self.cfg.accel_tol))
            }
        }
    }

    fn walk_rounds<C: Comm, S: Splitter>(
        &self,
        pc: &mut ParticleSet,
        comm: &C,
        mut splitter: S,
    ) -> Result<WalkStats> {
        let t0 = Instant::now();
        let dim = self.cfg.dim;
        let size = comm.size();
        let n = pc.len();

        // Remote contributions are folded in once, at termination, so the
        // result does not depend on where the buffer cap lands.
        let mut remote_acc = vec![[0.0f64; 3]; n];
        let mut exported_rank = vec![false; size];
        let mut cursor = 0usize;
        let mut paused: Option<PausedWalk> = None;
        let mut stats = WalkStats::default();

        loop {
            stats.rounds += 1;
            let mut exports: Vec<(usize, usize)> = Vec::new();

            // export walk: continue the paused particle, then drain the rest
            'particles: loop {
                let (pid, start, mut acc) = match paused.take() {
                    Some(p) => (p.pid, p.resume, p.acc),
                    None => {
                        let mut next = None;
                        while cursor < n {
                            let row = cursor;
                            cursor += 1;
                            if pc.tag[row] == ParticleTag::Real {
                                next = Some(row);
                                break;
                            }
                        }
                        match next {
                            Some(pid) => {
                                pc.accel[pid] = [0.0; 3];
                                exported_rank.iter_mut().for_each(|e| *e = false);
                                (pid, ROOT, [0.0; 3])
                            }
                            None => break 'particles,
                        }
                    }
                };

                let target = pc.position[pid];
                splitter.focus(target);
                let segment = self.export_segment(
                    &splitter,
                    &target,
                    start,
                    pid,
                    &mut acc,
                    &mut exports,
                    &mut exported_rank,
                );
                match segment {
                    Segment::Paused(resume) => {
                        paused = Some(PausedWalk { pid, resume, acc });
                        break 'particles;
                    }
                    Segment::Completed => {
                        for k in 0..dim {
                            pc.accel[pid][k] += acc[k];
                        }
                    }
                }
            }

            // pack order: stable by table row, i.e. by (rank, SFC key)
            exports.sort_by_key(|e| e.0);
            stats.exported += exports.len();

            let mut scounts = vec![0usize; size];
            for &(row, _) in &exports {
                scounts[self.table.rows[row].proc] += 1;
            }
            let rcounts = comm.all_to_all(&scounts);

            let mut sdispls = vec![0usize; size];
            let mut rdispls = vec![0usize; size];
            for r in 1..size {
                sdispls[r] = sdispls[r - 1] + scounts[r - 1];
                rdispls[r] = rdispls[r - 1] + rcounts[r - 1];
            }
            let n_out = exports.len();
            let n_in: usize = rcounts.iter().sum();

            // particles out
            let mut send = vec![0.0f64; n_out * dim];
            for (i, &(_, pid)) in exports.iter().enumerate() {
                for k in 0..dim {
                    send[i * dim + k] = pc.position[pid][k];
                }
            }
            let scounts_f: Vec<usize> = scounts.iter().map(|c| c * dim).collect();
            let rcounts_f: Vec<usize> = rcounts.iter().map(|c| c * dim).collect();
            let sdispls_f: Vec<usize> = sdispls.iter().map(|d| d * dim).collect();
            let rdispls_f: Vec<usize> = rdispls.iter().map(|d| d * dim).collect();
            let mut recv = vec![0.0f64; n_in * dim];
            comm.exchange(&send, &scounts_f, &sdispls_f, &mut recv, &rcounts_f, &rdispls_f);

            // import walk over the received foreign particles
            let mut import_acc = vec![0.0f64; n_in * dim];
            for i in 0..n_in {
                let mut target = [0.0; 3];
                for k in 0..dim {
                    target[k] = recv[i * dim + k];
                }
                splitter.focus(target);
                let mut acc = [0.0; 3];
                self.import_walk(&splitter, &target, &mut acc);
                for k in 0..dim {
                    import_acc[i * dim + k] = acc[k];
                }
            }

            // results back, same counts reversed
            let mut returned = vec![0.0f64; n_out * dim];
            comm.exchange(
                &import_acc,
                &rcounts_f,
                &rdispls_f,
                &mut returned,
                &scounts_f,
                &sdispls_f,
            );
            for (i, &(_, pid)) in exports.iter().enumerate() {
                for k in 0..dim {
                    remote_acc[pid][k] += returned[i * dim + k];
                }
            }

            let local_done = usize::from(cursor >= n && paused.is_none());
            let glb_done = comm.all_reduce_sum(local_done);
            debug!(
                "walk round {} on rank {}: {} exported, {} imported, {}/{} ranks done",
                stats.rounds,
                comm.rank(),
                n_out,
                n_in,
                glb_done,
                size
            );
            if glb_done == size {
                break;
            }
        }

        for pid in 0..n {
            if pc.tag[pid] == ParticleTag::Real {
                for k in 0..dim {
                    pc.accel[pid][k] += remote_acc[pid][k];
                }
            }
        }
        debug!(
            "distributed walk on rank {}: {} rounds, {} exports, {:.3} ms",
            comm.rank(),
            stats.rounds,
            stats.exported,
            t0.elapsed().as_secs_f64() * 1e3
        );
        Ok(stats)
    }

    /// One contiguous stretch of a particle's export walk: runs until the
    /// traversal ends or the export buffer fills. Local mass interacts as in
    /// the serial walk; an opened remote top leaf records one export per
    /// destination rank instead.
    #[allow(clippy::too_many_arguments)]
    fn export_segment<S: Splitter>(
        &self,
        splitter: &S,
        target: &[f64; 3],
        start: usize,
        pid: usize,
        acc: &mut [f64; 3],
        exports: &mut Vec<(usize, usize)>,
        exported_rank: &mut [bool],
    ) -> Segment {
        let dim = self.cfg.dim;
        let mut idx = start;
        while idx != NONE {
            let node = self.pool.node(idx);
            let m = node.moments();
            if m.mass == 0.0 {
                idx = m.next_sibling;
            } else if node.flags.is_remote_leaf() {
                if splitter.split(node) {
                    let rank = self.table.rows[node.table_row].proc;
                    if !exported_rank[rank] {
                        exported_rank[rank] = true;
                        exports.push((node.table_row, pid));
                        if exports.len() >= self.cfg.max_export {
                            return Segment::Paused(m.next_sibling);
                        }
                    }
                } else {
                    monopole_accel(dim, node, target, acc);
                }
                idx = m.next_sibling;
            } else if node.flags.is_leaf() {
                monopole_accel(dim, node, target, acc);
                idx = m.next_sibling;
            } else if splitter.split(node) {
                idx = m.first_child;
            } else {
                monopole_accel(dim, node, target, acc);
                idx = m.next_sibling;
            }
        }
        Segment::Completed
    }

    /// Walk for a foreign particle: only mass below locally owned top-tree
    /// leaves may interact. Top-tree summaries the exporting rank already
    /// accounted for are stepped over, remote regions and empty branches
    /// are skipped outright.
    fn import_walk<S: Splitter>(&self, splitter: &S, target: &[f64; 3], acc: &mut [f64; 3]) {
        let dim = self.cfg.dim;
        let mut idx = ROOT;
        while idx != NONE {
            let node = self.pool.node(idx);
            let m = node.moments();
            if m.mass == 0.0 || node.flags.is_skip_branch() || node.flags.is_remote_leaf() {
                idx = m.next_sibling;
            } else if node.flags.is_top() {
                if !splitter.split(node) {
                    // the exporter interacted with this summary itself
                    idx = m.next_sibling;
                } else if m.first_child != NONE {
                    idx = m.first_child;
                } else {
                    // a still-unrefined local top leaf: its lone particle is
                    // exactly what the exporter could not see
                    monopole_accel(dim, node, target, acc);
                    idx = m.next_sibling;
                }
            } else if node.flags.is_leaf() {
                monopole_accel(dim, node, target, acc);
                idx = m.next_sibling;
            } else if splitter.split(node) {
                idx = m.first_child;
            } else {
                monopole_accel(dim, node, target, acc);
                idx = m.next_sibling;
            }
        }
    }
}
