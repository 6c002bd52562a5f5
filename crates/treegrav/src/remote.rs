//! Remote-node table.
//!
//! One row per top-tree leaf, globally, ordered by `(owning rank, SFC key)`.
//! The table doubles as the exchange buffer for the moment all-gather and as
//! the lookup that writes received moments back into the local pool.

use crate::pool::NONE;

#[derive(Clone, Copy, Debug)]
pub struct RemoteRow {
    /// Pool index of the corresponding top-tree leaf node.
    pub map: usize,
    /// Owning rank of this partition leaf.
    pub proc: usize,
    pub mass: f64,
    pub com: [f64; 3],
}

impl Default for RemoteRow {
    fn default() -> Self {
        RemoteRow {
            map: NONE,
            proc: 0,
            mass: 0.0,
            com: [0.0; 3],
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RemoteNodeTable {
    pub rows: Vec<RemoteRow>,
    /// Rows owned by each rank; the per-rank blocks are contiguous.
    pub send_counts: Vec<usize>,
    /// Starting row of each rank's block.
    pub send_displs: Vec<usize>,
}

impl RemoteNodeTable {
    /// Build the table from `(leaf array index, pool node, owner)` triples
    /// listed in SFC leaf order. Returns the table and the map from leaf
    /// array index to table row.
    pub fn build(leaves: &[(usize, usize, usize)], num_ranks: usize) -> (Self, Vec<usize>) {
        let mut order: Vec<usize> = (0..leaves.len()).collect();
        // ranks own contiguous key ranges, so this is usually already
        // sorted; the stable sort pins the (rank, key) order either way
        order.sort_by_key(|&i| (leaves[i].2, leaves[i].0));

        let mut rows = Vec::with_capacity(leaves.len());
        let mut leaf_row = vec![NONE; leaves.len()];
        let mut send_counts = vec![0usize; num_ranks];
        for (row, &i) in order.iter().enumerate() {
            let (array_index, node, proc) = leaves[i];
            rows.push(RemoteRow {
                map: node,
                proc,
                ..RemoteRow::default()
            });
            leaf_row[array_index] = row;
            send_counts[proc] += 1;
        }
        let mut send_displs = vec![0usize; num_ranks];
        for r in 1..num_ranks {
            send_displs[r] = send_displs[r - 1] + send_counts[r - 1];
        }
        (
            RemoteNodeTable {
                rows,
                send_counts,
                send_displs,
            },
            leaf_row,
        )
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.send_counts.clear();
        self.send_displs.clear();
    }
}
