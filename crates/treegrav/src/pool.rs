//! Node records and the bump-allocating node pool.
//!
//! Nodes are fixed-size and live in one contiguous, index-addressed array.
//! Indices stay valid across pool growth; references do not, so callers
//! re-resolve after every [`NodePool::acquire`].

/// Index sentinel: no such node. Also terminates the threaded walk (the
/// root's `next_sibling`).
pub const NONE: usize = usize::MAX;

/// Hard cap on leaf subdivisions while separating two particles. Reaching it
/// means two Real particles share coordinates to below f64 cell resolution.
pub const MAX_SPLITS: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeFlags(u8);

impl NodeFlags {
    pub const LEAF: u8 = 1 << 0;
    pub const HAS_PARTICLE: u8 = 1 << 1;
    pub const TOP_TREE: u8 = 1 << 2;
    pub const TOP_TREE_LEAF: u8 = 1 << 3;
    pub const TOP_TREE_LEAF_REMOTE: u8 = 1 << 4;
    pub const SKIP_BRANCH: u8 = 1 << 5;

    #[inline]
    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    #[inline]
    pub fn clear(&mut self, bit: u8) {
        self.0 &= !bit;
    }

    #[inline]
    pub fn has(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.has(Self::LEAF)
    }

    #[inline]
    pub fn has_particle(&self) -> bool {
        self.has(Self::HAS_PARTICLE)
    }

    #[inline]
    pub fn is_top(&self) -> bool {
        self.has(Self::TOP_TREE)
    }

    #[inline]
    pub fn is_top_leaf(&self) -> bool {
        self.has(Self::TOP_TREE_LEAF)
    }

    #[inline]
    pub fn is_remote_leaf(&self) -> bool {
        self.has(Self::TOP_TREE_LEAF_REMOTE)
    }

    #[inline]
    pub fn is_skip_branch(&self) -> bool {
        self.has(Self::SKIP_BRANCH)
    }
}

/// Moment form of a node, written by the moment pass. After that pass every
/// walk reads only this form.
#[derive(Clone, Copy, Debug, Default)]
pub struct Moments {
    pub mass: f64,
    pub com: [f64; 3],
    /// Z-first child, or [`NONE`] for a leaf.
    pub first_child: usize,
    /// Next node in the threaded pre-order: the parent's next populated
    /// child, or the parent's own sibling for the last child.
    pub next_sibling: usize,
}

/// Payload union of a node. Children are consulted only during build and
/// moment aggregation; walks consult only [`Payload::Moments`].
#[derive(Clone, Copy, Debug)]
pub enum Payload {
    /// Interior cell under construction: its `2^dim` children occupy the
    /// contiguous index block starting at `first`, in Z-order.
    Children { first: usize },
    /// Leaf under construction: the resident particle, if any.
    Leaf { pid: Option<usize> },
    /// Aggregated form.
    Moments(Moments),
}

#[derive(Clone, Copy, Debug)]
pub struct Node {
    pub flags: NodeFlags,
    /// Physical side length of the cell.
    pub width: f64,
    /// Geometric center of the cell.
    pub center: [f64; 3],
    pub payload: Payload,
    /// Remote-node-table row of a top-tree leaf; [`NONE`] elsewhere.
    pub table_row: usize,
}

impl Default for Node {
    fn default() -> Self {
        let mut flags = NodeFlags::default();
        flags.set(NodeFlags::LEAF);
        Node {
            flags,
            width: 0.0,
            center: [0.0; 3],
            payload: Payload::Leaf { pid: None },
            table_row: NONE,
        }
    }
}

impl Node {
    /// Moment view of this node. Valid only after the moment pass.
    #[inline]
    pub fn moments(&self) -> &Moments {
        match &self.payload {
            Payload::Moments(m) => m,
            _ => panic!("node read in moment form before update_moments"),
        }
    }

    /// Mutable moment view, for writing exchanged values back in place.
    #[inline]
    pub fn payload_moments_mut(&mut self) -> &mut Moments {
        match &mut self.payload {
            Payload::Moments(m) => m,
            _ => panic!("node written in moment form before update_moments"),
        }
    }

    /// Index of the child block during build.
    #[inline]
    pub fn children_first(&self) -> usize {
        match self.payload {
            Payload::Children { first } => first,
            _ => panic!("children read on a node not in build form"),
        }
    }

    /// Half-open containment test on the active axes.
    #[inline]
    pub fn contains(&self, x: &[f64; 3], dim: usize) -> bool {
        let half = 0.5 * self.width;
        for k in 0..dim {
            if x[k] < self.center[k] - half || x[k] >= self.center[k] + half {
                return false;
            }
        }
        true
    }
}

/// Growable arena of node records with bump allocation.
#[derive(Clone, Debug, Default)]
pub struct NodePool {
    nodes: Vec<Node>,
    used: usize,
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `n` contiguous slots and return the index of the first.
    /// Capacity doubles (repeatedly) as needed; previously returned indices
    /// stay valid, previously taken references do not.
    pub fn acquire(&mut self, n: usize) -> usize {
        let first = self.used;
        let need = self.used + n;
        if need > self.nodes.len() {
            let mut cap = self.nodes.len().max(64);
            while cap < need {
                cap *= 2;
            }
            self.nodes.resize(cap, Node::default());
        }
        // Slots may hold stale records from before a reset.
        for slot in &mut self.nodes[first..need] {
            *slot = Node::default();
        }
        self.used = need;
        first
    }

    /// Grow capacity ahead of a batch of acquires, without changing `used`.
    pub fn reserve(&mut self, n: usize) {
        let need = self.used + n;
        if need > self.nodes.len() {
            let mut cap = self.nodes.len().max(64);
            while cap < need {
                cap *= 2;
            }
            self.nodes.resize(cap, Node::default());
        }
    }

    /// Forget all nodes but keep capacity.
    pub fn reset(&mut self) {
        self.used = 0;
    }

    #[inline]
    pub fn count_nodes(&self) -> usize {
        self.used
    }

    pub fn count_leaves(&self) -> usize {
        self.nodes[..self.used]
            .iter()
            .filter(|n| n.flags.is_leaf())
            .count()
    }

    #[inline]
    pub fn node(&self, idx: usize) -> &Node {
        debug_assert!(idx < self.used);
        &self.nodes[idx]
    }

    #[inline]
    pub fn node_mut(&mut self, idx: usize) -> &mut Node {
        debug_assert!(idx < self.used);
        &mut self.nodes[idx]
    }
}
