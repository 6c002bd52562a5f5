//! Message transport.
//!
//! The solver coordinates ranks through four primitives: an in-place
//! variable-count all-gather, a one-element-per-rank all-to-all, a paired
//! block exchange by counts/displacements, and an integer all-reduce. The
//! trait keeps the core free of any particular wire layer: [`SelfComm`]
//! serves single-rank runs, [`LocalCluster`] runs ranks as threads of one
//! process, and an MPI world can be adapted by implementing [`Comm`] over
//! the same calls it would make anyway.
//!
//! A stalled or inconsistent collective is fatal at this layer: the bus
//! panics with a description rather than returning garbage counts upward.

use std::sync::{Arc, Condvar, Mutex};

pub trait Comm {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// In-place all-gather with variable counts: on entry this rank's block
    /// `buf[displs[rank] .. displs[rank] + counts[rank]]` is valid; on exit
    /// every rank's block is.
    fn all_gather(&self, buf: &mut [f64], counts: &[usize], displs: &[usize]);

    /// Exchange one value per rank; element `r` of the result is what rank
    /// `r` sent to this rank.
    fn all_to_all(&self, send: &[usize]) -> Vec<usize>;

    /// Paired symmetric exchange: the block destined for rank `r` is
    /// `send[sdispls[r] .. sdispls[r] + scounts[r]]`; the block received
    /// from rank `r` lands at `recv[rdispls[r] .. rdispls[r] + rcounts[r]]`.
    fn exchange(
        &self,
        send: &[f64],
        scounts: &[usize],
        sdispls: &[usize],
        recv: &mut [f64],
        rcounts: &[usize],
        rdispls: &[usize],
    );

    /// Sum of `value` over all ranks.
    fn all_reduce_sum(&self, value: usize) -> usize;
}

/// The single-rank transport: every collective is an identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelfComm;

impl Comm for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather(&self, _buf: &mut [f64], _counts: &[usize], _displs: &[usize]) {}

    fn all_to_all(&self, send: &[usize]) -> Vec<usize> {
        send.to_vec()
    }

    fn exchange(
        &self,
        send: &[f64],
        scounts: &[usize],
        sdispls: &[usize],
        recv: &mut [f64],
        rcounts: &[usize],
        rdispls: &[usize],
    ) {
        assert_eq!(scounts[0], rcounts[0], "self exchange counts disagree");
        let n = scounts[0];
        recv[rdispls[0]..rdispls[0] + n].copy_from_slice(&send[sdispls[0]..sdispls[0] + n]);
    }

    fn all_reduce_sum(&self, value: usize) -> usize {
        value
    }
}

#[derive(Clone, Debug)]
enum Board {
    Gather(Vec<f64>),
    Counts(Vec<usize>),
    Blocks {
        data: Vec<f64>,
        counts: Vec<usize>,
        displs: Vec<usize>,
    },
    Scalar(usize),
}

struct BusState {
    boards: Vec<Option<Board>>,
    barrier_count: usize,
    barrier_gen: u64,
}

struct Bus {
    size: usize,
    state: Mutex<BusState>,
    cv: Condvar,
}

impl Bus {
    fn new(size: usize) -> Self {
        Bus {
            size,
            state: Mutex::new(BusState {
                boards: vec![None; size],
                barrier_count: 0,
                barrier_gen: 0,
            }),
            cv: Condvar::new(),
        }
    }

    fn barrier(&self) {
        let mut st = self.state.lock().expect("transport bus poisoned");
        let gen = st.barrier_gen;
        st.barrier_count += 1;
        if st.barrier_count == self.size {
            st.barrier_count = 0;
            st.barrier_gen += 1;
            self.cv.notify_all();
        } else {
            while st.barrier_gen == gen {
                st = self.cv.wait(st).expect("transport bus poisoned");
            }
        }
    }

    /// Post this rank's contribution, wait for everyone, and take a snapshot
    /// of all boards. The trailing barrier keeps any rank from reposting
    /// before all ranks have read.
    fn post_and_collect(&self, rank: usize, board: Board) -> Vec<Board> {
        {
            let mut st = self.state.lock().expect("transport bus poisoned");
            st.boards[rank] = Some(board);
        }
        self.barrier();
        let all: Vec<Board> = {
            let st = self.state.lock().expect("transport bus poisoned");
            st.boards
                .iter()
                .map(|b| b.clone().expect("rank missing from collective"))
                .collect()
        };
        self.barrier();
        all
    }
}

/// One rank's endpoint of an in-process cluster.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    bus: Arc<Bus>,
}

/// Deterministic in-process multi-rank transport. Create one cluster, hand
/// each [`ThreadComm`] to its rank's thread.
pub struct LocalCluster;

impl LocalCluster {
    pub fn create(size: usize) -> Vec<ThreadComm> {
        assert!(size >= 1);
        let bus = Arc::new(Bus::new(size));
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                bus: Arc::clone(&bus),
            })
            .collect()
    }
}

impl Comm for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.bus.size
    }

    fn all_gather(&self, buf: &mut [f64], counts: &[usize], displs: &[usize]) {
        let mine = buf[displs[self.rank]..displs[self.rank] + counts[self.rank]].to_vec();
        let boards = self.bus.post_and_collect(self.rank, Board::Gather(mine));
        for (r, board) in boards.into_iter().enumerate() {
            let Board::Gather(block) = board else {
                panic!("all_gather: rank {r} posted a different collective");
            };
            assert_eq!(
                block.len(),
                counts[r],
                "all_gather: rank {r} block size disagrees with counts"
            );
            buf[displs[r]..displs[r] + counts[r]].copy_from_slice(&block);
        }
    }

    fn all_to_all(&self, send: &[usize]) -> Vec<usize> {
        assert_eq!(send.len(), self.size());
        let boards = self
            .bus
            .post_and_collect(self.rank, Board::Counts(send.to_vec()));
        boards
            .into_iter()
            .enumerate()
            .map(|(r, board)| {
                let Board::Counts(row) = board else {
                    panic!("all_to_all: rank {r} posted a different collective");
                };
                assert_eq!(row.len(), self.size());
                row[self.rank]
            })
            .collect()
    }

    fn exchange(
        &self,
        send: &[f64],
        scounts: &[usize],
        sdispls: &[usize],
        recv: &mut [f64],
        rcounts: &[usize],
        rdispls: &[usize],
    ) {
        let board = Board::Blocks {
            data: send.to_vec(),
            counts: scounts.to_vec(),
            displs: sdispls.to_vec(),
        };
        let boards = self.bus.post_and_collect(self.rank, board);
        for (src, board) in boards.into_iter().enumerate() {
            let Board::Blocks {
                data,
                counts,
                displs,
            } = board
            else {
                panic!("exchange: rank {src} posted a different collective");
            };
            assert_eq!(
                counts[self.rank], rcounts[src],
                "exchange: rank {src} send count disagrees with our recv count"
            );
            let n = rcounts[src];
            let from = displs[self.rank];
            recv[rdispls[src]..rdispls[src] + n].copy_from_slice(&data[from..from + n]);
        }
    }

    fn all_reduce_sum(&self, value: usize) -> usize {
        let boards = self.bus.post_and_collect(self.rank, Board::Scalar(value));
        boards
            .into_iter()
            .map(|board| match board {
                Board::Scalar(v) => v,
                _ => panic!("all_reduce_sum: mismatched collective"),
            })
            .sum()
    }
}
