//! Collective communication abstraction standing in for MPI.
//!
//! Real MPI bindings are out of scope; what the map-reduce stage
//! actually needs from MPI is a rank/world-size pair and a point-to-point byte
//! transport between two ranks. [`MpiCommunicator`] captures exactly that surface so
//! [`crate::mapreduce::MapReduceNode`] can run unmodified against a single process
//! ([`SingleProcessComm`]) or a simulated multi-rank world ([`ThreadSimulatedComm`],
//! used by the S3 scenario tests). `send_dataset`/`recv_dataset` are convenience
//! wrappers over the byte primitives; `crate::mapreduce`'s gather messages (which also
//! need to carry a failure sentinel, not just a `Dataset`) use the byte primitives
//! directly.

use crate::dataset::Dataset;
use crate::error::{KernelError, KernelResult};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

/// A rank-to-rank byte transport, the collective surface the map-reduce stage's
/// cross-rank reduction is built on.
pub trait MpiCommunicator: Send + Sync {
    /// This process's rank, `0..world_size()`.
    fn rank(&self) -> usize;

    /// Total number of ranks in the world.
    fn world_size(&self) -> usize;

    /// Blocking send of `bytes` to `dest`. Every call that logically corresponds to a
    /// peer's `recv_bytes` must eventually execute, even on the local failure path —
    /// skipping a send a peer is blocked waiting on deadlocks the world.
    fn send_bytes(&self, dest: usize, bytes: &[u8]) -> KernelResult<()>;

    /// Blocking receive of a single message sent by `source`.
    fn recv_bytes(&self, source: usize) -> KernelResult<Vec<u8>>;

    /// Blocking send of a [`Dataset`] to `dest`, framed via [`Dataset::to_bytes`].
    fn send_dataset(&self, dest: usize, dataset: &Dataset) -> KernelResult<()> {
        self.send_bytes(dest, &dataset.to_bytes())
    }

    /// Blocking receive of a single [`Dataset`] sent by `source`.
    fn recv_dataset(&self, source: usize) -> KernelResult<Dataset> {
        let bytes = self.recv_bytes(source)?;
        let (dataset, _consumed) = Dataset::from_bytes(&bytes)?;
        Ok(dataset)
    }
}

/// A single-rank "world": `rank() == 0`, `world_size() == 1`. Any call to
/// `send_bytes`/`recv_bytes` is a logic error — the map-reduce stage's cross-rank
/// reduction never issues one when `world_size() == 1` — and returns
/// `ProtocolFailure` rather than panicking.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcessComm;

impl MpiCommunicator for SingleProcessComm {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn send_bytes(&self, dest: usize, _bytes: &[u8]) -> KernelResult<()> {
        Err(KernelError::ProtocolFailure {
            reason: format!("SingleProcessComm has no peer to send to (dest={dest})"),
        })
    }

    fn recv_bytes(&self, source: usize) -> KernelResult<Vec<u8>> {
        Err(KernelError::ProtocolFailure {
            reason: format!("SingleProcessComm has no peer to receive from (source={source})"),
        })
    }
}

/// One simulated rank's view of a [`ThreadSimulatedComm`] world: a channel to every
/// other rank, used from its own OS thread.
pub struct ThreadSimulatedComm {
    rank: usize,
    world_size: usize,
    senders: Vec<Sender<Vec<u8>>>,
    receivers: Vec<Mutex<Receiver<Vec<u8>>>>,
}

impl ThreadSimulatedComm {
    /// Build `world_size` linked communicators, one per simulated rank, each owning a
    /// full mesh of channels to every other rank. Intended to be moved one-per-thread
    /// (see `crate::testing` fixtures and the S3 scenario tests).
    #[must_use]
    pub fn world(world_size: usize) -> Vec<Arc<ThreadSimulatedComm>> {
        let mut senders: Vec<Vec<Sender<Vec<u8>>>> = vec![Vec::new(); world_size];
        let mut receivers: Vec<Vec<Mutex<Receiver<Vec<u8>>>>> = (0..world_size).map(|_| Vec::new()).collect();

        for from in 0..world_size {
            for _to in 0..world_size {
                let (tx, rx) = std::sync::mpsc::channel();
                senders[from].push(tx);
                receivers[from].push(Mutex::new(rx));
            }
        }
        // Transpose so rank r's receivers[s] holds the channel rank s sends on to r.
        let mut transposed: Vec<Vec<Mutex<Receiver<Vec<u8>>>>> = (0..world_size).map(|_| Vec::new()).collect();
        for row in receivers {
            for (to, rx) in row.into_iter().enumerate() {
                transposed[to].push(rx);
            }
        }

        (0..world_size)
            .map(|rank| {
                let my_senders: Vec<Sender<Vec<u8>>> = (0..world_size).map(|to| senders[rank][to].clone()).collect();
                Arc::new(ThreadSimulatedComm {
                    rank,
                    world_size,
                    senders: my_senders,
                    receivers: std::mem::take(&mut transposed[rank]),
                })
            })
            .collect()
    }
}

impl MpiCommunicator for ThreadSimulatedComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send_bytes(&self, dest: usize, bytes: &[u8]) -> KernelResult<()> {
        self.senders[dest].send(bytes.to_vec()).map_err(|e| KernelError::ProtocolFailure {
            reason: format!("rank {} failed to send to rank {dest}: {e}", self.rank),
        })
    }

    fn recv_bytes(&self, source: usize) -> KernelResult<Vec<u8>> {
        self.receivers[source].lock().unwrap().recv().map_err(|e| KernelError::ProtocolFailure {
            reason: format!("rank {} failed to receive from rank {source}: {e}", self.rank),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Extent, Mesh};
    use crate::variant::VariantArray;

    #[test]
    fn single_process_comm_reports_one_rank_world() {
        let c = SingleProcessComm;
        assert_eq!(c.rank(), 0);
        assert_eq!(c.world_size(), 1);
        assert!(c.send_dataset(1, &Dataset::Empty).is_err());
    }

    #[test]
    fn thread_simulated_comm_roundtrips_a_dataset_between_two_ranks() {
        let world = ThreadSimulatedComm::world(2);
        let sender = Arc::clone(&world[0]);
        let receiver = Arc::clone(&world[1]);

        let mut mesh = Mesh::new(Extent::new(0, 1, 0, 0, 0, 0));
        mesh.point_arrays.set("m", VariantArray::new_f64(vec![1.0, 2.0]));
        let sent = Dataset::Mesh(mesh);
        let expected = sent.clone();

        let sender_handle = std::thread::spawn(move || sender.send_dataset(1, &sent).unwrap());
        let received = receiver.recv_dataset(0).unwrap();
        sender_handle.join().unwrap();

        assert_eq!(received, expected);
    }
}
