//! Parallel map-reduce stage (C5): MPI-rank partitioning over thread-pool concurrency.
//!
//! [`MapReduceNode`] fans a contiguous `[first_step, last_step]` range of time steps
//! out across the MPI world (contiguous block partitioning, earlier ranks
//! absorbing the remainder), fetches its local block's datasets concurrently through a
//! `rayon` thread pool of configurable size, folds them in ascending step
//! order through a user-supplied, possibly non-commutative [`Reducer`],
//! then combines the per-rank partials into a single dataset with a deadlock-safe
//! binary-tree all-to-one reduction that preserves strict ascending rank order.
//! The local fold and the cross-rank combine share one Empty-aware wrapper
//! around the reducer, grounded in the original's `mesh_accumulate` pattern (an
//! `if (rightds && !leftds) return rightds; ...` guard before ever touching the
//! reducer), see `examples/original_source/apps/teca_moisture_density.cpp`.

use crate::comm::MpiCommunicator;
use crate::dataset::Dataset;
use crate::error::{KernelError, KernelResult};
use crate::metadata::Metadata;
use crate::node::{AlgorithmNode, PropertyDescriptor, PropertyKind, PropertyValue};
use std::sync::{Arc, Mutex};

/// The user-supplied combine step. Not assumed commutative — `MapReduceNode` never
/// reorders datasets relative to ascending time-step order, so a reducer like
/// "concatenate text" or "keep the most recent valid reading" behaves identically
/// under any partitioning across ranks or thread-pool sizes.
pub trait Reducer: Send + Sync {
    fn reduce(&self, left: Dataset, right: Dataset) -> KernelResult<Dataset>;
}

impl<F> Reducer for F
where
    F: Fn(Dataset, Dataset) -> KernelResult<Dataset> + Send + Sync,
{
    fn reduce(&self, left: Dataset, right: Dataset) -> KernelResult<Dataset> {
        self(left, right)
    }
}

struct Properties {
    /// -1 means "use 0" (the range start).
    first_step: i64,
    /// -1 means "use `number_of_time_steps - 1`" (the range end).
    last_step: i64,
    /// -1 means "use hardware concurrency" (a common `ExecMode::Parallel`
    /// sentinel convention).
    thread_pool_size: i64,
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            first_step: -1,
            last_step: -1,
            thread_pool_size: -1,
        }
    }
}

/// A message exchanged during the cross-rank reduction: either a combined dataset, or
/// a sentinel recording that the sending subtree failed. A rank designated to send at
/// a given tree level always sends one of these — even when its own subtree result is
/// an error — so the receiving rank's blocking `recv_bytes` is never left waiting on a
/// message that was silently skipped.
enum GatherMessage {
    Data(Dataset),
    Failed(String),
}

impl GatherMessage {
    fn from_result(r: &KernelResult<Dataset>) -> Self {
        match r {
            Ok(d) => GatherMessage::Data(d.clone()),
            Err(e) => GatherMessage::Failed(e.to_string()),
        }
    }

    fn into_result(self) -> KernelResult<Dataset> {
        match self {
            GatherMessage::Data(d) => Ok(d),
            GatherMessage::Failed(reason) => Err(KernelError::ProtocolFailure {
                reason: format!("peer rank reported a failure: {reason}"),
            }),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            GatherMessage::Data(d) => {
                let mut buf = vec![0u8];
                buf.extend_from_slice(&d.to_bytes());
                buf
            }
            GatherMessage::Failed(reason) => {
                let mut buf = vec![1u8];
                buf.extend_from_slice(&(reason.len() as u64).to_le_bytes());
                buf.extend_from_slice(reason.as_bytes());
                buf
            }
        }
    }

    fn from_bytes(bytes: &[u8]) -> KernelResult<Self> {
        match bytes.first() {
            Some(0) => {
                let (d, _) = Dataset::from_bytes(&bytes[1..])?;
                Ok(GatherMessage::Data(d))
            }
            Some(1) => {
                let len_bytes = bytes
                    .get(1..9)
                    .ok_or_else(|| KernelError::ProtocolFailure {
                        reason: "truncated gather-message failure length".to_string(),
                    })?;
                let len = u64::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
                let reason_bytes = bytes
                    .get(9..9 + len)
                    .ok_or_else(|| KernelError::ProtocolFailure {
                        reason: "truncated gather-message failure text".to_string(),
                    })?;
                let reason = String::from_utf8(reason_bytes.to_vec()).map_err(|_| KernelError::ProtocolFailure {
                    reason: "invalid utf-8 in gather-message failure text".to_string(),
                })?;
                Ok(GatherMessage::Failed(reason))
            }
            _ => Err(KernelError::ProtocolFailure {
                reason: "unrecognized gather-message tag".to_string(),
            }),
        }
    }
}

/// The map-reduce stage. Has exactly one input port and one output port: pulls a
/// time-indexed series of datasets from its upstream connection and produces a single
/// reduced dataset.
pub struct MapReduceNode<R: Reducer> {
    name: String,
    reducer: R,
    comm: Arc<dyn MpiCommunicator>,
    properties: Mutex<Properties>,
}

impl<R: Reducer> MapReduceNode<R> {
    pub fn new(name: impl Into<String>, reducer: R, comm: Arc<dyn MpiCommunicator>) -> Self {
        Self {
            name: name.into(),
            reducer,
            comm,
            properties: Mutex::new(Properties::default()),
        }
    }

    /// Empty-aware combine wrapper, grounded in the original's `mesh_accumulate`:
    /// `if (rightds && !leftds) return rightds; else if (!rightds && leftds) return
    /// leftds; else <user reducer>`. Keeps `Reducer` implementations free of Empty
    /// bookkeeping — they only ever see two genuine datasets.
    fn combine(&self, left: Dataset, right: Dataset) -> KernelResult<Dataset> {
        match (left.is_empty(), right.is_empty()) {
            (true, true) => Ok(Dataset::Empty),
            (true, false) => Ok(right),
            (false, true) => Ok(left),
            (false, false) => self.reducer.reduce(left, right),
        }
    }

    fn effective_thread_pool_size(&self) -> usize {
        let configured = self.properties.lock().unwrap().thread_pool_size;
        if configured < 0 {
            num_cpus::get()
        } else {
            configured.max(1) as usize
        }
    }

    /// Resolve the `[first_step, last_step]` range against the upstream report's
    /// `number_of_time_steps`, applying the `-1` "unset" sentinels.
    fn resolve_range(&self, upstream_report: &Metadata) -> KernelResult<(i64, i64)> {
        let n = upstream_report.get_scalar::<i64>("number_of_time_steps")?;
        let props = self.properties.lock().unwrap();
        let first = if props.first_step < 0 { 0 } else { props.first_step };
        let last = if props.last_step < 0 { n - 1 } else { props.last_step };
        Ok((first, last))
    }

    /// Contiguous block partitioning: `total` steps split into
    /// `world_size` blocks of size `total / world_size`, with the first `total %
    /// world_size` ranks absorbing one extra step each. Returns this rank's assigned
    /// step indices in ascending order.
    fn local_steps(&self, first: i64, last: i64) -> Vec<i64> {
        let total = (last - first + 1).max(0) as u64;
        let world = self.comm.world_size() as u64;
        let rank = self.comm.rank() as u64;
        let base = total / world;
        let rem = total % world;
        let (my_count, steps_before) = if rank < rem {
            (base + 1, rank * (base + 1))
        } else {
            (base, rem * (base + 1) + (rank - rem) * base)
        };
        (0..my_count).map(|i| first + steps_before as i64 + i as i64).collect()
    }

    /// Deadlock-safe binary-tree all-to-one reduction over `[lo, hi]`. The rank at
    /// `lo` of a subrange always receives from and combines with the rank at `mid`
    /// (the first rank of the subrange's right half); `mid` always sends — wrapping
    /// its subtree's result in a [`GatherMessage::Failed`] sentinel rather than
    /// skipping the send — so `lo`'s blocking receive is never left waiting on a
    /// message a failed peer chose not to send. Order is preserved because rank order
    /// matches ascending step order under the contiguous partitioning above.
    fn reduce_range(&self, lo: usize, hi: usize, local: KernelResult<Dataset>) -> KernelResult<Dataset> {
        if lo == hi {
            return local;
        }
        let mid = lo + (hi - lo) / 2 + 1;
        let rank = self.comm.rank();
        if rank < mid {
            let left_result = self.reduce_range(lo, mid - 1, local);
            if rank == lo {
                let bytes = self.comm.recv_bytes(mid)?;
                let right = GatherMessage::from_bytes(&bytes)?.into_result()?;
                self.combine(left_result?, right)
            } else {
                left_result
            }
        } else {
            let right_result = self.reduce_range(mid, hi, local);
            if rank == mid {
                let msg = GatherMessage::from_result(&right_result);
                self.comm.send_bytes(lo, &msg.to_bytes())?;
            }
            right_result
        }
    }

    fn ordered_tree_reduce(&self, local: KernelResult<Dataset>) -> KernelResult<Dataset> {
        let world_size = self.comm.world_size();
        if world_size <= 1 {
            return local;
        }
        self.reduce_range(0, world_size - 1, local)
    }
}

impl<R: Reducer> AlgorithmNode for MapReduceNode<R> {
    fn name(&self) -> &str {
        &self.name
    }

    /// The output is a single reduced dataset, not a time series: rewrite
    /// `number_of_time_steps` to 1 for anything downstream, while leaving every other
    /// upstream-reported key (extent, variables, ...) untouched.
    fn report(&self, _port: u32, upstream_report: &Metadata) -> KernelResult<Metadata> {
        let mut out = upstream_report.clone();
        out.set_scalar("number_of_time_steps", 1i64);
        Ok(out)
    }

    /// Ignore the incoming request's own `time_step` (there is no meaningful single
    /// step to ask for once this node's own report claims `number_of_time_steps = 1`)
    /// and instead explode this rank's local partition of `[first_step, last_step]`
    /// into one per-step request, each a copy of the incoming request with `time_step`
    /// overwritten.
    fn get_upstream_request(
        &self,
        _port: u32,
        upstream_report: &Metadata,
        request: &Metadata,
    ) -> KernelResult<Vec<Metadata>> {
        let (first, last) = self.resolve_range(upstream_report)?;
        Ok(self
            .local_steps(first, last)
            .into_iter()
            .map(|step| {
                let mut r = request.clone();
                r.set_scalar("time_step", step as u64);
                r
            })
            .collect())
    }

    /// Thread-pool size the executor should use while fetching this rank's local
    /// per-step datasets concurrently.
    fn upstream_pool_size(&self) -> Option<usize> {
        Some(self.effective_thread_pool_size())
    }

    /// Fold this rank's locally-fetched datasets in ascending step order through the
    /// Empty-aware combine wrapper, then merge with every other rank's
    /// partial via the ordered binary-tree reduction. Only the rank that
    /// ends up at the root of the tree (rank 0) receives the final combined dataset;
    /// every other rank returns `Dataset::Empty` once it has finished participating in
    /// the collective, mirroring the original's "only rank 0 writes output" pattern.
    fn execute(&self, _port: u32, upstream_datasets: &[Dataset], _request: &Metadata) -> KernelResult<Dataset> {
        tracing::debug!(
            node = self.name,
            rank = self.comm.rank(),
            world_size = self.comm.world_size(),
            local_steps = upstream_datasets.len(),
            "folding local steps"
        );
        let local = upstream_datasets
            .iter()
            .cloned()
            .try_fold(Dataset::Empty, |acc, ds| self.combine(acc, ds));
        if let Err(ref e) = local {
            tracing::warn!(node = self.name, rank = self.comm.rank(), error = %e, "local fold failed");
        }
        let reduced = self.ordered_tree_reduce(local);
        match &reduced {
            Ok(_) => tracing::debug!(node = self.name, rank = self.comm.rank(), "cross-rank reduction complete"),
            Err(e) => tracing::error!(node = self.name, rank = self.comm.rank(), error = %e, "cross-rank reduction failed"),
        }
        let reduced = reduced?;
        if self.comm.world_size() > 1 && self.comm.rank() != 0 {
            Ok(Dataset::Empty)
        } else {
            Ok(reduced)
        }
    }

    fn describe_properties(&self) -> Vec<PropertyDescriptor> {
        vec![
            PropertyDescriptor::new(
                "first_step",
                PropertyKind::Int,
                PropertyValue::Int(-1),
                "first time step to include in the reduction (-1 = start of the series)",
            ),
            PropertyDescriptor::new(
                "last_step",
                PropertyKind::Int,
                PropertyValue::Int(-1),
                "last time step to include in the reduction (-1 = end of the series)",
            ),
            PropertyDescriptor::new(
                "thread_pool_size",
                PropertyKind::Int,
                PropertyValue::Int(-1),
                "number of worker threads to fetch local steps with (-1 = hardware concurrency)",
            ),
        ]
    }

    fn set_property(&self, name: &str, value: PropertyValue) -> KernelResult<()> {
        let mut props = self.properties.lock().unwrap();
        match name {
            "first_step" => props.first_step = value.as_int()?,
            "last_step" => props.last_step = value.as_int()?,
            "thread_pool_size" => props.thread_pool_size = value.as_int()?,
            _ => {
                return Err(KernelError::KeyMissing {
                    key: name.to_string(),
                })
            }
        }
        Ok(())
    }

    fn get_property(&self, name: &str) -> KernelResult<PropertyValue> {
        let props = self.properties.lock().unwrap();
        match name {
            "first_step" => Ok(PropertyValue::Int(props.first_step)),
            "last_step" => Ok(PropertyValue::Int(props.last_step)),
            "thread_pool_size" => Ok(PropertyValue::Int(props.thread_pool_size)),
            _ => Err(KernelError::KeyMissing {
                key: name.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{SingleProcessComm, ThreadSimulatedComm};
    use crate::dataset::{Extent, Mesh};
    use crate::node::AlgorithmNode;
    use crate::pipeline::Pipeline;
    use crate::variant::VariantArray;

    /// Reports `steps` time steps over a single-point mesh; `execute` returns a mesh
    /// whose `"v"` array holds the requested `time_step` as a value, so reduction
    /// correctness reduces to checking an arithmetic identity over `0..steps`.
    struct StepSource {
        steps: i64,
    }

    impl AlgorithmNode for StepSource {
        fn name(&self) -> &str {
            "step_source"
        }

        fn input_ports(&self) -> u32 {
            0
        }

        fn report(&self, _port: u32, _upstream_report: &Metadata) -> KernelResult<Metadata> {
            let mut m = Metadata::new();
            m.set_scalar("number_of_time_steps", self.steps);
            m.insert("whole_extent", Extent::new(0, 0, 0, 0, 0, 0).to_metadata_array());
            m.insert("variables", VariantArray::new_string(vec!["v".to_string()]));
            Ok(m)
        }

        fn execute(&self, _port: u32, _upstream_datasets: &[Dataset], request: &Metadata) -> KernelResult<Dataset> {
            let step: i64 = request.get_scalar("time_step")?;
            let mut mesh = Mesh::new(Extent::new(0, 0, 0, 0, 0, 0));
            mesh.point_arrays.set("v", VariantArray::new_f64(vec![step as f64]));
            Ok(Dataset::Mesh(mesh))
        }
    }

    fn sum_reducer(left: Dataset, right: Dataset) -> KernelResult<Dataset> {
        let l = left.require_mesh()?;
        let r = right.require_mesh()?;
        if !l.compatible_for_reduction(r) {
            return Err(KernelError::ReducerFailure {
                step: 0,
                reason: "incompatible meshes".to_string(),
            });
        }
        let mut out = Mesh::new(l.extent);
        out.metadata = l.metadata.clone();
        for name in l.point_arrays.names() {
            let a = l.point_arrays.require(name)?;
            let b = r.point_arrays.require(name)?;
            out.point_arrays.set(name, a.zip_numeric::<f64, _>(b, |x, y| x + y)?);
        }
        Ok(Dataset::Mesh(out))
    }

    #[test]
    fn single_rank_sums_all_steps() {
        let p = Pipeline::new();
        let src = p.add_node(StepSource { steps: 5 });
        let mr = p.add_node(MapReduceNode::new("sum", sum_reducer, Arc::new(SingleProcessComm)));
        p.connect(mr, 0, src, 0);

        let out = p.update(mr).unwrap();
        let v = out.require_mesh().unwrap().point_arrays.require("v").unwrap().get::<f64>(0).unwrap();
        assert_eq!(v, (0..5).sum::<i64>() as f64);
    }

    #[test]
    fn first_last_step_properties_restrict_the_range() {
        let p = Pipeline::new();
        let src = p.add_node(StepSource { steps: 10 });
        let mr = p.add_node(MapReduceNode::new("sum", sum_reducer, Arc::new(SingleProcessComm)));
        p.connect(mr, 0, src, 0);
        p.set_property(mr, "first_step", PropertyValue::Int(2)).unwrap();
        p.set_property(mr, "last_step", PropertyValue::Int(4)).unwrap();

        let out = p.update(mr).unwrap();
        let v = out.require_mesh().unwrap().point_arrays.require("v").unwrap().get::<f64>(0).unwrap();
        assert_eq!(v, (2..=4).sum::<i64>() as f64);
    }

    #[test]
    fn two_rank_world_matches_single_rank_result() {
        let steps = 7i64;
        let comms = ThreadSimulatedComm::world(2);
        let expected: f64 = (0..steps).sum::<i64>() as f64;

        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let p = Pipeline::new();
                    let src = p.add_node(StepSource { steps });
                    let mr = p.add_node(MapReduceNode::new("sum", sum_reducer, comm.clone() as Arc<dyn MpiCommunicator>));
                    p.connect(mr, 0, src, 0);
                    p.update(mr).unwrap()
                })
            })
            .collect();

        let results: Vec<Dataset> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let root = &results[0];
        let v = root.require_mesh().unwrap().point_arrays.require("v").unwrap().get::<f64>(0).unwrap();
        assert_eq!(v, expected);
        assert!(results[1].is_empty());
    }

    #[test]
    fn local_steps_partition_is_contiguous_and_covers_every_step() {
        let comms = ThreadSimulatedComm::world(3);
        let node = MapReduceNode::new("sum", sum_reducer, comms[0].clone() as Arc<dyn MpiCommunicator>);
        let mut all_steps: Vec<i64> = Vec::new();
        for comm in &comms {
            let n = MapReduceNode::new("sum", sum_reducer, comm.clone() as Arc<dyn MpiCommunicator>);
            all_steps.extend(n.local_steps(0, 9));
        }
        all_steps.sort_unstable();
        assert_eq!(all_steps, (0..10).collect::<Vec<_>>());
        let _ = node;
    }
}
