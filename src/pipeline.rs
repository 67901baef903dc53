//! Pull-based, two-phase dataflow executor (C4).
//!
//! The [`Pipeline`] is the central registry for all [`AlgorithmNode`]s and their
//! directed connections: an arbitrary acyclic graph of trait objects, since the
//! report/execute recursion needs genuine per-node virtual dispatch rather than a
//! closed `Node` enum matched by a separate runner. `PipelineInner` sits behind an
//! `Arc<Mutex<_>>` so `Pipeline` itself stays a cheap-clone handle.
//!
//! `update()` on a terminal node drives two phases:
//! 1. **Report** (reverse topological, memoized): each node rewrites the report of its
//!    single upstream connection into its own output report.
//! 2. **Execute** (demand-driven recursion from the sink): at each node, the executor
//!    asks `get_upstream_request` for the list of requests to send upstream, fetches
//!    the resulting datasets (sequentially, or — for nodes like the map-reduce stage
//!    that declare a pool size — concurrently via a dedicated `rayon` pool), and hands
//!    the collected datasets to the node's own `execute`.

use crate::dataset::Dataset;
use crate::error::{KernelError, KernelResult};
use crate::metadata::Metadata;
use crate::node::{AlgorithmNode, PropertyValue};
use crate::node_id::NodeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct Edge {
    from: NodeId,
    from_port: u32,
    to: NodeId,
    to_port: u32,
}

pub(crate) struct PipelineInner {
    next_id: u64,
    nodes: HashMap<NodeId, Arc<dyn AlgorithmNode>>,
    edges: Vec<Edge>,
    report_cache: HashMap<(NodeId, u32), Metadata>,
}

/// Thread-safe, cheaply-cloneable pipeline graph. All clones share the same
/// underlying state.
pub struct Pipeline {
    pub(crate) inner: Arc<Mutex<PipelineInner>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PipelineInner {
                next_id: 0,
                nodes: HashMap::new(),
                edges: Vec::new(),
                report_cache: HashMap::new(),
            })),
        }
    }
}

impl Clone for Pipeline {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node, returning a handle usable with `connect`/`execute`/`update`.
    pub fn add_node<N: AlgorithmNode + 'static>(&self, node: N) -> NodeId {
        let mut g = self.inner.lock().unwrap();
        let id = NodeId::new(g.next_id);
        g.next_id += 1;
        g.nodes.insert(id, Arc::new(node));
        id
    }

    /// Wire `upstream`'s `upstream_port` output into `to`'s `to_port` input, replacing
    /// any existing connection already occupying that input port.
    pub fn connect(&self, to: NodeId, to_port: u32, upstream: NodeId, upstream_port: u32) {
        let mut g = self.inner.lock().unwrap();
        g.edges.retain(|e| !(e.to == to && e.to_port == to_port));
        g.edges.push(Edge {
            from: upstream,
            from_port: upstream_port,
            to,
            to_port,
        });
    }

    pub fn set_property(&self, node: NodeId, name: &str, value: PropertyValue) -> KernelResult<()> {
        self.node(node)?.set_property(name, value)
    }

    pub fn get_property(&self, node: NodeId, name: &str) -> KernelResult<PropertyValue> {
        self.node(node)?.get_property(name)
    }

    fn node(&self, id: NodeId) -> KernelResult<Arc<dyn AlgorithmNode>> {
        let g = self.inner.lock().unwrap();
        g.nodes.get(&id).cloned().ok_or_else(|| KernelError::ProtocolFailure {
            reason: format!("no such node {}", id.raw()),
        })
    }

    /// Fetch the type-erased handle to a registered node, e.g. to downcast a sink
    /// back to its concrete type via `AlgorithmNode::as_any` after `update` runs.
    pub fn node_handle(&self, id: NodeId) -> KernelResult<Arc<dyn AlgorithmNode>> {
        self.node(id)
    }

    /// The node feeding `node`'s `port`, if any. Each input port accepts at most one
    /// producer (see §4.3's single-producer-per-port resolution in `SPEC_FULL.md`);
    /// `connect` enforces this by replacing whatever edge already occupies the port.
    fn upstream_of(&self, node: NodeId, port: u32) -> Option<(NodeId, u32)> {
        let g = self.inner.lock().unwrap();
        g.edges
            .iter()
            .find(|e| e.to == node && e.to_port == port)
            .map(|e| (e.from, e.from_port))
    }

    /// Number of nodes currently registered. Used by debug/test tooling.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    /// Number of edges currently registered. Used by debug/test tooling.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.inner.lock().unwrap().edges.len()
    }

    pub fn debug_print_graph(&self) {
        let g = self.inner.lock().unwrap();
        println!("Pipeline graph:");
        for (id, n) in &g.nodes {
            println!("  {} [{}]", id.raw(), n.name());
        }
        for e in &g.edges {
            println!("  {}:{} -> {}:{}", e.from.raw(), e.from_port, e.to.raw(), e.to_port);
        }
    }

    /// Report phase: reverse-topological, memoized per `(node, port)`.
    /// Recurses on `upstream_of` first so a node only ever sees its own upstream's
    /// already-computed report.
    pub fn report(&self, node: NodeId, port: u32) -> KernelResult<Metadata> {
        if let Some(cached) = self.inner.lock().unwrap().report_cache.get(&(node, port)) {
            return Ok(cached.clone());
        }
        let n = self.node(node)?;
        let upstream_report = match self.upstream_of(node, port) {
            Some((un, up)) => self.report(un, up)?,
            None => Metadata::new(),
        };
        tracing::debug!(node = n.name(), port, "computing report");
        let rep = n.report(port, &upstream_report)?;
        self.inner
            .lock()
            .unwrap()
            .report_cache
            .insert((node, port), rep.clone());
        Ok(rep)
    }

    /// Execute phase. Recursively evaluates `node`'s single upstream
    /// connection for each request `get_upstream_request` produces, using a dedicated
    /// thread pool when the node asks for one ([`AlgorithmNode::upstream_pool_size`]),
    /// then hands the collected datasets to the node's own `execute`.
    pub fn execute(&self, node: NodeId, port: u32, request: &Metadata) -> KernelResult<Dataset> {
        let n = self.node(node)?;
        let upstream_report = match self.upstream_of(node, port) {
            Some((un, up)) => self.report(un, up)?,
            None => Metadata::new(),
        };
        let requests = n.get_upstream_request(port, &upstream_report, request)?;
        let upstream = self.upstream_of(node, port);

        let datasets: Vec<Dataset> = match (upstream, n.upstream_pool_size()) {
            (None, _) => {
                if !requests.is_empty() {
                    return Err(KernelError::ProtocolFailure {
                        reason: format!(
                            "node '{}' has no upstream connection but produced {} upstream request(s)",
                            n.name(),
                            requests.len()
                        ),
                    });
                }
                Vec::new()
            }
            (Some((un, up)), None) => requests
                .iter()
                .map(|r| self.execute(un, up, r))
                .collect::<KernelResult<Vec<_>>>()?,
            (Some((un, up)), Some(pool_size)) => self.execute_pooled(un, up, &requests, pool_size)?,
        };

        tracing::trace!(node = n.name(), port, upstream_datasets = datasets.len(), "executing");
        let result = n.execute(port, &datasets, request);
        if let Err(ref e) = result {
            tracing::error!(node = n.name(), port, error = %e, "node execute failed");
        }
        result
    }

    /// Fetch `requests` from `(node, port)` concurrently via a dedicated `rayon` pool
    /// sized `pool_size` (0 or 1 collapses to sequential). `collect::<KernelResult<Vec<_>>>()`
    /// preserves input order regardless of completion order, which is exactly the
    /// in-order discipline the later reduction requires — no
    /// separate ordering machinery is needed once the fetch preserves request order.
    fn execute_pooled(
        &self,
        node: NodeId,
        port: u32,
        requests: &[Metadata],
        pool_size: usize,
    ) -> KernelResult<Vec<Dataset>> {
        use rayon::prelude::*;

        if pool_size <= 1 || requests.len() <= 1 {
            return requests.iter().map(|r| self.execute(node, port, r)).collect();
        }
        tracing::debug!(pool_size, tasks = requests.len(), "submitting pooled upstream fetch");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pool_size)
            .build()
            .map_err(|e| KernelError::ProtocolFailure {
                reason: format!("failed to build thread pool: {e}"),
            })?;
        pool.install(|| {
            requests
                .par_iter()
                .map(|r| self.execute(node, port, r))
                .collect::<KernelResult<Vec<_>>>()
        })
    }

    /// Build the initial request at `terminal` from its own report: the whole extent,
    /// every reported variable, and `time_step = 0`. Callers needing a specific
    /// step/extent/variable subset should build
    /// their own `Metadata` and call [`Pipeline::update_with_request`] instead.
    pub fn update(&self, terminal: NodeId) -> KernelResult<Dataset> {
        let report = self.report(terminal, 0)?;
        let mut request = Metadata::new();
        request.set_scalar("time_step", 0u64);
        match report.get_array("whole_extent") {
            Ok(extent) => request.insert("extent", extent.clone()),
            Err(_) => request.insert("extent", crate::dataset::Extent::new(0, 0, 0, 0, 0, 0).to_metadata_array()),
        }
        match report.get_array("variables") {
            Ok(vars) => request.insert("arrays", vars.clone()),
            Err(_) => request.insert("arrays", crate::variant::VariantArray::new_string(Vec::new())),
        }
        self.update_with_request(terminal, request)
    }

    /// Like [`Pipeline::update`], but with a caller-supplied initial request.
    pub fn update_with_request(&self, terminal: NodeId, request: Metadata) -> KernelResult<Dataset> {
        self.execute(terminal, 0, &request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Extent, Mesh};
    use crate::variant::VariantArray;

    struct Passthrough;
    impl AlgorithmNode for Passthrough {
        fn name(&self) -> &str {
            "passthrough"
        }
        fn execute(&self, _port: u32, upstream_datasets: &[Dataset], _request: &Metadata) -> KernelResult<Dataset> {
            Ok(upstream_datasets.first().cloned().unwrap_or_default())
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct ConstantSource(Mesh);
    impl AlgorithmNode for ConstantSource {
        fn name(&self) -> &str {
            "constant_source"
        }
        fn input_ports(&self) -> u32 {
            0
        }
        fn report(&self, _port: u32, _upstream_report: &Metadata) -> KernelResult<Metadata> {
            let mut m = Metadata::new();
            m.set_scalar("number_of_time_steps", 1i64);
            m.insert("whole_extent", self.0.extent.to_metadata_array());
            m.insert(
                "variables",
                VariantArray::new_string(self.0.point_arrays.names().into_iter().map(String::from).collect()),
            );
            Ok(m)
        }
        fn execute(&self, _port: u32, _upstream_datasets: &[Dataset], _request: &Metadata) -> KernelResult<Dataset> {
            Ok(Dataset::Mesh(self.0.clone()))
        }
    }

    #[test]
    fn update_pulls_through_passthrough_chain() {
        let p = Pipeline::new();
        let mut mesh = Mesh::new(Extent::new(0, 1, 0, 0, 0, 0));
        mesh.point_arrays.set("m", VariantArray::new_f64(vec![1.0, 2.0]));
        let src = p.add_node(ConstantSource(mesh));
        let pass = p.add_node(Passthrough);
        p.connect(pass, 0, src, 0);

        let out = p.update(pass).unwrap();
        let m = out.as_mesh().unwrap();
        assert_eq!(m.point_arrays.get("m").unwrap().get::<f64>(0).unwrap(), 1.0);
    }

    #[test]
    fn report_is_cached_across_repeated_calls() {
        let p = Pipeline::new();
        let src = p.add_node(ConstantSource(Mesh::new(Extent::new(0, 0, 0, 0, 0, 0))));
        let r1 = p.report(src, 0).unwrap();
        let r2 = p.report(src, 0).unwrap();
        assert_eq!(r1, r2);
    }

    #[test]
    fn execute_without_upstream_rejects_nonempty_requests() {
        struct GreedyUpstreamRequest;
        impl AlgorithmNode for GreedyUpstreamRequest {
            fn name(&self) -> &str {
                "greedy"
            }
            fn get_upstream_request(
                &self,
                _port: u32,
                _upstream_report: &Metadata,
                request: &Metadata,
            ) -> KernelResult<Vec<Metadata>> {
                Ok(vec![request.clone()])
            }
            fn input_ports(&self) -> u32 {
                0
            }
            fn execute(&self, _port: u32, _upstream_datasets: &[Dataset], _request: &Metadata) -> KernelResult<Dataset> {
                Ok(Dataset::Empty)
            }
        }
        let p = Pipeline::new();
        let n = p.add_node(GreedyUpstreamRequest);
        let err = p.update(n).unwrap_err();
        assert!(matches!(err, KernelError::ProtocolFailure { .. }));
    }
}
