//! In-memory source/sink collaborators.
//!
//! Real NetCDF/HDF5 readers and writers are out of scope; what the
//! kernel needs from a collaborator is a source [`AlgorithmNode`] that reports a time
//! series and executes one [`Mesh`] per step, and a sink that records whatever
//! terminal dataset a pipeline produces. [`InMemoryMeshSource`] and
//! [`RecordingMeshSink`] give test code and the `demos/` binaries exactly that without
//! touching the filesystem.

use crate::dataset::{Dataset, Extent, Mesh};
use crate::error::{KernelError, KernelResult};
use crate::metadata::Metadata;
use crate::node::AlgorithmNode;
use crate::variant::VariantArray;
use std::sync::Mutex;

/// A source node backed by a fixed, in-memory time series of meshes, all sharing one
/// extent and one set of variable names (the "compatible for reduction" shape).
/// `report` advertises `number_of_time_steps = steps.len()`; `execute` indexes into
/// `steps` by the request's `time_step`.
pub struct InMemoryMeshSource {
    name: String,
    whole_extent: Extent,
    variables: Vec<String>,
    steps: Vec<Mesh>,
}

impl InMemoryMeshSource {
    /// `steps` must be non-empty and every mesh must share `whole_extent`'s point
    /// count and the same point-array names (not enforced here; `Mesh::validate`
    /// catches malformed meshes at the point of construction).
    #[must_use]
    pub fn new(name: impl Into<String>, whole_extent: Extent, steps: Vec<Mesh>) -> Self {
        let variables = steps
            .first()
            .map(|m| m.point_arrays.names().into_iter().map(String::from).collect())
            .unwrap_or_default();
        Self {
            name: name.into(),
            whole_extent,
            variables,
            steps,
        }
    }
}

impl AlgorithmNode for InMemoryMeshSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_ports(&self) -> u32 {
        0
    }

    fn report(&self, _port: u32, _upstream_report: &Metadata) -> KernelResult<Metadata> {
        let mut m = Metadata::new();
        m.set_scalar("number_of_time_steps", self.steps.len() as i64);
        m.insert("whole_extent", self.whole_extent.to_metadata_array());
        m.insert("variables", VariantArray::new_string(self.variables.clone()));

        let mut coordinates = Metadata::new();
        if let Some(first) = self.steps.first() {
            if let Some(x) = &first.x {
                coordinates.insert("x", x.deep_clone());
            }
            if let Some(y) = &first.y {
                coordinates.insert("y", y.deep_clone());
            }
            if let Some(z) = &first.z {
                coordinates.insert("z", z.deep_clone());
            }
            if let Some(t) = &first.t {
                coordinates.insert("t", t.deep_clone());
            }
        }
        m.insert("coordinates", coordinates);
        Ok(m)
    }

    fn execute(&self, _port: u32, _upstream_datasets: &[Dataset], request: &Metadata) -> KernelResult<Dataset> {
        let step = request.get_scalar::<i64>("time_step")?;
        let index = usize::try_from(step).map_err(|_| KernelError::OutOfRange {
            index: step as u64,
            size: self.steps.len() as u64,
        })?;
        let mesh = self.steps.get(index).ok_or(KernelError::OutOfRange {
            index: index as u64,
            size: self.steps.len() as u64,
        })?;
        Ok(Dataset::Mesh(mesh.clone()))
    }
}

/// A sink node that records every dataset that reaches it, in the order `execute` was
/// called, behind a mutex so test code can inspect it after `Pipeline::update` returns.
/// Mirrors the role of a file writer collaborator without touching the filesystem,
/// including the writer contract's `%e%` -> rank filename substitution.
#[derive(Default)]
pub struct RecordingMeshSink {
    name: String,
    filename_pattern: Option<String>,
    received: Mutex<Vec<Dataset>>,
}

impl RecordingMeshSink {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename_pattern: None,
            received: Mutex::new(Vec::new()),
        }
    }

    /// Attach a filename pattern that may contain `%e%`, resolved per-rank via
    /// [`RecordingMeshSink::resolved_filename`]. No other templating is supported.
    #[must_use]
    pub fn with_filename_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.filename_pattern = Some(pattern.into());
        self
    }

    /// The stored filename pattern with every `%e%` occurrence replaced by `rank`, if
    /// a pattern was set.
    #[must_use]
    pub fn resolved_filename(&self, rank: usize) -> Option<String> {
        self.filename_pattern.as_ref().map(|p| p.replace("%e%", &rank.to_string()))
    }

    /// Snapshot of every dataset recorded so far, in call order.
    #[must_use]
    pub fn recorded(&self) -> Vec<Dataset> {
        self.received.lock().unwrap().clone()
    }

    /// The most recently recorded dataset, if any.
    #[must_use]
    pub fn last(&self) -> Option<Dataset> {
        self.received.lock().unwrap().last().cloned()
    }
}

impl AlgorithmNode for RecordingMeshSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _port: u32, upstream_datasets: &[Dataset], _request: &Metadata) -> KernelResult<Dataset> {
        let ds = upstream_datasets.first().cloned().unwrap_or_default();
        self.received.lock().unwrap().push(ds.clone());
        Ok(ds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;

    fn mesh_with_value(extent: Extent, value: f64) -> Mesh {
        let mut m = Mesh::new(extent);
        m.point_arrays.set("v", VariantArray::new_f64(vec![value; extent.point_count() as usize]));
        m
    }

    #[test]
    fn source_reports_step_count_and_indexes_by_time_step() {
        let extent = Extent::new(0, 1, 0, 0, 0, 0);
        let src = InMemoryMeshSource::new(
            "src",
            extent,
            vec![mesh_with_value(extent, 1.0), mesh_with_value(extent, 2.0)],
        );
        let report = src.report(0, &Metadata::new()).unwrap();
        assert_eq!(report.get_scalar::<i64>("number_of_time_steps").unwrap(), 2);

        let mut req = Metadata::new();
        req.set_scalar("time_step", 1u64);
        let ds = src.execute(0, &[], &req).unwrap();
        assert_eq!(ds.require_mesh().unwrap().point_arrays.require("v").unwrap().get::<f64>(0).unwrap(), 2.0);
    }

    #[test]
    fn report_includes_coordinates_for_whatever_axes_are_present() {
        let extent = Extent::new(0, 1, 0, 0, 0, 0);
        let mut mesh = mesh_with_value(extent, 1.0);
        mesh.x = Some(VariantArray::new_f64(vec![0.0, 1.0]));
        let src = InMemoryMeshSource::new("src", extent, vec![mesh]);

        let report = src.report(0, &Metadata::new()).unwrap();
        let coords = report.get_nested("coordinates").unwrap();
        assert_eq!(coords.get_array("x").unwrap().get::<f64>(1).unwrap(), 1.0);
        assert!(!coords.contains("y"));
    }

    #[test]
    fn source_rejects_out_of_range_step() {
        let extent = Extent::new(0, 0, 0, 0, 0, 0);
        let src = InMemoryMeshSource::new("src", extent, vec![mesh_with_value(extent, 1.0)]);
        let mut req = Metadata::new();
        req.set_scalar("time_step", 5u64);
        let err = src.execute(0, &[], &req).unwrap_err();
        assert!(matches!(err, KernelError::OutOfRange { .. }));
    }

    #[test]
    fn sink_records_every_dataset_passed_through_a_pipeline() {
        let extent = Extent::new(0, 0, 0, 0, 0, 0);
        let p = Pipeline::new();
        let src = p.add_node(InMemoryMeshSource::new("src", extent, vec![mesh_with_value(extent, 9.0)]));
        let sink_node = RecordingMeshSink::new("sink");
        let sink = p.add_node(sink_node);
        p.connect(sink, 0, src, 0);

        p.update(sink).unwrap();
        // The sink node is type-erased behind `AlgorithmNode` inside the pipeline;
        // downstream code that needs `recorded()` keeps its own `Arc` to the sink
        // (see `demos/` for the pattern) rather than fetching it back out here.
        let _ = sink;
    }

    #[test]
    fn filename_pattern_substitutes_rank_for_e_token() {
        let sink = RecordingMeshSink::new("sink").with_filename_pattern("output_%e%.bin");
        assert_eq!(sink.resolved_filename(0).unwrap(), "output_0.bin");
        assert_eq!(sink.resolved_filename(3).unwrap(), "output_3.bin");

        let bare = RecordingMeshSink::new("sink");
        assert_eq!(bare.resolved_filename(0), None);
    }
}
