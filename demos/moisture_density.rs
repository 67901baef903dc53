//! Moisture-density pipeline demo: reader -> threshold/mask -> map-reduce accumulate
//! -> sink, in the shape of `teca_moisture_density.cpp` (segment, mask, accum, writer).
//!
//! This binary wires a synthetic multi-step mesh series (standing in for what a real
//! cf_reader collaborator would produce) through a threshold-and-mask transform node
//! and a [`MapReduceNode`] that sums the masked variable across the requested step
//! range, then prints the accumulated result.
//!
//! Run with:
//! ```bash
//! cargo run --example moisture_density
//! ```

use std::sync::Arc;
use teca_kernel::comm::SingleProcessComm;
use teca_kernel::config::{ConfigValue, PipelineConfig};
use teca_kernel::dataset::{Dataset, Extent, Mesh};
use teca_kernel::error::{KernelError, KernelResult};
use teca_kernel::mapreduce::MapReduceNode;
use teca_kernel::metadata::Metadata;
use teca_kernel::node::{AlgorithmNode, PropertyDescriptor, PropertyKind, PropertyValue};
use teca_kernel::pipeline::Pipeline;
use teca_kernel::variant::VariantArray;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Synthetic stand-in for `teca_cf_reader`: reports a fixed time series of a single
/// variable ("prw", integrated moisture) over a small 2x2 grid, one value per point
/// drifting upward step over step so the threshold has something interesting to bite on.
struct SyntheticMoistureReader {
    steps: Vec<Mesh>,
}

impl SyntheticMoistureReader {
    fn new(n_steps: usize) -> Self {
        let extent = Extent::new(0, 1, 0, 1, 0, 0);
        let steps = (0..n_steps)
            .map(|step| {
                let mut mesh = Mesh::new(extent);
                let base = step as f64;
                mesh.point_arrays.set(
                    "prw",
                    VariantArray::new_f64(vec![base, base + 1.0, base + 2.0, base + 3.0]),
                );
                mesh
            })
            .collect();
        Self { steps }
    }
}

impl AlgorithmNode for SyntheticMoistureReader {
    fn name(&self) -> &str {
        "reader"
    }

    fn input_ports(&self) -> u32 {
        0
    }

    fn report(&self, _port: u32, _upstream_report: &Metadata) -> KernelResult<Metadata> {
        let mut m = Metadata::new();
        m.set_scalar("number_of_time_steps", self.steps.len() as i64);
        m.insert("whole_extent", Extent::new(0, 1, 0, 1, 0, 0).to_metadata_array());
        m.insert("variables", VariantArray::new_string(vec!["prw".to_string()]));
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

/// Combines `teca_binary_segmentation` + `teca_apply_binary_mask`: derives a
/// `moisture_mask` array (1.0 where `threshold_variable` falls in `[low, high]`, else
/// 0.0) and a `masked_<threshold_variable>` array holding the variable's value where the
/// mask is set and 0.0 elsewhere, so a downstream sum-reducer directly accumulates
/// "moisture density" as the original's pipeline does.
struct ThresholdMask {
    threshold_variable: Mutex<String>,
    low: Mutex<f64>,
    high: Mutex<f64>,
}

impl ThresholdMask {
    fn new(threshold_variable: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            threshold_variable: Mutex::new(threshold_variable.into()),
            low: Mutex::new(low),
            high: Mutex::new(high),
        }
    }
}

impl AlgorithmNode for ThresholdMask {
    fn name(&self) -> &str {
        "threshold_mask"
    }

    fn execute(&self, _port: u32, upstream_datasets: &[Dataset], _request: &Metadata) -> KernelResult<Dataset> {
        let upstream = upstream_datasets.first().ok_or_else(|| KernelError::ProtocolFailure {
            reason: "threshold_mask has no upstream dataset".to_string(),
        })?;
        let mesh = upstream.require_mesh()?;
        let var_name = self.threshold_variable.lock().unwrap().clone();
        let low = *self.low.lock().unwrap();
        let high = *self.high.lock().unwrap();

        let source = mesh.point_arrays.require(&var_name)?;
        let n = source.len();
        let mut mask = VariantArray::new_f64(vec![0.0; n]);
        let mut masked = VariantArray::new_f64(vec![0.0; n]);
        for i in 0..n {
            let v: f64 = source.get(i)?;
            let inside = v >= low && v <= high;
            mask.set(i, if inside { 1.0 } else { 0.0 })?;
            masked.set(i, if inside { v } else { 0.0 })?;
        }

        let mut out = mesh.clone();
        out.point_arrays.set("moisture_mask", mask);
        out.point_arrays.set(format!("masked_{var_name}"), masked);
        Ok(Dataset::Mesh(out))
    }

    fn describe_properties(&self) -> Vec<PropertyDescriptor> {
        vec![
            PropertyDescriptor::new(
                "threshold_variable",
                PropertyKind::Str,
                PropertyValue::Str("prw".to_string()),
                "name of the variable to threshold and mask",
            ),
            PropertyDescriptor::new(
                "low_threshold",
                PropertyKind::Float,
                PropertyValue::Float(f64::NEG_INFINITY),
                "low cutoff used in segmentation",
            ),
            PropertyDescriptor::new(
                "high_threshold",
                PropertyKind::Float,
                PropertyValue::Float(f64::INFINITY),
                "high cutoff used in segmentation",
            ),
        ]
    }

    fn set_property(&self, name: &str, value: PropertyValue) -> KernelResult<()> {
        match name {
            "threshold_variable" => {
                *self.threshold_variable.lock().unwrap() = value.as_str()?.to_string();
                Ok(())
            }
            "low_threshold" => {
                *self.low.lock().unwrap() = value.as_float()?;
                Ok(())
            }
            "high_threshold" => {
                *self.high.lock().unwrap() = value.as_float()?;
                Ok(())
            }
            _ => Err(KernelError::KeyMissing {
                key: name.to_string(),
            }),
        }
    }

    fn get_property(&self, name: &str) -> KernelResult<PropertyValue> {
        match name {
            "threshold_variable" => Ok(PropertyValue::Str(self.threshold_variable.lock().unwrap().clone())),
            "low_threshold" => Ok(PropertyValue::Float(*self.low.lock().unwrap())),
            "high_threshold" => Ok(PropertyValue::Float(*self.high.lock().unwrap())),
            _ => Err(KernelError::KeyMissing {
                key: name.to_string(),
            }),
        }
    }
}

/// Elementwise sum, the direct analogue of the original's `mesh_accumulate`. The
/// Empty-aware short-circuit lives in `MapReduceNode::combine`; this only ever sees two
/// genuine meshes.
fn mesh_accumulate(left: Dataset, right: Dataset) -> KernelResult<Dataset> {
    let l = left.require_mesh()?;
    let r = right.require_mesh()?;
    if !l.compatible_for_reduction(r) {
        return Err(KernelError::ReducerFailure {
            step: 0,
            reason: "accumulated meshes are not compatible for reduction".to_string(),
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

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let pipeline = Pipeline::new();
    let reader = pipeline.add_node(SyntheticMoistureReader::new(5));
    let threshold = pipeline.add_node(ThresholdMask::new("prw", 1.0, 4.0));
    pipeline.connect(threshold, 0, reader, 0);

    let accum = pipeline.add_node(MapReduceNode::new("accum", mesh_accumulate, Arc::new(SingleProcessComm)));
    pipeline.connect(accum, 0, threshold, 0);

    // Property configuration the way a CLI-driven `advanced_opt_defs` sink would apply
    // it, here loaded from an in-memory config rather than parsed command-line flags.
    let mut config = PipelineConfig::new();
    config.set("threshold_mask", "low_threshold", ConfigValue::Float(1.0));
    config.set("threshold_mask", "high_threshold", ConfigValue::Float(4.0));
    config.set("accum", "thread_pool_size", ConfigValue::Int(2));
    let mut named = BTreeMap::new();
    named.insert("threshold_mask".to_string(), threshold);
    named.insert("accum".to_string(), accum);
    config.apply(&pipeline, &named)?;

    tracing::info!("running moisture-density pipeline over 5 steps");
    let result = pipeline.update(accum)?;
    let mesh = result.require_mesh()?;

    let masked = mesh.point_arrays.require("masked_prw")?;
    let values: Vec<f64> = (0..masked.len()).map(|i| masked.get::<f64>(i).unwrap()).collect();
    tracing::info!(?values, "accumulated masked moisture density");

    Ok(())
}
