//! End-to-end scenarios S1-S6.
//!
//! Each test builds a small pipeline from `teca_kernel`'s public API and checks the
//! exact expected values/behavior against the concrete scenario they implement.

use std::sync::Arc;
use teca_kernel::comm::{MpiCommunicator, SingleProcessComm, ThreadSimulatedComm};
use teca_kernel::dataset::{Dataset, Extent, Mesh};
use teca_kernel::error::KernelError;
use teca_kernel::mapreduce::MapReduceNode;
use teca_kernel::node::PropertyValue;
use teca_kernel::pipeline::Pipeline;
use teca_kernel::testing::MeshSeriesBuilder;
use teca_kernel::variant::VariantArray;
use teca_kernel::{AlgorithmNode, Metadata, NumericCast};

fn sum_reducer(left: Dataset, right: Dataset) -> teca_kernel::error::KernelResult<Dataset> {
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

fn source_node(name: &str, steps: Vec<Mesh>) -> teca_kernel::collaborators::InMemoryMeshSource {
    let extent = steps.first().map(|m| m.extent).unwrap_or(Extent::new(0, 0, 0, 0, 0, 0));
    teca_kernel::collaborators::InMemoryMeshSource::new(name, extent, steps)
}

fn get_m(dataset: &Dataset) -> Vec<f64> {
    let mesh = dataset.require_mesh().unwrap();
    let arr = mesh.point_arrays.require("m").unwrap();
    (0..arr.len()).map(|i| arr.get::<f64>(i).unwrap()).collect()
}

/// S1 — sum over three steps, one rank, one thread.
#[test]
fn s1_sum_over_three_steps_single_rank_single_thread() {
    let extent = Extent::new(0, 1, 0, 1, 0, 0);
    let steps = MeshSeriesBuilder::new(extent, "m")
        .step(vec![1.0, 2.0, 3.0, 4.0])
        .step(vec![10.0, 20.0, 30.0, 40.0])
        .step(vec![100.0, 200.0, 300.0, 400.0])
        .build();

    let p = Pipeline::new();
    let src = p.add_node(source_node("src", steps));
    let mr = p.add_node(MapReduceNode::new("sum", sum_reducer, Arc::new(SingleProcessComm)));
    p.connect(mr, 0, src, 0);
    p.set_property(mr, "first_step", PropertyValue::Int(0)).unwrap();
    p.set_property(mr, "last_step", PropertyValue::Int(2)).unwrap();
    p.set_property(mr, "thread_pool_size", PropertyValue::Int(1)).unwrap();

    let out = p.update(mr).unwrap();
    assert_eq!(get_m(&out), vec![111.0, 222.0, 333.0, 444.0]);
}

/// S2 — same as S1, `thread_pool_size=4`; output must be bit-identical (determinism
/// under thread-pool size).
#[test]
fn s2_thread_pool_size_four_matches_s1_bit_for_bit() {
    let extent = Extent::new(0, 1, 0, 1, 0, 0);
    let steps = MeshSeriesBuilder::new(extent, "m")
        .step(vec![1.0, 2.0, 3.0, 4.0])
        .step(vec![10.0, 20.0, 30.0, 40.0])
        .step(vec![100.0, 200.0, 300.0, 400.0])
        .build();

    let p = Pipeline::new();
    let src = p.add_node(source_node("src", steps));
    let mr = p.add_node(MapReduceNode::new("sum", sum_reducer, Arc::new(SingleProcessComm)));
    p.connect(mr, 0, src, 0);
    p.set_property(mr, "thread_pool_size", PropertyValue::Int(4)).unwrap();

    let out = p.update(mr).unwrap();
    assert_eq!(get_m(&out), vec![111.0, 222.0, 333.0, 444.0]);
}

/// S3 — two MPI ranks (steps split 2+1). Rank 0's result matches S1 bit-for-bit; rank
/// 1 returns empty.
#[test]
fn s3_two_mpi_ranks_rank_zero_matches_s1_rank_one_empty() {
    let extent = Extent::new(0, 1, 0, 1, 0, 0);
    let make_steps = || {
        MeshSeriesBuilder::new(extent, "m")
            .step(vec![1.0, 2.0, 3.0, 4.0])
            .step(vec![10.0, 20.0, 30.0, 40.0])
            .step(vec![100.0, 200.0, 300.0, 400.0])
            .build()
    };

    let comms = ThreadSimulatedComm::world(2);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            let steps = make_steps();
            std::thread::spawn(move || {
                let p = Pipeline::new();
                let src = p.add_node(source_node("src", steps));
                let mr = p.add_node(MapReduceNode::new("sum", sum_reducer, comm.clone() as Arc<dyn MpiCommunicator>));
                p.connect(mr, 0, src, 0);
                p.update(mr).unwrap()
            })
        })
        .collect();

    let results: Vec<Dataset> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(get_m(&results[0]), vec![111.0, 222.0, 333.0, 444.0]);
    assert!(results[1].is_empty());
}

/// S4 — range subsetting: N=5 one-element meshes, first_step=1, last_step=3.
#[test]
fn s4_range_subsetting_restricts_to_first_last_step() {
    let extent = Extent::new(0, 0, 0, 0, 0, 0);
    let steps = MeshSeriesBuilder::new(extent, "m")
        .step(vec![10.0])
        .step(vec![20.0])
        .step(vec![40.0])
        .step(vec![80.0])
        .step(vec![160.0])
        .build();

    let p = Pipeline::new();
    let src = p.add_node(source_node("src", steps));
    let mr = p.add_node(MapReduceNode::new("sum", sum_reducer, Arc::new(SingleProcessComm)));
    p.connect(mr, 0, src, 0);
    p.set_property(mr, "first_step", PropertyValue::Int(1)).unwrap();
    p.set_property(mr, "last_step", PropertyValue::Int(3)).unwrap();

    let out = p.update(mr).unwrap();
    assert_eq!(get_m(&out), vec![140.0]);
}

/// S5 — failure propagation: reader fails on step 2 of 4. `update` must fail and the
/// diagnostic must mention step 2.
#[test]
fn s5_failure_on_one_step_propagates_and_names_the_step() {
    struct FlakyReader;
    impl AlgorithmNode for FlakyReader {
        fn name(&self) -> &str {
            "flaky_reader"
        }
        fn input_ports(&self) -> u32 {
            0
        }
        fn report(&self, _port: u32, _upstream_report: &Metadata) -> teca_kernel::error::KernelResult<Metadata> {
            let mut m = Metadata::new();
            m.set_scalar("number_of_time_steps", 4i64);
            m.insert("whole_extent", Extent::new(0, 0, 0, 0, 0, 0).to_metadata_array());
            m.insert("variables", VariantArray::new_string(vec!["m".to_string()]));
            Ok(m)
        }
        fn execute(
            &self,
            _port: u32,
            _upstream_datasets: &[Dataset],
            request: &Metadata,
        ) -> teca_kernel::error::KernelResult<Dataset> {
            let step: i64 = request.get_scalar("time_step")?;
            if step == 2 {
                return Err(KernelError::IoFailure {
                    step: Some(step as u64),
                    reason: "simulated read failure".to_string(),
                });
            }
            let mut mesh = Mesh::new(Extent::new(0, 0, 0, 0, 0, 0));
            mesh.point_arrays.set("m", VariantArray::new_f64(vec![step as f64]));
            Ok(Dataset::Mesh(mesh))
        }
    }

    let p = Pipeline::new();
    let src = p.add_node(FlakyReader);
    let mr = p.add_node(MapReduceNode::new("sum", sum_reducer, Arc::new(SingleProcessComm)));
    p.connect(mr, 0, src, 0);

    let err = p.update(mr).unwrap_err();
    assert_eq!(err.step(), Some(2));
    assert!(err.to_string().contains("step"));
}

/// A reducer that explicitly up-converts both sides to `f64` before summing, rather
/// than relying on `zip_numeric`'s "output takes the left operand's element type"
/// convention (see `VariantArray::zip_numeric`): the reducer up-converts to float64
/// and returns float64 regardless of which side started narrower.
fn widening_sum_reducer(left: Dataset, right: Dataset) -> teca_kernel::error::KernelResult<Dataset> {
    let l = left.require_mesh()?;
    let r = right.require_mesh()?;
    let mut out = Mesh::new(l.extent);
    out.metadata = l.metadata.clone();
    for name in l.point_arrays.names() {
        let a = l.point_arrays.require(name)?;
        let b = r.point_arrays.require(name)?;
        let mut result = VariantArray::new_f64(vec![0.0; a.len()]);
        for i in 0..a.len() {
            let x: f64 = a.get(i)?;
            let y: f64 = b.get(i)?;
            result.set(i, x + y)?;
        }
        out.point_arrays.set(name, result);
    }
    Ok(Dataset::Mesh(out))
}

/// S6 — type conversion in the reducer, exercised through an actual `MapReduceNode`
/// reduction: step 0's mesh holds `m` as f32, step 1's holds `m` as f64. The reducer
/// up-converts both to f64; output must be f64 and correct to within 1 ULP of f64
/// arithmetic.
#[test]
fn s6_reducer_up_converts_f32_and_f64_to_f64() {
    let extent = Extent::new(0, 1, 0, 0, 0, 0);
    let mut step0 = Mesh::new(extent);
    step0.point_arrays.set("m", VariantArray::new_f32(vec![1.5, 2.5]));
    let mut step1 = Mesh::new(extent);
    step1.point_arrays.set("m", VariantArray::new_f64(vec![10.25, 20.75]));

    let p = Pipeline::new();
    let src = p.add_node(source_node("src", vec![step0, step1]));
    let mr = p.add_node(MapReduceNode::new("sum", widening_sum_reducer, Arc::new(SingleProcessComm)));
    p.connect(mr, 0, src, 0);

    let out = p.update(mr).unwrap();
    let mesh = out.require_mesh().unwrap();
    let arr = mesh.point_arrays.require("m").unwrap();
    assert_eq!(arr.type_code(), f64::CODE);
    let v0: f64 = arr.get(0).unwrap();
    let v1: f64 = arr.get(1).unwrap();
    assert!((v0 - 11.75).abs() <= f64::EPSILON);
    assert!((v1 - 23.25).abs() <= f64::EPSILON);
}
