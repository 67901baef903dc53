//! # teca-kernel
//!
//! A pull-based dataflow kernel for parallel reduction over gridded, time-varying
//! simulation output — the kind of regular lat-lon-height-time grid a climate or
//! weather model writes one time step at a time.
//!
//! The kernel is built from five pieces:
//!
//! - [`variant`] — [`VariantArray`], a type-erased array over the small set of
//!   element types a mesh variable can hold (the signed/unsigned integer widths,
//!   `f32`/`f64`, `String`, and nested [`Metadata`]), with numeric access going
//!   through an `as`-cast pivot so callers don't need to know the concrete element
//!   type ahead of time.
//! - [`metadata`] and [`dataset`] — [`Metadata`], an insertion-ordered key/value
//!   bag, and [`Mesh`]/[`Dataset`], the structured grid a pipeline moves between
//!   stages.
//! - [`node`] — [`AlgorithmNode`], the two-phase (`report` then `execute`) stage
//!   contract every pipeline stage implements.
//! - [`pipeline`] — [`Pipeline`], a pull-based executor: `report` runs once per
//!   node in reverse-topological order and is cached, `execute` is demand-driven,
//!   recursively pulling upstream data only when a downstream node actually asks
//!   for it.
//! - [`mapreduce`] — [`MapReduceNode`], a parallel reduction stage that splits a
//!   time-step range across simulated MPI ranks ([`comm`]) and, within a rank,
//!   across a `rayon` thread pool, combining partial results with a user-supplied
//!   [`Reducer`] in strict step order before a binary-tree cross-rank gather.
//!
//! Everything else ([`config`], [`metrics`], and, behind the `checkpointing`
//! feature, [`checkpoint`]) is ambient infrastructure around those five pieces:
//! loading node properties from a file, reporting execution statistics, and
//! persisting a reduction's progress so a long-running rank can resume after a
//! restart.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use teca_kernel::comm::SingleProcessComm;
//! use teca_kernel::collaborators::InMemoryMeshSource;
//! use teca_kernel::dataset::{Dataset, Extent, Mesh};
//! use teca_kernel::error::KernelResult;
//! use teca_kernel::mapreduce::MapReduceNode;
//! use teca_kernel::pipeline::Pipeline;
//! use teca_kernel::variant::VariantArray;
//!
//! fn sum_meshes(left: Dataset, right: Dataset) -> KernelResult<Dataset> {
//!     let l = left.require_mesh()?;
//!     let r = right.require_mesh()?;
//!     let mut out = Mesh::new(l.extent);
//!     out.metadata = l.metadata.clone();
//!     for name in l.point_arrays.names() {
//!         let a = l.point_arrays.require(name)?;
//!         let b = r.point_arrays.require(name)?;
//!         out.point_arrays.set(name, a.zip_numeric::<f64, _>(b, |x, y| x + y)?);
//!     }
//!     Ok(Dataset::Mesh(out))
//! }
//!
//! let extent = Extent::new(0, 1, 0, 1, 0, 0);
//! let mut steps = Vec::new();
//! for step in 0..3 {
//!     let mut mesh = Mesh::new(extent);
//!     let base = (step + 1) as f64;
//!     mesh.point_arrays.set("temp", VariantArray::new_f64(vec![base, base * 2.0, base * 3.0, base * 4.0]));
//!     steps.push(mesh);
//! }
//!
//! let pipeline = Pipeline::new();
//! let source = pipeline.add_node(InMemoryMeshSource::new("source", extent, steps));
//! let reduce = pipeline.add_node(MapReduceNode::new("sum", sum_meshes, Arc::new(SingleProcessComm)));
//! pipeline.connect(reduce, 0, source, 0);
//!
//! let result = pipeline.update(reduce).unwrap();
//! let mesh = result.require_mesh().unwrap();
//! let summed = mesh.point_arrays.get("temp").unwrap().get::<f64>(0).unwrap();
//! assert_eq!(summed, 6.0); // 1 + 2 + 3
//! ```

pub mod collaborators;
pub mod comm;
pub mod config;
pub mod dataset;
pub mod error;
pub mod mapreduce;
pub mod metadata;
pub mod node;
pub mod node_id;
pub mod pipeline;
pub mod variant;

#[cfg(feature = "checkpointing")]
pub mod checkpoint;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use dataset::{ArrayCollection, Dataset, Extent, Mesh};
pub use error::{KernelError, KernelResult};
pub use mapreduce::{MapReduceNode, Reducer};
pub use metadata::{Metadata, MetadataValue};
pub use node::{AlgorithmNode, PropertyDescriptor, PropertyKind, PropertyValue};
pub use node_id::NodeId;
pub use pipeline::Pipeline;
pub use variant::{NumericCast, NumericScalar, VariantArray};
