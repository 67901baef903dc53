//! Test fixtures for building meshes, datasets, and communicators without a real
//! NetCDF/MPI stack.
//!
//! Gives test code a fluent way to build fixture data, the way a pipeline runtime's
//! own `testing` helpers usually do — but builds [`Mesh`]/[`Metadata`] directly, since
//! that is what this kernel's nodes actually consume.

use crate::dataset::{Dataset, Extent, Mesh};
use crate::variant::VariantArray;

/// Fluent builder for a single-variable time series of meshes sharing one extent, the
/// shape [`crate::collaborators::InMemoryMeshSource`] expects.
pub struct MeshSeriesBuilder {
    extent: Extent,
    variable: String,
    steps: Vec<Vec<f64>>,
}

impl MeshSeriesBuilder {
    #[must_use]
    pub fn new(extent: Extent, variable: impl Into<String>) -> Self {
        Self {
            extent,
            variable: variable.into(),
            steps: Vec::new(),
        }
    }

    /// Append one time step's worth of point values; `values.len()` must equal
    /// `extent.point_count()` or the resulting mesh fails `Mesh::validate`.
    #[must_use]
    pub fn step(mut self, values: Vec<f64>) -> Self {
        self.steps.push(values);
        self
    }

    /// Append `count` steps built from `f(step_index)`.
    #[must_use]
    pub fn steps_from(mut self, count: usize, f: impl Fn(usize) -> Vec<f64>) -> Self {
        for i in 0..count {
            self.steps.push(f(i));
        }
        self
    }

    #[must_use]
    pub fn build(self) -> Vec<Mesh> {
        self.steps
            .into_iter()
            .map(|values| {
                let mut mesh = Mesh::new(self.extent);
                mesh.point_arrays.set(self.variable.clone(), VariantArray::new_f64(values));
                mesh
            })
            .collect()
    }
}

/// A single-point (`Extent::new(0,0,0,0,0,0)`) mesh carrying one scalar value in
/// variable `name`, the common case for [`crate::mapreduce`] unit tests.
#[must_use]
pub fn scalar_mesh(name: &str, value: f64) -> Mesh {
    let mut mesh = Mesh::new(Extent::new(0, 0, 0, 0, 0, 0));
    mesh.point_arrays.set(name, VariantArray::new_f64(vec![value]));
    mesh
}

/// Assert that `dataset` is a mesh whose `variable` point array is, elementwise,
/// within `tolerance` of `expected`.
pub fn assert_mesh_values_close(dataset: &Dataset, variable: &str, expected: &[f64], tolerance: f64) {
    let mesh = dataset.require_mesh().expect("expected a mesh dataset");
    let arr = mesh.point_arrays.require(variable).expect("missing variable");
    assert_eq!(arr.len(), expected.len(), "array length mismatch for '{variable}'");
    for (i, want) in expected.iter().enumerate() {
        let got: f64 = arr.get(i).expect("index in range");
        assert!(
            (got - want).abs() <= tolerance,
            "'{variable}'[{i}] = {got}, expected {want} (tolerance {tolerance})"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_series_builder_produces_one_mesh_per_step() {
        let extent = Extent::new(0, 1, 0, 0, 0, 0);
        let steps = MeshSeriesBuilder::new(extent, "m")
            .step(vec![1.0, 2.0])
            .step(vec![3.0, 4.0])
            .build();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].point_arrays.get("m").unwrap().get::<f64>(1).unwrap(), 2.0);
    }

    #[test]
    fn steps_from_generates_the_requested_count() {
        let extent = Extent::new(0, 0, 0, 0, 0, 0);
        let steps = MeshSeriesBuilder::new(extent, "v").steps_from(3, |i| vec![i as f64]).build();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[2].point_arrays.get("v").unwrap().get::<f64>(0).unwrap(), 2.0);
    }

    #[test]
    fn assert_mesh_values_close_accepts_values_within_tolerance() {
        let ds = Dataset::Mesh(scalar_mesh("v", 1.0000001));
        assert_mesh_values_close(&ds, "v", &[1.0], 1e-4);
    }
}
