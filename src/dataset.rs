//! Dataset and mesh types (C2, continued from [`crate::metadata`]).
//!
//! A [`Dataset`] is the polymorphic root that flows between pipeline stages; today its
//! only non-empty variant is [`Mesh`], a Cartesian grid carrying metadata, a named
//! collection of point arrays, and optional coordinate axes. Two invariants hold for
//! every valid mesh: every point array's length equals the mesh's point count, and any
//! present coordinate axis matches its extent dimension's length.

use crate::error::{KernelError, KernelResult};
use crate::metadata::Metadata;
use crate::variant::VariantArray;

/// Six inclusive integers `[i0, i1, j0, j1, k0, k1]` naming an axis-aligned index-space
/// subregion, matching the original's `whole_extent`/`extent` convention.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Extent(pub [i64; 6]);

impl Extent {
    #[must_use]
    pub fn new(i0: i64, i1: i64, j0: i64, j1: i64, k0: i64, k1: i64) -> Self {
        Self([i0, i1, j0, j1, k0, k1])
    }

    /// Nodal point count: the product of each dimension's inclusive span.
    #[must_use]
    pub fn point_count(&self) -> u64 {
        let [i0, i1, j0, j1, k0, k1] = self.0;
        let dims = [i1 - i0 + 1, j1 - j0 + 1, k1 - k0 + 1];
        dims.iter().map(|d| (*d).max(0) as u64).product()
    }

    #[must_use]
    pub fn dims(&self) -> [i64; 3] {
        let [i0, i1, j0, j1, k0, k1] = self.0;
        [i1 - i0 + 1, j1 - j0 + 1, k1 - k0 + 1]
    }

    #[must_use]
    pub fn to_metadata_array(self) -> VariantArray {
        VariantArray::new_i64(self.0.to_vec())
    }

    pub fn from_metadata_array(arr: &VariantArray) -> KernelResult<Self> {
        if arr.len() != 6 {
            return Err(KernelError::ProtocolFailure {
                reason: format!("extent array must have 6 elements, got {}", arr.len()),
            });
        }
        let mut out = [0i64; 6];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = arr.get(i)?;
        }
        Ok(Extent(out))
    }
}

/// An ordered, name-addressed collection of variant arrays, all the same length.
/// Duplicate names are disallowed (last `set` for a name overwrites in place).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArrayCollection {
    entries: Vec<(String, VariantArray)>,
}

impl ArrayCollection {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or overwrite an array by name, preserving first-insertion position.
    pub fn set(&mut self, name: impl Into<String>, arr: VariantArray) {
        let name = name.into();
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = arr;
        } else {
            self.entries.push((name, arr));
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&VariantArray> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    pub fn require(&self, name: &str) -> KernelResult<&VariantArray> {
        self.get(name).ok_or_else(|| KernelError::KeyMissing {
            key: name.to_string(),
        })
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VariantArray)> {
        self.entries.iter().map(|(n, a)| (n.as_str(), a))
    }

    pub fn remove(&mut self, name: &str) -> Option<VariantArray> {
        let pos = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(pos).1)
    }
}

/// A Cartesian grid: metadata, a point-array collection, optional x/y/z/t coordinate
/// axes, and the whole-extent defining the nodal dimensions in index space.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mesh {
    pub metadata: Metadata,
    pub point_arrays: ArrayCollection,
    pub x: Option<VariantArray>,
    pub y: Option<VariantArray>,
    pub z: Option<VariantArray>,
    pub t: Option<VariantArray>,
    pub extent: Extent,
}

impl Mesh {
    #[must_use]
    pub fn new(extent: Extent) -> Self {
        Self {
            metadata: Metadata::new(),
            point_arrays: ArrayCollection::new(),
            x: None,
            y: None,
            z: None,
            t: None,
            extent,
        }
    }

    /// Same shape (extent, coordinates, metadata) with each point array emptied —
    /// used by reducers to build an output accumulator (`new_instance` in the
    /// original).
    #[must_use]
    pub fn new_instance(&self) -> Mesh {
        let mut out = Mesh::new(self.extent);
        out.metadata = self.metadata.clone();
        out.x = self.x.clone();
        out.y = self.y.clone();
        out.z = self.z.clone();
        out.t = self.t.clone();
        for (name, arr) in self.point_arrays.iter() {
            out.point_arrays.set(name, arr.new_instance());
        }
        out
    }

    /// Validate that every point array's length equals the extent's point count and
    /// that present coordinate axes match their extent dimension's length.
    pub fn validate(&self) -> KernelResult<()> {
        let expected = self.extent.point_count();
        for (name, arr) in self.point_arrays.iter() {
            if arr.len() as u64 != expected {
                return Err(KernelError::ProtocolFailure {
                    reason: format!(
                        "point array '{name}' has length {} but extent implies {expected}",
                        arr.len()
                    ),
                });
            }
        }
        let [ni, nj, nk] = self.extent.dims();
        for (axis_name, axis, dim) in [("x", &self.x, ni), ("y", &self.y, nj), ("z", &self.z, nk)] {
            if let Some(arr) = axis {
                if arr.len() as i64 != dim.max(0) {
                    return Err(KernelError::ProtocolFailure {
                        reason: format!(
                            "coordinate axis '{axis_name}' has length {} but extent dimension is {dim}",
                            arr.len()
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Binary framing for cross-rank transmission: extent, then the optional
    /// coordinate axes each tagged present/absent, then metadata, then the point-array
    /// collection — each piece using its own `to_bytes`/`from_bytes` framing, the same
    /// "typed length-prefixed payload" discipline `VariantArray` and `Metadata` use.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for c in self.extent.0 {
            buf.extend_from_slice(&c.to_le_bytes());
        }
        for axis in [&self.x, &self.y, &self.z, &self.t] {
            match axis {
                Some(a) => {
                    buf.push(1);
                    buf.extend_from_slice(&a.to_bytes());
                }
                None => buf.push(0),
            }
        }
        buf.extend_from_slice(&self.metadata.to_bytes());
        buf.extend_from_slice(&(self.point_arrays.len() as u64).to_le_bytes());
        for (name, arr) in self.point_arrays.iter() {
            buf.extend_from_slice(&(name.len() as u64).to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&arr.to_bytes());
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> KernelResult<(Mesh, usize)> {
        fn bad(reason: &str) -> KernelError {
            KernelError::ProtocolFailure {
                reason: reason.to_string(),
            }
        }
        if bytes.len() < 48 {
            return Err(bad("truncated mesh extent"));
        }
        let mut extent = [0i64; 6];
        for (i, slot) in extent.iter_mut().enumerate() {
            *slot = i64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
        }
        let mut off = 48usize;
        let mut mesh = Mesh::new(Extent(extent));

        let mut axes: [Option<VariantArray>; 4] = [None, None, None, None];
        for slot in axes.iter_mut() {
            let tag = *bytes.get(off).ok_or_else(|| bad("truncated mesh axis tag"))?;
            off += 1;
            if tag == 1 {
                let (arr, consumed) = VariantArray::from_bytes(&bytes[off..])?;
                off += consumed;
                *slot = Some(arr);
            } else if tag != 0 {
                return Err(bad("invalid mesh axis presence tag"));
            }
        }
        let [x, y, z, t] = axes;
        mesh.x = x;
        mesh.y = y;
        mesh.z = z;
        mesh.t = t;

        let (metadata, consumed) = Metadata::from_bytes(&bytes[off..])?;
        off += consumed;
        mesh.metadata = metadata;

        let count_bytes = bytes.get(off..off + 8).ok_or_else(|| bad("truncated point array count"))?;
        let count = u64::from_le_bytes(count_bytes.try_into().unwrap()) as usize;
        off += 8;
        for _ in 0..count {
            let nlen_bytes = bytes.get(off..off + 8).ok_or_else(|| bad("truncated point array name length"))?;
            let nlen = u64::from_le_bytes(nlen_bytes.try_into().unwrap()) as usize;
            off += 8;
            let name_bytes = bytes.get(off..off + nlen).ok_or_else(|| bad("truncated point array name"))?;
            let name = String::from_utf8(name_bytes.to_vec()).map_err(|_| bad("invalid utf-8 in point array name"))?;
            off += nlen;
            let (arr, consumed) = VariantArray::from_bytes(&bytes[off..])?;
            off += consumed;
            mesh.point_arrays.set(name, arr);
        }
        Ok((mesh, off))
    }

    /// Two meshes are compatible for elementwise reduction iff their extents,
    /// point-array name sets, and per-array element types all match.
    #[must_use]
    pub fn compatible_for_reduction(&self, other: &Mesh) -> bool {
        if self.extent != other.extent {
            return false;
        }
        let mut my_names = self.point_arrays.names();
        let mut their_names = other.point_arrays.names();
        my_names.sort_unstable();
        their_names.sort_unstable();
        if my_names != their_names {
            return false;
        }
        my_names.iter().all(|name| {
            let a = self.point_arrays.get(name).unwrap();
            let b = other.point_arrays.get(name).unwrap();
            a.type_code() == b.type_code()
        })
    }
}

/// The polymorphic root that flows between pipeline stages: either nothing at all,
/// or a [`Mesh`].
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Dataset {
    #[default]
    Empty,
    Mesh(Mesh),
}

impl Dataset {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Dataset::Empty)
    }

    /// Typed downcast, mirroring the original's `mesh?` dynamic-cast query.
    #[must_use]
    pub fn as_mesh(&self) -> Option<&Mesh> {
        match self {
            Dataset::Mesh(m) => Some(m),
            Dataset::Empty => None,
        }
    }

    #[must_use]
    pub fn into_mesh(self) -> Option<Mesh> {
        match self {
            Dataset::Mesh(m) => Some(m),
            Dataset::Empty => None,
        }
    }

    pub fn require_mesh(&self) -> KernelResult<&Mesh> {
        self.as_mesh().ok_or_else(|| KernelError::ProtocolFailure {
            reason: "expected a mesh dataset".to_string(),
        })
    }

    /// Same shape as `self`, with empty point arrays; used by reducers to build an
    /// accumulator before folding in the first step (`new_instance` in the original).
    #[must_use]
    pub fn new_instance(&self) -> Dataset {
        match self {
            Dataset::Empty => Dataset::Empty,
            Dataset::Mesh(m) => Dataset::Mesh(m.new_instance()),
        }
    }

    /// Binary framing for cross-rank message passing: a one-byte tag (0 = empty,
    /// 1 = mesh) followed by the mesh's own framing when present.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Dataset::Empty => vec![0],
            Dataset::Mesh(m) => {
                let mut buf = vec![1u8];
                buf.extend_from_slice(&m.to_bytes());
                buf
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> KernelResult<(Dataset, usize)> {
        match bytes.first() {
            Some(0) => Ok((Dataset::Empty, 1)),
            Some(1) => {
                let (mesh, consumed) = Mesh::from_bytes(&bytes[1..])?;
                Ok((Dataset::Mesh(mesh), consumed + 1))
            }
            _ => Err(KernelError::ProtocolFailure {
                reason: "truncated or invalid dataset framing tag".to_string(),
            }),
        }
    }
}

impl From<Mesh> for Dataset {
    fn from(m: Mesh) -> Self {
        Dataset::Mesh(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_2x2() -> Extent {
        Extent::new(0, 1, 0, 1, 0, 0)
    }

    #[test]
    fn point_count_matches_product_of_dims() {
        assert_eq!(grid_2x2().point_count(), 4);
    }

    #[test]
    fn validate_rejects_mismatched_point_array_length() {
        let mut m = Mesh::new(grid_2x2());
        m.point_arrays.set("m", VariantArray::new_f64(vec![1.0, 2.0]));
        let err = m.validate().unwrap_err();
        assert!(matches!(err, KernelError::ProtocolFailure { .. }));
    }

    #[test]
    fn validate_accepts_matching_shapes() {
        let mut m = Mesh::new(grid_2x2());
        m.point_arrays
            .set("m", VariantArray::new_f64(vec![1.0, 2.0, 3.0, 4.0]));
        m.x = Some(VariantArray::new_f64(vec![0.0, 1.0]));
        m.y = Some(VariantArray::new_f64(vec![0.0, 1.0]));
        m.validate().unwrap();
    }

    #[test]
    fn new_instance_preserves_shape_with_empty_arrays() {
        let mut m = Mesh::new(grid_2x2());
        m.point_arrays
            .set("m", VariantArray::new_f64(vec![1.0, 2.0, 3.0, 4.0]));
        let inst = m.new_instance();
        assert_eq!(inst.extent, m.extent);
        assert!(inst.point_arrays.get("m").unwrap().is_empty());
    }

    #[test]
    fn mesh_binary_roundtrip_preserves_shape_and_values() {
        let mut m = Mesh::new(grid_2x2());
        m.point_arrays.set("moisture", VariantArray::new_f64(vec![1.0, 2.0, 3.0, 4.0]));
        m.x = Some(VariantArray::new_f64(vec![0.0, 1.0]));
        m.y = Some(VariantArray::new_f64(vec![0.0, 1.0]));
        m.metadata.set_scalar("time_step", 3i64);

        let bytes = m.to_bytes();
        let (decoded, consumed) = Mesh::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, m);
    }

    #[test]
    fn dataset_binary_roundtrip_covers_both_variants() {
        let (empty, n) = Dataset::from_bytes(&Dataset::Empty.to_bytes()).unwrap();
        assert_eq!(empty, Dataset::Empty);
        assert_eq!(n, 1);

        let mut m = Mesh::new(grid_2x2());
        m.point_arrays.set("m", VariantArray::new_f64(vec![1.0; 4]));
        let ds = Dataset::Mesh(m);
        let bytes = ds.to_bytes();
        let (decoded, consumed) = Dataset::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, ds);
    }

    #[test]
    fn compatible_for_reduction_checks_extent_names_and_types() {
        let mut a = Mesh::new(grid_2x2());
        a.point_arrays.set("m", VariantArray::new_f64(vec![1.0; 4]));
        let mut b = Mesh::new(grid_2x2());
        b.point_arrays.set("m", VariantArray::new_f64(vec![2.0; 4]));
        assert!(a.compatible_for_reduction(&b));

        let mut c = Mesh::new(grid_2x2());
        c.point_arrays.set("m", VariantArray::new_i32(vec![2; 4]));
        assert!(!a.compatible_for_reduction(&c));

        let mut d = Mesh::new(Extent::new(0, 2, 0, 1, 0, 0));
        d.point_arrays.set("m", VariantArray::new_f64(vec![1.0; 6]));
        assert!(!a.compatible_for_reduction(&d));
    }
}
