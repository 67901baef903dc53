//! Insertion-ordered key/value property bag (C2).
//!
//! Backed by a `Vec<(String, MetadataValue)>` searched linearly rather than a hash map,
//! to preserve insertion order for display and diagnostics. Pipelines carry a handful
//! of keys per report/request, so the O(n) lookup this implies is not a concern in
//! practice.

use crate::error::{KernelError, KernelResult};
use crate::variant::{NumericScalar, VariantArray};

/// A metadata value: either a leaf array or a nested metadata map (mirrors the
/// original's `teca_metadata` object element type, type code 12 in `VariantArray`).
#[derive(Clone, Debug, PartialEq)]
pub enum MetadataValue {
    Array(VariantArray),
    Nested(Metadata),
}

impl From<VariantArray> for MetadataValue {
    fn from(v: VariantArray) -> Self {
        MetadataValue::Array(v)
    }
}

impl From<Metadata> for MetadataValue {
    fn from(m: Metadata) -> Self {
        MetadataValue::Nested(m)
    }
}

/// An insertion-ordered, last-write-wins key/value map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
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

    /// Insert or overwrite `key`. A repeated `insert` of the same key replaces the
    /// value in place rather than appending a second entry, so key order reflects
    /// first-insertion order even after updates.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Fetch a key, returning `KeyMissing` — the one recoverable error kind — when
    /// absent, so callers that want a hard failure don't have to build their own error.
    pub fn require(&self, key: &str) -> KernelResult<&MetadataValue> {
        self.get(key).ok_or_else(|| KernelError::KeyMissing {
            key: key.to_string(),
        })
    }

    pub fn get_array(&self, key: &str) -> KernelResult<&VariantArray> {
        match self.require(key)? {
            MetadataValue::Array(a) => Ok(a),
            MetadataValue::Nested(_) => Err(KernelError::BadCast {
                from: "nested metadata",
                to: "array",
            }),
        }
    }

    pub fn get_nested(&self, key: &str) -> KernelResult<&Metadata> {
        match self.require(key)? {
            MetadataValue::Nested(m) => Ok(m),
            MetadataValue::Array(_) => Err(KernelError::BadCast {
                from: "array",
                to: "nested metadata",
            }),
        }
    }

    /// Convenience accessor for a single scalar value stored as a length-1 array,
    /// the common case for keys like `time_step` or `step_count`.
    pub fn get_scalar<T: crate::variant::NumericCast>(&self, key: &str) -> KernelResult<T> {
        let arr = self.get_array(key)?;
        if arr.is_empty() {
            return Err(KernelError::KeyMissing {
                key: key.to_string(),
            });
        }
        arr.get(0)
    }

    pub fn set_scalar<T: crate::variant::NumericCast>(&mut self, key: impl Into<String>, value: T) {
        let arr = match value.to_scalar() {
            NumericScalar::I8(v) => VariantArray::new_i8(vec![v]),
            NumericScalar::U8(v) => VariantArray::new_u8(vec![v]),
            NumericScalar::I16(v) => VariantArray::new_i16(vec![v]),
            NumericScalar::U16(v) => VariantArray::new_u16(vec![v]),
            NumericScalar::I32(v) => VariantArray::new_i32(vec![v]),
            NumericScalar::U32(v) => VariantArray::new_u32(vec![v]),
            NumericScalar::I64(v) => VariantArray::new_i64(vec![v]),
            NumericScalar::U64(v) => VariantArray::new_u64(vec![v]),
            NumericScalar::F32(v) => VariantArray::new_f32(vec![v]),
            NumericScalar::F64(v) => VariantArray::new_f64(vec![v]),
        };
        self.insert(key, arr);
    }

    pub fn get_string(&self, key: &str) -> KernelResult<&str> {
        self.get_array(key)?.get_string(0)
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.insert(key, VariantArray::new_string(vec![value.into()]));
    }

    /// Remove a key, returning its value if present.
    pub fn remove(&mut self, key: &str) -> Option<MetadataValue> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merge `other` into `self`; `other`'s values win on key collision, matching the
    /// original's `teca_metadata::merge` used when a node's own properties are layered
    /// over an upstream report.
    pub fn merge(&mut self, other: &Metadata) {
        for (k, v) in &other.entries {
            self.insert(k.clone(), v.clone());
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        for (k, v) in &self.entries {
            buf.extend_from_slice(&(k.len() as u64).to_le_bytes());
            buf.extend_from_slice(k.as_bytes());
            match v {
                MetadataValue::Array(a) => {
                    buf.push(0);
                    buf.extend_from_slice(&a.to_bytes());
                }
                MetadataValue::Nested(m) => {
                    buf.push(1);
                    buf.extend_from_slice(&m.to_bytes());
                }
            }
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> KernelResult<(Metadata, usize)> {
        fn bad(reason: &str) -> KernelError {
            KernelError::ProtocolFailure {
                reason: reason.to_string(),
            }
        }
        if bytes.len() < 8 {
            return Err(bad("truncated metadata framing header"));
        }
        let count = u64::from_le_bytes(bytes[0..8].try_into().unwrap()) as usize;
        let mut off = 8usize;
        let mut m = Metadata::new();
        for _ in 0..count {
            let klen_bytes = bytes
                .get(off..off + 8)
                .ok_or_else(|| bad("truncated metadata key length"))?;
            let klen = u64::from_le_bytes(klen_bytes.try_into().unwrap()) as usize;
            off += 8;
            let key_bytes = bytes
                .get(off..off + klen)
                .ok_or_else(|| bad("truncated metadata key"))?;
            let key = String::from_utf8(key_bytes.to_vec())
                .map_err(|_| bad("invalid utf-8 in metadata key"))?;
            off += klen;
            let tag = *bytes.get(off).ok_or_else(|| bad("truncated metadata tag"))?;
            off += 1;
            match tag {
                0 => {
                    let (arr, consumed) = VariantArray::from_bytes(&bytes[off..])?;
                    off += consumed;
                    m.insert(key, arr);
                }
                1 => {
                    let (nested, consumed) = Metadata::from_bytes(&bytes[off..])?;
                    off += consumed;
                    m.insert(key, nested);
                }
                other => return Err(bad(&format!("unknown metadata value tag {other}"))),
            }
        }
        Ok((m, off))
    }

    #[must_use]
    pub fn to_text(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| match v {
                MetadataValue::Array(a) => format!("{k}: {}", a.to_text()),
                MetadataValue::Nested(m) => format!("{k}: {{{}}}", m.to_text()),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_last_write_wins_in_place() {
        let mut m = Metadata::new();
        m.insert("a", VariantArray::new_i32(vec![1]));
        m.insert("b", VariantArray::new_i32(vec![2]));
        m.insert("a", VariantArray::new_i32(vec![99]));
        let keys: Vec<&str> = m.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(m.get_array("a").unwrap().get::<i32>(0).unwrap(), 99);
    }

    #[test]
    fn require_missing_key_is_recoverable() {
        let m = Metadata::new();
        let err = m.require("missing").unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn nested_metadata_roundtrip() {
        let mut inner = Metadata::new();
        inner.set_string("x_variable", "lon");
        let mut outer = Metadata::new();
        outer.insert("coordinates", inner.clone());
        outer.set_scalar("step_count", 10i64);

        let bytes = outer.to_bytes();
        let (decoded, consumed) = Metadata::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.get_nested("coordinates").unwrap(), &inner);
        assert_eq!(decoded.get_scalar::<i64>("step_count").unwrap(), 10);
    }

    #[test]
    fn merge_prefers_other() {
        let mut base = Metadata::new();
        base.set_scalar("time_step", 1i64);
        let mut patch = Metadata::new();
        patch.set_scalar("time_step", 2i64);
        base.merge(&patch);
        assert_eq!(base.get_scalar::<i64>("time_step").unwrap(), 2);
    }
}
