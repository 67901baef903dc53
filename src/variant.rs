//! Type-erased polymorphic array container (C1).
//!
//! [`VariantArray`] is a closed sum over the twelve element types the kernel moves
//! through a pipeline: the eight fixed-width integer types, `f32`/`f64`, `String`, and
//! nested [`Metadata`]. Modeling the element type as a closed Rust enum rather than a
//! trait object removes the dynamic downcast the original C++ implementation relies on
//! (`dynamic_cast` in a `TEMPLATE_DISPATCH` case cascade) — every dispatch here is an
//! exhaustive `match`, so a mismatched type is a `BadCast` value, never a downcast panic.
//!
//! Type codes are stable and match the order the variants are declared in below,
//! mirroring the original's `teca_variant_array_code` table.

use crate::error::{KernelError, KernelResult};
use crate::metadata::Metadata;
use paste::paste;

/// A single numeric value tagged with its source type, used as the pivot when
/// converting between two (possibly different) numeric element types.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NumericScalar {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

/// A numeric element type that can be produced from, and converted to, any other
/// numeric element type via Rust's `as` cast semantics.
///
/// `as` casts between these ten primitive numeric types truncate/saturate the same way
/// the original's plain `static_cast`-based assignment does — this is a deliberate,
/// documented match to the original's behavior, not an accidental omission of range
/// checking.
pub trait NumericCast: Copy + PartialEq + Send + Sync + 'static {
    /// Stable type code for this element type (see module docs).
    const CODE: u32;
    /// Name used in `BadCast` diagnostics.
    const NAME: &'static str;

    fn from_scalar(s: NumericScalar) -> Self;
    fn to_scalar(self) -> NumericScalar;
}

macro_rules! impl_numeric_cast {
    ($ty:ty, $variant:ident, $code:expr) => {
        impl NumericCast for $ty {
            const CODE: u32 = $code;
            const NAME: &'static str = stringify!($ty);

            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            fn from_scalar(s: NumericScalar) -> Self {
                match s {
                    NumericScalar::I8(v) => v as Self,
                    NumericScalar::U8(v) => v as Self,
                    NumericScalar::I16(v) => v as Self,
                    NumericScalar::U16(v) => v as Self,
                    NumericScalar::I32(v) => v as Self,
                    NumericScalar::U32(v) => v as Self,
                    NumericScalar::I64(v) => v as Self,
                    NumericScalar::U64(v) => v as Self,
                    NumericScalar::F32(v) => v as Self,
                    NumericScalar::F64(v) => v as Self,
                }
            }

            fn to_scalar(self) -> NumericScalar {
                NumericScalar::$variant(self)
            }
        }
    };
}

impl_numeric_cast!(i8, I8, 1);
impl_numeric_cast!(u8, U8, 2);
impl_numeric_cast!(i16, I16, 3);
impl_numeric_cast!(u16, U16, 4);
impl_numeric_cast!(i32, I32, 5);
impl_numeric_cast!(u32, U32, 6);
impl_numeric_cast!(i64, I64, 7);
impl_numeric_cast!(u64, U64, 8);
impl_numeric_cast!(f32, F32, 9);
impl_numeric_cast!(f64, F64, 10);

const STRING_CODE: u32 = 11;
const META_CODE: u32 = 12;

/// A type-erased, homogeneously-typed array. See module docs.
#[derive(Clone, Debug, PartialEq)]
pub enum VariantArray {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Str(Vec<String>),
    Meta(Vec<Metadata>),
}

/// Generates the boilerplate that is identical across all ten numeric variants:
/// `type_code`, `len`, `new_instance`, `resize`, `reserve`, `clear`, and the numeric
/// get/set/append family. One macro arm per variant keeps each case an explicit,
/// reviewable match arm instead of hiding the dispatch behind a trait object.
macro_rules! numeric_arms {
    ($self:expr, $v:ident => $body:expr) => {
        match $self {
            VariantArray::I8($v) => $body,
            VariantArray::U8($v) => $body,
            VariantArray::I16($v) => $body,
            VariantArray::U16($v) => $body,
            VariantArray::I32($v) => $body,
            VariantArray::U32($v) => $body,
            VariantArray::I64($v) => $body,
            VariantArray::U64($v) => $body,
            VariantArray::F32($v) => $body,
            VariantArray::F64($v) => $body,
            VariantArray::Str(_) | VariantArray::Meta(_) => {
                return Err(KernelError::BadCast {
                    from: $self.type_name(),
                    to: "numeric",
                });
            }
        }
    };
}

impl VariantArray {
    /// Stable type code, round-trips across serialization.
    #[must_use]
    pub fn type_code(&self) -> u32 {
        match self {
            VariantArray::I8(_) => i8::CODE,
            VariantArray::U8(_) => u8::CODE,
            VariantArray::I16(_) => i16::CODE,
            VariantArray::U16(_) => u16::CODE,
            VariantArray::I32(_) => i32::CODE,
            VariantArray::U32(_) => u32::CODE,
            VariantArray::I64(_) => i64::CODE,
            VariantArray::U64(_) => u64::CODE,
            VariantArray::F32(_) => f32::CODE,
            VariantArray::F64(_) => f64::CODE,
            VariantArray::Str(_) => STRING_CODE,
            VariantArray::Meta(_) => META_CODE,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            VariantArray::I8(_) => "i8",
            VariantArray::U8(_) => "u8",
            VariantArray::I16(_) => "i16",
            VariantArray::U16(_) => "u16",
            VariantArray::I32(_) => "i32",
            VariantArray::U32(_) => "u32",
            VariantArray::I64(_) => "i64",
            VariantArray::U64(_) => "u64",
            VariantArray::F32(_) => "f32",
            VariantArray::F64(_) => "f64",
            VariantArray::Str(_) => "string",
            VariantArray::Meta(_) => "metadata",
        }
    }

    /// Number of stored elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            VariantArray::I8(v) => v.len(),
            VariantArray::U8(v) => v.len(),
            VariantArray::I16(v) => v.len(),
            VariantArray::U16(v) => v.len(),
            VariantArray::I32(v) => v.len(),
            VariantArray::U32(v) => v.len(),
            VariantArray::I64(v) => v.len(),
            VariantArray::U64(v) => v.len(),
            VariantArray::F32(v) => v.len(),
            VariantArray::F64(v) => v.len(),
            VariantArray::Str(v) => v.len(),
            VariantArray::Meta(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A new, empty array of the same element type. Used by reducers to build an
    /// output accumulator of the right shape (`new_instance` in the original).
    #[must_use]
    pub fn new_instance(&self) -> VariantArray {
        match self {
            VariantArray::I8(_) => VariantArray::I8(Vec::new()),
            VariantArray::U8(_) => VariantArray::U8(Vec::new()),
            VariantArray::I16(_) => VariantArray::I16(Vec::new()),
            VariantArray::U16(_) => VariantArray::U16(Vec::new()),
            VariantArray::I32(_) => VariantArray::I32(Vec::new()),
            VariantArray::U32(_) => VariantArray::U32(Vec::new()),
            VariantArray::I64(_) => VariantArray::I64(Vec::new()),
            VariantArray::U64(_) => VariantArray::U64(Vec::new()),
            VariantArray::F32(_) => VariantArray::F32(Vec::new()),
            VariantArray::F64(_) => VariantArray::F64(Vec::new()),
            VariantArray::Str(_) => VariantArray::Str(Vec::new()),
            VariantArray::Meta(_) => VariantArray::Meta(Vec::new()),
        }
    }

    /// Deep clone producing an independently mutable instance that compares equal.
    /// `Clone::clone` already does this since every variant owns its data.
    #[must_use]
    pub fn deep_clone(&self) -> VariantArray {
        self.clone()
    }

    /// Resize, preserving existing elements and zero/default-filling new slots.
    pub fn resize(&mut self, n: usize) -> KernelResult<()> {
        match self {
            VariantArray::Str(v) => {
                v.resize(n, String::new());
                Ok(())
            }
            VariantArray::Meta(v) => {
                v.resize(n, Metadata::new());
                Ok(())
            }
            _ => {
                numeric_arms!(self, v => { v.resize(n, Default::default()); Ok(()) })
            }
        }
    }

    /// Preallocate space without constructing elements.
    pub fn reserve(&mut self, n: usize) {
        match self {
            VariantArray::I8(v) => v.reserve(n),
            VariantArray::U8(v) => v.reserve(n),
            VariantArray::I16(v) => v.reserve(n),
            VariantArray::U16(v) => v.reserve(n),
            VariantArray::I32(v) => v.reserve(n),
            VariantArray::U32(v) => v.reserve(n),
            VariantArray::I64(v) => v.reserve(n),
            VariantArray::U64(v) => v.reserve(n),
            VariantArray::F32(v) => v.reserve(n),
            VariantArray::F64(v) => v.reserve(n),
            VariantArray::Str(v) => v.reserve(n),
            VariantArray::Meta(v) => v.reserve(n),
        }
    }

    /// Free all stored elements, keeping the element type.
    pub fn clear(&mut self) {
        match self {
            VariantArray::I8(v) => v.clear(),
            VariantArray::U8(v) => v.clear(),
            VariantArray::I16(v) => v.clear(),
            VariantArray::U16(v) => v.clear(),
            VariantArray::I32(v) => v.clear(),
            VariantArray::U32(v) => v.clear(),
            VariantArray::I64(v) => v.clear(),
            VariantArray::U64(v) => v.clear(),
            VariantArray::F32(v) => v.clear(),
            VariantArray::F64(v) => v.clear(),
            VariantArray::Str(v) => v.clear(),
            VariantArray::Meta(v) => v.clear(),
        }
    }

    fn numeric_scalar_at(&self, i: usize) -> KernelResult<NumericScalar> {
        let size = self.len() as u64;
        if i as u64 >= size {
            return Err(KernelError::OutOfRange {
                index: i as u64,
                size,
            });
        }
        Ok(match self {
            VariantArray::I8(v) => NumericScalar::I8(v[i]),
            VariantArray::U8(v) => NumericScalar::U8(v[i]),
            VariantArray::I16(v) => NumericScalar::I16(v[i]),
            VariantArray::U16(v) => NumericScalar::U16(v[i]),
            VariantArray::I32(v) => NumericScalar::I32(v[i]),
            VariantArray::U32(v) => NumericScalar::U32(v[i]),
            VariantArray::I64(v) => NumericScalar::I64(v[i]),
            VariantArray::U64(v) => NumericScalar::U64(v[i]),
            VariantArray::F32(v) => NumericScalar::F32(v[i]),
            VariantArray::F64(v) => NumericScalar::F64(v[i]),
            VariantArray::Str(_) | VariantArray::Meta(_) => {
                return Err(KernelError::BadCast {
                    from: self.type_name(),
                    to: "numeric",
                });
            }
        })
    }

    /// Get element `i` converted to `T` via implicit numeric conversion.
    pub fn get<T: NumericCast>(&self, i: usize) -> KernelResult<T> {
        self.numeric_scalar_at(i).map(T::from_scalar)
    }

    /// Set element `i` from a value of possibly different numeric type `T`.
    pub fn set<T: NumericCast>(&mut self, i: usize, val: T) -> KernelResult<()> {
        let size = self.len() as u64;
        if i as u64 >= size {
            return Err(KernelError::OutOfRange {
                index: i as u64,
                size,
            });
        }
        let scalar = val.to_scalar();
        match self {
            VariantArray::I8(v) => v[i] = i8::from_scalar(scalar),
            VariantArray::U8(v) => v[i] = u8::from_scalar(scalar),
            VariantArray::I16(v) => v[i] = i16::from_scalar(scalar),
            VariantArray::U16(v) => v[i] = u16::from_scalar(scalar),
            VariantArray::I32(v) => v[i] = i32::from_scalar(scalar),
            VariantArray::U32(v) => v[i] = u32::from_scalar(scalar),
            VariantArray::I64(v) => v[i] = i64::from_scalar(scalar),
            VariantArray::U64(v) => v[i] = u64::from_scalar(scalar),
            VariantArray::F32(v) => v[i] = f32::from_scalar(scalar),
            VariantArray::F64(v) => v[i] = f64::from_scalar(scalar),
            VariantArray::Str(_) | VariantArray::Meta(_) => {
                return Err(KernelError::BadCast {
                    from: "numeric",
                    to: self.type_name(),
                });
            }
        }
        Ok(())
    }

    /// Append a single numeric value, converting into this array's element type.
    pub fn append<T: NumericCast>(&mut self, val: T) -> KernelResult<()> {
        let scalar = val.to_scalar();
        match self {
            VariantArray::I8(v) => v.push(i8::from_scalar(scalar)),
            VariantArray::U8(v) => v.push(u8::from_scalar(scalar)),
            VariantArray::I16(v) => v.push(i16::from_scalar(scalar)),
            VariantArray::U16(v) => v.push(u16::from_scalar(scalar)),
            VariantArray::I32(v) => v.push(i32::from_scalar(scalar)),
            VariantArray::U32(v) => v.push(u32::from_scalar(scalar)),
            VariantArray::I64(v) => v.push(i64::from_scalar(scalar)),
            VariantArray::U64(v) => v.push(u64::from_scalar(scalar)),
            VariantArray::F32(v) => v.push(f32::from_scalar(scalar)),
            VariantArray::F64(v) => v.push(f64::from_scalar(scalar)),
            VariantArray::Str(_) | VariantArray::Meta(_) => {
                return Err(KernelError::BadCast {
                    from: "numeric",
                    to: self.type_name(),
                });
            }
        }
        Ok(())
    }

    /// Copy an entire numeric range out of this array, converting each element.
    pub fn get_range<T: NumericCast>(&self, start: usize, end: usize) -> KernelResult<Vec<T>> {
        (start..end).map(|i| self.get(i)).collect()
    }

    pub fn get_string(&self, i: usize) -> KernelResult<&str> {
        match self {
            VariantArray::Str(v) => v
                .get(i)
                .map(String::as_str)
                .ok_or(KernelError::OutOfRange {
                    index: i as u64,
                    size: v.len() as u64,
                }),
            _ => Err(KernelError::BadCast {
                from: self.type_name(),
                to: "string",
            }),
        }
    }

    pub fn append_string(&mut self, val: impl Into<String>) -> KernelResult<()> {
        match self {
            VariantArray::Str(v) => {
                v.push(val.into());
                Ok(())
            }
            _ => Err(KernelError::BadCast {
                from: "string",
                to: self.type_name(),
            }),
        }
    }

    pub fn get_metadata(&self, i: usize) -> KernelResult<&Metadata> {
        match self {
            VariantArray::Meta(v) => v.get(i).ok_or(KernelError::OutOfRange {
                index: i as u64,
                size: v.len() as u64,
            }),
            _ => Err(KernelError::BadCast {
                from: self.type_name(),
                to: "metadata",
            }),
        }
    }

    pub fn append_metadata(&mut self, val: Metadata) -> KernelResult<()> {
        match self {
            VariantArray::Meta(v) => {
                v.push(val);
                Ok(())
            }
            _ => Err(KernelError::BadCast {
                from: "metadata",
                to: self.type_name(),
            }),
        }
    }

    /// Copy the contents of `other` into `self`, converting element-by-element when
    /// both sides are numeric. String and metadata arrays only accept a same-type copy
    /// (there is no conversion between object types, matching the original's
    /// `object_dispatch` single-case behavior).
    pub fn copy_from(&mut self, other: &VariantArray) -> KernelResult<()> {
        match (self, other) {
            (VariantArray::Str(dst), VariantArray::Str(src)) => {
                *dst = src.clone();
                Ok(())
            }
            (VariantArray::Meta(dst), VariantArray::Meta(src)) => {
                *dst = src.clone();
                Ok(())
            }
            (VariantArray::Str(_) | VariantArray::Meta(_), other)
            | (other, VariantArray::Str(_) | VariantArray::Meta(_)) => Err(KernelError::BadCast {
                from: other.type_name(),
                to: "incompatible element type",
            }),
            (dst, src) => {
                let n = src.len();
                dst.resize(n)?;
                for i in 0..n {
                    let scalar = src.numeric_scalar_at(i)?;
                    dst.set_scalar(i, scalar)?;
                }
                Ok(())
            }
        }
    }

    fn set_scalar(&mut self, i: usize, scalar: NumericScalar) -> KernelResult<()> {
        match self {
            VariantArray::I8(v) => v[i] = i8::from_scalar(scalar),
            VariantArray::U8(v) => v[i] = u8::from_scalar(scalar),
            VariantArray::I16(v) => v[i] = i16::from_scalar(scalar),
            VariantArray::U16(v) => v[i] = u16::from_scalar(scalar),
            VariantArray::I32(v) => v[i] = i32::from_scalar(scalar),
            VariantArray::U32(v) => v[i] = u32::from_scalar(scalar),
            VariantArray::I64(v) => v[i] = i64::from_scalar(scalar),
            VariantArray::U64(v) => v[i] = u64::from_scalar(scalar),
            VariantArray::F32(v) => v[i] = f32::from_scalar(scalar),
            VariantArray::F64(v) => v[i] = f64::from_scalar(scalar),
            VariantArray::Str(_) | VariantArray::Meta(_) => {
                return Err(KernelError::BadCast {
                    from: "numeric",
                    to: self.type_name(),
                });
            }
        }
        Ok(())
    }

    /// Append the contents of `other` onto the end of `self`, same conversion rule
    /// as [`VariantArray::copy_from`].
    pub fn append_from(&mut self, other: &VariantArray) -> KernelResult<()> {
        match (&mut *self, other) {
            (VariantArray::Str(dst), VariantArray::Str(src)) => {
                dst.extend(src.iter().cloned());
                Ok(())
            }
            (VariantArray::Meta(dst), VariantArray::Meta(src)) => {
                dst.extend(src.iter().cloned());
                Ok(())
            }
            (VariantArray::Str(_) | VariantArray::Meta(_), other)
            | (other, VariantArray::Str(_) | VariantArray::Meta(_)) => Err(KernelError::BadCast {
                from: other.type_name(),
                to: "incompatible element type",
            }),
            (_, src) => {
                for i in 0..src.len() {
                    let scalar = src.numeric_scalar_at(i)?;
                    self.append_scalar(scalar)?;
                }
                Ok(())
            }
        }
    }

    fn append_scalar(&mut self, scalar: NumericScalar) -> KernelResult<()> {
        match self {
            VariantArray::I8(v) => v.push(i8::from_scalar(scalar)),
            VariantArray::U8(v) => v.push(u8::from_scalar(scalar)),
            VariantArray::I16(v) => v.push(i16::from_scalar(scalar)),
            VariantArray::U16(v) => v.push(u16::from_scalar(scalar)),
            VariantArray::I32(v) => v.push(i32::from_scalar(scalar)),
            VariantArray::U32(v) => v.push(u32::from_scalar(scalar)),
            VariantArray::I64(v) => v.push(i64::from_scalar(scalar)),
            VariantArray::U64(v) => v.push(u64::from_scalar(scalar)),
            VariantArray::F32(v) => v.push(f32::from_scalar(scalar)),
            VariantArray::F64(v) => v.push(f64::from_scalar(scalar)),
            VariantArray::Str(_) | VariantArray::Meta(_) => {
                return Err(KernelError::BadCast {
                    from: "numeric",
                    to: self.type_name(),
                });
            }
        }
        Ok(())
    }

    /// Structural equality; numeric arrays of different element types are never
    /// equal even if their converted values would match (equality does not convert).
    #[must_use]
    pub fn equal(&self, other: &VariantArray) -> bool {
        self == other
    }

    /// Elementwise binary combination of two numeric arrays of the same length,
    /// producing an array of `self`'s element type with `other` converted on the fly.
    /// `T` must be `self`'s own concrete element type (checked; `BadCast` otherwise) —
    /// `self`'s elements are read natively and `other`'s are converted into `T` through
    /// the same exact `NumericCast` pivot `get`/`set` use, so the combination itself
    /// happens in `T`, never rounded through `f64`. This is the typed
    /// elementwise-over-two-arrays machinery every transform and the map-reduce reducer
    /// build on.
    pub fn zip_numeric<T, F>(&self, other: &VariantArray, mut f: F) -> KernelResult<VariantArray>
    where
        T: NumericCast,
        F: FnMut(T, T) -> T,
    {
        if self.type_code() != T::CODE {
            return Err(KernelError::BadCast {
                from: self.type_name(),
                to: T::NAME,
            });
        }
        if self.len() != other.len() {
            return Err(KernelError::ProtocolFailure {
                reason: format!(
                    "zip_numeric length mismatch: {} vs {}",
                    self.len(),
                    other.len()
                ),
            });
        }
        let n = self.len();
        let mut out = self.new_instance();
        out.resize(n)?;
        for i in 0..n {
            let a: T = self.get(i)?;
            let b: T = other.get(i)?;
            out.set(i, f(a, b))?;
        }
        Ok(out)
    }

    /// Build a new array holding only the elements at `indices`, in order, with no
    /// numeric conversion — the element type is copied verbatim. Used to subset an
    /// array to a requested index-space extent.
    pub fn gather(&self, indices: &[usize]) -> KernelResult<VariantArray> {
        macro_rules! gather_arm {
            ($v:expr, $variant:ident) => {{
                let mut out = Vec::with_capacity(indices.len());
                for &i in indices {
                    out.push($v.get(i).cloned().ok_or(KernelError::OutOfRange {
                        index: i as u64,
                        size: $v.len() as u64,
                    })?);
                }
                VariantArray::$variant(out)
            }};
        }
        Ok(match self {
            VariantArray::I8(v) => gather_arm!(v, I8),
            VariantArray::U8(v) => gather_arm!(v, U8),
            VariantArray::I16(v) => gather_arm!(v, I16),
            VariantArray::U16(v) => gather_arm!(v, U16),
            VariantArray::I32(v) => gather_arm!(v, I32),
            VariantArray::U32(v) => gather_arm!(v, U32),
            VariantArray::I64(v) => gather_arm!(v, I64),
            VariantArray::U64(v) => gather_arm!(v, U64),
            VariantArray::F32(v) => gather_arm!(v, F32),
            VariantArray::F64(v) => gather_arm!(v, F64),
            VariantArray::Str(v) => gather_arm!(v, Str),
            VariantArray::Meta(v) => gather_arm!(v, Meta),
        })
    }

    /// Binary framing: `uint32 type_code, uint64 element_count, payload`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.type_code().to_le_bytes());
        buf.extend_from_slice(&(self.len() as u64).to_le_bytes());
        self.write_payload(&mut buf);
        buf
    }

    fn write_payload(&self, buf: &mut Vec<u8>) {
        macro_rules! write_le {
            ($v:expr) => {
                for x in $v {
                    buf.extend_from_slice(&x.to_le_bytes());
                }
            };
        }
        match self {
            VariantArray::I8(v) => buf.extend(v.iter().map(|x| *x as u8)),
            VariantArray::U8(v) => buf.extend_from_slice(v),
            VariantArray::I16(v) => write_le!(v),
            VariantArray::U16(v) => write_le!(v),
            VariantArray::I32(v) => write_le!(v),
            VariantArray::U32(v) => write_le!(v),
            VariantArray::I64(v) => write_le!(v),
            VariantArray::U64(v) => write_le!(v),
            VariantArray::F32(v) => write_le!(v),
            VariantArray::F64(v) => write_le!(v),
            VariantArray::Str(v) => {
                for s in v {
                    buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
                    buf.extend_from_slice(s.as_bytes());
                }
            }
            VariantArray::Meta(v) => {
                for m in v {
                    buf.extend_from_slice(&m.to_bytes());
                }
            }
        }
    }

    /// Inverse of [`VariantArray::to_bytes`]. Deserialization is binary-only: there is
    /// deliberately no `from_text`.
    pub fn from_bytes(bytes: &[u8]) -> KernelResult<(VariantArray, usize)> {
        fn bad(reason: &str) -> KernelError {
            KernelError::ProtocolFailure {
                reason: reason.to_string(),
            }
        }
        if bytes.len() < 12 {
            return Err(bad("truncated variant array framing header"));
        }
        let type_code = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let count = u64::from_le_bytes(bytes[4..12].try_into().unwrap()) as usize;
        let mut off = 12usize;

        macro_rules! read_numeric {
            ($ty:ty, $ctor:expr) => {{
                let sz = std::mem::size_of::<$ty>();
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    let end = off + sz;
                    let bytes_slice = bytes
                        .get(off..end)
                        .ok_or_else(|| bad("truncated numeric payload"))?;
                    v.push(<$ty>::from_le_bytes(bytes_slice.try_into().unwrap()));
                    off = end;
                }
                ($ctor(v), off)
            }};
        }

        let (arr, new_off) = match type_code {
            1 => read_numeric!(i8, VariantArray::I8),
            2 => read_numeric!(u8, VariantArray::U8),
            3 => read_numeric!(i16, VariantArray::I16),
            4 => read_numeric!(u16, VariantArray::U16),
            5 => read_numeric!(i32, VariantArray::I32),
            6 => read_numeric!(u32, VariantArray::U32),
            7 => read_numeric!(i64, VariantArray::I64),
            8 => read_numeric!(u64, VariantArray::U64),
            9 => read_numeric!(f32, VariantArray::F32),
            10 => read_numeric!(f64, VariantArray::F64),
            11 => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    let len_bytes = bytes
                        .get(off..off + 8)
                        .ok_or_else(|| bad("truncated string length"))?;
                    let len = u64::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
                    off += 8;
                    let s_bytes = bytes
                        .get(off..off + len)
                        .ok_or_else(|| bad("truncated string payload"))?;
                    v.push(
                        String::from_utf8(s_bytes.to_vec())
                            .map_err(|_| bad("invalid utf-8 in string payload"))?,
                    );
                    off += len;
                }
                (VariantArray::Str(v), off)
            }
            12 => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    let (m, consumed) = Metadata::from_bytes(&bytes[off..])?;
                    v.push(m);
                    off += consumed;
                }
                (VariantArray::Meta(v), off)
            }
            other => return Err(bad(&format!("unknown type code {other}"))),
        };
        let _ = new_off;
        Ok((arr, off))
    }

    /// Comma-separated textual form; object elements (nested metadata) wrap in `{…}`.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            VariantArray::I8(v) => join_display(v),
            VariantArray::U8(v) => join_display(v),
            VariantArray::I16(v) => join_display(v),
            VariantArray::U16(v) => join_display(v),
            VariantArray::I32(v) => join_display(v),
            VariantArray::U32(v) => join_display(v),
            VariantArray::I64(v) => join_display(v),
            VariantArray::U64(v) => join_display(v),
            VariantArray::F32(v) => join_display(v),
            VariantArray::F64(v) => join_display(v),
            VariantArray::Str(v) => v.join(", "),
            VariantArray::Meta(v) => v
                .iter()
                .map(|m| format!("{{{}}}", m.to_text()))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

fn join_display<T: std::fmt::Display>(v: &[T]) -> String {
    v.iter()
        .map(std::string::ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// Typed constructors, one per element type, e.g. `VariantArray::new_f64(vec![1.0])`.
// Generated with `paste!` to build each method name from its element type rather than
// writing out the same ten-line boilerplate by hand.
macro_rules! ctor {
    ($ty:ty, $variant:ident) => {
        paste! {
            impl VariantArray {
                #[must_use]
                pub fn [<new_ $ty>](v: Vec<$ty>) -> VariantArray {
                    VariantArray::$variant(v)
                }
            }
        }
    };
}

ctor!(i8, I8);
ctor!(u8, U8);
ctor!(i16, I16);
ctor!(u16, U16);
ctor!(i32, I32);
ctor!(u32, U32);
ctor!(i64, I64);
ctor!(u64, U64);
ctor!(f32, F32);
ctor!(f64, F64);

impl VariantArray {
    #[must_use]
    pub fn new_string(v: Vec<String>) -> VariantArray {
        VariantArray::Str(v)
    }

    #[must_use]
    pub fn new_metadata(v: Vec<Metadata>) -> VariantArray {
        VariantArray::Meta(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_roundtrip_same_type() {
        // set(i,v); get(i,u) yields u == v for identical T.
        let mut a = VariantArray::new_f64(vec![0.0, 0.0, 0.0]);
        a.set(1, 42.5f64).unwrap();
        let u: f64 = a.get(1).unwrap();
        assert_eq!(u, 42.5);
    }

    #[test]
    fn narrowing_conversion_truncates() {
        let a = VariantArray::new_f64(vec![3.9, -3.9]);
        let lo: i32 = a.get(0).unwrap();
        let hi: i32 = a.get(1).unwrap();
        assert_eq!(lo, 3);
        assert_eq!(hi, -3);
    }

    #[test]
    fn out_of_range_get() {
        let a = VariantArray::new_i32(vec![1, 2]);
        let err = a.get::<i32>(5).unwrap_err();
        assert!(matches!(err, KernelError::OutOfRange { index: 5, size: 2 }));
    }

    #[test]
    fn bad_cast_numeric_vs_string() {
        let a = VariantArray::new_string(vec!["x".into()]);
        let err = a.get::<i32>(0).unwrap_err();
        assert!(matches!(err, KernelError::BadCast { .. }));
    }

    #[test]
    fn deep_clone_is_independent() {
        let a = VariantArray::new_i32(vec![1, 2, 3]);
        let mut b = a.deep_clone();
        assert!(a.equal(&b));
        b.set(0, 99i32).unwrap();
        assert!(!a.equal(&b));
    }

    #[test]
    fn binary_roundtrip() {
        let a = VariantArray::new_f64(vec![1.0, 2.0, 3.5]);
        let bytes = a.to_bytes();
        let (b, consumed) = VariantArray::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert!(a.equal(&b));
    }

    #[test]
    fn string_roundtrip() {
        let a = VariantArray::new_string(vec!["abc".into(), "".into(), "xyz".into()]);
        let bytes = a.to_bytes();
        let (b, _) = VariantArray::from_bytes(&bytes).unwrap();
        assert!(a.equal(&b));
    }

    #[test]
    fn zip_numeric_sums_with_conversion() {
        let a = VariantArray::new_f64(vec![1.0, 2.0]);
        let b = VariantArray::new_f32(vec![10.0, 20.0]);
        let out = a.zip_numeric::<f64, _>(&b, |x, y| x + y).unwrap();
        assert_eq!(out.type_code(), f64::CODE);
        let v0: f64 = out.get(0).unwrap();
        let v1: f64 = out.get(1).unwrap();
        assert_eq!(v0, 11.0);
        assert_eq!(v1, 22.0);
    }

    #[test]
    fn zip_numeric_preserves_i64_precision_beyond_f64_mantissa() {
        // 2^62 + 1 and 2^62 + 3 are both exactly representable in i64 but not as
        // distinct f64 values once added — pivoting through f64 would lose the low bits.
        let big = 1i64 << 62;
        let a = VariantArray::new_i64(vec![big + 1]);
        let b = VariantArray::new_i64(vec![big + 3]);
        let out = a.zip_numeric::<i64, _>(&b, |x, y| x + y).unwrap();
        assert_eq!(out.type_code(), i64::CODE);
        let v: i64 = out.get(0).unwrap();
        assert_eq!(v, 2 * big + 4);
    }

    #[test]
    fn zip_numeric_rejects_mismatched_pivot_type() {
        let a = VariantArray::new_i64(vec![1, 2]);
        let b = VariantArray::new_i64(vec![3, 4]);
        let err = a.zip_numeric::<f64, _>(&b, |x, y| x + y).unwrap_err();
        assert!(matches!(err, KernelError::BadCast { .. }));
    }
}
