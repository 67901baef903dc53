//! The kernel's closed error taxonomy.
//!
//! Every fallible operation in the pipeline kernel returns [`KernelError`] (or a
//! [`KernelResult`]). Collaborators and example binaries that sit at the edge of the
//! kernel may still prefer `anyhow::Result`; `KernelError` implements `std::error::Error`
//! so it converts into `anyhow::Error` via `?` without any extra glue.

use thiserror::Error;

/// Result alias used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

/// The six error kinds named in the propagation policy: `KeyMissing` is recoverable by
/// callers; every other variant aborts the current `execute` chain when it escapes a node.
#[derive(Error, Debug, Clone)]
pub enum KernelError {
    /// A variant array operation was attempted against an incompatible element type.
    #[error("bad cast: cannot treat a {from} array as {to}")]
    BadCast {
        /// Name of the stored element type.
        from: &'static str,
        /// Name of the type the caller asked for.
        to: &'static str,
    },

    /// A metadata lookup found no entry for the requested key. Recoverable: callers may
    /// substitute a default instead of propagating this upward.
    #[error("metadata key missing: {key}")]
    KeyMissing {
        /// The key that was not found.
        key: String,
    },

    /// An indexed access or extent fell outside the bounds of the array/dataset.
    #[error("index out of range: {index} >= {size}")]
    OutOfRange {
        /// The offending index.
        index: u64,
        /// The size the index was checked against.
        size: u64,
    },

    /// A reader/writer collaborator failed to produce or consume data.
    #[error("io failure in step {step:?}: {reason}")]
    IoFailure {
        /// The time step being read/written when the failure occurred, if known.
        step: Option<u64>,
        /// Human-readable diagnostic.
        reason: String,
    },

    /// An upstream node produced a dataset that does not satisfy the shape the caller
    /// required (missing coordinates, mismatched extent, duplicate array names, ...).
    #[error("protocol failure: {reason}")]
    ProtocolFailure {
        /// Human-readable diagnostic.
        reason: String,
    },

    /// The user-supplied reducer returned an empty result or combined two incompatible
    /// datasets (mismatched extent, array names, or element types).
    #[error("reducer failed at step {step}: {reason}")]
    ReducerFailure {
        /// The step being folded in when the reducer failed.
        step: u64,
        /// Human-readable diagnostic.
        reason: String,
    },
}

impl KernelError {
    /// True for the one recoverable error kind; callers may choose to substitute a
    /// default instead of propagating this further.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, KernelError::KeyMissing { .. })
    }

    /// The time step associated with this failure, if any. Used to build the
    /// "diagnostic mentions step N" guarantee required of map-reduce failures (S5).
    #[must_use]
    pub fn step(&self) -> Option<u64> {
        match self {
            KernelError::IoFailure { step, .. } => *step,
            KernelError::ReducerFailure { step, .. } => Some(*step),
            _ => None,
        }
    }
}
