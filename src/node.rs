//! Pipeline stage contract (C3).
//!
//! An [`AlgorithmNode`] is the unit of composition in the kernel: a fixed number of
//! input/output ports, a set of named properties, and the two-phase `report`/`execute`
//! pair the executor (`crate::pipeline`) drives.
//!
//! Every method takes `&self`, not `&mut self` — a node is re-executed per distinct
//! upstream request and must not retain per-request state. Where a node genuinely
//! needs runtime-configurable properties (e.g.
//! [`crate::mapreduce::MapReduceNode`]'s `first_step`/`last_step`/`thread_pool_size`),
//! it holds them behind its own interior mutability rather than the trait forcing
//! `&mut self` through a shared, possibly-concurrently-executing graph.

use crate::dataset::Dataset;
use crate::error::{KernelError, KernelResult};
use crate::metadata::Metadata;
use std::any::Any;

/// A scalar property value settable on a node, the shape a `boost::program_options`-
/// style property sink would bind to.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl PropertyValue {
    pub fn as_int(&self) -> KernelResult<i64> {
        match self {
            PropertyValue::Int(v) => Ok(*v),
            _ => Err(KernelError::BadCast {
                from: self.kind_name(),
                to: "int",
            }),
        }
    }

    pub fn as_float(&self) -> KernelResult<f64> {
        match self {
            PropertyValue::Float(v) => Ok(*v),
            PropertyValue::Int(v) => Ok(*v as f64),
            _ => Err(KernelError::BadCast {
                from: self.kind_name(),
                to: "float",
            }),
        }
    }

    pub fn as_str(&self) -> KernelResult<&str> {
        match self {
            PropertyValue::Str(v) => Ok(v.as_str()),
            _ => Err(KernelError::BadCast {
                from: self.kind_name(),
                to: "string",
            }),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            PropertyValue::Int(_) => "int",
            PropertyValue::Float(_) => "float",
            PropertyValue::Str(_) => "string",
            PropertyValue::Bool(_) => "bool",
        }
    }
}

/// The kind of a property, used by [`PropertyDescriptor`] to describe a node's
/// configuration surface to a generic config sink (a CLI option parser, a JSON
/// config loader, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyKind {
    Int,
    Float,
    Str,
    Bool,
}

/// One entry in a node's property description, the generic config-sink contract a
/// CLI layer would bind to.
#[derive(Clone, Debug)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: PropertyKind,
    pub default: PropertyValue,
    pub help: String,
}

impl PropertyDescriptor {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: PropertyKind,
        default: PropertyValue,
        help: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            default,
            help: help.into(),
        }
    }
}

/// A pipeline stage: declares ports and properties, implements the `report`/`execute`
/// pair the executor drives.
pub trait AlgorithmNode: Send + Sync {
    /// Stage name, used in diagnostics and debug dumps.
    fn name(&self) -> &str;

    /// Number of input ports. Zero for source stages (e.g. a reader).
    fn input_ports(&self) -> u32 {
        1
    }

    /// Number of output ports. Almost always one.
    fn output_ports(&self) -> u32 {
        1
    }

    /// Produce this node's output report for `port`, given the report of the single
    /// producer connected to that port (`Metadata::new()` if the port has no
    /// connection). Each input port accepts at most one producer — see §4.3's
    /// single-producer-per-port resolution. The default is identity: forward the
    /// upstream report unchanged.
    fn report(&self, _port: u32, upstream_report: &Metadata) -> KernelResult<Metadata> {
        Ok(upstream_report.clone())
    }

    /// Translate a downstream request for `port` into the list of requests to send to
    /// the single producer connected to that port (default: pass the request straight
    /// through, once). [`crate::mapreduce::MapReduceNode`] overrides this to explode a
    /// step range into per-step, MPI-rank-partitioned requests.
    fn get_upstream_request(
        &self,
        _port: u32,
        _upstream_report: &Metadata,
        request: &Metadata,
    ) -> KernelResult<Vec<Metadata>> {
        if self.input_ports() == 0 {
            Ok(Vec::new())
        } else {
            Ok(vec![request.clone()])
        }
    }

    /// Thread-pool size the executor should use while fetching this node's upstream
    /// requests concurrently. `None` (the default) means fetch sequentially — correct
    /// for the common case where `get_upstream_request` returns at most one request.
    /// [`crate::mapreduce::MapReduceNode`] overrides this with its configured
    /// `thread_pool_size` property.
    fn upstream_pool_size(&self) -> Option<usize> {
        None
    }

    /// Compute this node's dataset for `port`, given the datasets the executor
    /// collected for each request `get_upstream_request` produced (same order).
    fn execute(&self, port: u32, upstream_datasets: &[Dataset], request: &Metadata) -> KernelResult<Dataset>;

    /// Properties this node exposes to a generic config sink.
    fn describe_properties(&self) -> Vec<PropertyDescriptor> {
        Vec::new()
    }

    /// Set a named property. The default rejects every name; concrete nodes override
    /// this for the properties they declare in [`AlgorithmNode::describe_properties`].
    fn set_property(&self, name: &str, _value: PropertyValue) -> KernelResult<()> {
        Err(KernelError::KeyMissing {
            key: name.to_string(),
        })
    }

    /// Read back a named property's current value.
    fn get_property(&self, name: &str) -> KernelResult<PropertyValue> {
        Err(KernelError::KeyMissing {
            key: name.to_string(),
        })
    }

    /// Cast to `Any` for downcasting, the same escape hatch `crate::metrics::Metric`
    /// uses to let callers recover a concrete node type (e.g. a sink) out of a
    /// `Pipeline`'s type-erased graph.
    fn as_any(&self) -> &dyn Any
    where
        Self: 'static,
    {
        self
    }
}
