//! Compute backend abstraction
//!
//! A backend receives one kernel launch at a time: the node name, its tiled
//! configuration and every port resolved to an absolute HBM region. It
//! answers with a [`KernelReport`].

use crate::error::{DispatchError, Result};
use serde::Serialize;
use softhier_arch::ArchitectureDescriptor;
use softhier_plan::space::Region;
use softhier_plan::{KernelConfig, KernelKind, SpaceId};
use std::fmt::Debug;
use std::path::Path;

/// One port of a launch, resolved against its address space
#[derive(Debug, Clone, Copy)]
pub struct Binding<'a> {
    /// Port name
    pub port: &'a str,
    /// Whether the kernel writes this port
    pub output: bool,
    /// Space holding the buffer
    pub space: SpaceId,
    /// Buffer or alias location
    pub region: Region<'a>,
}

/// Performance of one kernel launch
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KernelReport {
    /// Wall time at the core clock
    pub runtime_ns: f64,
    /// Core cycles
    pub cycles: u64,
    /// Achieved fraction of mesh peak
    pub utilization: f64,
    /// FLOP per HBM byte
    pub arithmetic_intensity: f64,
    /// Floating-point operations
    pub flop: u64,
    /// HBM bytes moved
    pub bytes: u64,
    /// FLOP retired per cycle
    pub achieved_flop_per_cycle: f64,
}

impl KernelReport {
    /// Report for `repeat` back-to-back launches of the same kernel
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn repeated(&self, repeat: u64) -> Self {
        Self {
            runtime_ns: self.runtime_ns * repeat as f64,
            cycles: self.cycles * repeat,
            flop: self.flop * repeat,
            bytes: self.bytes * repeat,
            ..*self
        }
    }
}

/// Compute backend trait
pub trait ComputeBackend: Debug {
    /// Backend type for logging and errors
    fn backend_type(&self) -> BackendType;

    /// Whether this backend can run `kind`
    fn supports(&self, kind: KernelKind) -> bool;

    /// Whether launches change backend state (files, simulators)
    ///
    /// Stateful backends are never invoked during a dry run.
    fn is_stateful(&self) -> bool;

    /// Run (or estimate) one launch
    ///
    /// # Errors
    ///
    /// Returns a backend error if the launch fails.
    fn invoke(
        &mut self,
        node: &str,
        config: &KernelConfig,
        bindings: &[Binding<'_>],
        dry_run: bool,
    ) -> Result<KernelReport>;

    /// Push buffered output to its destination
    ///
    /// # Errors
    ///
    /// Returns an I/O error if flushing fails.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Analytical roofline estimate
    Roofline,

    /// Launch trace for an external simulator harness
    Trace,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Roofline => write!(f, "Roofline"),
            Self::Trace => write!(f, "Trace"),
        }
    }
}

/// Backend selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSelection {
    /// Trace when a trace path is given, roofline otherwise
    Auto,

    /// Force the roofline estimator
    Roofline,

    /// Force the launch trace
    Trace,
}

/// Select a backend for `arch`
///
/// # Errors
///
/// Returns a backend error if a trace is requested without a path, or an
/// I/O error if the trace file cannot be created.
pub fn select_backend(
    selection: BackendSelection,
    arch: &ArchitectureDescriptor,
    trace: Option<&Path>,
) -> Result<Box<dyn ComputeBackend>> {
    use crate::backends::{RooflineBackend, TraceBackend};

    match (selection, trace) {
        (BackendSelection::Auto | BackendSelection::Trace, Some(path)) => {
            tracing::info!("Using trace backend, writing {}", path.display());
            Ok(Box::new(TraceBackend::create(path, arch)?))
        }
        (BackendSelection::Trace, None) => Err(DispatchError::backend("trace backend needs an output path")),
        (BackendSelection::Auto, None) | (BackendSelection::Roofline, _) => {
            tracing::info!("Using roofline backend");
            Ok(Box::new(RooflineBackend::new(*arch)))
        }
    }
}
