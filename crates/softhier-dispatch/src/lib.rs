//! Dispatch of frozen SoftHier layer plans.
//!
//! A [`Dispatcher`] walks a [`KernelFlow`](softhier_plan::KernelFlow) in
//! declaration order, resolves every port against the two frozen address
//! spaces and hands each launch to a [`ComputeBackend`].
//!
//! # Backends
//!
//! ```text
//! RooflineBackend   analytical max(compute, HBM) estimate, stateless
//! TraceBackend      JSON-lines launch trace, stateful (skipped on dry runs)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use softhier_dispatch::prelude::*;
//! use softhier_plan::{build_layer, PlanConfig};
//! use std::path::Path;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let config = PlanConfig::from_file(Path::new("configs/tiny_moe_decode.toml"))?;
//! let arch = config.arch.clone().into_descriptor()?;
//! let plan = build_layer(&config.model, &config.workload, &arch)?;
//!
//! let mut backend = select_backend(BackendSelection::Auto, &arch, None)?;
//! let mut dispatcher = Dispatcher::new(&arch);
//! let results = dispatcher.run_plan(&plan, backend.as_mut(), false)?;
//! println!("{:.1} µs", results.runtime_ns() / 1000.0);
//! println!("{}", flop_breakdown(results));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod backend;
pub mod backends;
mod dispatch;
mod error;
pub mod report;

pub use backend::{select_backend, BackendSelection, BackendType, Binding, ComputeBackend, KernelReport};
pub use backends::{RooflineBackend, TraceBackend};
pub use dispatch::{DispatchResults, Dispatcher, NodeResult};
pub use error::{DispatchError, Result};
pub use report::{flop_breakdown, FlopBreakdown};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        flop_breakdown, select_backend, BackendSelection, ComputeBackend, DispatchError, DispatchResults,
        Dispatcher, KernelReport, Result,
    };
}
