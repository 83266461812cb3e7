//! Layer planner for the SoftHier tiled accelerator
//!
//! Turns one transformer layer (architecture + model + workload) into a
//! [`LayerPlan`]: a frozen pair of HBM address spaces and the ordered
//! kernel launches that read and write them.
//!
//! ```text
//! PlanConfig ──▶ build_layer ──▶ LayerBuilder ──▶ tiler::tile (per node)
//!                                     │
//!                                     ├── AddressSpace A / B (bump allocation)
//!                                     └── finish: reoffset → freeze → validate
//! ```
//!
//! # Example
//!
//! ```no_run
//! use softhier_plan::prelude::*;
//! use std::path::Path;
//!
//! # fn main() -> Result<()> {
//! let config = PlanConfig::from_file(Path::new("configs/tiny_moe_decode.toml"))?;
//! let arch = config.arch.clone().into_descriptor()?;
//! let plan = build_layer(&config.model, &config.workload, &arch)?;
//!
//! println!("{} kernels", plan.flow.len());
//! println!("{}", space_summary(&plan.space_b));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
mod error;
pub mod export;
pub mod flow;
pub mod kernel;
mod shape;
pub mod simplify;
pub mod space;
pub mod summary;
pub mod tiler;

pub use config::{ArchConfig, ModelConfig, PlanConfig, WorkloadConfig};
pub use error::{PlanError, Result};
pub use flow::{build_layer, expert_load, ExpertLoad, KernelFlow, KernelNode, LayerPlan, PortBinding};
pub use kernel::{Common, KernelConfig, KernelKind};
pub use shape::Shape;
pub use simplify::simplify;
pub use space::{AddressSpace, BufferId, Region, SpaceId, SpaceState};
pub use summary::{space_summary, SpaceSummary};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        build_layer, simplify, space_summary, KernelConfig, KernelFlow, KernelKind, LayerPlan, PlanConfig,
        PlanError, Result, SpaceId,
    };
}
