//! Architecture model for the SoftHier tiled multi-cluster accelerator.
//!
//! This crate has **no dependencies** and performs no I/O. It is a pure
//! description of the hardware the planner maps transformer layers onto:
//! the cluster mesh, the per-cluster matrix engine, the scratchpad budget,
//! and the HBM channels attached to the four mesh edges.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`mesh`] | Cluster mesh extents, matrix-engine geometry, power-of-two helpers |
//! | [`hbm`] | HBM edges (west/north/east/south), edge base addresses and capacities, alignment |
//! | [`dtype`] | Element types and their byte widths |
//! | [`descriptor`] | [`ArchitectureDescriptor`] tying it all together, plus presets |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod descriptor;
pub mod dtype;
pub mod hbm;
pub mod mesh;

pub use descriptor::ArchitectureDescriptor;
pub use dtype::DType;
pub use hbm::{align_up, Edge, HbmLayout, HBM_NODE_ALIGN, SPACE_B_ALIGN};
pub use mesh::{ClusterMesh, ComputeEngine};
