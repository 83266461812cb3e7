//! Complete hardware description consumed by the planner.

use crate::hbm::HbmLayout;
use crate::mesh::{ClusterMesh, ComputeEngine};

/// Immutable hardware facts for one planning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchitectureDescriptor {
    /// Cluster grid.
    pub mesh: ClusterMesh,
    /// Matrix engine in every cluster.
    pub engine: ComputeEngine,
    /// Per-cluster scratchpad (TCDM) capacity in bytes.
    pub scratchpad_capacity: u64,
    /// HBM attachment.
    pub hbm: HbmLayout,
    /// Core clock in MHz.
    pub frequency_mhz: u32,
}

impl ArchitectureDescriptor {
    /// 32×32 mesh with all HBM channels on the south edge.
    pub const SOFTHIER_32X32: Self = Self {
        mesh: ClusterMesh::new(32, 32),
        engine: ComputeEngine { height: 32, width: 16, pipeline_depth: 1 },
        scratchpad_capacity: 0x6_0000,
        hbm: HbmLayout {
            base: 0xC000_0000,
            node_capacity: 0xC000_0000,
            channels: [0, 0, 0, 64],
            channel_bandwidth: 64,
        },
        frequency_mhz: 965,
    };

    /// 8×8 mesh with HBM on the west and south edges.
    pub const SOFTHIER_8X8_DUAL: Self = Self {
        mesh: ClusterMesh::new(8, 8),
        engine: ComputeEngine { height: 64, width: 16, pipeline_depth: 3 },
        scratchpad_capacity: 0x18_0000,
        hbm: HbmLayout {
            base: 0xC000_0000,
            node_capacity: 0x4000_0000,
            channels: [8, 0, 0, 8],
            channel_bandwidth: 64,
        },
        frequency_mhz: 1000,
    };

    /// Total clusters.
    #[must_use]
    pub const fn mesh_area(&self) -> u64 {
        self.mesh.area() as u64
    }

    /// Elements per engine line (`4 × engine height`).
    #[must_use]
    pub const fn hardware_line(&self) -> u64 {
        self.engine.hardware_line()
    }

    /// Peak FLOP per cycle across the whole mesh.
    #[must_use]
    pub const fn peak_flop_per_cycle(&self) -> u64 {
        self.mesh_area() * self.engine.peak_flop_per_cycle()
    }

    /// Convert a cycle count to nanoseconds at the core clock.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cycles_to_ns(&self, cycles: u64) -> f64 {
        cycles as f64 * 1000.0 / f64::from(self.frequency_mhz)
    }
}

impl std::fmt::Display for ArchitectureDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SoftHier {} mesh, CE {}×{}×{}, TCDM {} KiB, HBM {:?} @ {:#x}",
            self.mesh,
            self.engine.height,
            self.engine.width,
            self.engine.pipeline_depth,
            self.scratchpad_capacity / 1024,
            self.hbm.channels,
            self.hbm.base,
        )
    }
}
