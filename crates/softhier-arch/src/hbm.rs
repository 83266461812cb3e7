//! HBM edge layout.
//!
//! HBM nodes sit along the four edges of the cluster mesh. Each node owns a
//! contiguous window of `node_capacity` bytes; the edges are laid out back to
//! back starting at `base`, in the order west, north, east, south:
//!
//! ```text
//! Edge   Nodes  Start address
//! ────── ────── ─────────────────────────────
//! west   ny     base
//! north  nx     base + s·ny
//! east   ny     base + s·ny + s·nx
//! south  nx     base + 2·s·ny + s·nx          (s = node capacity)
//! ```
//!
//! An edge is *active* when at least one HBM channel is attached to it.

use crate::mesh::ClusterMesh;

/// Granule of one HBM node window; buffers that start a new stage align to it.
pub const HBM_NODE_ALIGN: u64 = 0x1_0000;

/// Alignment of space B when both spaces share a single edge.
pub const SPACE_B_ALIGN: u64 = 0x10_0000;

/// Round `addr` up to the next multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) & !(align - 1)
}

/// Mesh edge carrying HBM channels, in placement order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    /// Left of column 0.
    West = 0,
    /// Above row 0.
    North = 1,
    /// Right of the last column.
    East = 2,
    /// Below the last row.
    South = 3,
}

impl Edge {
    /// All edges in placement order.
    pub const ALL: [Self; 4] = [Self::West, Self::North, Self::East, Self::South];

    /// Number of HBM nodes along this edge.
    #[must_use]
    pub const fn node_count(&self, mesh: &ClusterMesh) -> u64 {
        match self {
            Self::West | Self::East => mesh.y as u64,
            Self::North | Self::South => mesh.x as u64,
        }
    }
}

impl std::fmt::Display for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::West => write!(f, "west"),
            Self::North => write!(f, "north"),
            Self::East => write!(f, "east"),
            Self::South => write!(f, "south"),
        }
    }
}

/// HBM attachment of the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HbmLayout {
    /// Address of the first west-edge node.
    pub base: u64,
    /// Bytes addressable per HBM node.
    pub node_capacity: u64,
    /// Channels per edge, indexed west/north/east/south.
    pub channels: [u32; 4],
    /// Sustained bytes per cycle of one channel.
    pub channel_bandwidth: u64,
}

impl HbmLayout {
    /// Channels attached to `edge`.
    #[must_use]
    pub const fn channels_on(&self, edge: Edge) -> u32 {
        self.channels[edge as usize]
    }

    /// Active edges in placement order.
    #[must_use]
    pub fn active_edges(&self) -> Vec<Edge> {
        Edge::ALL
            .into_iter()
            .filter(|e| self.channels_on(*e) > 0)
            .collect()
    }

    /// Total channel count across all edges.
    #[must_use]
    pub fn total_channels(&self) -> u64 {
        self.channels.iter().map(|&c| u64::from(c)).sum()
    }

    /// First address of `edge`.
    #[must_use]
    pub const fn edge_base(&self, edge: Edge, mesh: &ClusterMesh) -> u64 {
        let s = self.node_capacity;
        let (nx, ny) = (mesh.x as u64, mesh.y as u64);
        match edge {
            Edge::West => self.base,
            Edge::North => self.base + s * ny,
            Edge::East => self.base + s * ny + s * nx,
            Edge::South => self.base + 2 * s * ny + s * nx,
        }
    }

    /// Bytes addressable along `edge`.
    #[must_use]
    pub const fn edge_capacity(&self, edge: Edge, mesh: &ClusterMesh) -> u64 {
        self.node_capacity * edge.node_count(mesh)
    }

    /// Aggregate sustained bandwidth in bytes per cycle.
    #[must_use]
    pub fn bandwidth(&self) -> u64 {
        self.total_channels() * self.channel_bandwidth
    }
}
