//! Cluster mesh and matrix-engine geometry.
//!
//! Every cluster carries one matrix engine (RedMulE) of `height × width`
//! processing elements. The engine streams operands in lines of
//! `4 × height` elements, which is the natural tile length for any tiled
//! kernel dimension.
//!
//! ```text
//!          x (columns) ──►
//!        ┌────┬────┬────┬────┐
//!   y    │ 0,0│ 1,0│ 2,0│ 3,0│   north edge above, south edge below,
//!   │    ├────┼────┼────┼────┤   west edge left, east edge right
//!   ▼    │ 0,1│ 1,1│ 2,1│ 3,1│
//!        └────┴────┴────┴────┘
//! ```

/// 2D grid of compute clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterMesh {
    /// Clusters along X.
    pub x: u32,
    /// Clusters along Y.
    pub y: u32,
}

impl ClusterMesh {
    /// Create a mesh of `x × y` clusters.
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Total number of clusters.
    #[must_use]
    pub const fn area(&self) -> u32 {
        self.x * self.y
    }

    /// Largest power-of-two scale that fits along X.
    #[must_use]
    pub const fn max_scale_x(&self) -> u32 {
        floor_pow2(self.x)
    }

    /// Largest power-of-two scale that fits along Y.
    #[must_use]
    pub const fn max_scale_y(&self) -> u32 {
        floor_pow2(self.y)
    }
}

impl std::fmt::Display for ClusterMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{}", self.x, self.y)
    }
}

/// Per-cluster matrix engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeEngine {
    /// Processing-element rows.
    pub height: u32,
    /// Processing-element columns.
    pub width: u32,
    /// Pipeline stages per processing element.
    pub pipeline_depth: u32,
}

impl ComputeEngine {
    /// Elements per operand line streamed into the engine (`4 × height`).
    #[must_use]
    pub const fn hardware_line(&self) -> u64 {
        4 * self.height as u64
    }

    /// Peak multiply-accumulate throughput, counted as 2 FLOP per MAC.
    #[must_use]
    pub const fn peak_flop_per_cycle(&self) -> u64 {
        2 * self.height as u64 * self.width as u64
    }
}

/// Largest power of two `≤ n` (0 for 0).
#[must_use]
pub const fn floor_pow2(n: u32) -> u32 {
    if n == 0 {
        0
    } else {
        1 << (31 - n.leading_zeros())
    }
}

/// Whether `n` is a (non-zero) power of two.
#[must_use]
pub const fn is_pow2(n: u64) -> bool {
    n.is_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_area_and_scales() {
        let mesh = ClusterMesh::new(8, 8);
        assert_eq!(mesh.area(), 64);
        assert_eq!(mesh.max_scale_x(), 8);

        // Non power-of-two meshes clamp down
        let odd = ClusterMesh::new(5, 12);
        assert_eq!(odd.max_scale_x(), 4);
        assert_eq!(odd.max_scale_y(), 8);
        assert_eq!(odd.to_string(), "5×12");
    }

    #[test]
    fn engine_line_and_peak() {
        let ce = ComputeEngine { height: 64, width: 16, pipeline_depth: 3 };
        assert_eq!(ce.hardware_line(), 256);
        assert_eq!(ce.peak_flop_per_cycle(), 2048);
    }

    #[test]
    fn pow2_helpers() {
        assert_eq!(floor_pow2(0), 0);
        assert_eq!(floor_pow2(1), 1);
        assert_eq!(floor_pow2(31), 16);
        assert_eq!(floor_pow2(32), 32);
        assert!(is_pow2(64));
        assert!(!is_pow2(3));
        assert!(!is_pow2(0));
    }
}
