//! Roofline estimator
//!
//! Runtime is the slower of two bounds:
//!
//! ```text
//! compute = flop  / (active clusters × per-cluster rate)
//! memory  = bytes / HBM bytes per cycle        (all active edges)
//! ```
//!
//! Matrix kernels (GEMM, output down projection, flat attention) run on the
//! engines of the clusters their tiling occupies. Everything else is
//! element-wise work spread over the whole mesh at [`VECTOR_FLOP_PER_CYCLE`].
//! Bytes are the sizes of every bound region, reads and writes alike.

use crate::backend::{BackendType, Binding, ComputeBackend, KernelReport};
use crate::error::Result;
use softhier_arch::ArchitectureDescriptor;
use softhier_plan::kernel::AttentionTiling;
use softhier_plan::{KernelConfig, KernelKind};
use tracing::debug;

/// Element-wise FLOP per cycle of one cluster's vector cores
pub const VECTOR_FLOP_PER_CYCLE: u64 = 16;

/// Floating-point operations of one launch
#[must_use]
pub fn flop(config: &KernelConfig) -> u64 {
    match config {
        KernelConfig::Gemm(c) | KernelConfig::OutputDownProj(c) => c.flop(),
        // QKᵀ and PV, 2 FLOP per MAC each
        KernelConfig::FlatAttention(c) => {
            4 * c.batch * c.num_heads * c.q_seq * c.speculative * c.kv_seq * c.head_dim
        }
        // QKᵀ spans nope + rope, PV only nope
        KernelConfig::FlatMla(c) => {
            2 * c.batch * c.num_heads * c.q_seq * c.speculative * c.kv_seq * (2 * c.nope_dim + c.rope_dim)
        }
        // square, sum, scale
        KernelConfig::Norm(c) => 3 * c.m * c.n,
        // two multiplies and one add per element
        KernelConfig::Rope(c) => 3 * c.m * c.n,
        KernelConfig::Activation(c) => c.m * c.n * (4 + u64::from(c.gate) + u64::from(c.bias)),
        KernelConfig::Add(c) => c.m * c.n,
        KernelConfig::MoeGate(c) => c.tokens * c.routed * 2,
        KernelConfig::MoeCombine(c) => 2 * c.tokens * c.active * c.embedded_length,
        KernelConfig::SplitConcat(_) | KernelConfig::MoeDispatch(_) => 0,
    }
}

fn attention_clusters(tiling: &AttentionTiling, batch: u64, area: u64) -> u64 {
    let group = tiling.scale_x * tiling.scale_y;
    if group == 0 {
        return 1;
    }
    let replicas = if tiling.flatten_async { area / group } else { batch.min(area / group) };
    group * replicas.max(1)
}

/// Clusters whose engines a matrix kernel keeps busy
fn active_clusters(config: &KernelConfig, area: u64) -> u64 {
    let clusters = match config {
        KernelConfig::Gemm(c) | KernelConfig::OutputDownProj(c) => c.scale_x * c.scale_y * c.group_number,
        KernelConfig::FlatAttention(c) => attention_clusters(&c.tiling, c.batch, area),
        KernelConfig::FlatMla(c) => attention_clusters(&c.tiling, c.batch, area),
        _ => area,
    };
    clusters.clamp(1, area)
}

const fn is_matrix(kind: KernelKind) -> bool {
    matches!(
        kind,
        KernelKind::Gemm | KernelKind::OutputDownProj | KernelKind::FlatAttention | KernelKind::FlatMla
    )
}

/// Stateless analytical backend
#[derive(Debug, Clone)]
pub struct RooflineBackend {
    arch: ArchitectureDescriptor,
}

impl RooflineBackend {
    /// Estimator for `arch`
    #[must_use]
    pub const fn new(arch: ArchitectureDescriptor) -> Self {
        Self { arch }
    }

    /// Estimate one launch moving `bytes`
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn estimate(&self, config: &KernelConfig, bytes: u64) -> KernelReport {
        let area = self.arch.mesh_area();
        let flop = flop(config);
        let rate = if is_matrix(config.kind()) {
            active_clusters(config, area) * self.arch.engine.peak_flop_per_cycle()
        } else {
            area * VECTOR_FLOP_PER_CYCLE
        };
        let compute_cycles = flop.div_ceil(rate.max(1));
        let memory_cycles = bytes.div_ceil(self.arch.hbm.bandwidth().max(1));
        let cycles = compute_cycles.max(memory_cycles).max(1);

        let peak = self.arch.peak_flop_per_cycle() as f64;
        let achieved = flop as f64 / cycles as f64;
        KernelReport {
            runtime_ns: self.arch.cycles_to_ns(cycles),
            cycles,
            utilization: achieved / peak,
            arithmetic_intensity: if bytes == 0 { 0.0 } else { flop as f64 / bytes as f64 },
            flop,
            bytes,
            achieved_flop_per_cycle: achieved,
        }
    }
}

/// HBM bytes touched by a launch
pub(crate) fn bound_bytes(bindings: &[Binding<'_>]) -> u64 {
    bindings.iter().map(|b| b.region.size).sum()
}

impl ComputeBackend for RooflineBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Roofline
    }

    fn supports(&self, _kind: KernelKind) -> bool {
        true
    }

    fn is_stateful(&self) -> bool {
        false
    }

    fn invoke(
        &mut self,
        node: &str,
        config: &KernelConfig,
        bindings: &[Binding<'_>],
        _dry_run: bool,
    ) -> Result<KernelReport> {
        let report = self.estimate(config, bound_bytes(bindings));
        debug!(
            "{node}: {} FLOP, {} bytes, {} cycles ({:.1}% of peak)",
            report.flop,
            report.bytes,
            report.cycles,
            report.utilization * 100.0
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use softhier_arch::DType;
    use softhier_plan::kernel::{AddConfig, Common, GemmConfig};
    use softhier_plan::tiler;

    const FP16: Common = Common { dtype: DType::Fp16, numerical_check: false };

    #[test]
    fn test_gemm_is_compute_bound() {
        let arch = ArchitectureDescriptor::SOFTHIER_8X8_DUAL;
        let gemm = GemmConfig::builder(1024, 1024, 1024).build().unwrap();
        let tiled = KernelConfig::Gemm(tiler::tile_gemm(&gemm, &FP16, &arch).unwrap());
        let backend = RooflineBackend::new(arch);

        let report = backend.estimate(&tiled, 3 * 1024 * 1024 * 2);
        assert_eq!(report.flop, 2 * 1024 * 1024 * 1024);
        // 4×4 output tiles × 4 split-K groups: the whole mesh
        let compute = report.flop / arch.peak_flop_per_cycle();
        assert_eq!(report.cycles, compute);
        assert!((report.utilization - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_add_is_memory_bound() {
        let arch = ArchitectureDescriptor::SOFTHIER_8X8_DUAL;
        let add = KernelConfig::Add(AddConfig::new(64, 1024).unwrap());
        let bytes = 3 * 64 * 1024 * 2;
        let report = RooflineBackend::new(arch).estimate(&add, bytes);
        assert_eq!(report.cycles, bytes.div_ceil(arch.hbm.bandwidth()));
        assert!(report.arithmetic_intensity < 1.0);
    }

    #[test]
    fn test_zero_work_takes_one_cycle() {
        let arch = ArchitectureDescriptor::SOFTHIER_8X8_DUAL;
        let add = KernelConfig::Add(AddConfig::new(1, 1).unwrap());
        let report = RooflineBackend::new(arch).estimate(&add, 0);
        assert_eq!(report.cycles, 1);
        assert!(report.arithmetic_intensity.abs() < f64::EPSILON);
    }
}
