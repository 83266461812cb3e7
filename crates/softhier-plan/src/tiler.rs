//! Hardware-fit tiling
//!
//! Derives tile, scale and split parameters for every tiled kernel from the
//! [`ArchitectureDescriptor`] and the kernel's logical shape. All functions
//! are pure: they return a new config and never touch the input.
//!
//! ## Dimension fitting
//!
//! ```text
//! tile  = min(dim, 4·ce_height)          (attention: ≤ 32 when 4·ce_height ≤ 64)
//! scale = dim / tile                     (rounded up to a power of two,
//!                                         tile recomputed as dim / scale)
//! scale = min(scale, pow2 ≤ mesh extent) (passes = dim / (tile·scale))
//! ```
//!
//! GEMMs then spend the clusters left over (`mesh_area / (sx·sy)`) on a
//! split-K or split-N group fan-out, whichever keeps more clusters busy;
//! attention spends them on batch replication.

use crate::error::{PlanError, Result};
use crate::kernel::{
    AttentionTiling, Common, FlatAttentionConfig, FlatMlaConfig, GemmConfig, KernelConfig,
    MoeGateConfig, MoeTransferConfig, Strategy,
};
use softhier_arch::mesh::is_pow2;
use softhier_arch::ArchitectureDescriptor;
use tracing::{debug, warn};

/// Engine lines at or below this length cap attention tiles at [`SMALL_LINE_TILE`].
pub const SMALL_LINE_THRESHOLD: u64 = 64;

/// Attention tile used on engines whose line is at most [`SMALL_LINE_THRESHOLD`].
pub const SMALL_LINE_TILE: u64 = 32;

/// A split-K slice longer than this many engine lines is tiled by exactly one line.
pub const MAX_SPLIT_K_LINES: u64 = 4;

/// Result of fitting one logical dimension onto one mesh axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimFit {
    /// Per-cluster tile
    pub tile: u64,
    /// Clusters along the axis (power of two)
    pub scale: u64,
    /// Sequential passes when the mesh is narrower than the ideal scale
    pub passes: u64,
}

/// Natural tile length for a dimension on this engine: one line at most
#[must_use]
pub fn natural_tile(dim: u64, arch: &ArchitectureDescriptor) -> u64 {
    dim.min(arch.hardware_line())
}

/// Attention tile on this engine: the natural tile, capped at
/// [`SMALL_LINE_TILE`] on short-line engines
#[must_use]
pub fn attention_tile(dim: u64, arch: &ArchitectureDescriptor) -> u64 {
    let tile = natural_tile(dim, arch);
    if arch.hardware_line() <= SMALL_LINE_THRESHOLD {
        tile.min(SMALL_LINE_TILE)
    } else {
        tile
    }
}

/// Fit `dim` onto a mesh axis whose largest power-of-two scale is
/// `max_scale`, starting from its natural tile
///
/// # Errors
///
/// Returns a configuration error if the dimension is zero, is not a multiple
/// of its natural tile, or cannot be split into a power-of-two scale.
pub fn fit_dimension(label: &str, dim: u64, max_scale: u32, arch: &ArchitectureDescriptor) -> Result<DimFit> {
    fit_with_tile(label, dim, natural_tile(dim, arch), max_scale)
}

fn fit_with_tile(label: &str, dim: u64, tile: u64, max_scale: u32) -> Result<DimFit> {
    if dim == 0 {
        return Err(PlanError::configuration(format!("{label}: zero-length dimension")));
    }
    let mut tile = tile;
    if dim % tile != 0 {
        return Err(PlanError::configuration(format!(
            "{label}: dimension {dim} is not a multiple of tile {tile}"
        )));
    }

    let mut scale = dim / tile;
    if !is_pow2(scale) {
        let rounded = scale.next_power_of_two();
        if dim % rounded != 0 {
            return Err(PlanError::configuration(format!(
                "{label}: dimension {dim} cannot be split into {rounded} (next power of two above {scale})"
            )));
        }
        debug!("{label}: scale {scale} rounded to {rounded}, tile {tile} -> {}", dim / rounded);
        scale = rounded;
        tile = dim / scale;
    }

    let max_scale = u64::from(max_scale);
    if max_scale == 0 {
        return Err(PlanError::configuration(format!("{label}: empty mesh axis")));
    }
    if scale > max_scale {
        warn!("{label}: scale {scale} clamped to mesh extent {max_scale}");
        scale = max_scale;
    }

    Ok(DimFit {
        tile,
        scale,
        passes: dim / (tile * scale),
    })
}

/// Largest power-of-two split of `k` not exceeding `available_group`
///
/// Candidates `2, 4, 8, …` are probed in order and probing stops at the
/// first one that does not divide `k`.
#[must_use]
pub fn split_k_group(k: u64, available_group: u64) -> u64 {
    let mut group = 1;
    let mut candidate = 2;
    while candidate <= available_group {
        if k % candidate != 0 {
            break;
        }
        group = candidate;
        candidate *= 2;
    }
    group
}

/// Largest divisor of `value` not exceeding `limit`
#[must_use]
pub fn max_divisor(value: u64, limit: u64) -> u64 {
    (1..=limit.min(value)).rev().find(|d| value % d == 0).unwrap_or(1)
}

/// K tile for a split-K slice of `split_k` elements
///
/// Short slices are taken whole; slices of fewer than [`MAX_SPLIT_K_LINES`]
/// lines use their largest divisor within one line, but never less than
/// three quarters of a line; longer slices use exactly one line.
#[must_use]
pub fn split_k_tile(split_k: u64, line: u64) -> u64 {
    if split_k <= line {
        split_k
    } else if split_k / line < MAX_SPLIT_K_LINES {
        max_divisor(split_k, line).max(line * 3 / 4)
    } else {
        line
    }
}

fn fit_gemm_axes(cfg: &GemmConfig, arch: &ArchitectureDescriptor) -> Result<(DimFit, DimFit)> {
    let fy = fit_dimension("gemm.m", cfg.m, arch.mesh.max_scale_y(), arch)?;
    let fx = fit_dimension("gemm.n", cfg.n, arch.mesh.max_scale_x(), arch)?;
    Ok((fy, fx))
}

fn apply_axes(cfg: &mut GemmConfig, fy: DimFit, fx: DimFit) {
    cfg.m_tile = fy.tile;
    cfg.scale_y = fy.scale;
    cfg.passes_y = fy.passes;
    cfg.n_tile = fx.tile;
    cfg.scale_x = fx.scale;
    cfg.passes_x = fx.passes;
}

fn check_reshape_alignment(cfg: &GemmConfig) -> Result<()> {
    let checks = [
        ("X", cfg.reshape.x_from_m, cfg.k, cfg.k_tile),
        ("Z", cfg.reshape.z_to_m, cfg.n, cfg.n_tile),
    ];
    for (operand, rows, cols, col_tile) in checks {
        let Some(rows) = rows else { continue };
        let reshaped_cols = cfg.m * cols / rows;
        if rows < cfg.m_tile || rows % cfg.m_tile != 0 {
            return Err(PlanError::configuration(format!(
                "gemm: {operand} reshape to {rows} rows crosses M tile {}",
                cfg.m_tile
            )));
        }
        if reshaped_cols < col_tile || reshaped_cols % col_tile != 0 {
            return Err(PlanError::configuration(format!(
                "gemm: {operand} reshape to {reshaped_cols} columns crosses tile {col_tile}"
            )));
        }
    }
    Ok(())
}

/// Primary GEMM tiling (split-K when the spare clusters allow it)
///
/// # Errors
///
/// Returns a configuration error if M/N cannot be fitted, the K tile does
/// not divide K, or a fused reshape crosses tile boundaries.
pub fn tile_gemm(cfg: &GemmConfig, common: &Common, arch: &ArchitectureDescriptor) -> Result<GemmConfig> {
    let (fy, fx) = fit_gemm_axes(cfg, arch)?;
    let mut out = cfg.clone();
    apply_axes(&mut out, fy, fx);

    let elem = common.dtype.size();
    let line = arch.hardware_line();
    let available_group = arch.mesh_area() / (fy.scale * fx.scale);
    let group = split_k_group(cfg.k, available_group);

    if group > 1 {
        let split_k = cfg.k / group;
        out.k_tile = split_k_tile(split_k, line);
        if cfg.k % out.k_tile != 0 {
            return Err(PlanError::configuration(format!(
                "gemm: K {} is not a multiple of split-K tile {}",
                cfg.k, out.k_tile
            )));
        }
        out.strategy = Strategy::SplitK;
        out.group_number = group;
        out.group_reduce = true;
        out.group_splitk = 1;
        out.gap_x = split_k * elem;
        out.gap_w = split_k * cfg.n * elem;
        out.gap_z = 0;
    } else {
        out.k_tile = cfg.k.min(line);
        out.strategy = Strategy::NoSplit;
    }
    check_reshape_alignment(&out)?;

    debug!(
        "gemm {}x{}x{}: tile {}x{}x{}, scale {}x{}, {:?} x{}",
        cfg.m, cfg.n, cfg.k, out.m_tile, out.n_tile, out.k_tile, out.scale_y, out.scale_x,
        out.strategy, out.group_number
    );
    Ok(out)
}

/// All GEMM tilings worth evaluating, primary first
///
/// The split-N alternative is offered when spare clusters exist and N
/// spans more than one flatten group.
///
/// # Errors
///
/// Propagates errors from [`tile_gemm`].
pub fn gemm_candidates(cfg: &GemmConfig, common: &Common, arch: &ArchitectureDescriptor) -> Result<Vec<GemmConfig>> {
    let primary = tile_gemm(cfg, common, arch)?;
    let available_group = arch.mesh_area() / (primary.scale_y * primary.scale_x);
    let n_groups = cfg.n / (primary.scale_x * primary.n_tile);

    let mut candidates = vec![primary.clone()];
    if available_group > 1 && n_groups > 1 {
        let elem = common.dtype.size();
        let mut split_n = primary;
        split_n.k_tile = cfg.k.min(arch.hardware_line());
        split_n.strategy = Strategy::SplitN;
        split_n.group_number = available_group.min(n_groups);
        split_n.group_reduce = false;
        split_n.group_splitk = 0;
        split_n.gap_x = 0;
        split_n.gap_w = split_n.scale_x * split_n.n_tile * elem;
        split_n.gap_z = split_n.gap_w;
        candidates.push(split_n);
    }
    Ok(candidates)
}

/// Clusters a GEMM tiling keeps busy
#[must_use]
pub const fn active_clusters(cfg: &GemmConfig) -> u64 {
    cfg.scale_x * cfg.scale_y * cfg.group_number
}

/// GEMM tiling used for launch: the candidate keeping the most clusters
/// busy, the primary on ties
///
/// # Errors
///
/// Propagates errors from [`gemm_candidates`].
pub fn select_gemm(cfg: &GemmConfig, common: &Common, arch: &ArchitectureDescriptor) -> Result<GemmConfig> {
    let chosen = gemm_candidates(cfg, common, arch)?
        .into_iter()
        .reduce(|best, c| if active_clusters(&c) > active_clusters(&best) { c } else { best })
        .ok_or_else(|| PlanError::configuration("gemm: no tiling candidate"))?;
    if chosen.strategy == Strategy::SplitN {
        debug!("gemm {}x{}x{}: split-N x{} preferred", cfg.m, cfg.n, cfg.k, chosen.group_number);
    }
    Ok(chosen)
}

/// Output down projection: one K partition per head, groups fan out over
/// the partitions and loop `repeat` times when there are more partitions
/// than groups
///
/// # Errors
///
/// Returns a configuration error if the config has no partition count or
/// M/N cannot be fitted.
pub fn tile_output_down_proj(cfg: &GemmConfig, common: &Common, arch: &ArchitectureDescriptor) -> Result<GemmConfig> {
    let parts = cfg
        .splitk_num
        .ok_or_else(|| PlanError::configuration("ofdp: missing per-head K partition count"))?;
    let (fy, fx) = fit_gemm_axes(cfg, arch)?;
    let mut out = cfg.clone();
    apply_axes(&mut out, fy, fx);

    let elem = common.dtype.size();
    let group = (arch.mesh_area() / (fy.scale * fx.scale)).min(parts);
    let split_k = cfg.k / parts;
    let repeat = parts.div_ceil(group);

    out.k_tile = split_k.min(arch.hardware_line());
    out.strategy = Strategy::SplitK;
    out.group_number = group;
    out.group_reduce = false;
    out.group_splitk = repeat;
    out.gap_x = split_k * elem;
    out.gap_w = cfg.n * elem;
    out.gap_z = split_k * elem;
    Ok(out)
}

fn tile_attention(label: &str, rows: u64, kv: u64, batch: u64, external: bool, arch: &ArchitectureDescriptor) -> Result<AttentionTiling> {
    if external {
        let tile_y = natural_tile(rows, arch);
        let tile_x = natural_tile(kv, arch);
        // external kernels keep full-line tiles
        for (dim, tile) in [(rows, tile_y), (kv, tile_x)] {
            if tile == 0 || dim % tile != 0 {
                return Err(PlanError::configuration(format!(
                    "{label}: sequence {dim} is not a multiple of tile {tile}"
                )));
            }
        }
        return Ok(AttentionTiling {
            tile_x,
            tile_y,
            scale_x: 1,
            scale_y: 1,
            passes_x: kv / tile_x,
            passes_y: rows / tile_y,
            shape_x: tile_x,
            shape_y: tile_y,
            flatten_async: false,
        });
    }

    let fy = fit_with_tile(&format!("{label}.q"), rows, attention_tile(rows, arch), arch.mesh.max_scale_y())?;
    let fx = fit_with_tile(&format!("{label}.kv"), kv, attention_tile(kv, arch), arch.mesh.max_scale_x())?;
    let available_group = arch.mesh_area() / (fy.scale * fx.scale);
    let flatten_async = if batch <= available_group {
        false
    } else if batch % available_group == 0 {
        true
    } else {
        return Err(PlanError::configuration(format!(
            "{label}: batch {batch} does not replicate over {available_group} flatten groups"
        )));
    };

    Ok(AttentionTiling {
        tile_x: fx.tile,
        tile_y: fy.tile,
        scale_x: fx.scale,
        scale_y: fy.scale,
        passes_x: fx.passes,
        passes_y: fy.passes,
        shape_x: fx.tile * fx.scale,
        shape_y: fy.tile * fy.scale,
        flatten_async,
    })
}

/// Flatten tiling for standard attention
///
/// # Errors
///
/// Returns a configuration error if the sequences cannot be fitted or the
/// batch does not replicate evenly over the spare groups.
pub fn tile_flat_attention(cfg: &FlatAttentionConfig, arch: &ArchitectureDescriptor) -> Result<FlatAttentionConfig> {
    let mut out = cfg.clone();
    out.tiling = tile_attention(
        "flat_attn",
        cfg.rows_per_group(),
        cfg.kv_seq,
        cfg.batch,
        cfg.use_external_kernel,
        arch,
    )?;
    Ok(out)
}

/// Flatten tiling for latent attention
///
/// # Errors
///
/// Returns a configuration error if the sequences cannot be fitted or the
/// batch does not replicate evenly over the spare groups.
pub fn tile_flatmla(cfg: &FlatMlaConfig, arch: &ArchitectureDescriptor) -> Result<FlatMlaConfig> {
    let mut out = cfg.clone();
    out.tiling = tile_attention(
        "flatmla",
        cfg.rows_per_group(),
        cfg.kv_seq,
        cfg.batch,
        cfg.use_external_kernel,
        arch,
    )?;
    Ok(out)
}

/// Tokens each cluster handles per MoE routing step
///
/// Every cluster keeps three score rows per routed expert, plus three
/// embedding rows when tokens are moved (`embedded_length`), in its
/// scratchpad.
///
/// # Errors
///
/// Returns a capacity error if the reserved embedding rows or a single
/// token do not fit in the scratchpad.
pub fn moe_token_budget(
    tokens: u64,
    routed: u64,
    embedded_length: Option<u64>,
    elem: u64,
    arch: &ArchitectureDescriptor,
) -> Result<u64> {
    let reserve = embedded_length.map_or(0, |emb| 3 * emb * elem);
    if reserve >= arch.scratchpad_capacity {
        return Err(PlanError::capacity(format!(
            "moe: {reserve} bytes of embedding rows exceed scratchpad of {} bytes",
            arch.scratchpad_capacity
        )));
    }
    let max_per_cluster = (arch.scratchpad_capacity - reserve) / (3 * routed * elem);
    if max_per_cluster == 0 {
        return Err(PlanError::capacity(format!(
            "moe: scratchpad of {} bytes cannot hold one token's scores for {routed} experts",
            arch.scratchpad_capacity
        )));
    }
    let average = tokens.div_ceil(arch.mesh_area());
    Ok(average.min(max_per_cluster))
}

fn tile_moe_gate(cfg: &MoeGateConfig, common: &Common, arch: &ArchitectureDescriptor) -> Result<MoeGateConfig> {
    let mut out = cfg.clone();
    out.token_per_cluster = moe_token_budget(cfg.tokens, cfg.routed, None, common.dtype.size(), arch)?;
    Ok(out)
}

fn tile_moe_transfer(cfg: &MoeTransferConfig, common: &Common, arch: &ArchitectureDescriptor) -> Result<MoeTransferConfig> {
    let mut out = cfg.clone();
    out.token_per_cluster = moe_token_budget(
        cfg.tokens,
        cfg.routed,
        Some(cfg.embedded_length),
        common.dtype.size(),
        arch,
    )?;
    Ok(out)
}

/// Tile any kernel config; untiled kinds are returned unchanged
///
/// # Errors
///
/// Propagates the per-kind tiling errors.
pub fn tile(config: &KernelConfig, common: &Common, arch: &ArchitectureDescriptor) -> Result<KernelConfig> {
    Ok(match config {
        KernelConfig::Gemm(c) => KernelConfig::Gemm(select_gemm(c, common, arch)?),
        KernelConfig::OutputDownProj(c) => KernelConfig::OutputDownProj(tile_output_down_proj(c, common, arch)?),
        KernelConfig::FlatAttention(c) => KernelConfig::FlatAttention(tile_flat_attention(c, arch)?),
        KernelConfig::FlatMla(c) => KernelConfig::FlatMla(tile_flatmla(c, arch)?),
        KernelConfig::MoeGate(c) => KernelConfig::MoeGate(tile_moe_gate(c, common, arch)?),
        KernelConfig::MoeDispatch(c) => KernelConfig::MoeDispatch(tile_moe_transfer(c, common, arch)?),
        KernelConfig::MoeCombine(c) => KernelConfig::MoeCombine(tile_moe_transfer(c, common, arch)?),
        KernelConfig::Norm(_)
        | KernelConfig::Rope(_)
        | KernelConfig::Activation(_)
        | KernelConfig::Add(_)
        | KernelConfig::SplitConcat(_) => config.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use softhier_arch::{ClusterMesh, ComputeEngine, DType};

    fn arch(ce_height: u32, mesh: u32) -> ArchitectureDescriptor {
        let mut arch = ArchitectureDescriptor::SOFTHIER_8X8_DUAL;
        arch.engine = ComputeEngine { height: ce_height, width: 16, pipeline_depth: 1 };
        arch.mesh = ClusterMesh::new(mesh, mesh);
        arch
    }

    const FP16: Common = Common { dtype: DType::Fp16, numerical_check: false };

    #[test]
    fn test_exact_fit() {
        let fit = fit_dimension("m", 1024, 8, &arch(64, 8)).unwrap();
        assert_eq!(fit, DimFit { tile: 256, scale: 4, passes: 1 });
        assert_eq!(fit.tile * fit.scale, 1024);
    }

    #[test]
    fn test_power_of_two_rounding() {
        let fit = fit_dimension("m", 768, 8, &arch(64, 8)).unwrap();
        assert_eq!(fit.tile, 192);
        assert_eq!(fit.scale, 4);
        assert_eq!(fit.tile * fit.scale, 768);
    }

    #[test]
    fn test_indivisible_dimension_rejected() {
        let err = fit_dimension("m", 300, 8, &arch(64, 8)).unwrap_err();
        assert!(matches!(err, PlanError::Configuration { .. }));
    }

    #[test]
    fn test_mesh_clamp_records_passes() {
        let fit = fit_dimension("n", 4096, 8, &arch(64, 8)).unwrap();
        assert_eq!(fit.tile, 256);
        assert_eq!(fit.scale, 8);
        assert_eq!(fit.passes, 2);
        assert_eq!(fit.tile * fit.scale * fit.passes, 4096);
    }

    #[test]
    fn test_clamp_to_non_pow2_mesh() {
        // 5 columns only fit a scale of 4
        let narrow = arch(64, 5);
        let fit = fit_dimension("n", 2048, narrow.mesh.max_scale_x(), &narrow).unwrap();
        assert_eq!(fit.scale, 4);
        assert_eq!(fit.passes, 2);
    }

    #[test]
    fn test_small_line_fallback() {
        // 4 × 16 = 64 ≤ 64
        assert_eq!(attention_tile(1024, &arch(16, 8)), SMALL_LINE_TILE);
        assert_eq!(attention_tile(16, &arch(16, 8)), 16);
        assert_eq!(attention_tile(1024, &arch(32, 8)), 128);
        assert_eq!(natural_tile(1024, &arch(16, 8)), 64);
    }

    #[test]
    fn test_short_line_gemm_keeps_full_line() {
        // 64-element line: GEMM tiles stay at one line
        let arch = arch(16, 8);
        let cfg = GemmConfig::builder(256, 512, 64).build().unwrap();
        let tiled = tile_gemm(&cfg, &FP16, &arch).unwrap();
        assert_eq!((tiled.m_tile, tiled.scale_y), (64, 4));
        assert_eq!((tiled.n_tile, tiled.scale_x, tiled.passes_x), (64, 8, 1));

        // attention on the same engine uses the short tile
        let mla = FlatMlaConfig::new(1, 256, 4, 512, 64, 64, 1).unwrap();
        let tiled = tile_flatmla(&mla, &arch).unwrap();
        assert_eq!(tiled.tiling.tile_x, SMALL_LINE_TILE);
        assert_eq!(tiled.tiling.scale_x, 8);
    }

    #[test]
    fn test_split_k_probe() {
        assert_eq!(split_k_group(512, 4), 4);
        assert_eq!(split_k_group(512, 7), 4);
        assert_eq!(split_k_group(6, 16), 2);
        assert_eq!(split_k_group(7, 16), 1);
        assert_eq!(split_k_tile(512 / 4, 256), 128);
    }

    #[test]
    fn test_split_k_tile_long_slices() {
        // 2 lines: largest divisor ≤ 256 is 256
        assert_eq!(split_k_tile(512, 256), 256);
        // 1.5 lines: largest divisor of 384 ≤ 256 is 192 = 3/4 line
        assert_eq!(split_k_tile(384, 256), 192);
        // 262 = 2·131: the 3/4-line floor wins over 131
        assert_eq!(split_k_tile(262, 256), 192);
        // ≥ 4 lines: one line
        assert_eq!(split_k_tile(2048, 256), 256);
    }

    #[test]
    fn test_gemm_rejects_indivisible_k_tile() {
        let arch = arch(64, 8);
        // K = 2·263 only splits in two; 263 is prime so the tile is 192
        let cfg = GemmConfig::builder(256, 256, 526).build().unwrap();
        let err = tile_gemm(&cfg, &FP16, &arch).unwrap_err();
        assert!(matches!(err, PlanError::Configuration { .. }));
    }

    #[test]
    fn test_gemm_split_k() {
        let arch = arch(64, 8);
        let cfg = GemmConfig::builder(256, 256, 512).build().unwrap();
        let tiled = tile_gemm(&cfg, &FP16, &arch).unwrap();
        // 1×1 flatten group leaves 64 groups; 512 splits into 64
        assert_eq!(tiled.scale_x, 1);
        assert_eq!(tiled.scale_y, 1);
        assert_eq!(tiled.strategy, Strategy::SplitK);
        assert_eq!(tiled.group_number, 64);
        assert_eq!(tiled.k_tile, 8);
        assert!(tiled.group_reduce);
        assert_eq!(tiled.gap_x, 8 * 2);
        assert_eq!(tiled.gap_w, 8 * 256 * 2);
        assert_eq!(tiled.gap_z, 0);
    }

    #[test]
    fn test_gemm_no_split_when_mesh_full() {
        let arch = arch(64, 8);
        let cfg = GemmConfig::builder(2048, 2048, 4096).build().unwrap();
        let tiled = tile_gemm(&cfg, &FP16, &arch).unwrap();
        assert_eq!(tiled.scale_x, 8);
        assert_eq!(tiled.scale_y, 8);
        assert_eq!(tiled.strategy, Strategy::NoSplit);
        assert_eq!(tiled.group_number, 1);
        assert_eq!(tiled.k_tile, 256);
    }

    #[test]
    fn test_gemm_candidates_offer_split_n() {
        let arch = arch(64, 8);
        let cfg = GemmConfig::builder(256, 8192, 384).build().unwrap();
        let candidates = gemm_candidates(&cfg, &FP16, &arch).unwrap();
        assert_eq!(candidates[0].strategy, Strategy::SplitK);
        let split_n = &candidates[1];
        assert_eq!(split_n.strategy, Strategy::SplitN);
        // scale 1×8 leaves 8 groups, N spans 4 flatten groups of 8×256
        assert_eq!(split_n.group_number, 4);
        assert_eq!(split_n.gap_w, 8 * 256 * 2);
        assert_eq!(split_n.gap_z, split_n.gap_w);

        // split-K over 8 groups beats split-N over 4
        let chosen = tile(&KernelConfig::Gemm(cfg), &FP16, &arch).unwrap();
        match chosen {
            KernelConfig::Gemm(g) => assert_eq!((g.strategy, g.group_number), (Strategy::SplitK, 8)),
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[test]
    fn test_split_n_chosen_when_k_splits_poorly() {
        let arch = arch(64, 8);
        // K = 2·225 splits in two only, N spans 4 flatten groups
        let cfg = GemmConfig::builder(256, 8192, 450).build().unwrap();
        assert_eq!(tile_gemm(&cfg, &FP16, &arch).unwrap().group_number, 2);
        let chosen = select_gemm(&cfg, &FP16, &arch).unwrap();
        assert_eq!(chosen.strategy, Strategy::SplitN);
        assert_eq!(chosen.group_number, 4);
        assert_eq!(chosen.k_tile, 256);
        assert_eq!(active_clusters(&chosen), 32);
        assert!(!chosen.group_reduce);
    }

    #[test]
    fn test_reshape_crossing_tiles_rejected() {
        let arch = arch(64, 8);
        // Z reshaped to 64-wide rows while the N tile is 256
        let cfg = GemmConfig::builder(256, 4096, 256).reshape_z_to_m(256 * 64).build().unwrap();
        assert!(tile_gemm(&cfg, &FP16, &arch).is_err());
    }

    #[test]
    fn test_output_down_proj() {
        let arch = arch(64, 8);
        let cfg = GemmConfig::builder(4, 128, 128 * 512).split_k_per(128).build().unwrap();
        let tiled = tile_output_down_proj(&cfg, &FP16, &arch).unwrap();
        assert_eq!(tiled.m_tile, 4);
        assert_eq!(tiled.n_tile, 128);
        // 64 groups over 128 heads: two rounds
        assert_eq!(tiled.group_number, 64);
        assert_eq!(tiled.group_splitk, 2);
        assert_eq!(tiled.k_tile, 256);
        assert_eq!(tiled.gap_x, 512 * 2);
        assert_eq!(tiled.gap_w, 128 * 2);
        assert!(!tiled.group_reduce);
    }

    #[test]
    fn test_attention_async_replication() {
        let arch = arch(64, 8);
        // rows 4×128 = 512 -> 2×256, kv 1024 -> 4×256: 8 clusters, 8 groups
        let cfg = FlatMlaConfig::new(1, 1024, 4, 512, 64, 128, 16).unwrap();
        let tiled = tile_flatmla(&cfg, &arch).unwrap();
        assert_eq!(tiled.tiling.scale_y, 2);
        assert_eq!(tiled.tiling.scale_x, 4);
        assert_eq!(tiled.tiling.shape_x, 1024);
        assert!(tiled.tiling.flatten_async);

        let small = FlatMlaConfig::new(1, 1024, 4, 512, 64, 128, 8).unwrap();
        assert!(!tile_flatmla(&small, &arch).unwrap().tiling.flatten_async);

        let odd = FlatMlaConfig::new(1, 1024, 4, 512, 64, 128, 12).unwrap();
        assert!(tile_flatmla(&odd, &arch).is_err());
    }

    #[test]
    fn test_attention_external_kernel() {
        let arch = arch(64, 8);
        let mut cfg = FlatAttentionConfig::new(512, 512, 1, 128, 32, 32, 1).unwrap();
        cfg.use_external_kernel = true;
        let tiled = tile_flat_attention(&cfg, &arch).unwrap();
        assert_eq!(tiled.tiling.scale_x, 1);
        assert_eq!(tiled.tiling.scale_y, 1);
        assert_eq!(tiled.tiling.shape_x, 256);
        assert!(!tiled.tiling.flatten_async);
    }

    #[test]
    fn test_moe_token_budget() {
        let mut arch = arch(64, 8);
        arch.scratchpad_capacity = 4096;
        // floor(4096 / (3·256·2)) = 2, ceil(1024 / 64) = 16
        assert_eq!(moe_token_budget(1024, 256, None, 2, &arch).unwrap(), 2);
        // few tokens: the average wins
        assert_eq!(moe_token_budget(64, 256, None, 2, &arch).unwrap(), 1);
    }

    #[test]
    fn test_moe_budget_follows_dtype() {
        let mut arch = arch(64, 8);
        arch.scratchpad_capacity = 4096;
        let gate = KernelConfig::MoeGate(MoeGateConfig::new(1024, 256, 8).unwrap());
        let budget = |dtype| match tile(&gate, &Common { dtype, numerical_check: false }, &arch).unwrap() {
            KernelConfig::MoeGate(g) => g.token_per_cluster,
            other => panic!("unexpected config {other:?}"),
        };
        // floor(4096 / (3·256·w)) for a w-byte element
        assert_eq!(budget(DType::Fp16), 2);
        assert_eq!(budget(DType::Fp8), 5);
    }

    #[test]
    fn test_moe_budget_exhausted() {
        let mut arch = arch(64, 8);
        arch.scratchpad_capacity = 4096;
        let err = moe_token_budget(1024, 256, Some(1024), 2, &arch).unwrap_err();
        assert!(matches!(err, PlanError::Capacity { .. }));
        let err = moe_token_budget(1024, 1024, None, 2, &arch).unwrap_err();
        assert!(matches!(err, PlanError::Capacity { .. }));
    }

    #[test]
    fn test_tile_passes_untiled_kinds_through() {
        let arch = arch(64, 8);
        let norm = KernelConfig::Norm(crate::kernel::NormConfig::new(4, 7168).unwrap());
        assert_eq!(tile(&norm, &FP16, &arch).unwrap(), norm);
    }
}
