//! Kernel configuration set
//!
//! One configuration record per kernel kind the accelerator runs. Every
//! record is validated when it is constructed; the tiler then fills in the
//! hardware-fit fields (tiles, scales, split groups) and the result is
//! embedded, frozen, into a [`KernelNode`](crate::flow::KernelNode).
//!
//! | Kind | Export name | Config |
//! |------|-------------|--------|
//! | RMS normalisation | `norm` | [`NormConfig`] |
//! | SUMMA GEMM | `gemm` | [`GemmConfig`] |
//! | Output down projection (split-K per head) | `ofdp` | [`GemmConfig`] |
//! | Rotary embedding | `rope` | [`RopeConfig`] |
//! | Flat attention (MHA/GQA) | `flat_attn` | [`FlatAttentionConfig`] |
//! | Flat latent attention | `flatmla` | [`FlatMlaConfig`] |
//! | Activation | `acti` | [`ActivationConfig`] |
//! | Residual add | `addi` | [`AddConfig`] |
//! | Latent split/concat | `split_concat` | [`SplitConcatConfig`] |
//! | MoE gate top-k | `moeg` | [`MoeGateConfig`] |
//! | MoE dispatch | `moed` | [`MoeTransferConfig`] |
//! | MoE combine | `moec` | [`MoeTransferConfig`] |

use crate::error::{PlanError, Result};
use serde::{Deserialize, Serialize, Serializer};
use softhier_arch::DType;
use std::str::FromStr;

/// Kernel kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    /// RMS normalisation
    Norm,
    /// SUMMA GEMM
    Gemm,
    /// Output first-down projection, K split per head
    OutputDownProj,
    /// Rotary position embedding
    Rope,
    /// Flat attention over standard heads
    FlatAttention,
    /// Flat attention over latent-compressed heads
    FlatMla,
    /// Element-wise activation, optionally gated
    Activation,
    /// Residual add
    Add,
    /// Split latent projections into query and KV caches
    SplitConcat,
    /// Router top-k
    MoeGate,
    /// Token dispatch to experts
    MoeDispatch,
    /// Expert output combine
    MoeCombine,
}

impl KernelKind {
    /// All kinds
    pub const ALL: [Self; 12] = [
        Self::Norm,
        Self::Gemm,
        Self::OutputDownProj,
        Self::Rope,
        Self::FlatAttention,
        Self::FlatMla,
        Self::Activation,
        Self::Add,
        Self::SplitConcat,
        Self::MoeGate,
        Self::MoeDispatch,
        Self::MoeCombine,
    ];

    /// Name used in exported flows
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Norm => "norm",
            Self::Gemm => "gemm",
            Self::OutputDownProj => "ofdp",
            Self::Rope => "rope",
            Self::FlatAttention => "flat_attn",
            Self::FlatMla => "flatmla",
            Self::Activation => "acti",
            Self::Add => "addi",
            Self::SplitConcat => "split_concat",
            Self::MoeGate => "moeg",
            Self::MoeDispatch => "moed",
            Self::MoeCombine => "moec",
        }
    }
}

impl FromStr for KernelKind {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| PlanError::unsupported_kernel(s))
    }
}

impl std::fmt::Display for KernelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for KernelKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

fn serialize_dtype<S: Serializer>(dtype: &DType, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(dtype.as_str())
}

/// Fields shared by every kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Common {
    /// Element type of activations and weights
    #[serde(serialize_with = "serialize_dtype")]
    pub dtype: DType,
    /// Whether the backend should check results against a golden model
    pub numerical_check: bool,
}

fn require_nonzero(kind: KernelKind, fields: &[(&str, u64)]) -> Result<()> {
    match fields.iter().find(|(_, v)| *v == 0) {
        Some((name, _)) => Err(PlanError::configuration(format!(
            "{kind}: `{name}` must be non-zero"
        ))),
        None => Ok(()),
    }
}

/// RMS normalisation over rows of `n` elements
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormConfig {
    /// Rows
    pub m: u64,
    /// Row width
    pub n: u64,
}

impl NormConfig {
    /// Validate and create
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a dimension is zero.
    pub fn new(m: u64, n: u64) -> Result<Self> {
        require_nonzero(KernelKind::Norm, &[("m", m), ("n", n)])?;
        Ok(Self { m, n })
    }
}

/// Work partitioning chosen for a GEMM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One group covers the whole problem
    #[default]
    NoSplit,
    /// Reduction dimension split across groups, reduced at the end
    SplitK,
    /// Output columns split across groups
    SplitN,
}

/// Operand reshapes fused into a GEMM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct Reshape {
    /// Read X as if it had this many rows (`m × k` preserved)
    pub x_from_m: Option<u64>,
    /// Write Z as if it had this many rows (`m × n` preserved)
    pub z_to_m: Option<u64>,
}

/// SUMMA GEMM `Z[m,n] = X[m,k] · W[k,n]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GemmConfig {
    /// Rows of X and Z
    pub m: u64,
    /// Columns of W and Z
    pub n: u64,
    /// Reduction dimension
    pub k: u64,
    /// Per-cluster tile along M
    pub m_tile: u64,
    /// Per-cluster tile along N
    pub n_tile: u64,
    /// Per-step tile along K
    pub k_tile: u64,
    /// Clusters cooperating along N
    pub scale_x: u64,
    /// Clusters cooperating along M
    pub scale_y: u64,
    /// Sequential passes along N when the mesh clamps `scale_x`
    pub passes_x: u64,
    /// Sequential passes along M when the mesh clamps `scale_y`
    pub passes_y: u64,
    /// Partitioning strategy
    pub strategy: Strategy,
    /// Cluster groups working in parallel
    pub group_number: u64,
    /// Whether groups reduce partial sums at the end
    pub group_reduce: bool,
    /// Split-K rounds per group
    pub group_splitk: u64,
    /// Byte stride of the X slice between groups
    pub gap_x: u64,
    /// Byte stride of the W slice between groups
    pub gap_w: u64,
    /// Byte stride of the Z slice between groups
    pub gap_z: u64,
    /// Independent K partitions (output down projection: one per head)
    pub splitk_num: Option<u64>,
    /// Fused operand reshapes
    pub reshape: Reshape,
}

impl GemmConfig {
    /// Start building a GEMM of `m × k` by `k × n`
    pub fn builder(m: u64, n: u64, k: u64) -> GemmBuilder {
        GemmBuilder {
            m,
            n,
            k,
            reshape: Reshape::default(),
            splitk_num: None,
        }
    }

    /// Multiply-accumulate work in FLOP (2 per MAC)
    #[must_use]
    pub const fn flop(&self) -> u64 {
        2 * self.m * self.n * self.k
    }
}

/// Builder for [`GemmConfig`]
#[derive(Debug, Clone)]
pub struct GemmBuilder {
    m: u64,
    n: u64,
    k: u64,
    reshape: Reshape,
    splitk_num: Option<u64>,
}

impl GemmBuilder {
    /// Read X reshaped to `rows` rows
    #[must_use]
    pub const fn reshape_x_from_m(mut self, rows: u64) -> Self {
        self.reshape.x_from_m = Some(rows);
        self
    }

    /// Write Z reshaped to `rows` rows
    #[must_use]
    pub const fn reshape_z_to_m(mut self, rows: u64) -> Self {
        self.reshape.z_to_m = Some(rows);
        self
    }

    /// Split K into `parts` independent partitions (output down projection)
    #[must_use]
    pub const fn split_k_per(mut self, parts: u64) -> Self {
        self.splitk_num = Some(parts);
        self
    }

    /// Validate and produce an untiled config
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a dimension is zero, a reshape does
    /// not divide its operand or leaves it unchanged, or K does not split
    /// evenly into the requested partitions.
    pub fn build(self) -> Result<GemmConfig> {
        let kind = if self.splitk_num.is_some() {
            KernelKind::OutputDownProj
        } else {
            KernelKind::Gemm
        };
        require_nonzero(kind, &[("m", self.m), ("n", self.n), ("k", self.k)])?;

        if let Some(rows) = self.reshape.x_from_m {
            check_reshape(kind, "X", self.m, self.k, rows)?;
        }
        if let Some(rows) = self.reshape.z_to_m {
            check_reshape(kind, "Z", self.m, self.n, rows)?;
        }
        if let Some(parts) = self.splitk_num {
            if parts == 0 || self.k % parts != 0 {
                return Err(PlanError::configuration(format!(
                    "{kind}: k={} does not split into {parts} partitions",
                    self.k
                )));
            }
        }

        Ok(GemmConfig {
            m: self.m,
            n: self.n,
            k: self.k,
            m_tile: 0,
            n_tile: 0,
            k_tile: 0,
            scale_x: 1,
            scale_y: 1,
            passes_x: 1,
            passes_y: 1,
            strategy: Strategy::NoSplit,
            group_number: 1,
            group_reduce: false,
            group_splitk: 0,
            gap_x: 0,
            gap_w: 0,
            gap_z: 0,
            splitk_num: self.splitk_num,
            reshape: self.reshape,
        })
    }
}

fn check_reshape(kind: KernelKind, operand: &str, m: u64, cols: u64, rows: u64) -> Result<()> {
    if rows == 0 || (m * cols) % rows != 0 {
        return Err(PlanError::configuration(format!(
            "{kind}: {operand} reshape to {rows} rows does not divide {m}×{cols}"
        )));
    }
    if rows == m {
        return Err(PlanError::configuration(format!(
            "{kind}: {operand} reshape enabled but dimension not changed ({rows} rows)"
        )));
    }
    Ok(())
}

/// Rotary position embedding applied in place
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RopeConfig {
    /// Rows (tokens)
    pub m: u64,
    /// Row width
    pub n: u64,
    /// Rows in the cos/sin tables
    pub max_positions: u64,
    /// Consecutive rows sharing one sequence
    pub contiguous_length: u64,
    /// Rotary width per head when rows hold several heads
    pub view_n: Option<u64>,
}

impl RopeConfig {
    /// Validate and create
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a dimension is zero, `n` is odd, or
    /// `m` is not a whole number of sequences.
    pub fn new(m: u64, n: u64, max_positions: u64, contiguous_length: u64) -> Result<Self> {
        require_nonzero(
            KernelKind::Rope,
            &[
                ("m", m),
                ("n", n),
                ("max_positions", max_positions),
                ("contiguous_length", contiguous_length),
            ],
        )?;
        if n % 2 != 0 {
            return Err(PlanError::configuration(format!("rope: odd row width {n}")));
        }
        if m % contiguous_length != 0 {
            return Err(PlanError::configuration(format!(
                "rope: {m} rows are not a multiple of sequence length {contiguous_length}"
            )));
        }
        Ok(Self {
            m,
            n,
            max_positions,
            contiguous_length,
            view_n: None,
        })
    }

    /// Rotate each `view_n`-wide head slice independently
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `view_n` is odd or does not divide `n`.
    pub fn with_view(mut self, view_n: u64) -> Result<Self> {
        if view_n == 0 || view_n % 2 != 0 || self.n % view_n != 0 {
            return Err(PlanError::configuration(format!(
                "rope: head view {view_n} does not evenly split row width {}",
                self.n
            )));
        }
        self.view_n = Some(view_n);
        Ok(self)
    }
}

/// Tiling of an attention kernel over the cluster mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct AttentionTiling {
    /// KV tile per cluster
    pub tile_x: u64,
    /// Query tile per cluster
    pub tile_y: u64,
    /// Clusters cooperating along KV
    pub scale_x: u64,
    /// Clusters cooperating along queries
    pub scale_y: u64,
    /// Sequential passes along KV when the mesh clamps
    pub passes_x: u64,
    /// Sequential passes along queries when the mesh clamps
    pub passes_y: u64,
    /// KV extent covered by one flatten group
    pub shape_x: u64,
    /// Query extent covered by one flatten group
    pub shape_y: u64,
    /// Whether batch items are processed concurrently by replicated groups
    pub flatten_async: bool,
}

/// Flat attention over standard (optionally grouped) heads
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlatAttentionConfig {
    /// Query tokens per sequence
    pub q_seq: u64,
    /// Key/value tokens per sequence
    pub kv_seq: u64,
    /// Speculative tokens per query position
    pub speculative: u64,
    /// Head dimension
    pub head_dim: u64,
    /// Query heads
    pub num_heads: u64,
    /// KV head groups
    pub head_groups: u64,
    /// Sequences
    pub batch: u64,
    /// Delegate to an external attention kernel (no flattening)
    pub use_external_kernel: bool,
    /// Hardware fit
    pub tiling: AttentionTiling,
}

impl FlatAttentionConfig {
    /// Validate and create
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a field is zero or the heads do not
    /// split evenly into groups.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        q_seq: u64,
        kv_seq: u64,
        speculative: u64,
        head_dim: u64,
        num_heads: u64,
        head_groups: u64,
        batch: u64,
    ) -> Result<Self> {
        require_nonzero(
            KernelKind::FlatAttention,
            &[
                ("q_seq", q_seq),
                ("kv_seq", kv_seq),
                ("speculative", speculative),
                ("head_dim", head_dim),
                ("num_heads", num_heads),
                ("head_groups", head_groups),
                ("batch", batch),
            ],
        )?;
        if num_heads % head_groups != 0 {
            return Err(PlanError::configuration(format!(
                "flat_attn: {num_heads} heads do not split into {head_groups} groups"
            )));
        }
        Ok(Self {
            q_seq,
            kv_seq,
            speculative,
            head_dim,
            num_heads,
            head_groups,
            batch,
            use_external_kernel: false,
            tiling: AttentionTiling::default(),
        })
    }

    /// Query rows one head group processes against its shared KV
    #[must_use]
    pub const fn rows_per_group(&self) -> u64 {
        self.q_seq * self.speculative * self.num_heads / self.head_groups
    }
}

/// Flat attention over latent-compressed heads
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlatMlaConfig {
    /// Query tokens per sequence
    pub q_seq: u64,
    /// Cached plus new tokens per sequence
    pub kv_seq: u64,
    /// Speculative tokens per query position
    pub speculative: u64,
    /// Latent (non-rotary) head dimension
    pub nope_dim: u64,
    /// Rotary head dimension
    pub rope_dim: u64,
    /// Heads
    pub num_heads: u64,
    /// Sequences
    pub batch: u64,
    /// Delegate to an external attention kernel (no flattening)
    pub use_external_kernel: bool,
    /// Hardware fit
    pub tiling: AttentionTiling,
}

impl FlatMlaConfig {
    /// Validate and create
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a field is zero.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        q_seq: u64,
        kv_seq: u64,
        speculative: u64,
        nope_dim: u64,
        rope_dim: u64,
        num_heads: u64,
        batch: u64,
    ) -> Result<Self> {
        require_nonzero(
            KernelKind::FlatMla,
            &[
                ("q_seq", q_seq),
                ("kv_seq", kv_seq),
                ("speculative", speculative),
                ("nope_dim", nope_dim),
                ("rope_dim", rope_dim),
                ("num_heads", num_heads),
                ("batch", batch),
            ],
        )?;
        Ok(Self {
            q_seq,
            kv_seq,
            speculative,
            nope_dim,
            rope_dim,
            num_heads,
            batch,
            use_external_kernel: false,
            tiling: AttentionTiling::default(),
        })
    }

    /// Query rows sharing one latent KV stream
    #[must_use]
    pub const fn rows_per_group(&self) -> u64 {
        self.q_seq * self.speculative * self.num_heads
    }
}

/// Activation function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationAlgo {
    /// `x · sigmoid(x)`
    Silu,
    /// `max(x, 0)`
    Relu,
    /// `1 / (1 + e^-x)`
    Sigmoid,
    /// Identity (used by residual adds)
    None,
}

/// Element-wise activation, optionally gated and biased
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationConfig {
    /// Rows
    pub m: u64,
    /// Row width
    pub n: u64,
    /// Function
    pub algo: ActivationAlgo,
    /// Multiply by a gate operand
    pub gate: bool,
    /// Add a bias operand
    pub bias: bool,
}

impl ActivationConfig {
    /// Validate and create
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a dimension is zero.
    pub fn new(m: u64, n: u64, algo: ActivationAlgo, gate: bool, bias: bool) -> Result<Self> {
        require_nonzero(KernelKind::Activation, &[("m", m), ("n", n)])?;
        Ok(Self { m, n, algo, gate, bias })
    }
}

/// Residual add `out = input + bias`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddConfig {
    /// Rows
    pub m: u64,
    /// Row width
    pub n: u64,
}

impl AddConfig {
    /// Validate and create
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a dimension is zero.
    pub fn new(m: u64, n: u64) -> Result<Self> {
        require_nonzero(KernelKind::Add, &[("m", m), ("n", n)])?;
        Ok(Self { m, n })
    }
}

/// Split the merged latent projection into query latent and KV caches
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitConcatConfig {
    /// Sequences
    pub batch: u64,
    /// New tokens per sequence
    pub seq: u64,
    /// Query latent width
    pub q_width: u64,
    /// KV latent width
    pub kv_width: u64,
    /// Rotary key width
    pub rope_width: u64,
    /// Cache row where new tokens are written
    pub sequence_offset: u64,
    /// Cache rows per sequence
    pub max_sequence: u64,
}

impl SplitConcatConfig {
    /// Validate and create
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a width is zero, or a capacity error
    /// if the new tokens do not fit behind the cached ones.
    pub fn new(
        batch: u64,
        seq: u64,
        (q_width, kv_width, rope_width): (u64, u64, u64),
        sequence_offset: u64,
        max_sequence: u64,
    ) -> Result<Self> {
        require_nonzero(
            KernelKind::SplitConcat,
            &[
                ("batch", batch),
                ("seq", seq),
                ("q_width", q_width),
                ("kv_width", kv_width),
                ("rope_width", rope_width),
            ],
        )?;
        if sequence_offset + seq > max_sequence {
            return Err(PlanError::capacity(format!(
                "split_concat: {sequence_offset} cached + {seq} new tokens exceed cache of {max_sequence}"
            )));
        }
        Ok(Self {
            batch,
            seq,
            q_width,
            kv_width,
            rope_width,
            sequence_offset,
            max_sequence,
        })
    }
}

/// Router top-k over expert scores
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MoeGateConfig {
    /// Tokens routed
    pub tokens: u64,
    /// Routed experts
    pub routed: u64,
    /// Experts selected per token
    pub active: u64,
    /// Tokens processed per cluster per step
    pub token_per_cluster: u64,
}

impl MoeGateConfig {
    /// Validate and create
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a field is zero or more experts are
    /// selected than exist.
    pub fn new(tokens: u64, routed: u64, active: u64) -> Result<Self> {
        check_experts(KernelKind::MoeGate, tokens, routed, active)?;
        Ok(Self {
            tokens,
            routed,
            active,
            token_per_cluster: 0,
        })
    }
}

/// Token dispatch to, or combine from, routed experts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MoeTransferConfig {
    /// Tokens routed
    pub tokens: u64,
    /// Embedding width moved per token
    pub embedded_length: u64,
    /// Routed experts
    pub routed: u64,
    /// Experts selected per token
    pub active: u64,
    /// Tokens processed per cluster per step
    pub token_per_cluster: u64,
}

impl MoeTransferConfig {
    /// Validate and create
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a field is zero or more experts are
    /// selected than exist.
    pub fn new(kind: KernelKind, tokens: u64, embedded_length: u64, routed: u64, active: u64) -> Result<Self> {
        check_experts(kind, tokens, routed, active)?;
        require_nonzero(kind, &[("embedded_length", embedded_length)])?;
        Ok(Self {
            tokens,
            embedded_length,
            routed,
            active,
            token_per_cluster: 0,
        })
    }
}

fn check_experts(kind: KernelKind, tokens: u64, routed: u64, active: u64) -> Result<()> {
    require_nonzero(kind, &[("tokens", tokens), ("routed", routed), ("active", active)])?;
    if active > routed {
        return Err(PlanError::configuration(format!(
            "{kind}: {active} active experts exceed {routed} routed experts"
        )));
    }
    Ok(())
}

/// Per-kind kernel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum KernelConfig {
    /// `norm`
    Norm(NormConfig),
    /// `gemm`
    Gemm(GemmConfig),
    /// `ofdp`
    OutputDownProj(GemmConfig),
    /// `rope`
    Rope(RopeConfig),
    /// `flat_attn`
    FlatAttention(FlatAttentionConfig),
    /// `flatmla`
    FlatMla(FlatMlaConfig),
    /// `acti`
    Activation(ActivationConfig),
    /// `addi`
    Add(AddConfig),
    /// `split_concat`
    SplitConcat(SplitConcatConfig),
    /// `moeg`
    MoeGate(MoeGateConfig),
    /// `moed`
    MoeDispatch(MoeTransferConfig),
    /// `moec`
    MoeCombine(MoeTransferConfig),
}

impl KernelConfig {
    /// Kind of this config
    #[must_use]
    pub const fn kind(&self) -> KernelKind {
        match self {
            Self::Norm(_) => KernelKind::Norm,
            Self::Gemm(_) => KernelKind::Gemm,
            Self::OutputDownProj(_) => KernelKind::OutputDownProj,
            Self::Rope(_) => KernelKind::Rope,
            Self::FlatAttention(_) => KernelKind::FlatAttention,
            Self::FlatMla(_) => KernelKind::FlatMla,
            Self::Activation(_) => KernelKind::Activation,
            Self::Add(_) => KernelKind::Add,
            Self::SplitConcat(_) => KernelKind::SplitConcat,
            Self::MoeGate(_) => KernelKind::MoeGate,
            Self::MoeDispatch(_) => KernelKind::MoeDispatch,
            Self::MoeCombine(_) => KernelKind::MoeCombine,
        }
    }
}
