//! Typed planner configuration
//!
//! Three concerns, each loadable from its own TOML file or together as one
//! [`PlanConfig`]:
//!
//! - [`ArchConfig`]: the accelerator (becomes an [`ArchitectureDescriptor`])
//! - [`ModelConfig`]: one transformer layer's shape
//! - [`WorkloadConfig`]: batch, prefill/decode phase and routing
//!
//! ```toml
//! [arch]
//! num_cluster_x = 8
//! num_cluster_y = 8
//! # ...
//!
//! [model]
//! name = "dsv3-16b"
//! embedding = 2048
//! attention = { type = "mla", num_heads = 16, ... }
//! ffn = { type = "moe", ... }
//!
//! [workload]
//! batch = 16
//! phase = { mode = "decode", speculative_factor = 1, kv_cache_length = 511 }
//! ```

use crate::error::{PlanError, Result};
use crate::kernel::ActivationAlgo;
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use softhier_arch::{ArchitectureDescriptor, ClusterMesh, ComputeEngine, DType, HbmLayout};
use std::path::Path;
use tracing::debug;

/// Read and parse any TOML configuration file
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read, or a parse error naming
/// the file.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    debug!("Loaded {} ({} bytes)", path.display(), text.len());
    toml::from_str(&text).map_err(|e| PlanError::parse(path, e.to_string()))
}

fn deserialize_dtype<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<DType, D::Error> {
    let name = String::deserialize(deserializer)?;
    DType::from_name(&name).ok_or_else(|| serde::de::Error::custom(format!("unknown dtype '{name}'")))
}

const fn default_dtype() -> DType {
    DType::Fp16
}

const fn default_one() -> u32 {
    1
}

/// Accelerator description as written in configuration files
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchConfig {
    /// Cluster columns
    pub num_cluster_x: u32,
    /// Cluster rows
    pub num_cluster_y: u32,
    /// Matrix engine height
    pub compute_engine_height: u32,
    /// Matrix engine width
    pub compute_engine_width: u32,
    /// Matrix engine pipeline depth
    #[serde(default = "default_one")]
    pub compute_engine_pipeline_depth: u32,
    /// Per-cluster scratchpad bytes
    pub scratchpad_capacity_bytes: u64,
    /// Bytes addressable per HBM node
    pub hbm_node_capacity_bytes: u64,
    /// Channels per edge (west, north, east, south)
    pub hbm_edge_channel_counts: [u32; 4],
    /// Address of the first west-edge node
    pub hbm_base_address: u64,
    /// Bytes per cycle of one HBM channel
    pub hbm_node_bandwidth_bytes_per_cycle: u64,
    /// Core clock
    pub frequency_mhz: u32,
}

impl ArchConfig {
    /// Load from a TOML file
    ///
    /// # Errors
    ///
    /// See [`load_toml`].
    pub fn from_file(path: &Path) -> Result<Self> {
        load_toml(path)
    }

    /// Validate and convert into the planner's descriptor
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a size is zero or the HBM base is not
    /// aligned to a node window.
    pub fn into_descriptor(self) -> Result<ArchitectureDescriptor> {
        let required = [
            ("num_cluster_x", u64::from(self.num_cluster_x)),
            ("num_cluster_y", u64::from(self.num_cluster_y)),
            ("compute_engine_height", u64::from(self.compute_engine_height)),
            ("compute_engine_width", u64::from(self.compute_engine_width)),
            ("compute_engine_pipeline_depth", u64::from(self.compute_engine_pipeline_depth)),
            ("scratchpad_capacity_bytes", self.scratchpad_capacity_bytes),
            ("hbm_node_capacity_bytes", self.hbm_node_capacity_bytes),
            ("hbm_node_bandwidth_bytes_per_cycle", self.hbm_node_bandwidth_bytes_per_cycle),
            ("frequency_mhz", u64::from(self.frequency_mhz)),
        ];
        if let Some((field, _)) = required.iter().find(|(_, v)| *v == 0) {
            return Err(PlanError::configuration(format!("arch: `{field}` must be non-zero")));
        }
        if self.hbm_base_address % softhier_arch::HBM_NODE_ALIGN != 0 {
            return Err(PlanError::configuration(format!(
                "arch: HBM base {:#x} is not aligned to {:#x}",
                self.hbm_base_address,
                softhier_arch::HBM_NODE_ALIGN
            )));
        }

        Ok(ArchitectureDescriptor {
            mesh: ClusterMesh::new(self.num_cluster_x, self.num_cluster_y),
            engine: ComputeEngine {
                height: self.compute_engine_height,
                width: self.compute_engine_width,
                pipeline_depth: self.compute_engine_pipeline_depth,
            },
            scratchpad_capacity: self.scratchpad_capacity_bytes,
            hbm: HbmLayout {
                base: self.hbm_base_address,
                node_capacity: self.hbm_node_capacity_bytes,
                channels: self.hbm_edge_channel_counts,
                channel_bandwidth: self.hbm_node_bandwidth_bytes_per_cycle,
            },
            frequency_mhz: self.frequency_mhz,
        })
    }
}

/// Latent (compressed-KV) multi-head attention
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MlaConfig {
    /// Attention heads
    pub num_heads: u64,
    /// Value head dimension
    pub head_dim: u64,
    /// Query latent rank
    pub q_lora_rank: u64,
    /// KV latent rank
    pub kv_lora_rank: u64,
    /// Rotary key/query dimension
    pub rope_head_dim: u64,
}

/// Standard multi-head (grouped-query) attention
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MhaConfig {
    /// Query heads
    pub num_heads: u64,
    /// Head dimension
    pub head_dim: u64,
    /// KV head groups
    pub head_groups: u64,
    /// Rotary embedding on Q and K
    #[serde(default)]
    pub qk_rope: bool,
}

/// Attention block of a layer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AttentionConfig {
    /// Latent attention
    Mla(MlaConfig),
    /// Multi-head attention
    Mha(MhaConfig),
}

const fn default_silu() -> ActivationAlgo {
    ActivationAlgo::Silu
}

/// Mixture of experts
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoeConfig {
    /// Expert hidden width
    pub inter_dim: u64,
    /// Routed experts
    pub routed_experts: u64,
    /// Always-on shared experts
    pub shared_experts: u64,
    /// Experts selected per token
    pub active_experts: u64,
    /// Expert activation
    #[serde(default = "default_silu")]
    pub activation: ActivationAlgo,
}

/// Dense feed-forward block
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MlpConfig {
    /// Hidden width
    pub inter_dim: u64,
    /// Activation
    #[serde(default = "default_silu")]
    pub activation: ActivationAlgo,
    /// Activation bias
    #[serde(default)]
    pub bias: bool,
}

/// Feed-forward block of a layer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FfnConfig {
    /// Mixture of experts
    Moe(MoeConfig),
    /// Dense MLP
    Mlp(MlpConfig),
}

/// One transformer layer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Display name
    pub name: String,
    /// Element type of weights and activations
    #[serde(default = "default_dtype", deserialize_with = "deserialize_dtype")]
    pub dtype: DType,
    /// Embedding width
    pub embedding: u64,
    /// Cache rows per sequence
    pub max_sequence_length: u64,
    /// Attention block
    pub attention: AttentionConfig,
    /// Feed-forward block
    pub ffn: FfnConfig,
}

impl ModelConfig {
    /// Load from a TOML file
    ///
    /// # Errors
    ///
    /// See [`load_toml`].
    pub fn from_file(path: &Path) -> Result<Self> {
        load_toml(path)
    }
}

/// Inference phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Phase {
    /// Whole prompt at once, empty cache
    Prefill {
        /// Prompt tokens per sequence
        prompt_tokens: u64,
    },
    /// Token generation against a filled cache
    Decode {
        /// Tokens proposed per step
        speculative_factor: u64,
        /// Tokens already cached
        kv_cache_length: u64,
    },
}

/// Sequence parameters derived from a [`Phase`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceParams {
    /// New tokens per sequence this step
    pub seq: u64,
    /// Tokens already in the cache
    pub kv_cached: u64,
    /// Query positions per sequence
    pub q_seq: u64,
    /// Speculative tokens per query position
    pub speculative: u64,
}

impl Phase {
    /// Whether this is a prefill step
    #[must_use]
    pub const fn is_prefill(&self) -> bool {
        matches!(self, Self::Prefill { .. })
    }

    /// Sequence parameters of this phase
    #[must_use]
    pub const fn sequence(&self) -> SequenceParams {
        match *self {
            Self::Prefill { prompt_tokens } => SequenceParams {
                seq: prompt_tokens,
                kv_cached: 0,
                q_seq: prompt_tokens,
                speculative: 1,
            },
            Self::Decode {
                speculative_factor,
                kv_cache_length,
            } => SequenceParams {
                seq: speculative_factor,
                kv_cached: kv_cache_length,
                q_seq: 1,
                speculative: speculative_factor,
            },
        }
    }
}

/// How routed-expert load is modelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoeDistribution {
    /// Round-robin over all routed experts
    #[default]
    Fair,
    /// Every token picks the same first `active` experts
    Identical,
}

/// One planning run's workload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadConfig {
    /// Sequences
    pub batch: u64,
    /// Prefill or decode
    pub phase: Phase,
    /// Ask backends to check numerics
    #[serde(default)]
    pub numerical_check: bool,
    /// Routed-expert load model
    #[serde(default)]
    pub moe_distribution: MoeDistribution,
    /// Run attention through the external kernel (no flattening)
    #[serde(default)]
    pub use_external_attention: bool,
}

impl WorkloadConfig {
    /// Load from a TOML file
    ///
    /// # Errors
    ///
    /// See [`load_toml`].
    pub fn from_file(path: &Path) -> Result<Self> {
        load_toml(path)
    }
}

/// Architecture, model and workload in one file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanConfig {
    /// Accelerator
    pub arch: ArchConfig,
    /// Layer
    pub model: ModelConfig,
    /// Workload
    pub workload: WorkloadConfig,
}

impl PlanConfig {
    /// Load from a TOML file
    ///
    /// # Errors
    ///
    /// See [`load_toml`].
    pub fn from_file(path: &Path) -> Result<Self> {
        load_toml(path)
    }

    /// Parse from TOML text
    ///
    /// # Errors
    ///
    /// Returns a parse error if the text is not a valid plan configuration.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PlanError::parse("<inline>", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
        [arch]
        num_cluster_x = 8
        num_cluster_y = 8
        compute_engine_height = 64
        compute_engine_width = 16
        compute_engine_pipeline_depth = 3
        scratchpad_capacity_bytes = 0x180000
        hbm_node_capacity_bytes = 0x40000000
        hbm_edge_channel_counts = [8, 0, 0, 8]
        hbm_base_address = 0xc0000000
        hbm_node_bandwidth_bytes_per_cycle = 64
        frequency_mhz = 1000

        [model]
        name = "tiny-moe"
        dtype = "fp8"
        embedding = 1024
        max_sequence_length = 1024
        attention = { type = "mla", num_heads = 8, head_dim = 128, q_lora_rank = 512, kv_lora_rank = 256, rope_head_dim = 64 }
        ffn = { type = "moe", inter_dim = 512, routed_experts = 16, shared_experts = 1, active_experts = 2 }

        [workload]
        batch = 4
        phase = { mode = "decode", speculative_factor = 2, kv_cache_length = 254 }
        moe_distribution = "identical"
    "#;

    #[test]
    fn test_parse_plan() {
        let plan = PlanConfig::from_toml_str(PLAN).unwrap();
        assert_eq!(plan.model.dtype, DType::Fp8);
        assert!(matches!(plan.model.attention, AttentionConfig::Mla(ref mla) if mla.kv_lora_rank == 256));
        match &plan.model.ffn {
            FfnConfig::Moe(moe) => assert_eq!(moe.activation, ActivationAlgo::Silu),
            FfnConfig::Mlp(_) => panic!("expected moe"),
        }
        assert_eq!(plan.workload.moe_distribution, MoeDistribution::Identical);
        assert!(!plan.workload.numerical_check);

        let arch = plan.arch.into_descriptor().unwrap();
        assert_eq!(arch, ArchitectureDescriptor::SOFTHIER_8X8_DUAL);
    }

    #[test]
    fn test_phase_sequence() {
        let decode = Phase::Decode { speculative_factor: 2, kv_cache_length: 100 }.sequence();
        assert_eq!(decode, SequenceParams { seq: 2, kv_cached: 100, q_seq: 1, speculative: 2 });
        let prefill = Phase::Prefill { prompt_tokens: 64 }.sequence();
        assert_eq!(prefill, SequenceParams { seq: 64, kv_cached: 0, q_seq: 64, speculative: 1 });
    }

    #[test]
    fn test_unknown_field_rejected() {
        let text = PLAN.replace("batch = 4", "batch = 4\nbatches = 5");
        let err = PlanConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, PlanError::Parse { .. }));
    }

    #[test]
    fn test_unknown_dtype_rejected() {
        let text = PLAN.replace("\"fp8\"", "\"bf16\"");
        assert!(PlanConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_zero_arch_field_rejected() {
        let mut plan = PlanConfig::from_toml_str(PLAN).unwrap();
        plan.arch.num_cluster_x = 0;
        let err = plan.arch.into_descriptor().unwrap_err();
        assert!(matches!(err, PlanError::Configuration { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.toml");
        std::fs::write(&path, PLAN).unwrap();
        let plan = PlanConfig::from_file(&path).unwrap();
        assert_eq!(plan.workload.batch, 4);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(PlanConfig::from_file(&missing), Err(PlanError::Io { .. })));
    }
}
