//! Latent attention + mixture-of-experts layer
//!
//! Space B holds the layer input, the KV caches, all weights and the routing
//! tables; space A holds activations. Routed experts share one token slice
//! each of `moe_dispatch_buffer` and reuse a single set of scratch buffers,
//! all expressed as aliases.

use super::{gemm, token_tensor, LayerBuilder, LayerPlan};
use crate::config::{MlaConfig, ModelConfig, MoeConfig, MoeDistribution, WorkloadConfig};
use crate::error::{PlanError, Result};
use crate::kernel::{
    ActivationConfig, FlatMlaConfig, GemmConfig, KernelConfig, KernelKind, MoeGateConfig, MoeTransferConfig,
    NormConfig, RopeConfig, SplitConcatConfig,
};
use crate::space::SpaceId::{A, B};
use softhier_arch::{DType, HBM_NODE_ALIGN};
use tracing::debug;

/// Tokens each routed expert receives in one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpertLoad {
    counts: Vec<u64>,
}

impl ExpertLoad {
    /// Tokens routed to `expert`
    #[must_use]
    pub fn tokens(&self, expert: usize) -> u64 {
        self.counts.get(expert).copied().unwrap_or(0)
    }

    /// Per-expert token counts
    #[must_use]
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Experts with at least one token, with their counts
    pub fn loaded(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.counts.iter().copied().enumerate().filter(|&(_, n)| n > 0)
    }

    /// Token-expert slots in total (`tokens × active`)
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Deterministic routed-expert load for `tokens` tokens
///
/// `Fair` deals slot `(t, j)` to expert `(t·active + j) mod routed`;
/// `Identical` sends slot `(t, j)` to expert `j`.
///
/// # Errors
///
/// Returns a configuration error if there are no routed experts or more
/// active experts than routed ones.
pub fn expert_load(tokens: u64, routed: u64, active: u64, distribution: MoeDistribution) -> Result<ExpertLoad> {
    if routed == 0 {
        return Err(PlanError::configuration("moe: no routed experts to load"));
    }
    if active > routed {
        return Err(PlanError::configuration(format!(
            "moe: {active} active experts exceed {routed} routed experts"
        )));
    }
    let counts: Vec<u64> = match distribution {
        MoeDistribution::Fair => {
            let slots = tokens * active;
            (0..routed)
                .map(|e| slots / routed + u64::from(e < slots % routed))
                .collect()
        }
        MoeDistribution::Identical => (0..routed).map(|e| if e < active { tokens } else { 0 }).collect(),
    };
    Ok(ExpertLoad { counts })
}

pub(super) fn build(
    mut layer: LayerBuilder<'_>,
    model: &ModelConfig,
    mla: &MlaConfig,
    moe: &MoeConfig,
    workload: &WorkloadConfig,
) -> Result<LayerPlan> {
    attention(&mut layer, model, mla, workload)?;
    experts(&mut layer, model, moe, workload)?;
    layer.finish()
}

fn attention(layer: &mut LayerBuilder<'_>, model: &ModelConfig, mla: &MlaConfig, workload: &WorkloadConfig) -> Result<()> {
    let dt = model.dtype;
    let emb = model.embedding;
    let max_seq = model.max_sequence_length;
    let seq = workload.phase.sequence();
    let batch = workload.batch;
    let tokens = (batch, seq.seq);
    let rows = batch * seq.seq;
    let heads = mla.num_heads;
    let (q_lora, kv_lora, rope) = (mla.q_lora_rank, mla.kv_lora_rank, mla.rope_head_dim);

    token_tensor(&mut layer.b, "layer_input", tokens, emb, dt)?;
    layer
        .b
        .allocate_view("cn_caches", [batch * max_seq, kv_lora], [batch, max_seq, kv_lora], dt, 1)?;
    layer
        .b
        .allocate_view("cr_caches", [batch * max_seq, rope], [batch, max_seq, rope], dt, 1)?;
    layer.a.allocate_view("position", [rows], [batch, seq.seq], DType::U32, 1)?;
    layer.a.align_cursor(HBM_NODE_ALIGN)?;

    token_tensor(&mut layer.a, "attn_norm", tokens, emb, dt)?;
    layer
        .node("attn_norm", KernelConfig::Norm(NormConfig::new(rows, emb)?))
        .read("input", B, "layer_input")
        .write("output", A, "attn_norm")
        .add()?;

    // Merged query-latent and KV-latent projection
    layer.b.allocate("latent_qc_weight", [emb, q_lora + kv_lora], dt, 1)?;
    token_tensor(&mut layer.a, "attn_latqc", tokens, q_lora + kv_lora, dt)?;
    layer.projection(
        "attn_latqc_proj",
        gemm(rows, q_lora + kv_lora, emb)?,
        (A, "attn_norm"),
        (B, "latent_qc_weight"),
        (A, "attn_latqc"),
    )?;

    layer.b.allocate("latent_cr_weight", [emb, rope], dt, 1)?;
    token_tensor(&mut layer.b, "attn_latcr", tokens, rope, dt)?;
    layer.projection(
        "attn_latcr_proj",
        gemm(rows, rope, emb)?,
        (A, "attn_norm"),
        (B, "latent_cr_weight"),
        (B, "attn_latcr"),
    )?;

    layer.a.allocate("rope_c_cos_table", [max_seq, rope / 2], dt, 1)?;
    layer.a.allocate("rope_c_sin_table", [max_seq, rope / 2], dt, 1)?;
    layer
        .node("attn_rope_cr", KernelConfig::Rope(RopeConfig::new(rows, rope, max_seq, seq.seq)?))
        .read("input", B, "attn_latcr")
        .read("cos", A, "rope_c_cos_table")
        .read("sin", A, "rope_c_sin_table")
        .read("position", A, "position")
        .write("output", B, "attn_latcr")
        .add()?;

    token_tensor(&mut layer.a, "attn_latq", tokens, q_lora, dt)?;
    let split = SplitConcatConfig::new(batch, seq.seq, (q_lora, kv_lora, rope), seq.kv_cached, max_seq)?;
    layer
        .node("attn_split_concat", KernelConfig::SplitConcat(split))
        .read("input1", A, "attn_latqc")
        .read("input2", B, "attn_latcr")
        .write("output1", A, "attn_latq")
        .write("output2", B, "cn_caches")
        .write("output3", B, "cr_caches")
        .add()?;

    layer.b.allocate("qn_proj_weight", [q_lora, heads * kv_lora], dt, 1)?;
    layer.a.allocate_view(
        "attn_qn",
        [rows, heads * kv_lora],
        [batch, seq.seq, heads, kv_lora],
        dt,
        1,
    )?;
    layer.projection(
        "attn_qn_proj",
        gemm(rows, heads * kv_lora, q_lora)?,
        (A, "attn_latq"),
        (B, "qn_proj_weight"),
        (A, "attn_qn"),
    )?;

    layer.b.allocate("qr_proj_weight", [q_lora, heads * rope], dt, 1)?;
    layer
        .a
        .allocate_view("attn_qr", [rows, heads * rope], [batch, seq.seq, heads, rope], dt, 1)?;
    layer.projection(
        "attn_qr_proj",
        gemm(rows, heads * rope, q_lora)?,
        (A, "attn_latq"),
        (B, "qr_proj_weight"),
        (A, "attn_qr"),
    )?;

    layer.b.allocate("rope_q_cos_table", [max_seq, heads * rope / 2], dt, 1)?;
    layer.b.allocate("rope_q_sin_table", [max_seq, heads * rope / 2], dt, 1)?;
    layer
        .node(
            "attn_rope_qr",
            KernelConfig::Rope(RopeConfig::new(rows, heads * rope, max_seq, seq.seq)?),
        )
        .read("input", A, "attn_qr")
        .read("cos", B, "rope_q_cos_table")
        .read("sin", B, "rope_q_sin_table")
        .read("position", A, "position")
        .write("output", A, "attn_qr")
        .add()?;

    layer
        .a
        .allocate_view("attn_o", [rows, heads * kv_lora], [batch, seq.seq, heads, kv_lora], dt, 1)?;
    let mut flatmla = FlatMlaConfig::new(
        seq.q_seq,
        seq.kv_cached + seq.seq,
        seq.speculative,
        kv_lora,
        rope,
        heads,
        batch,
    )?;
    flatmla.use_external_kernel = workload.use_external_attention;
    layer
        .node("attn_flatmla", KernelConfig::FlatMla(flatmla))
        .read("qn", A, "attn_qn")
        .read("qr", A, "attn_qr")
        .read("cn", B, "cn_caches")
        .read("cr", B, "cr_caches")
        .write("o", A, "attn_o")
        .add()?;

    // Per-head down projection, then the shared output projection
    layer.b.allocate("o1_proj_weight", [kv_lora, heads * mla.head_dim], dt, 1)?;
    layer.a.allocate_view(
        "attn_o1",
        [rows, heads * mla.head_dim],
        [batch, seq.seq, heads, mla.head_dim],
        dt,
        1,
    )?;
    let o1 = GemmConfig::builder(rows, mla.head_dim, heads * kv_lora)
        .split_k_per(heads)
        .build()?;
    layer.projection(
        "attn_o1_proj",
        KernelConfig::OutputDownProj(o1),
        (A, "attn_o"),
        (B, "o1_proj_weight"),
        (A, "attn_o1"),
    )?;

    layer.b.allocate("o2_proj_weight", [heads * mla.head_dim, emb], dt, 1)?;
    token_tensor(&mut layer.a, "attn_o2", tokens, emb, dt)?;
    layer.projection(
        "attn_o2_proj",
        gemm(rows, emb, heads * mla.head_dim)?,
        (A, "attn_o1"),
        (B, "o2_proj_weight"),
        (A, "attn_o2"),
    )?;

    layer.add_bias("attn_resnet", (rows, emb), (B, "layer_input"), (A, "attn_o2"), (B, "layer_input"))
}

/// Up, gate, gated activation and down projection of one expert
struct ExpertNames {
    input: String,
    up: String,
    gate: String,
    acti: String,
    down_output: String,
}

fn expert_ffn(
    layer: &mut LayerBuilder<'_>,
    prefix: &str,
    names: &ExpertNames,
    (tokens, emb, inter): (u64, u64, u64),
    moe: &MoeConfig,
) -> Result<()> {
    let dt = layer.common.dtype;
    let up_weight = format!("{prefix}up_proj_weight");
    let gate_weight = format!("{prefix}gate_proj_weight");
    let down_weight = format!("{prefix}down_proj_weight");

    layer.b.allocate(&up_weight, [emb, inter], dt, 1)?;
    layer.projection(
        &format!("{prefix}up"),
        gemm(tokens, inter, emb)?,
        (A, names.input.as_str()),
        (B, up_weight.as_str()),
        (A, names.up.as_str()),
    )?;

    layer.b.allocate(&gate_weight, [emb, inter], dt, 1)?;
    layer.projection(
        &format!("{prefix}gate"),
        gemm(tokens, inter, emb)?,
        (A, names.input.as_str()),
        (B, gate_weight.as_str()),
        (A, names.gate.as_str()),
    )?;

    let acti = ActivationConfig::new(tokens, inter, moe.activation, true, false)?;
    layer
        .node(format!("{prefix}acti"), KernelConfig::Activation(acti))
        .read("input", A, names.up.as_str())
        .read("gate", A, names.gate.as_str())
        .write("output", A, names.acti.as_str())
        .add()?;

    layer.b.allocate(&down_weight, [inter, emb], dt, 1)?;
    layer.projection(
        &format!("{prefix}down"),
        gemm(tokens, emb, inter)?,
        (A, names.acti.as_str()),
        (B, down_weight.as_str()),
        (A, names.down_output.as_str()),
    )
}

fn experts(layer: &mut LayerBuilder<'_>, model: &ModelConfig, moe: &MoeConfig, workload: &WorkloadConfig) -> Result<()> {
    let dt = model.dtype;
    let elem = dt.size();
    let emb = model.embedding;
    let inter = moe.inter_dim;
    let seq = workload.phase.sequence();
    let tokens = (workload.batch, seq.seq);
    let rows = workload.batch * seq.seq;

    token_tensor(&mut layer.a, "moe_norm", tokens, emb, dt)?;
    layer
        .node("moe_norm", KernelConfig::Norm(NormConfig::new(rows, emb)?))
        .read("input", B, "layer_input")
        .write("output", A, "moe_norm")
        .add()?;

    for eid in 0..moe.shared_experts {
        let prefix = format!("moe_shared_{eid}_");
        let names = ExpertNames {
            input: "moe_norm".to_string(),
            up: format!("{prefix}up"),
            gate: format!("{prefix}gate"),
            acti: format!("{prefix}acti"),
            down_output: format!("{prefix}down"),
        };
        token_tensor(&mut layer.a, &names.up, tokens, inter, dt)?;
        token_tensor(&mut layer.a, &names.gate, tokens, inter, dt)?;
        token_tensor(&mut layer.a, &names.acti, tokens, inter, dt)?;
        token_tensor(&mut layer.a, &names.down_output, tokens, emb, dt)?;
        expert_ffn(layer, &prefix, &names, (rows, emb, inter), moe)?;
        if eid > 0 {
            layer.add_bias(
                &format!("{prefix}accumulate"),
                (rows, emb),
                (A, "moe_shared_0_down"),
                (A, names.down_output.as_str()),
                (A, "moe_shared_0_down"),
            )?;
        }
    }

    // Router
    layer.b.allocate("moe_rgate_weight", [emb, moe.routed_experts], dt, 1)?;
    token_tensor(&mut layer.a, "moe_rgate", tokens, moe.routed_experts, dt)?;
    layer.projection(
        "moe_rgate_proj",
        gemm(rows, moe.routed_experts, emb)?,
        (A, "moe_norm"),
        (B, "moe_rgate_weight"),
        (A, "moe_rgate"),
    )?;

    token_tensor(&mut layer.b, "moe_route_val", tokens, moe.active_experts, dt)?;
    layer.b.align_cursor(HBM_NODE_ALIGN)?;
    token_tensor(&mut layer.b, "moe_route_idx", tokens, moe.active_experts, DType::U32)?;
    layer.b.align_cursor(HBM_NODE_ALIGN)?;
    let topk = MoeGateConfig::new(rows, moe.routed_experts, moe.active_experts)?;
    layer
        .node("moe_rgate_topk", KernelConfig::MoeGate(topk))
        .read("input", A, "moe_rgate")
        .write("output_val", B, "moe_route_val")
        .write("output_idx", B, "moe_route_idx")
        .add()?;

    // Dispatch into one token slice per expert
    let load = expert_load(rows, moe.routed_experts, moe.active_experts, workload.moe_distribution)?;
    debug!(
        "expert load: {} of {} experts active, {} slots",
        load.loaded().count(),
        moe.routed_experts,
        load.total()
    );
    layer.a.allocate_view(
        "moe_dispatch_buffer",
        [moe.routed_experts * rows, emb],
        [moe.routed_experts, rows, emb],
        dt,
        1,
    )?;
    for (eid, n) in load.loaded() {
        layer.a.alias(
            &format!("moe_routed_{eid}_input"),
            "moe_dispatch_buffer",
            eid as u64 * rows * emb * elem,
            [n, emb],
            dt,
        )?;
    }
    token_tensor(&mut layer.b, "moe_route_pos", tokens, moe.active_experts, DType::U32)?;
    layer.b.align_cursor(HBM_NODE_ALIGN)?;

    let dispatch = MoeTransferConfig::new(KernelKind::MoeDispatch, rows, emb, moe.routed_experts, moe.active_experts)?;
    let mut node = layer
        .node("moe_dispatch", KernelConfig::MoeDispatch(dispatch))
        .read("input", A, "moe_norm")
        .read("input_idx", B, "moe_route_idx")
        .write("output_pos", B, "moe_route_pos");
    for (eid, _) in load.loaded() {
        node = node.write(format!("output_{eid}"), A, format!("moe_routed_{eid}_input"));
    }
    node.add()?;

    // Routed experts share one scratch set
    for scratch in ["moe_routed_up", "moe_routed_gate", "moe_routed_acti"] {
        layer.a.allocate(scratch, [rows, inter], dt, 1)?;
    }
    for (eid, n) in load.loaded() {
        let prefix = format!("moe_routed_{eid}_");
        let names = ExpertNames {
            input: format!("{prefix}input"),
            up: format!("{prefix}up"),
            gate: format!("{prefix}gate"),
            acti: format!("{prefix}acti"),
            down_output: format!("{prefix}input"),
        };
        layer.a.alias(&names.up, "moe_routed_up", 0, [n, inter], dt)?;
        layer.a.alias(&names.gate, "moe_routed_gate", 0, [n, inter], dt)?;
        layer.a.alias(&names.acti, "moe_routed_acti", 0, [n, inter], dt)?;
        expert_ffn(layer, &prefix, &names, (n, emb, inter), moe)?;
    }

    token_tensor(&mut layer.a, "moe_route_output", tokens, emb, dt)?;
    let combine = MoeTransferConfig::new(KernelKind::MoeCombine, rows, emb, moe.routed_experts, moe.active_experts)?;
    let mut node = layer
        .node("moe_combine", KernelConfig::MoeCombine(combine))
        .read("input_val", B, "moe_route_val")
        .read("input_idx", B, "moe_route_idx")
        .read("input_pos", B, "moe_route_pos");
    for (eid, _) in load.loaded() {
        node = node.read(format!("input_{eid}"), A, format!("moe_routed_{eid}_input"));
    }
    node.write("output", A, "moe_route_output").add()?;

    let moe_output = if moe.shared_experts > 0 {
        token_tensor(&mut layer.a, "moe_o", tokens, emb, dt)?;
        layer.add_bias(
            "moe_share_add_route",
            (rows, emb),
            (A, "moe_shared_0_down"),
            (A, "moe_route_output"),
            (A, "moe_o"),
        )?;
        "moe_o"
    } else {
        "moe_route_output"
    };

    layer.add_bias("moe_resnet", (rows, emb), (B, "layer_input"), (A, moe_output), (B, "layer_input"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fair_load() {
        // 6 tokens × 2 slots over 4 experts: 3 each
        let load = expert_load(6, 4, 2, MoeDistribution::Fair).unwrap();
        assert_eq!(load.counts(), &[3, 3, 3, 3]);
        // 5 × 2 = 10 slots over 4 experts
        let load = expert_load(5, 4, 2, MoeDistribution::Fair).unwrap();
        assert_eq!(load.counts(), &[3, 3, 2, 2]);
        assert_eq!(load.total(), 10);
    }

    #[test]
    fn test_fair_load_leaves_experts_idle() {
        let load = expert_load(2, 256, 8, MoeDistribution::Fair).unwrap();
        assert_eq!(load.loaded().count(), 16);
        assert_eq!(load.tokens(15), 1);
        assert_eq!(load.tokens(16), 0);
    }

    #[test]
    fn test_identical_load() {
        let load = expert_load(16, 8, 2, MoeDistribution::Identical).unwrap();
        assert_eq!(load.counts(), &[16, 16, 0, 0, 0, 0, 0, 0]);
        assert_eq!(load.loaded().map(|(e, _)| e).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_load_without_routed_experts_rejected() {
        for distribution in [MoeDistribution::Fair, MoeDistribution::Identical] {
            let err = expert_load(8, 0, 0, distribution).unwrap_err();
            assert!(matches!(err, PlanError::Configuration { .. }));
        }
        assert!(expert_load(8, 2, 4, MoeDistribution::Identical).is_err());
    }
}
