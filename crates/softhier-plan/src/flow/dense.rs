//! Dense multi-head attention + gated MLP layer, prefill only

use super::{gemm, token_tensor, LayerBuilder, LayerPlan};
use crate::config::{MhaConfig, MlpConfig, ModelConfig, WorkloadConfig};
use crate::error::Result;
use crate::kernel::{ActivationConfig, FlatAttentionConfig, GemmConfig, KernelConfig, NormConfig, RopeConfig};
use crate::space::SpaceId::{A, B};
use softhier_arch::{DType, HBM_NODE_ALIGN};

pub(super) fn build(
    mut layer: LayerBuilder<'_>,
    model: &ModelConfig,
    mha: &MhaConfig,
    mlp: &MlpConfig,
    workload: &WorkloadConfig,
) -> Result<LayerPlan> {
    let dt = model.dtype;
    let emb = model.embedding;
    let max_seq = model.max_sequence_length;
    let batch = workload.batch;
    let seq = workload.phase.sequence().seq;
    let tokens = (batch, seq);
    let rows = batch * seq;
    let (heads, groups, hd) = (mha.num_heads, mha.head_groups, mha.head_dim);

    token_tensor(&mut layer.b, "layer_input", tokens, emb, dt)?;
    layer.a.allocate_view("position", [rows], [batch, seq], DType::U32, 1)?;
    layer.a.align_cursor(HBM_NODE_ALIGN)?;

    token_tensor(&mut layer.a, "attn_norm", tokens, emb, dt)?;
    layer
        .node("attn_norm", KernelConfig::Norm(NormConfig::new(rows, emb)?))
        .read("input", B, "layer_input")
        .write("output", A, "attn_norm")
        .add()?;

    // Head-major Q/K/V: [tokens, heads·hd] is written as [heads·tokens, hd]
    layer.b.allocate("q_proj_weight", [emb, heads * hd], dt, 1)?;
    layer
        .a
        .allocate_view("attn_q", [rows * heads, hd], [batch * heads, seq, hd], dt, 1)?;
    let q = GemmConfig::builder(rows, heads * hd, emb)
        .reshape_z_to_m(rows * heads)
        .build()?;
    layer.projection(
        "attn_q_proj",
        KernelConfig::Gemm(q),
        (A, "attn_norm"),
        (B, "q_proj_weight"),
        (A, "attn_q"),
    )?;

    for (proj, weight, out) in [
        ("attn_k_proj", "k_proj_weight", "attn_k"),
        ("attn_v_proj", "v_proj_weight", "attn_v"),
    ] {
        layer.b.allocate(weight, [emb, groups * hd], dt, 1)?;
        layer
            .b
            .allocate_view(out, [rows * groups, hd], [batch * groups, seq, hd], dt, 1)?;
        let kv = GemmConfig::builder(rows, groups * hd, emb)
            .reshape_z_to_m(rows * groups)
            .build()?;
        layer.projection(proj, KernelConfig::Gemm(kv), (A, "attn_norm"), (B, weight), (B, out))?;
    }

    if mha.qk_rope {
        layer.b.allocate("rope_q_cos_table", [max_seq, heads * hd / 2], dt, 1)?;
        layer.b.allocate("rope_q_sin_table", [max_seq, heads * hd / 2], dt, 1)?;
        let rope_q = RopeConfig::new(rows, heads * hd, max_seq, seq)?.with_view(hd)?;
        layer
            .node("attn_rope_q", KernelConfig::Rope(rope_q))
            .read("input", A, "attn_q")
            .read("cos", B, "rope_q_cos_table")
            .read("sin", B, "rope_q_sin_table")
            .read("position", A, "position")
            .write("output", A, "attn_q")
            .add()?;

        layer.a.allocate("rope_k_cos_table", [max_seq, groups * hd / 2], dt, 1)?;
        layer.a.allocate("rope_k_sin_table", [max_seq, groups * hd / 2], dt, 1)?;
        let rope_k = RopeConfig::new(rows, groups * hd, max_seq, seq)?.with_view(hd)?;
        layer
            .node("attn_rope_k", KernelConfig::Rope(rope_k))
            .read("input", B, "attn_k")
            .read("cos", A, "rope_k_cos_table")
            .read("sin", A, "rope_k_sin_table")
            .read("position", A, "position")
            .write("output", B, "attn_k")
            .add()?;
    }

    layer
        .a
        .allocate_view("attn_o", [rows * heads, hd], [batch * heads, seq, hd], dt, 1)?;
    let mut attention = FlatAttentionConfig::new(seq, seq, 1, hd, heads, groups, batch)?;
    attention.use_external_kernel = workload.use_external_attention;
    layer
        .node("attn_mha", KernelConfig::FlatAttention(attention))
        .read("q", A, "attn_q")
        .read("k", B, "attn_k")
        .read("v", B, "attn_v")
        .write("o", A, "attn_o")
        .add()?;

    layer.b.allocate("o_proj_weight", [heads * hd, emb], dt, 1)?;
    token_tensor(&mut layer.a, "attn_a", tokens, emb, dt)?;
    let o = GemmConfig::builder(rows, emb, heads * hd)
        .reshape_x_from_m(rows * heads)
        .build()?;
    layer.projection(
        "attn_o_proj",
        KernelConfig::Gemm(o),
        (A, "attn_o"),
        (B, "o_proj_weight"),
        (A, "attn_a"),
    )?;
    layer.add_bias("attn_resnet", (rows, emb), (B, "layer_input"), (A, "attn_a"), (B, "layer_input"))?;

    // Gated MLP
    let inter = mlp.inter_dim;
    token_tensor(&mut layer.a, "ffn_norm", tokens, emb, dt)?;
    layer
        .node("ffn_norm", KernelConfig::Norm(NormConfig::new(rows, emb)?))
        .read("input", B, "layer_input")
        .write("output", A, "ffn_norm")
        .add()?;

    for (proj, weight, out) in [
        ("ffn_up_proj", "up_proj_weight", "ffn_up"),
        ("ffn_gate_proj", "gate_proj_weight", "ffn_gate"),
    ] {
        layer.b.allocate(weight, [emb, inter], dt, 1)?;
        token_tensor(&mut layer.a, out, tokens, inter, dt)?;
        layer.projection(proj, gemm(rows, inter, emb)?, (A, "ffn_norm"), (B, weight), (A, out))?;
    }

    token_tensor(&mut layer.a, "ffn_acti", tokens, inter, dt)?;
    if mlp.bias {
        layer.b.allocate("ffn_acti_bias", [rows, inter], dt, 1)?;
    }
    let acti = ActivationConfig::new(rows, inter, mlp.activation, true, mlp.bias)?;
    let mut node = layer
        .node("ffn_acti", KernelConfig::Activation(acti))
        .read("input", A, "ffn_up")
        .read("gate", A, "ffn_gate");
    if mlp.bias {
        node = node.read("bias", B, "ffn_acti_bias");
    }
    node.write("output", A, "ffn_acti").add()?;

    layer.b.allocate("down_proj_weight", [inter, emb], dt, 1)?;
    token_tensor(&mut layer.a, "ffn_o", tokens, emb, dt)?;
    layer.projection(
        "ffn_down_proj",
        gemm(rows, emb, inter)?,
        (A, "ffn_acti"),
        (B, "down_proj_weight"),
        (A, "ffn_o"),
    )?;
    layer.add_bias("ffn_resnet", (rows, emb), (B, "layer_input"), (A, "ffn_o"), (B, "layer_input"))?;

    layer.finish()
}
