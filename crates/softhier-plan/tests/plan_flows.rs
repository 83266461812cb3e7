//! End-to-end layer planning on the sample configurations

use softhier_arch::{ArchitectureDescriptor, DType, Edge, SPACE_B_ALIGN};
use softhier_plan::config::{ArchConfig, MoeDistribution, Phase};
use softhier_plan::prelude::*;
use softhier_plan::space::SpaceState;
use softhier_plan::{export, ModelConfig, WorkloadConfig};
use std::collections::HashSet;
use std::path::PathBuf;

fn config_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../configs").join(name)
}

fn tiny_moe() -> PlanConfig {
    PlanConfig::from_file(&config_path("tiny_moe_decode.toml")).unwrap()
}

fn tiny_moe_plan(distribution: MoeDistribution) -> (ArchitectureDescriptor, LayerPlan) {
    let mut config = tiny_moe();
    config.workload.moe_distribution = distribution;
    let arch = config.arch.into_descriptor().unwrap();
    let plan = build_layer(&config.model, &config.workload, &arch).unwrap();
    (arch, plan)
}

fn llama_prefill() -> LayerPlan {
    let arch = ArchConfig::from_file(&config_path("softhier_32x32.toml"))
        .unwrap()
        .into_descriptor()
        .unwrap();
    let model = ModelConfig::from_file(&config_path("llama3_8b.toml")).unwrap();
    let workload = WorkloadConfig::from_file(&config_path("prefill.toml")).unwrap();
    build_layer(&model, &workload, &arch).unwrap()
}

/// Every plan invariant that does not depend on the layer shape
fn check_plan(plan: &LayerPlan) {
    for id in [SpaceId::A, SpaceId::B] {
        let space = plan.space(id);
        assert_eq!(space.state(), SpaceState::Frozen);
        space.check_layout().unwrap();

        let mut end = 0;
        for buffer in space.buffers() {
            assert!(buffer.offset() >= end, "{} overlaps its predecessor", buffer.name());
            assert_eq!(buffer.size(), buffer.shape().total_elements() * buffer.dtype().size());
            assert_eq!(buffer.address(), space.base() + buffer.offset());
            end = buffer.end();
        }
        assert!(space.footprint() >= end);
    }

    plan.flow.validate().unwrap();
    let mut names = HashSet::new();
    for node in plan.flow.nodes() {
        assert!(names.insert(node.name()), "{} declared twice", node.name());
        for (port, binding) in node.ports() {
            assert!(
                plan.space(binding.space).region(&binding.buffer).is_some(),
                "{}.{port} bound to missing {binding}",
                node.name()
            );
        }
    }
}

#[test]
fn test_latent_decode_builds() {
    let (arch, plan) = tiny_moe_plan(MoeDistribution::Identical);
    check_plan(&plan);

    // 12 attention nodes, norm + 4 shared + router (2) + dispatch
    // + 2 experts × 4 + combine + shared/routed add + residual
    assert_eq!(plan.flow.len(), 31);
    assert!(plan.flow.get("moe_routed_1_down").is_some());
    assert!(plan.flow.get("moe_routed_2_up").is_none());

    assert_eq!(plan.space_a.base(), arch.hbm.edge_base(Edge::West, &arch.mesh));
    assert_eq!(plan.space_b.base(), arch.hbm.edge_base(Edge::South, &arch.mesh));

    let flatmla = plan.flow.get("attn_flatmla").unwrap();
    assert_eq!(flatmla.kind(), KernelKind::FlatMla);
    match flatmla.config() {
        KernelConfig::FlatMla(c) => {
            assert_eq!(c.kv_seq, 256);
            assert_eq!(c.speculative, 2);
            assert!(!c.tiling.flatten_async);
        }
        other => panic!("unexpected config {other:?}"),
    }
}

#[test]
fn test_latent_decode_dependencies() {
    let (_, plan) = tiny_moe_plan(MoeDistribution::Identical);
    let flow = &plan.flow;

    assert_eq!(flow.dependencies("attn_norm"), Vec::<&str>::new());
    assert_eq!(flow.data_dependencies("attn_resnet"), vec!["attn_o2_proj"]);
    // the residual overwrites the layer input attn_norm read
    assert!(flow.dependencies("attn_resnet").contains(&"attn_norm"));
    // moe_norm sees the residual, not the layer input on entry
    assert_eq!(flow.dependencies("moe_norm"), vec!["attn_resnet"]);

    let combine = flow.data_dependencies("moe_combine");
    for dep in ["moe_rgate_topk", "moe_dispatch", "moe_routed_0_down", "moe_routed_1_down"] {
        assert!(combine.contains(&dep), "moe_combine should depend on {dep}");
    }
    assert_eq!(flow.data_dependencies("moe_resnet"), vec!["attn_resnet", "moe_share_add_route"]);
    assert!(flow.dependencies("moe_resnet").contains(&"moe_norm"));

    let up = flow.get("moe_routed_0_up").unwrap();
    assert_eq!(up.inputs()[0].1.buffer, "moe_routed_0_input");
    assert_eq!(flow.producer(&up.inputs()[0].1).unwrap().name(), "moe_dispatch");
}

#[test]
fn test_routed_experts_order_on_shared_scratch() {
    let (_, plan) = tiny_moe_plan(MoeDistribution::Identical);
    let flow = &plan.flow;

    // expert 1 reuses the scratch expert 0 wrote and read
    assert_eq!(flow.data_dependencies("moe_routed_1_up"), vec!["moe_dispatch"]);
    let before = flow.dependencies("moe_routed_1_up");
    assert!(before.contains(&"moe_routed_0_up"));
    assert!(before.contains(&"moe_routed_0_acti"));
    assert!(flow.dependencies("moe_routed_1_acti").contains(&"moe_routed_0_down"));

    // down overwrites the token slice that up and gate read
    let before = flow.dependencies("moe_routed_0_down");
    assert!(before.contains(&"moe_dispatch"));
    assert!(before.contains(&"moe_routed_0_up"));
    assert!(before.contains(&"moe_routed_0_gate"));
    assert_eq!(flow.data_dependencies("moe_routed_0_down"), vec!["moe_routed_0_acti"]);
}

#[test]
fn test_latent_decode_expert_aliases() {
    let (_, plan) = tiny_moe_plan(MoeDistribution::Identical);
    let a = &plan.space_a;
    let dispatch = a.region("moe_dispatch_buffer").unwrap();
    let e1 = a.region("moe_routed_1_input").unwrap();
    assert_eq!(e1.parent, Some("moe_dispatch_buffer"));
    // 8 rows × 1024 × fp8 per expert slice
    assert_eq!(e1.address, dispatch.address + 8 * 1024);
    assert_eq!(e1.size, 8 * 1024);
    assert!(a.region("moe_routed_2_input").is_none());

    let b = &plan.space_b;
    assert_eq!(b.region("moe_route_idx").unwrap().dtype, DType::U32);
    assert!(b.region("cn_caches").is_some());
}

#[test]
fn test_fair_distribution_loads_every_expert() {
    let (_, plan) = tiny_moe_plan(MoeDistribution::Fair);
    check_plan(&plan);
    // 8 rows × 2 slots over 16 experts: one token each
    assert_eq!(plan.flow.len(), 31 - 8 + 16 * 4);
    let down = plan.flow.get("moe_routed_15_down").unwrap();
    match down.config() {
        KernelConfig::Gemm(g) => assert_eq!((g.m, g.n, g.k), (1, 1024, 512)),
        other => panic!("unexpected config {other:?}"),
    }
}

#[test]
fn test_simplify_collapses_routed_experts() {
    let (_, plan) = tiny_moe_plan(MoeDistribution::Fair);
    let simplified = simplify(&plan.flow);
    simplified.validate().unwrap();
    assert_eq!(simplified.len(), 31 - 8 + 4);

    for stage in ["up", "gate", "acti", "down"] {
        let node = simplified.get(&format!("moe_routed_0_{stage}")).unwrap();
        assert_eq!(node.repeat(), 16);
    }
    assert!(simplified.get("moe_routed_3_up").is_none());
    assert!(simplified.dependencies("moe_combine").contains(&"moe_routed_0_down"));
    assert_eq!(simplified.get("moe_dispatch").unwrap().repeat(), 1);
}

#[test]
fn test_no_shared_experts() {
    let mut config = tiny_moe();
    if let softhier_plan::config::FfnConfig::Moe(moe) = &mut config.model.ffn {
        moe.shared_experts = 0;
    }
    let arch = config.arch.into_descriptor().unwrap();
    let plan = build_layer(&config.model, &config.workload, &arch).unwrap();
    check_plan(&plan);
    assert!(plan.flow.get("moe_share_add_route").is_none());
    assert!(plan.flow.get("moe_shared_0_up").is_none());
    assert_eq!(plan.flow.data_dependencies("moe_resnet"), vec!["attn_resnet", "moe_combine"]);
}

#[test]
fn test_multiple_shared_experts_accumulate() {
    let mut config = tiny_moe();
    if let softhier_plan::config::FfnConfig::Moe(moe) = &mut config.model.ffn {
        moe.shared_experts = 2;
    }
    let arch = config.arch.into_descriptor().unwrap();
    let plan = build_layer(&config.model, &config.workload, &arch).unwrap();
    check_plan(&plan);
    let acc = plan.flow.get("moe_shared_1_accumulate").unwrap();
    assert_eq!(acc.kind(), KernelKind::Add);
    assert_eq!(
        plan.flow.data_dependencies("moe_share_add_route"),
        vec!["moe_shared_1_accumulate", "moe_combine"]
    );
}

#[test]
fn test_cache_overflow_rejected() {
    let mut config = tiny_moe();
    config.workload.phase = Phase::Decode {
        speculative_factor: 2,
        kv_cache_length: 1023,
    };
    let arch = config.arch.into_descriptor().unwrap();
    let err = build_layer(&config.model, &config.workload, &arch).unwrap_err();
    assert!(matches!(err, PlanError::Capacity { .. }));
}

#[test]
fn test_dense_prefill_builds() {
    let plan = llama_prefill();
    check_plan(&plan);
    assert_eq!(plan.flow.len(), 15);

    // single south edge: A first, B on the next 1 MiB boundary
    assert_eq!(plan.space_b.base() % SPACE_B_ALIGN, 0);
    assert!(plan.space_b.base() >= plan.space_a.base() + plan.space_a.footprint());

    let q = plan.flow.get("attn_q_proj").unwrap();
    match q.config() {
        KernelConfig::Gemm(g) => {
            assert_eq!(g.reshape.z_to_m, Some(512 * 32));
            assert_eq!((g.m_tile, g.n_tile, g.k_tile), (128, 128, 128));
        }
        other => panic!("unexpected config {other:?}"),
    }
    assert_eq!(plan.flow.data_dependencies("attn_mha"), vec!["attn_rope_q", "attn_rope_k", "attn_v_proj"]);
    assert_eq!(plan.flow.data_dependencies("ffn_acti"), vec!["ffn_up_proj", "ffn_gate_proj"]);
}

#[test]
fn test_dense_decode_rejected() {
    let arch = ArchitectureDescriptor::SOFTHIER_32X32;
    let model = ModelConfig::from_file(&config_path("llama3_8b.toml")).unwrap();
    let workload = WorkloadConfig::from_file(&config_path("decode.toml")).unwrap();
    let err = build_layer(&model, &workload, &arch).unwrap_err();
    assert!(matches!(err, PlanError::Configuration { .. }));
}

#[test]
fn test_deepseek_decode_builds() {
    let arch = ArchConfig::from_file(&config_path("softhier_32x32.toml"))
        .unwrap()
        .into_descriptor()
        .unwrap();
    let model = ModelConfig::from_file(&config_path("dsv3.toml")).unwrap();
    let workload = WorkloadConfig::from_file(&config_path("decode.toml")).unwrap();
    let plan = build_layer(&model, &workload, &arch).unwrap();
    check_plan(&plan);

    // 64 rows × 8 slots over 256 experts: two tokens each
    assert!(plan.flow.get("moe_routed_255_down").is_some());
    let simplified = simplify(&plan.flow);
    assert_eq!(simplified.get("moe_routed_0_up").unwrap().repeat(), 256);

    let summary = space_summary(&plan.space_b);
    let up = summary.rows.iter().find(|r| r.name == "moe_routed_*_up_proj_weight").unwrap();
    assert_eq!(up.count, 256);
    assert_eq!(up.size, 256 * 7168 * 2048);
}

#[test]
fn test_export_round_trip_through_disk() {
    let (_, plan) = tiny_moe_plan(MoeDistribution::Identical);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.json");
    export::write_json(&plan, &path).unwrap();

    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["flow"].as_object().unwrap().len(), plan.flow.len());
    assert_eq!(json["flow"]["moe_dispatch"]["kind"], "moed");
    assert_eq!(
        json["spaceA"]["moe_routed_0_input"]["belongs"],
        "moe_dispatch_buffer"
    );
}
