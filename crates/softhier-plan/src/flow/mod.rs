//! Kernel flows
//!
//! A [`KernelFlow`] is the ordered list of kernel launches of one layer. Each
//! port of a node is bound to a buffer *version*: every write creates a new
//! version of the buffer it targets, and a read observes whatever version is
//! current when the node is declared. Version 0 is the buffer's content on
//! entry (weights, caches, the layer input).
//!
//! The flow keeps a producer table `(space, buffer, version) → node`, so
//! the producer of every bound version follows from its binding alone:
//!
//! ```text
//! attn_resnet   reads  B.layer_input@0, A.attn_o2@1   writes B.layer_input@1
//! moe_norm      reads  B.layer_input@1                writes A.moe_norm@1
//!                      └── produced by attn_resnet
//! ```
//!
//! Aliases share bytes with their parent and with each other, so ordering
//! is tracked on byte extents of the root allocation as well. A read
//! depends on the overlapping writes back to the last one covering it; a
//! write is additionally ordered after overlapping reads and writes
//! (write-after-read, write-after-write):
//!
//! ```text
//! moe_routed_0_acti  reads   A.moe_routed_up[0, n·inter)   (alias moe_routed_0_up)
//! moe_routed_1_up    writes  A.moe_routed_up[0, n·inter)   (alias moe_routed_1_up)
//!                    └── ordered after moe_routed_0_acti and moe_routed_0_up
//! ```

mod dense;
mod latent;

pub use latent::{expert_load, ExpertLoad};

use crate::config::{AttentionConfig, FfnConfig, ModelConfig, WorkloadConfig};
use crate::error::{PlanError, Result};
use crate::kernel::{AddConfig, Common, GemmConfig, KernelConfig, KernelKind};
use crate::space::{self, AddressSpace, SpaceId};
use crate::tiler;
use softhier_arch::{ArchitectureDescriptor, DType};
use std::collections::HashMap;
use tracing::{debug, info};

/// A port's view of one buffer version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortBinding {
    /// Space holding the buffer
    pub space: SpaceId,
    /// Buffer or alias name
    pub buffer: String,
    /// Version read or written
    pub version: u32,
}

impl std::fmt::Display for PortBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}@{}", self.space, self.buffer, self.version)
    }
}

/// One kernel launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelNode {
    pub(crate) name: String,
    pub(crate) inputs: Vec<(String, PortBinding)>,
    pub(crate) outputs: Vec<(String, PortBinding)>,
    pub(crate) common: Common,
    pub(crate) config: KernelConfig,
    pub(crate) repeat: u64,
    /// Earlier nodes whose writes this node reads
    pub(crate) reads_from: Vec<String>,
    /// Earlier nodes this node must not overtake beyond `reads_from`
    pub(crate) after: Vec<String>,
}

impl KernelNode {
    /// Node name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel kind
    #[must_use]
    pub const fn kind(&self) -> KernelKind {
        self.config.kind()
    }

    /// Ports read, in declaration order
    #[must_use]
    pub fn inputs(&self) -> &[(String, PortBinding)] {
        &self.inputs
    }

    /// Ports written, in declaration order
    #[must_use]
    pub fn outputs(&self) -> &[(String, PortBinding)] {
        &self.outputs
    }

    /// Fields shared by every kernel
    #[must_use]
    pub const fn common(&self) -> &Common {
        &self.common
    }

    /// Tiled configuration
    #[must_use]
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Launches this node stands for (1 unless the flow was simplified)
    #[must_use]
    pub const fn repeat(&self) -> u64 {
        self.repeat
    }

    /// Every bound port, inputs first
    pub fn ports(&self) -> impl Iterator<Item = &(String, PortBinding)> {
        self.inputs.iter().chain(self.outputs.iter())
    }
}

type VersionKey = (SpaceId, String, u32);

/// Ordered kernel launches of one layer
#[derive(Debug, Clone, Default)]
pub struct KernelFlow {
    pub(crate) nodes: Vec<KernelNode>,
    pub(crate) index: HashMap<String, usize>,
    pub(crate) producers: HashMap<VersionKey, String>,
}

impl KernelFlow {
    /// Nodes in launch order
    pub fn nodes(&self) -> impl Iterator<Item = &KernelNode> {
        self.nodes.iter()
    }

    /// Node by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&KernelNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Number of nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the flow has no nodes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node that wrote `binding`, or `None` for entry contents
    #[must_use]
    pub fn producer(&self, binding: &PortBinding) -> Option<&KernelNode> {
        let key = (binding.space, binding.buffer.clone(), binding.version);
        self.producers.get(&key).and_then(|name| self.get(name))
    }

    /// Names of the nodes whose writes `node` reads, through any alias
    #[must_use]
    pub fn data_dependencies(&self, node: &str) -> Vec<&str> {
        self.get(node)
            .map(|n| n.reads_from.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Every node that must complete before `node`: its data dependencies
    /// first, then write-after-read and write-after-write hazards on shared
    /// bytes
    #[must_use]
    pub fn dependencies(&self, node: &str) -> Vec<&str> {
        self.get(node)
            .map(|n| n.reads_from.iter().chain(&n.after).map(String::as_str).collect())
            .unwrap_or_default()
    }

    fn push(&mut self, node: KernelNode) -> Result<()> {
        if self.index.contains_key(&node.name) {
            return Err(PlanError::configuration(format!("node '{}' declared twice", node.name)));
        }
        for (_, binding) in &node.outputs {
            self.producers.insert(
                (binding.space, binding.buffer.clone(), binding.version),
                node.name.clone(),
            );
        }
        self.index.insert(node.name.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// Check that every read is of entry contents or of a version written by
    /// an earlier node, and that every predecessor precedes its node
    ///
    /// # Errors
    ///
    /// Returns an invalid-state error naming the first offending port or
    /// ordering edge.
    pub fn validate(&self) -> Result<()> {
        for (position, node) in self.nodes.iter().enumerate() {
            for before in node.reads_from.iter().chain(&node.after) {
                if !self.index.get(before).is_some_and(|&i| i < position) {
                    return Err(PlanError::invalid_state(format!(
                        "{} is ordered after {before}, which does not precede it",
                        node.name
                    )));
                }
            }
            for (port, binding) in &node.inputs {
                if binding.version == 0 {
                    continue;
                }
                let produced_before = self
                    .producer(binding)
                    .and_then(|p| self.index.get(&p.name))
                    .is_some_and(|&i| i < position);
                if !produced_before {
                    return Err(PlanError::invalid_state(format!(
                        "{}.{port} reads {binding} before it is written",
                        node.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Frozen result of planning one layer
#[derive(Debug, Clone)]
pub struct LayerPlan {
    /// Kernel launches
    pub flow: KernelFlow,
    /// Space A
    pub space_a: AddressSpace,
    /// Space B
    pub space_b: AddressSpace,
}

impl LayerPlan {
    /// Space by id
    #[must_use]
    pub const fn space(&self, id: SpaceId) -> &AddressSpace {
        match id {
            SpaceId::A => &self.space_a,
            SpaceId::B => &self.space_b,
        }
    }
}

/// Shared state while one layer is being laid out
pub(crate) struct LayerBuilder<'a> {
    pub(crate) arch: &'a ArchitectureDescriptor,
    pub(crate) common: Common,
    pub(crate) a: AddressSpace,
    pub(crate) b: AddressSpace,
    flow: KernelFlow,
    latest: HashMap<(SpaceId, String), u32>,
    accesses: Vec<Access>,
}

/// Byte range of a root allocation touched through a buffer or alias
#[derive(Debug, Clone, PartialEq, Eq)]
struct Extent {
    space: SpaceId,
    root: String,
    start: u64,
    end: u64,
}

impl Extent {
    fn overlaps(&self, other: &Self) -> bool {
        self.space == other.space && self.root == other.root && self.start < other.end && other.start < self.end
    }

    fn covers(&self, other: &Self) -> bool {
        self.space == other.space && self.root == other.root && self.start <= other.start && other.end <= self.end
    }
}

/// One port of an already declared node
#[derive(Debug, Clone)]
struct Access {
    node: String,
    extent: Extent,
    write: bool,
}

/// Push into `out` the earlier nodes an access of `extent` must follow
///
/// The log is walked backwards and stops at the first write covering the
/// whole extent. Reads only follow writes; writes follow both.
fn ordering(log: &[Access], extent: &Extent, write: bool, out: &mut Vec<String>) {
    for access in log.iter().rev() {
        if !access.extent.overlaps(extent) {
            continue;
        }
        if (access.write || write) && !out.contains(&access.node) {
            out.push(access.node.clone());
        }
        if access.write && access.extent.covers(extent) {
            break;
        }
    }
}

impl<'a> LayerBuilder<'a> {
    pub(crate) fn new(arch: &'a ArchitectureDescriptor, common: Common) -> Self {
        Self {
            arch,
            common,
            a: AddressSpace::new(SpaceId::A),
            b: AddressSpace::new(SpaceId::B),
            flow: KernelFlow::default(),
            latest: HashMap::new(),
            accesses: Vec::new(),
        }
    }

    /// Root extent behind a bound buffer or alias
    fn extent(&self, space: SpaceId, buffer: &str) -> Option<Extent> {
        let region = self.space(space).region(buffer)?;
        // offsets until the spaces are rebased, so `address` is relative
        Some(Extent {
            space,
            root: region.parent.unwrap_or(region.name).to_string(),
            start: region.address,
            end: region.address + region.size,
        })
    }

    pub(crate) const fn space(&self, id: SpaceId) -> &AddressSpace {
        match id {
            SpaceId::A => &self.a,
            SpaceId::B => &self.b,
        }
    }

    pub(crate) fn node(&mut self, name: impl Into<String>, config: KernelConfig) -> NodeBuilder<'_, 'a> {
        NodeBuilder {
            layer: self,
            name: name.into(),
            config,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// `output = input × weight`
    pub(crate) fn projection(
        &mut self,
        name: &str,
        config: KernelConfig,
        input: (SpaceId, &str),
        weight: (SpaceId, &str),
        output: (SpaceId, &str),
    ) -> Result<()> {
        self.node(name, config)
            .read("input", input.0, input.1)
            .read("weight", weight.0, weight.1)
            .write("output", output.0, output.1)
            .add()
    }

    /// `output = input + bias`, row-wise over `rows × width`
    pub(crate) fn add_bias(
        &mut self,
        name: &str,
        (rows, width): (u64, u64),
        input: (SpaceId, &str),
        bias: (SpaceId, &str),
        output: (SpaceId, &str),
    ) -> Result<()> {
        self.node(name, KernelConfig::Add(AddConfig::new(rows, width)?))
            .read("input", input.0, input.1)
            .read("bias", bias.0, bias.1)
            .write("output", output.0, output.1)
            .add()
    }

    /// Rebase, freeze and validate
    pub(crate) fn finish(mut self) -> Result<LayerPlan> {
        space::reoffset(self.arch, &mut self.a, &mut self.b)?;
        space::freeze(&mut self.a, &mut self.b)?;
        self.flow.validate()?;
        info!(
            "✅ Layer planned: {} nodes, A {} buffers / {:#x} bytes, B {} buffers / {:#x} bytes",
            self.flow.len(),
            self.a.len(),
            self.a.footprint(),
            self.b.len(),
            self.b.footprint()
        );
        Ok(LayerPlan {
            flow: self.flow,
            space_a: self.a,
            space_b: self.b,
        })
    }
}

/// Plain GEMM config without reshapes
pub(crate) fn gemm(m: u64, n: u64, k: u64) -> Result<KernelConfig> {
    Ok(KernelConfig::Gemm(GemmConfig::builder(m, n, k).build()?))
}

/// Allocate a per-token activation `[batch·seq, width]` viewed as `[batch, seq, width]`
pub(crate) fn token_tensor(space: &mut AddressSpace, name: &str, (batch, seq): (u64, u64), width: u64, dtype: DType) -> Result<()> {
    space.allocate_view(name, [batch * seq, width], [batch, seq, width], dtype, 1)?;
    Ok(())
}

/// Collects the ports of one node before it is versioned and tiled
pub(crate) struct NodeBuilder<'l, 'a> {
    layer: &'l mut LayerBuilder<'a>,
    name: String,
    config: KernelConfig,
    inputs: Vec<(String, SpaceId, String)>,
    outputs: Vec<(String, SpaceId, String)>,
}

impl NodeBuilder<'_, '_> {
    pub(crate) fn read(mut self, port: impl Into<String>, space: SpaceId, buffer: impl Into<String>) -> Self {
        self.inputs.push((port.into(), space, buffer.into()));
        self
    }

    pub(crate) fn write(mut self, port: impl Into<String>, space: SpaceId, buffer: impl Into<String>) -> Self {
        self.outputs.push((port.into(), space, buffer.into()));
        self
    }

    /// Version the ports, tile the config and append the node
    pub(crate) fn add(self) -> Result<()> {
        let Self {
            layer,
            name,
            config,
            inputs,
            outputs,
        } = self;

        let mut reads = Vec::with_capacity(inputs.len());
        let mut writes = Vec::with_capacity(outputs.len());
        for (port, space, buffer) in &inputs {
            reads.push(layer.extent(*space, buffer).ok_or_else(|| unknown_buffer(&name, port, *space, buffer))?);
        }
        for (port, space, buffer) in &outputs {
            writes.push(layer.extent(*space, buffer).ok_or_else(|| unknown_buffer(&name, port, *space, buffer))?);
        }

        let mut reads_from = Vec::new();
        for extent in &reads {
            ordering(&layer.accesses, extent, false, &mut reads_from);
        }
        let mut after = Vec::new();
        for extent in &writes {
            ordering(&layer.accesses, extent, true, &mut after);
        }
        after.retain(|n| !reads_from.contains(n));

        let inputs: Vec<_> = inputs
            .into_iter()
            .map(|(port, space, buffer)| {
                let version = layer.latest.get(&(space, buffer.clone())).copied().unwrap_or(0);
                (port, PortBinding { space, buffer, version })
            })
            .collect();
        let outputs: Vec<_> = outputs
            .into_iter()
            .map(|(port, space, buffer)| {
                let slot = layer.latest.entry((space, buffer.clone())).or_insert(0);
                *slot += 1;
                let version = *slot;
                (port, PortBinding { space, buffer, version })
            })
            .collect();

        let config = tiler::tile(&config, &layer.common, layer.arch)
            .map_err(|e| match e {
                PlanError::Configuration { reason } => PlanError::configuration(format!("{name}: {reason}")),
                PlanError::Capacity { reason } => PlanError::capacity(format!("{name}: {reason}")),
                other => other,
            })?;
        debug!("node {name} ({}) after {reads_from:?} {after:?}", config.kind());

        let accesses = reads
            .into_iter()
            .map(|extent| (extent, false))
            .chain(writes.into_iter().map(|extent| (extent, true)))
            .map(|(extent, write)| Access {
                node: name.clone(),
                extent,
                write,
            });
        layer.accesses.extend(accesses);

        layer.flow.push(KernelNode {
            name,
            inputs,
            outputs,
            common: layer.common,
            config,
            repeat: 1,
            reads_from,
            after,
        })
    }
}

fn unknown_buffer(node: &str, port: &str, space: SpaceId, buffer: &str) -> PlanError {
    PlanError::configuration(format!("{node}.{port} is bound to unknown buffer {space}.{buffer}"))
}

/// Plan one layer: lay out both spaces, build the flow, rebase and freeze
///
/// Latent-attention models with a mixture of experts get the latent flow in
/// either phase; dense multi-head models with an MLP support prefill only.
///
/// # Errors
///
/// Returns a configuration error for unsupported model/phase combinations,
/// and propagates tiling, allocation and rebasing errors.
pub fn build_layer(model: &ModelConfig, workload: &WorkloadConfig, arch: &ArchitectureDescriptor) -> Result<LayerPlan> {
    if workload.batch == 0 {
        return Err(PlanError::configuration("workload: batch must be non-zero"));
    }
    let common = Common {
        dtype: model.dtype,
        numerical_check: workload.numerical_check,
    };
    info!("Planning {} ({}) on {arch}", model.name, if workload.phase.is_prefill() { "prefill" } else { "decode" });

    match (&model.attention, &model.ffn) {
        (AttentionConfig::Mla(mla), FfnConfig::Moe(moe)) => {
            latent::build(LayerBuilder::new(arch, common), model, mla, moe, workload)
        }
        (AttentionConfig::Mha(mha), FfnConfig::Mlp(mlp)) => {
            if !workload.phase.is_prefill() {
                return Err(PlanError::configuration(format!(
                    "{}: dense attention layers are planned for prefill only",
                    model.name
                )));
            }
            dense::build(LayerBuilder::new(arch, common), model, mha, mlp, workload)
        }
        _ => Err(PlanError::configuration(format!(
            "{}: attention and feed-forward combination is not supported",
            model.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::NormConfig;

    fn builder(arch: &ArchitectureDescriptor) -> LayerBuilder<'_> {
        LayerBuilder::new(arch, Common { dtype: DType::Fp16, numerical_check: false })
    }

    #[test]
    fn test_versions_follow_writes() {
        let arch = ArchitectureDescriptor::SOFTHIER_8X8_DUAL;
        let mut layer = builder(&arch);
        layer.b.allocate("x", [4, 64], DType::Fp16, 1).unwrap();
        layer.a.allocate("y", [4, 64], DType::Fp16, 1).unwrap();

        let norm = KernelConfig::Norm(NormConfig::new(4, 64).unwrap());
        layer.node("norm", norm).read("input", SpaceId::B, "x").write("output", SpaceId::A, "y").add().unwrap();
        let add = KernelConfig::Add(AddConfig::new(4, 64).unwrap());
        layer
            .node("add", add)
            .read("input", SpaceId::B, "x")
            .read("bias", SpaceId::A, "y")
            .write("output", SpaceId::B, "x")
            .add()
            .unwrap();

        let plan = layer.finish().unwrap();
        let add = plan.flow.get("add").unwrap();
        assert_eq!(add.inputs()[0].1.version, 0);
        assert_eq!(add.inputs()[1].1.version, 1);
        assert_eq!(add.outputs()[0].1.version, 1);
        assert_eq!(plan.flow.dependencies("add"), vec!["norm"]);
        assert!(plan.flow.dependencies("norm").is_empty());
        assert_eq!(plan.flow.producer(&add.outputs()[0].1).unwrap().name(), "add");
    }

    #[test]
    fn test_unknown_buffer_rejected() {
        let arch = ArchitectureDescriptor::SOFTHIER_8X8_DUAL;
        let mut layer = builder(&arch);
        let norm = KernelConfig::Norm(NormConfig::new(4, 64).unwrap());
        let err = layer.node("norm", norm).read("input", SpaceId::B, "missing").add().unwrap_err();
        assert!(matches!(err, PlanError::Configuration { .. }));
    }

    #[test]
    fn test_validate_catches_reads_before_writes() {
        let binding = PortBinding { space: SpaceId::A, buffer: "t".into(), version: 1 };
        let node = |name: &str, inputs, outputs| KernelNode {
            name: name.to_string(),
            inputs,
            outputs,
            common: Common { dtype: DType::Fp16, numerical_check: false },
            config: KernelConfig::Add(AddConfig::new(1, 1).unwrap()),
            repeat: 1,
            reads_from: Vec::new(),
            after: Vec::new(),
        };
        let mut flow = KernelFlow::default();
        flow.push(node("reader", vec![("input".to_string(), binding.clone())], vec![])).unwrap();
        flow.push(node("writer", vec![], vec![("output".to_string(), binding)])).unwrap();
        let err = flow.validate().unwrap_err();
        assert!(matches!(err, PlanError::InvalidState { .. }));
    }

    #[test]
    fn test_aliases_order_on_shared_bytes() {
        let arch = ArchitectureDescriptor::SOFTHIER_8X8_DUAL;
        let mut layer = builder(&arch);
        layer.a.allocate("src", [8, 64], DType::Fp16, 1).unwrap();
        layer.a.allocate("buf", [8, 64], DType::Fp16, 1).unwrap();
        layer.a.alias("lo", "buf", 0, [4, 64], DType::Fp16).unwrap();
        layer.a.alias("hi", "buf", 4 * 64 * 2, [4, 64], DType::Fp16).unwrap();
        layer.a.alias("lo_again", "buf", 0, [4, 64], DType::Fp16).unwrap();

        let add = || KernelConfig::Add(AddConfig::new(4, 64).unwrap());
        layer.node("w_lo", add()).read("input", SpaceId::A, "src").write("output", SpaceId::A, "lo").add().unwrap();
        layer.node("w_hi", add()).read("input", SpaceId::A, "src").write("output", SpaceId::A, "hi").add().unwrap();
        let whole = KernelConfig::Add(AddConfig::new(8, 64).unwrap());
        layer.node("r_buf", whole).read("input", SpaceId::A, "buf").write("output", SpaceId::A, "src").add().unwrap();
        layer
            .node("w_lo_again", add())
            .read("input", SpaceId::A, "src")
            .write("output", SpaceId::A, "lo_again")
            .add()
            .unwrap();

        let plan = layer.finish().unwrap();
        let flow = &plan.flow;
        // a read of the parent sees writes through both halves
        let mut deps = flow.data_dependencies("r_buf");
        deps.sort_unstable();
        assert_eq!(deps, vec!["w_hi", "w_lo"]);
        // r_buf overwrites src, which both writers read
        assert_eq!(flow.dependencies("r_buf").len(), 2);
        // a different alias over the low half follows the read and the old write
        assert_eq!(flow.data_dependencies("w_lo_again"), vec!["r_buf"]);
        assert_eq!(flow.dependencies("w_lo_again"), vec!["r_buf", "w_lo"]);
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let arch = ArchitectureDescriptor::SOFTHIER_8X8_DUAL;
        let mut layer = builder(&arch);
        layer.a.allocate("y", [4, 64], DType::Fp16, 1).unwrap();
        let add = KernelConfig::Add(AddConfig::new(4, 64).unwrap());
        layer.node("add", add.clone()).write("output", SpaceId::A, "y").add().unwrap();
        assert!(layer.node("add", add).write("output", SpaceId::A, "y").add().is_err());
    }
}
