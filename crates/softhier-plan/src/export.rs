//! JSON export of a frozen plan
//!
//! Tables are written in declaration order, which is the order the buffers
//! were allocated and the nodes will launch:
//!
//! ```text
//! {
//!   "spaceA": { "attn_norm": { "addr": 3221225472, "shape": [8, 1024], "view": [4, 2, 1024], "size": 8192 }, …,
//!               "moe_routed_0_input": { "addr": …, "shape": …, "size": …, "belongs": "moe_dispatch_buffer" } },
//!   "spaceB": { "layer_input": { … }, … },
//!   "flow":   { "attn_norm": { "kind": "norm", "dtype": "fp8", "numerical_check": false,
//!                              "inputs":  { "input":  { "space": "spaceB", "buffer_name": "layer_input" } },
//!                              "outputs": { "output": { "space": "spaceA", "buffer_name": "attn_norm" } },
//!                              "config": { … }, "repeat": 1 }, … }
//! }
//! ```

use crate::error::Result;
use crate::flow::{KernelFlow, KernelNode, LayerPlan, PortBinding};
use crate::kernel::{Common, KernelConfig, KernelKind};
use crate::shape::Shape;
use crate::space::{AddressSpace, SpaceId};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Serialize)]
struct BufferEntry<'a> {
    addr: u64,
    shape: &'a Shape,
    #[serde(skip_serializing_if = "Option::is_none")]
    view: Option<&'a Shape>,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    belongs: Option<&'a str>,
}

struct SpaceTable<'a>(&'a AddressSpace);

impl Serialize for SpaceTable<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let space = self.0;
        let mut map = serializer.serialize_map(None)?;
        for buffer in space.buffers() {
            let entry = BufferEntry {
                addr: buffer.address(),
                shape: buffer.shape(),
                view: buffer.view(),
                size: buffer.size(),
                belongs: None,
            };
            map.serialize_entry(buffer.name(), &entry)?;
        }
        for alias in space.aliases() {
            if let Some(region) = space.region(alias.name()) {
                let entry = BufferEntry {
                    addr: region.address,
                    shape: region.shape,
                    view: None,
                    size: region.size,
                    belongs: region.parent,
                };
                map.serialize_entry(region.name, &entry)?;
            }
        }
        map.end()
    }
}

#[derive(Serialize)]
struct PortEntry<'a> {
    space: SpaceId,
    buffer_name: &'a str,
}

struct PortTable<'a>(&'a [(String, PortBinding)]);

impl Serialize for PortTable<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (port, binding) in self.0 {
            let entry = PortEntry {
                space: binding.space,
                buffer_name: &binding.buffer,
            };
            map.serialize_entry(port, &entry)?;
        }
        map.end()
    }
}

#[derive(Serialize)]
struct NodeEntry<'a> {
    kind: KernelKind,
    #[serde(flatten)]
    common: &'a Common,
    inputs: PortTable<'a>,
    outputs: PortTable<'a>,
    config: &'a KernelConfig,
    repeat: u64,
}

impl<'a> From<&'a KernelNode> for NodeEntry<'a> {
    fn from(node: &'a KernelNode) -> Self {
        Self {
            kind: node.kind(),
            common: node.common(),
            inputs: PortTable(node.inputs()),
            outputs: PortTable(node.outputs()),
            config: node.config(),
            repeat: node.repeat(),
        }
    }
}

struct FlowTable<'a>(&'a KernelFlow);

impl Serialize for FlowTable<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for node in self.0.nodes() {
            map.serialize_entry(node.name(), &NodeEntry::from(node))?;
        }
        map.end()
    }
}

#[derive(Serialize)]
struct PlanDocument<'a> {
    #[serde(rename = "spaceA")]
    space_a: SpaceTable<'a>,
    #[serde(rename = "spaceB")]
    space_b: SpaceTable<'a>,
    flow: FlowTable<'a>,
}

impl<'a> From<&'a LayerPlan> for PlanDocument<'a> {
    fn from(plan: &'a LayerPlan) -> Self {
        Self {
            space_a: SpaceTable(&plan.space_a),
            space_b: SpaceTable(&plan.space_b),
            flow: FlowTable(&plan.flow),
        }
    }
}

/// Serialize a plan as pretty-printed JSON
///
/// # Errors
///
/// Returns an export error if serialization fails.
pub fn to_json(plan: &LayerPlan) -> Result<String> {
    Ok(serde_json::to_string_pretty(&PlanDocument::from(plan))?)
}

/// Write a plan as JSON to `path`
///
/// # Errors
///
/// Returns an export error if serialization fails, or an I/O error if the
/// file cannot be written.
pub fn write_json(plan: &LayerPlan, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, to_json(plan)?)?;
    info!("✅ Plan exported to {}", path.display());
    Ok(())
}
