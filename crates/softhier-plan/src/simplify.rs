//! Flow simplification
//!
//! Routed experts that receive the same number of tokens launch identical
//! kernels. [`simplify`] keeps the first launch of each identical stage and
//! counts the rest in its `repeat`, so a dispatch of the simplified flow
//! visits every distinct kernel once.

use crate::flow::{KernelFlow, KernelNode};
use std::collections::HashMap;
use tracing::info;

/// Stages of one routed expert
const EXPERT_STAGES: [&str; 4] = ["up", "gate", "acti", "down"];

/// Stage of a routed-expert node name (`moe_routed_<e>_<stage>`)
fn expert_stage(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("moe_routed_")?;
    let (expert, stage) = rest.split_once('_')?;
    if expert.is_empty() || !expert.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    EXPERT_STAGES.contains(&stage).then_some(stage)
}

/// Collapse identical routed-expert launches into one node with a repeat count
///
/// Outputs of dropped nodes are attributed to their representative, so
/// readers downstream still resolve a producer that precedes them. Ordering
/// edges naming a dropped node are redirected the same way.
#[must_use]
pub fn simplify(flow: &KernelFlow) -> KernelFlow {
    let mut nodes: Vec<KernelNode> = Vec::with_capacity(flow.nodes.len());
    let mut representatives: Vec<(&str, usize)> = Vec::new();
    let mut renamed: HashMap<&str, usize> = HashMap::new();

    for node in &flow.nodes {
        let Some(stage) = expert_stage(&node.name) else {
            nodes.push(node.clone());
            continue;
        };
        let existing = representatives
            .iter()
            .copied()
            .find(|&(s, i)| s == stage && nodes[i].config == node.config && nodes[i].common == node.common)
            .map(|(_, i)| i);
        match existing {
            Some(i) => {
                nodes[i].repeat += node.repeat;
                renamed.insert(&node.name, i);
            }
            None => {
                representatives.push((stage, nodes.len()));
                nodes.push(node.clone());
            }
        }
    }

    let owner = |name: &str| renamed.get(name).map_or_else(|| name.to_string(), |&i| nodes[i].name.clone());
    let redirected: Vec<(Vec<String>, Vec<String>)> = nodes
        .iter()
        .map(|node| {
            let remap = |edges: &[String]| {
                let mut out: Vec<String> = Vec::with_capacity(edges.len());
                for name in edges.iter().map(|n| owner(n.as_str())) {
                    if name != node.name && !out.contains(&name) {
                        out.push(name);
                    }
                }
                out
            };
            let reads_from = remap(&node.reads_from);
            let mut after = remap(&node.after);
            after.retain(|n| !reads_from.contains(n));
            (reads_from, after)
        })
        .collect();
    let producers = flow
        .producers
        .iter()
        .map(|(key, name)| (key.clone(), owner(name.as_str())))
        .collect();

    for (node, (reads_from, after)) in nodes.iter_mut().zip(redirected) {
        node.reads_from = reads_from;
        node.after = after;
    }
    let index: HashMap<String, usize> = nodes.iter().enumerate().map(|(i, n)| (n.name.clone(), i)).collect();

    info!("✅ Flow simplified: {} nodes -> {}", flow.nodes.len(), nodes.len());
    KernelFlow { nodes, index, producers }
}
