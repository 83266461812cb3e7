//! Sequential dispatch of a frozen kernel flow
//!
//! ```text
//! for node in flow (declaration order):
//!     backend.supports(kind)?        ── no  → UnsupportedKernel, nothing recorded
//!     ports → Region (space A / B)   ── miss → MissingBuffer
//!     dry run && stateful backend?   ── yes → roofline estimate instead
//!     record launch report × repeat
//! ```

use crate::backend::{BackendType, Binding, ComputeBackend, KernelReport};
use crate::backends::roofline::bound_bytes;
use crate::backends::RooflineBackend;
use crate::error::{DispatchError, Result};
use serde::Serialize;
use softhier_arch::ArchitectureDescriptor;
use softhier_plan::{AddressSpace, KernelFlow, KernelKind, KernelNode, LayerPlan, PlanError, SpaceId, SpaceState};
use std::path::Path;
use tracing::{debug, info};

/// Outcome of one dispatched node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeResult {
    /// Node name
    pub name: String,
    /// Kernel kind
    pub kind: KernelKind,
    /// Launches the node stands for
    pub repeat: u64,
    /// One launch
    pub launch: KernelReport,
    /// All `repeat` launches
    pub total: KernelReport,
}

/// Per-node reports of one dispatch
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchResults {
    /// Backend that produced the reports
    pub backend: Option<String>,
    /// Whether the run was a dry run
    pub dry_run: bool,
    /// Nodes in launch order
    pub nodes: Vec<NodeResult>,
}

#[derive(Serialize)]
struct ResultsDocument<'a> {
    #[serde(flatten)]
    results: &'a DispatchResults,
    runtime_ns: f64,
    flop: u64,
    launches: u64,
}

impl DispatchResults {
    /// Result of the node called `name`
    pub fn get(&self, name: &str) -> Option<&NodeResult> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Number of recorded nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Wall time of the whole flow
    pub fn runtime_ns(&self) -> f64 {
        self.nodes.iter().map(|n| n.total.runtime_ns).sum()
    }

    /// FLOP of the whole flow
    pub fn flop(&self) -> u64 {
        self.nodes.iter().map(|n| n.total.flop).sum()
    }

    /// Launches, repeats included
    pub fn launches(&self) -> u64 {
        self.nodes.iter().map(|n| n.repeat).sum()
    }

    /// Pretty JSON with totals
    ///
    /// # Errors
    ///
    /// Returns a backend error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        let document = ResultsDocument {
            results: self,
            runtime_ns: self.runtime_ns(),
            flop: self.flop(),
            launches: self.launches(),
        };
        serde_json::to_string_pretty(&document).map_err(|e| DispatchError::backend(format!("results: {e}")))
    }

    /// Write [`Self::to_json`] to `path`
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be written.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        info!("✅ Dispatch results written to {}", path.display());
        Ok(())
    }
}

/// Drives a backend through a flow, one node at a time
#[derive(Debug)]
pub struct Dispatcher {
    estimator: RooflineBackend,
    results: DispatchResults,
}

impl Dispatcher {
    /// Dispatcher for flows planned on `arch`
    pub fn new(arch: &ArchitectureDescriptor) -> Self {
        Self {
            estimator: RooflineBackend::new(*arch),
            results: DispatchResults::default(),
        }
    }

    /// Results of the last run, complete or not
    pub const fn results(&self) -> &DispatchResults {
        &self.results
    }

    /// Dispatch a whole [`LayerPlan`]
    ///
    /// # Errors
    ///
    /// See [`Self::run`].
    pub fn run_plan(
        &mut self,
        plan: &LayerPlan,
        backend: &mut dyn ComputeBackend,
        dry_run: bool,
    ) -> Result<&DispatchResults> {
        self.run(&plan.flow, &plan.space_a, &plan.space_b, backend, dry_run)
    }

    /// Dispatch `flow` against its two frozen spaces
    ///
    /// Results recorded before a failing node stay available through
    /// [`Self::results`].
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - either space is not frozen or the flow reads before it writes
    /// - the backend does not support a node's kind
    /// - a port names a buffer its space does not hold
    /// - the backend fails
    pub fn run(
        &mut self,
        flow: &KernelFlow,
        space_a: &AddressSpace,
        space_b: &AddressSpace,
        backend: &mut dyn ComputeBackend,
        dry_run: bool,
    ) -> Result<&DispatchResults> {
        let backend_type = backend.backend_type();
        self.results = DispatchResults {
            backend: Some(backend_type.to_string()),
            dry_run,
            nodes: Vec::new(),
        };

        for space in [space_a, space_b] {
            if space.state() != SpaceState::Frozen {
                return Err(PlanError::invalid_state(format!("{}: dispatch before freeze", space.id())).into());
            }
        }
        flow.validate()?;

        let stand_in = dry_run && backend.is_stateful();
        if stand_in {
            info!("Dry run: {backend_type} backend replaced by roofline estimate");
        }

        for node in flow.nodes() {
            let kind = node.kind();
            if !backend.supports(kind) {
                return Err(DispatchError::unsupported_kernel(backend_type.to_string(), node.name(), kind));
            }
            let bindings = resolve(node, space_a, space_b)?;

            let launch = if stand_in {
                self.estimator.estimate(node.config(), bound_bytes(&bindings))
            } else {
                backend.invoke(node.name(), node.config(), &bindings, dry_run)?
            };
            debug!("{}: {} cycles × {}", node.name(), launch.cycles, node.repeat());

            self.results.nodes.push(NodeResult {
                name: node.name().to_string(),
                kind,
                repeat: node.repeat(),
                launch,
                total: launch.repeated(node.repeat()),
            });
        }

        if !stand_in {
            backend.flush()?;
        }

        info!(
            "✅ Dispatched {} nodes ({} launches) on {backend_type}: {:.1} µs, {} FLOP",
            self.results.len(),
            self.results.launches(),
            self.results.runtime_ns() / 1000.0,
            self.results.flop()
        );
        Ok(&self.results)
    }
}

/// Resolve every port of `node`, inputs first
fn resolve<'s>(node: &'s KernelNode, space_a: &'s AddressSpace, space_b: &'s AddressSpace) -> Result<Vec<Binding<'s>>> {
    let inputs = node.inputs().iter().map(|p| (p, false));
    let outputs = node.outputs().iter().map(|p| (p, true));

    inputs
        .chain(outputs)
        .map(|((port, binding), output)| -> Result<Binding<'s>> {
            let space = match binding.space {
                SpaceId::A => space_a,
                SpaceId::B => space_b,
            };
            let region = space
                .region(&binding.buffer)
                .ok_or_else(|| DispatchError::missing_buffer(node.name(), port.as_str(), binding.buffer.as_str()))?;
            Ok(Binding {
                port,
                output,
                space: binding.space,
                region,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unfrozen_space_rejected() {
        let arch = ArchitectureDescriptor::SOFTHIER_8X8_DUAL;
        let mut dispatcher = Dispatcher::new(&arch);
        let mut backend = RooflineBackend::new(arch);
        let a = AddressSpace::new(SpaceId::A);
        let b = AddressSpace::new(SpaceId::B);

        let err = dispatcher
            .run(&KernelFlow::default(), &a, &b, &mut backend, false)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Plan { source: PlanError::InvalidState { .. } }));
        assert!(dispatcher.results().is_empty());
    }

    #[test]
    fn test_results_json_has_totals() {
        let launch = KernelReport {
            runtime_ns: 2.0,
            cycles: 2,
            utilization: 0.25,
            arithmetic_intensity: 1.0,
            flop: 100,
            bytes: 100,
            achieved_flop_per_cycle: 50.0,
        };
        let results = DispatchResults {
            backend: Some(BackendType::Roofline.to_string()),
            dry_run: false,
            nodes: vec![NodeResult {
                name: "moe_routed_0_up".into(),
                kind: KernelKind::Gemm,
                repeat: 4,
                launch,
                total: launch.repeated(4),
            }],
        };
        let json: serde_json::Value = serde_json::from_str(&results.to_json().unwrap()).unwrap();
        assert_eq!(json["flop"], 400);
        assert_eq!(json["launches"], 4);
        assert_eq!(json["backend"], "Roofline");
        assert_eq!(json["nodes"][0]["kind"], "gemm");
        assert_eq!(json["nodes"][0]["launch"]["cycles"], 2);
    }
}
