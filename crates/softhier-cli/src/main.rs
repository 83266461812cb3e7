//! `softhier` - layer planner for the SoftHier accelerator.
//!
//! ```text
//! USAGE:
//!   softhier plan    --config <toml> [--export plan.json]   Build and check one layer
//!   softhier run     --config <toml> [--dry-run] [--trace]  Dispatch the layer to a backend
//!   softhier summary --config <toml>                        Buffer sizes of both spaces
//!
//! Inputs are either one combined file (--config) or separate
//! --model / --workload files with --arch <toml> or --preset.
//! ```

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use softhier_arch::ArchitectureDescriptor;
use softhier_dispatch::{flop_breakdown, select_backend, BackendSelection, Dispatcher};
use softhier_plan::{
    build_layer, export, simplify, space_summary, ArchConfig, LayerPlan, ModelConfig, PlanConfig, SpaceId,
    WorkloadConfig,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "softhier", about = "SoftHier kernel scheduling and memory layout planner", version)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug); RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Build one layer, check it, and optionally export it as JSON.
    Plan {
        #[command(flatten)]
        inputs: Inputs,
        /// Write the plan (both spaces and the flow) to this file.
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Dispatch one layer to a compute backend.
    Run {
        #[command(flatten)]
        inputs: Inputs,
        /// Backend to dispatch to.
        #[arg(long, value_enum, default_value_t = BackendArg::Auto)]
        backend: BackendArg,
        /// Launch trace output (selects the trace backend under `auto`).
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Estimate only; stateful backends are never called.
        #[arg(long)]
        dry_run: bool,
        /// Collapse identical routed experts before dispatch.
        #[arg(long)]
        simplify: bool,
        /// Write per-node results to this file.
        #[arg(long)]
        results: Option<PathBuf>,
    },
    /// Print the buffer size breakdown of both spaces.
    Summary {
        #[command(flatten)]
        inputs: Inputs,
    },
}

#[derive(Args)]
struct Inputs {
    /// Combined architecture + model + workload file.
    #[arg(long, conflicts_with_all = ["arch", "preset", "model", "workload"])]
    config: Option<PathBuf>,
    /// Architecture file.
    #[arg(long, conflicts_with = "preset")]
    arch: Option<PathBuf>,
    /// Built-in architecture, used when no architecture file is given.
    #[arg(long, value_enum, default_value_t = Preset::Softhier32x32)]
    preset: Preset,
    /// Model file.
    #[arg(long, required_unless_present = "config")]
    model: Option<PathBuf>,
    /// Workload file.
    #[arg(long, required_unless_present = "config")]
    workload: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    /// 32×32 clusters, south-edge HBM.
    #[value(name = "32x32")]
    Softhier32x32,
    /// 8×8 clusters, west and south HBM edges.
    #[value(name = "8x8-dual")]
    Softhier8x8Dual,
}

impl Preset {
    const fn descriptor(self) -> ArchitectureDescriptor {
        match self {
            Self::Softhier32x32 => ArchitectureDescriptor::SOFTHIER_32X32,
            Self::Softhier8x8Dual => ArchitectureDescriptor::SOFTHIER_8X8_DUAL,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    /// Trace when --trace is given, roofline otherwise.
    Auto,
    /// Analytical estimate.
    Roofline,
    /// JSON-lines launch trace (needs --trace).
    Trace,
}

impl From<BackendArg> for BackendSelection {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => Self::Auto,
            BackendArg::Roofline => Self::Roofline,
            BackendArg::Trace => Self::Trace,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .init();

    match cli.command {
        Cmd::Plan { inputs, export } => cmd_plan(&inputs, export.as_deref())?,
        Cmd::Run {
            inputs,
            backend,
            trace,
            dry_run,
            simplify,
            results,
        } => cmd_run(&inputs, backend.into(), trace.as_deref(), dry_run, simplify, results.as_deref())?,
        Cmd::Summary { inputs } => cmd_summary(&inputs)?,
    }

    Ok(())
}

fn load(inputs: &Inputs) -> Result<(ArchitectureDescriptor, ModelConfig, WorkloadConfig)> {
    if let Some(path) = &inputs.config {
        let config = PlanConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?;
        let arch = config.arch.into_descriptor().context("invalid [arch] section")?;
        return Ok((arch, config.model, config.workload));
    }

    let arch = match &inputs.arch {
        Some(path) => ArchConfig::from_file(path)
            .and_then(ArchConfig::into_descriptor)
            .with_context(|| format!("loading {}", path.display()))?,
        None => inputs.preset.descriptor(),
    };
    let model_path = inputs.model.as_deref().context("--model is required without --config")?;
    let workload_path = inputs.workload.as_deref().context("--workload is required without --config")?;
    let model = ModelConfig::from_file(model_path).with_context(|| format!("loading {}", model_path.display()))?;
    let workload =
        WorkloadConfig::from_file(workload_path).with_context(|| format!("loading {}", workload_path.display()))?;
    Ok((arch, model, workload))
}

fn build(inputs: &Inputs) -> Result<(ArchitectureDescriptor, ModelConfig, LayerPlan)> {
    let (arch, model, workload) = load(inputs)?;
    tracing::info!("Planning {} on a {}×{} mesh", model.name, arch.mesh.x, arch.mesh.y);
    let plan = build_layer(&model, &workload, &arch).with_context(|| format!("planning {}", model.name))?;
    Ok((arch, model, plan))
}

fn cmd_plan(inputs: &Inputs, export_path: Option<&Path>) -> Result<()> {
    let (arch, model, plan) = build(inputs)?;

    println!("Model        : {}", model.name);
    println!("Mesh         : {}×{} clusters", arch.mesh.x, arch.mesh.y);
    println!("Kernels      : {}", plan.flow.len());
    for id in [SpaceId::A, SpaceId::B] {
        let space = plan.space(id);
        println!(
            "{:<13}: {:#x} .. {:#x}  ({} buffers)",
            id.to_string(),
            space.base(),
            space.base() + space.footprint(),
            space.len()
        );
    }

    if let Some(path) = export_path {
        export::write_json(&plan, path).with_context(|| format!("exporting to {}", path.display()))?;
        println!("Exported     : {}", path.display());
    }
    Ok(())
}

fn cmd_run(
    inputs: &Inputs,
    selection: BackendSelection,
    trace: Option<&Path>,
    dry_run: bool,
    collapse: bool,
    results_path: Option<&Path>,
) -> Result<()> {
    let (arch, model, plan) = build(inputs)?;
    let flow = if collapse { simplify(&plan.flow) } else { plan.flow.clone() };

    let mut backend = select_backend(selection, &arch, trace).context("selecting backend")?;
    let mut dispatcher = Dispatcher::new(&arch);
    let results = dispatcher
        .run(&flow, &plan.space_a, &plan.space_b, backend.as_mut(), dry_run)
        .with_context(|| format!("dispatching {} on {}", model.name, backend.backend_type()))?;

    println!("{:<28} {:>6} {:>12} {:>8}", "node", "repeat", "runtime µs", "util %");
    for node in &results.nodes {
        println!(
            "{:<28} {:>6} {:>12.3} {:>8.1}",
            node.name,
            node.repeat,
            node.total.runtime_ns / 1000.0,
            node.launch.utilization * 100.0
        );
    }
    println!();
    println!("Runtime      : {:.3} µs", results.runtime_ns() / 1000.0);
    println!("Launches     : {}", results.launches());
    println!();
    println!("{}", flop_breakdown(results));

    if let Some(path) = results_path {
        results
            .write_json(path)
            .with_context(|| format!("writing results to {}", path.display()))?;
    }
    Ok(())
}

fn cmd_summary(inputs: &Inputs) -> Result<()> {
    let (_, _, plan) = build(inputs)?;
    println!("{}", space_summary(&plan.space_a));
    println!("{}", space_summary(&plan.space_b));
    Ok(())
}
