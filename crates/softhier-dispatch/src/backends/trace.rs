//! Launch trace backend
//!
//! Writes one JSON object per launch, one per line, for an external
//! simulator harness to replay:
//!
//! ```text
//! {"seq":0,"node":"attn_norm","kind":"norm","config":{"m":8,"n":1024},
//!  "bindings":[{"port":"input","dir":"in","space":"spaceB","buffer":"layer_input","addr":"0x…","size":8192}, …]}
//! ```
//!
//! The launch itself is not simulated here; the reported figures are the
//! roofline estimate.

use super::roofline::{bound_bytes, RooflineBackend};
use crate::backend::{BackendType, Binding, ComputeBackend, KernelReport};
use crate::error::{DispatchError, Result};
use serde::Serialize;
use softhier_arch::ArchitectureDescriptor;
use softhier_plan::{KernelConfig, KernelKind, SpaceId};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

#[derive(Serialize)]
struct TraceBinding<'a> {
    port: &'a str,
    dir: &'static str,
    space: SpaceId,
    buffer: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    belongs: Option<&'a str>,
    addr: String,
    size: u64,
}

#[derive(Serialize)]
struct TraceRecord<'a> {
    seq: u64,
    node: &'a str,
    kind: KernelKind,
    config: &'a KernelConfig,
    bindings: Vec<TraceBinding<'a>>,
}

/// Stateful backend writing a launch trace
#[derive(Debug)]
pub struct TraceBackend<W: Write> {
    writer: W,
    estimator: RooflineBackend,
    launches: u64,
}

impl TraceBackend<BufWriter<File>> {
    /// Create (truncate) a trace file
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be created.
    pub fn create(path: &Path, arch: &ArchitectureDescriptor) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file), arch))
    }
}

impl<W: Write> TraceBackend<W> {
    /// Trace into any writer
    pub fn new(writer: W, arch: &ArchitectureDescriptor) -> Self {
        Self {
            writer,
            estimator: RooflineBackend::new(*arch),
            launches: 0,
        }
    }

    /// Launches written so far
    pub const fn launches(&self) -> u64 {
        self.launches
    }

    /// Flush and return the writer
    ///
    /// # Errors
    ///
    /// Returns an I/O error if flushing fails.
    pub fn into_inner(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: Write + std::fmt::Debug> ComputeBackend for TraceBackend<W> {
    fn backend_type(&self) -> BackendType {
        BackendType::Trace
    }

    fn supports(&self, _kind: KernelKind) -> bool {
        true
    }

    fn is_stateful(&self) -> bool {
        true
    }

    fn invoke(
        &mut self,
        node: &str,
        config: &KernelConfig,
        bindings: &[Binding<'_>],
        _dry_run: bool,
    ) -> Result<KernelReport> {
        let record = TraceRecord {
            seq: self.launches,
            node,
            kind: config.kind(),
            config,
            bindings: bindings
                .iter()
                .map(|b| TraceBinding {
                    port: b.port,
                    dir: if b.output { "out" } else { "in" },
                    space: b.space,
                    buffer: b.region.name,
                    belongs: b.region.parent,
                    addr: format!("{:#x}", b.region.address),
                    size: b.region.size,
                })
                .collect(),
        };
        serde_json::to_writer(&mut self.writer, &record)
            .map_err(|e| DispatchError::backend(format!("{node}: trace record: {e}")))?;
        self.writer.write_all(b"\n")?;
        self.launches += 1;
        debug!("{node}: traced launch {}", record.seq);

        Ok(self.estimator.estimate(config, bound_bytes(bindings)))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
