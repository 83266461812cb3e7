//! Per-buffer size breakdown of an address space
//!
//! Aliases occupy no storage of their own and are left out. The weights of
//! routed experts are folded into one row per projection kind, since a
//! model with hundreds of experts would otherwise drown the table.

use crate::space::{AddressSpace, SpaceId};
use std::fmt;

/// One row of a [`SpaceSummary`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRow {
    /// Buffer name, or a `*` pattern for aggregated expert weights
    pub name: String,
    /// Buffers folded into this row
    pub count: usize,
    /// Bytes
    pub size: u64,
}

/// Size breakdown of one space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceSummary {
    /// Space summarised
    pub space: SpaceId,
    /// Rows in allocation order
    pub rows: Vec<SummaryRow>,
    /// Footprint including alignment padding
    pub footprint: u64,
}

impl SpaceSummary {
    /// Bytes held by buffers (excludes padding)
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.rows.iter().map(|r| r.size).sum()
    }
}

/// Aggregation key for `moe_routed_<e>_<proj>_proj_weight`
fn routed_weight_group(name: &str) -> Option<String> {
    let rest = name.strip_prefix("moe_routed_")?;
    let (expert, tail) = rest.split_once('_')?;
    if expert.is_empty() || !expert.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    matches!(tail, "up_proj_weight" | "gate_proj_weight" | "down_proj_weight").then(|| format!("moe_routed_*_{tail}"))
}

/// Summarise `space`
#[must_use]
pub fn space_summary(space: &AddressSpace) -> SpaceSummary {
    let mut rows: Vec<SummaryRow> = Vec::new();
    for buffer in space.buffers() {
        let (name, grouped) = match routed_weight_group(buffer.name()) {
            Some(group) => (group, true),
            None => (buffer.name().to_string(), false),
        };
        if grouped {
            if let Some(row) = rows.iter_mut().find(|r| r.name == name) {
                row.count += 1;
                row.size += buffer.size();
                continue;
            }
        }
        rows.push(SummaryRow {
            name,
            count: 1,
            size: buffer.size(),
        });
    }
    SpaceSummary {
        space: space.id(),
        rows,
        footprint: space.footprint(),
    }
}

#[allow(clippy::cast_precision_loss)]
fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

impl fmt::Display for SpaceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {:.2} MiB", self.space, mib(self.footprint))?;
        for row in &self.rows {
            #[allow(clippy::cast_precision_loss)]
            let share = if self.footprint == 0 {
                0.0
            } else {
                100.0 * row.size as f64 / self.footprint as f64
            };
            let label = if row.count > 1 {
                format!("{} (×{})", row.name, row.count)
            } else {
                row.name.clone()
            };
            writeln!(f, "  {label:<40} {:>12.3} MiB  {share:>5.1}%", mib(row.size))?;
        }
        Ok(())
    }
}
