//! FLOP breakdown of a dispatched layer

use crate::dispatch::DispatchResults;
use serde::Serialize;
use softhier_plan::KernelKind;
use std::fmt;

/// FLOP grouped by layer section
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlopBreakdown {
    /// Attention projections (`attn_*_proj`)
    #[serde(rename = "ATN_proj")]
    pub attention_proj: u64,
    /// Attention core (flat attention, flat MLA)
    #[serde(rename = "ATN_core")]
    pub attention_core: u64,
    /// Feed-forward and MoE (`ffn_*`, `moe_*`)
    #[serde(rename = "FFN")]
    pub ffn: u64,
    /// Everything else (norms, residuals, rope)
    pub other: u64,
}

impl FlopBreakdown {
    /// Sum of all sections
    pub const fn total(&self) -> u64 {
        self.attention_proj + self.attention_core + self.ffn + self.other
    }
}

fn is_attention_proj(name: &str) -> bool {
    name.starts_with("attn_") && name.contains("_proj")
}

/// Group the FLOP of every recorded node, repeats included
pub fn flop_breakdown(results: &DispatchResults) -> FlopBreakdown {
    let mut breakdown = FlopBreakdown::default();
    for node in &results.nodes {
        let flop = node.total.flop;
        if matches!(node.kind, KernelKind::FlatAttention | KernelKind::FlatMla) {
            breakdown.attention_core += flop;
        } else if is_attention_proj(&node.name) {
            breakdown.attention_proj += flop;
        } else if node.name.starts_with("moe_") || node.name.starts_with("ffn_") {
            breakdown.ffn += flop;
        } else {
            breakdown.other += flop;
        }
    }
    breakdown
}

impl fmt::Display for FlopBreakdown {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.total().max(1) as f64;
        for (label, flop) in [
            ("ATN_proj", self.attention_proj),
            ("ATN_core", self.attention_core),
            ("FFN", self.ffn),
            ("other", self.other),
        ] {
            writeln!(
                f,
                "{label:<10}{:>12.3} GFLOP  {:>5.1}%",
                flop as f64 / 1e9,
                flop as f64 / total * 100.0
            )?;
        }
        write!(f, "{:<10}{:>12.3} GFLOP", "total", self.total() as f64 / 1e9)
    }
}
