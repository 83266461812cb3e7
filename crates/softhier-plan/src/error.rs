//! Error types for layer planning

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for planning operations
pub type Result<T> = std::result::Result<T, PlanError>;

/// Errors that can occur while tiling, allocating or building a kernel flow
///
/// Every variant aborts the current build. There is no partial plan.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Tile/scale/split parameters cannot satisfy the hardware constraints
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Reason for failure
        reason: String,
    },

    /// An address space or scratchpad budget is exceeded
    #[error("Capacity exceeded: {reason}")]
    Capacity {
        /// Reason for failure
        reason: String,
    },

    /// The architecture has an unsupported number of active HBM edges
    #[error("Unsupported HBM topology: {active_edges} active edges (expected 1 or 2)")]
    Topology {
        /// Edges with at least one channel
        active_edges: usize,
    },

    /// Kernel kind name not recognised
    #[error("Unsupported kernel kind: {kind}")]
    UnsupportedKernel {
        /// Name as given
        kind: String,
    },

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid plan state: {reason}")]
    InvalidState {
        /// Reason for failure
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed
    #[error("Failed to parse {path}: {reason}")]
    Parse {
        /// File that was read
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// Plan could not be serialized
    #[error("Export failed: {source}")]
    Export {
        /// Underlying serializer error
        #[from]
        source: serde_json::Error,
    },
}

impl PlanError {
    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a capacity error
    pub fn capacity(reason: impl Into<String>) -> Self {
        Self::Capacity {
            reason: reason.into(),
        }
    }

    /// Create an unsupported kernel error
    pub fn unsupported_kernel(kind: impl Into<String>) -> Self {
        Self::UnsupportedKernel { kind: kind.into() }
    }

    /// Create an invalid state error
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Create a parse error
    pub fn parse(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
