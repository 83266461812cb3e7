//! Error types for kernel dispatch

use softhier_plan::{KernelKind, PlanError};
use thiserror::Error;

/// Result type alias for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors that can occur while dispatching a kernel flow
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The plan is not ready for dispatch or is inconsistent
    #[error("Plan error: {source}")]
    Plan {
        /// Underlying planning error
        #[from]
        source: PlanError,
    },

    /// The backend cannot run this kernel kind
    #[error("Backend {backend} does not support kernel {kind} (node {node})")]
    UnsupportedKernel {
        /// Backend that rejected the node
        backend: String,
        /// Node name
        node: String,
        /// Kernel kind
        kind: KernelKind,
    },

    /// A port is bound to a buffer its space does not hold
    #[error("{node}.{port}: buffer '{buffer}' not found")]
    MissingBuffer {
        /// Node name
        node: String,
        /// Port name
        port: String,
        /// Buffer name as bound
        buffer: String,
    },

    /// Backend failure
    #[error("Backend error: {reason}")]
    Backend {
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
}

impl DispatchError {
    /// Create an unsupported kernel error
    pub fn unsupported_kernel(backend: impl Into<String>, node: impl Into<String>, kind: KernelKind) -> Self {
        Self::UnsupportedKernel {
            backend: backend.into(),
            node: node.into(),
            kind,
        }
    }

    /// Create a missing buffer error
    pub fn missing_buffer(node: impl Into<String>, port: impl Into<String>, buffer: impl Into<String>) -> Self {
        Self::MissingBuffer {
            node: node.into(),
            port: port.into(),
            buffer: buffer.into(),
        }
    }

    /// Create a backend error
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }
}
