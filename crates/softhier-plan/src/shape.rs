//! Tensor shapes of planned buffers

use serde::Serialize;

/// Tensor shape (dimensions, outermost first)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Shape {
    /// Dimensions (e.g., [tokens, embedding])
    pub dims: Vec<u64>,
}

impl Shape {
    /// Create new shape
    pub const fn new(dims: Vec<u64>) -> Self {
        Self { dims }
    }

    /// Get total number of elements
    #[must_use]
    pub fn total_elements(&self) -> u64 {
        self.dims.iter().product()
    }

    /// Get number of dimensions
    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Whether any dimension is zero
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.dims.iter().any(|&d| d == 0)
    }
}

impl<const N: usize> From<[u64; N]> for Shape {
    fn from(dims: [u64; N]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}
