//! Element types carried by planned buffers.

/// Tensor element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// IEEE half precision.
    Fp16,
    /// 8-bit float (E4M3/E5M2, same width).
    Fp8,
    /// 32-bit unsigned index (positions, expert ids).
    U32,
}

impl DType {
    /// Width of one element in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        match self {
            Self::Fp16 => 2,
            Self::Fp8 => 1,
            Self::U32 => 4,
        }
    }

    /// Lower-case name used in configuration and export files.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fp16 => "fp16",
            Self::Fp8 => "fp8",
            Self::U32 => "uint32",
        }
    }

    /// Parse a configuration name (`fp16`, `fp8`, `uint32`).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "fp16" => Some(Self::Fp16),
            "fp8" | "fp8_e4m3" | "fp8_e5m2" => Some(Self::Fp8),
            "uint32" | "u32" => Some(Self::U32),
            _ => None,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
