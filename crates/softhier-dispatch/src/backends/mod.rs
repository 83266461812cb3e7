//! Compute backend implementations
//!
//! - **Roofline**: analytical estimate, no state, always safe to call
//! - **Trace**: JSON-lines launch trace for an external simulator harness

pub mod roofline;
pub mod trace;

pub use roofline::RooflineBackend;
pub use trace::TraceBackend;
