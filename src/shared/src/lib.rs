//! Shared event model and taxonomy for the TrustScore platform

pub mod types;

pub use types::*;
