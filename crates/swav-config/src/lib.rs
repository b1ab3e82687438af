//! Runtime configuration shared by the swav-rs crates.

pub mod determinism;
pub mod tracing;
