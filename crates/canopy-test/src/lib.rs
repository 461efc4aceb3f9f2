//! Canopy Test Harness - Multi-node overlay simulation
//!
//! This crate provides:
//! - A deterministic in-process overlay of relay nodes and viewers
//! - A viewer stub speaking the leaf side of the link protocol
//! - Standard topologies and the end-to-end scenario suite

pub mod overlay;
pub mod scenarios;
pub mod viewer;

pub use overlay::*;
pub use scenarios::*;
pub use viewer::*;
