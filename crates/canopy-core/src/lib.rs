//! Canopy Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every layer of the relay tree:
//! - Identifiers (PeerId, SessionId, OwnerId, EventId)
//! - Depth, the placement hint carried by every relay
//! - The error taxonomy
//! - Per-node configuration

pub mod config;
pub mod depth;
pub mod error;
pub mod id;

pub use config::*;
pub use depth::*;
pub use error::*;
pub use id::*;
