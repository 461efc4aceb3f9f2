//! Canopy Transport Layer - Peer link abstraction
//!
//! This crate provides:
//! - Link handles and the events a link raises
//! - Observable transport states of media calls
//! - The link table each node keeps
//! - The [`PeerTransport`] seam a concrete media/data stack implements
//!
//! ICE/SDP negotiation lives behind the seam; only the observable states
//! matter here.

pub mod link;
pub mod table;

pub use link::*;
pub use table::*;
