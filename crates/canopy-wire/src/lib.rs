//! Canopy Wire - What travels over a peer link
//!
//! Two things cross a link:
//! - the metadata bundle attached when the link is opened
//! - control messages sent over an open data link
//!
//! Both are JSON on the wire. Inbound metadata is decoded once at the
//! boundary into [`InboundClass`], which the node then matches exhaustively.

pub mod classify;
pub mod message;
pub mod metadata;

pub use classify::*;
pub use message::*;
pub use metadata::*;
