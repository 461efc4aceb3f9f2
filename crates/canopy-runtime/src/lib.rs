//! Canopy Runtime - Node orchestration
//!
//! This crate runs one relay-tree node:
//! 1. Bootstrap from signaling parameters
//! 2. Place and attach upstream, retrying on the attach timeout
//! 3. Classify inbound links and admit downstream peers
//! 4. Forward the stream, promoting limbo on the first track
//! 5. Rebalance on bump instructions and kick notices
//! 6. Aggregate viewer counts and flood control events
//! 7. Close: release the registry, close every link, stamp the session log
//!
//! [`Node`] is the sans-IO state machine; [`NodeDriver`] runs it on tokio.

pub mod action;
pub mod driver;
pub mod node;
pub mod timer;

pub use action::*;
pub use driver::*;
pub use node::*;
pub use timer::*;
