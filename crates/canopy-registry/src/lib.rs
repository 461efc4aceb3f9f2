//! Placement registry for the relay tree
//!
//! The registry is an external shared document store with one document per
//! node. Nodes never share memory; the registry's single-document atomic
//! operations are the only cross-node serialization point.
//!
//! # Document shape
//!
//! ```text
//! { peer, owner, depth, children: [ { peer, depth, timestamp } ] }
//! ```
//!
//! A placement decision reads a snapshot (`find_open_slot`) and writes later
//! (`attach_as_child`). Two concurrent placements may pick the same slot;
//! the tree tolerates this and the attach timeout acts as the retry loop.
//!
//! The session log is a second, append-only collection used only for
//! observability.

pub mod entry;
pub mod log;
pub mod memory;
pub mod store;

pub use entry::{ChildSummary, RegistryEntry};
pub use log::{LogId, MemorySessionLog, SessionLog, SessionLogEntry};
pub use memory::MemoryRegistry;
pub use store::Registry;
