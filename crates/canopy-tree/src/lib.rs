//! Canopy Tree - the shape of the relay overlay
//!
//! Pure decision logic, free of I/O:
//! - Placement: where a node attaches
//! - Downstream: the bounded set of links a node forwards to, plus limbo
//! - Bump: which occupant is relocated to admit a newcomer
//! - Redirect: which child takes a newcomer when nothing can be bumped
//! - Tally: viewer counts flowing back toward the origin
//! - Flood: exactly-once delivery of out-of-band control events
//!
//! # Depth
//!
//! Depth is 1 at the viewer-facing layer and grows by one per hop toward the
//! origin. A direct child of a node at depth `d` is expected to carry
//! `d - 1`; a child that does not is "mismatched" and is the first candidate
//! for relocation.

pub mod bump;
pub mod downstream;
pub mod flood;
pub mod placement;
pub mod redirect;
pub mod tally;

pub use bump::*;
pub use downstream::*;
pub use flood::*;
pub use placement::*;
pub use redirect::*;
pub use tally::*;
