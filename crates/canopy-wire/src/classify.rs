//! Inbound connection classification
//!
//! Every inbound link is classified exactly once, from its metadata, before
//! the node touches any of its sets.

use canopy_core::{CanopyError, CanopyResult, Depth, SessionToken};

use crate::{ConnectMetadata, NoticeKind};

/// What an inbound link is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundClass {
    /// A relay attaching its subtree from below
    SubtreeAttach {
        depth: Depth,
        viewers: u32,
        bumped: bool,
    },
    /// Control-only notice; closed right after delivery
    RelocationNotice(NoticeKind),
    /// A viewer; only legal at the viewer-facing layer
    ViewerAttach,
    /// Control-plane replication from a parent; never counted as a viewer
    ControlReplica,
    /// A trusted peer offering itself as this node's upstream
    ParentRenegotiate { bumped: bool },
}

impl InboundClass {
    /// Classify inbound metadata against this node's session token
    pub fn classify(metadata: &ConnectMetadata, token: &SessionToken) -> CanopyResult<Self> {
        if metadata.replica {
            return Ok(InboundClass::ControlReplica);
        }

        let Some(offered) = metadata.token.as_ref() else {
            if metadata.notice.is_some() || metadata.depth.is_some() {
                return Err(CanopyError::ProtocolViolation(
                    "tree-internal metadata without session token".into(),
                ));
            }
            return Ok(InboundClass::ViewerAttach);
        };

        if offered != token {
            return Err(CanopyError::ProtocolViolation("session token mismatch".into()));
        }

        if let Some(kind) = metadata.notice {
            return Ok(InboundClass::RelocationNotice(kind));
        }

        match metadata.depth {
            Some(depth) => Ok(InboundClass::SubtreeAttach {
                depth,
                viewers: metadata.viewers.unwrap_or(0),
                bumped: metadata.bumped,
            }),
            None => Ok(InboundClass::ParentRenegotiate {
                bumped: metadata.bumped,
            }),
        }
    }
}
