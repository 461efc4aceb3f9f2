//! Connection metadata bundle
//!
//! Attached by the caller when a link is opened. The receiving node reads it
//! once to decide what kind of link it is being offered.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use canopy_core::{CanopyError, CanopyResult, Depth, SessionToken};

/// Control-only notices sent on a short-lived link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoticeKind {
    /// The sender (former parent) has evicted the receiver
    Kicked,
    /// The sender has been relocated under the receiver
    Relocated,
}

/// Metadata attached to an outgoing connection or call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectMetadata {
    /// Shared session token; absent on viewer links
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<SessionToken>,

    /// Depth of the connecting relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<Depth>,

    /// The link is the result of a relocation
    #[serde(default)]
    pub bumped: bool,

    /// Viewer count the connecting relay currently reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewers: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<NoticeKind>,

    /// The link only replicates control-plane traffic
    #[serde(default)]
    pub replica: bool,
}

impl ConnectMetadata {
    /// Subtree attach from a relay to its chosen parent
    pub fn subtree(token: SessionToken, depth: Depth, bumped: bool, viewers: u32) -> Self {
        ConnectMetadata {
            token: Some(token),
            depth: Some(depth),
            bumped,
            viewers: Some(viewers),
            ..Default::default()
        }
    }

    /// Plain viewer connection
    pub fn viewer() -> Self {
        ConnectMetadata::default()
    }

    /// Control-replica link opened by a parent toward a downstream peer
    pub fn replica() -> Self {
        ConnectMetadata {
            replica: true,
            ..Default::default()
        }
    }

    /// Control-only notice
    pub fn notice(token: SessionToken, kind: NoticeKind) -> Self {
        ConnectMetadata {
            token: Some(token),
            notice: Some(kind),
            ..Default::default()
        }
    }

    /// A parent offering itself as the receiver's new upstream
    pub fn adopt(token: SessionToken, bumped: bool) -> Self {
        ConnectMetadata {
            token: Some(token),
            bumped,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> CanopyResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| CanopyError::InvalidMetadata(e.to_string()))
    }

    pub fn decode(buf: &[u8]) -> CanopyResult<Self> {
        serde_json::from_slice(buf).map_err(|e| CanopyError::InvalidMetadata(e.to_string()))
    }
}
