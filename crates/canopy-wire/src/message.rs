//! Control messages exchanged over open data links

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use canopy_core::{CanopyError, CanopyResult, Depth, EventId, PeerId, SessionToken};

/// Name of the device-change control event
pub const DEVICE_CHANGE: &str = "device-change";

/// Out-of-band control event flooded through the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEvent {
    pub id: EventId,
    pub name: String,
    /// Set by every relay that re-sends the event
    #[serde(default)]
    pub propagated: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ControlEvent {
    pub fn new(id: EventId, name: impl Into<String>, payload: serde_json::Value) -> Self {
        ControlEvent {
            id,
            name: name.into(),
            propagated: false,
            payload,
        }
    }

    pub fn device_change(id: EventId, payload: serde_json::Value) -> Self {
        ControlEvent::new(id, DEVICE_CHANGE, payload)
    }

    /// Copy tagged for re-sending
    pub fn relayed(&self) -> Self {
        ControlEvent {
            propagated: true,
            ..self.clone()
        }
    }
}

/// A message on a data link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Aggregated viewer count, child to parent
    Viewers { viewers: u32 },

    /// Downstream peer is ready to receive the media call
    Ready,

    /// Relocation instruction, parent to evicted occupant
    Relocate {
        token: SessionToken,
        new_parent: PeerId,
        depth: Depth,
    },

    /// Full parent pointing a newcomer at one of its children
    Redirect { token: SessionToken, parent: PeerId },

    /// Flooded control event
    Control(ControlEvent),
}

impl ControlMessage {
    pub fn encode(&self) -> CanopyResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| CanopyError::InvalidMetadata(e.to_string()))
    }

    pub fn decode(buf: &[u8]) -> CanopyResult<Self> {
        serde_json::from_slice(buf).map_err(|e| CanopyError::InvalidMetadata(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_viewers_wire_shape() {
        let bytes = ControlMessage::Viewers { viewers: 7 }.encode().unwrap();
        assert_eq!(&bytes[..], b"{\"type\":\"viewers\",\"viewers\":7}");
    }

    #[test]
    fn test_redirect_wire_shape() {
        let message = ControlMessage::Redirect {
            token: SessionToken::new("k"),
            parent: PeerId::new(12),
        };
        let bytes = message.encode().unwrap();
        assert_eq!(
            &bytes[..],
            b"{\"type\":\"redirect\",\"token\":\"k\",\"parent\":12}"
        );
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_relayed_sets_tag_only() {
        let event = ControlEvent::device_change(
            EventId::new(PeerId::new(9), 1),
            serde_json::json!({ "camera": "front" }),
        );
        let relayed = event.relayed();
        assert!(!event.propagated);
        assert!(relayed.propagated);
        assert_eq!(relayed.id, event.id);
        assert_eq!(relayed.payload, event.payload);
    }

    #[test]
    fn test_control_event_decodes() {
        let raw = br#"{"type":"control","id":{"origin":5,"seq":2},"name":"device-change"}"#;
        match ControlMessage::decode(raw).unwrap() {
            ControlMessage::Control(event) => {
                assert_eq!(event.id, EventId::new(PeerId::new(5), 2));
                assert!(!event.propagated);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = ControlMessage::decode(&data);
        }
    }
}
