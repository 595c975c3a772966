//! Control channel messages exchanged with a WebSocket relay
//!
//! Every message is one JSON text frame on the control WebSocket
//! (`<bootstrap>/lease`). Relayed connections never touch the control channel;
//! each one gets its own data WebSocket at
//! `<bootstrap>/lease/<lease_id>/<connection_id>`.

use serde::{Deserialize, Serialize};

use crate::{Lease, RelayError, RelayResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client → relay: register a lease
    Register { lease: Lease },
    /// Relay → client: the oldest pending registration succeeded
    Registered { lease_id: String },
    /// Relay → client: the oldest pending registration failed
    Rejected { reason: String },
    /// Relay → client: a remote peer is waiting on a data socket
    Incoming {
        lease_id: String,
        connection_id: String,
    },
    /// Client → relay: drop a lease
    Deregister { lease_id: String },
}

impl ControlMessage {
    pub fn encode(&self) -> RelayResult<String> {
        serde_json::to_string(self).map_err(|e| RelayError::Protocol(e.to_string()))
    }

    pub fn decode(text: &str) -> RelayResult<Self> {
        serde_json::from_str(text).map_err(|e| RelayError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let msg = ControlMessage::Incoming {
            lease_id: "l1".to_string(),
            connection_id: "c1".to_string(),
        };
        assert_eq!(
            msg.encode().unwrap(),
            r#"{"type":"incoming","lease_id":"l1","connection_id":"c1"}"#
        );

        let decoded = ControlMessage::decode(r#"{"type":"registered","lease_id":"abc"}"#).unwrap();
        assert_eq!(
            decoded,
            ControlMessage::Registered {
                lease_id: "abc".to_string()
            }
        );
    }

    #[test]
    fn test_register_carries_lease() {
        let lease = Lease::new("ceversi", ["http/1.1"]).with_tags(["game"]);
        let text = ControlMessage::Register {
            lease: lease.clone(),
        }
        .encode()
        .unwrap();
        assert!(text.starts_with(r#"{"type":"register","lease":"#));
        assert_eq!(
            ControlMessage::decode(&text).unwrap(),
            ControlMessage::Register { lease }
        );
    }

    #[test]
    fn test_unknown_message_is_protocol_error() {
        let err = ControlMessage::decode(r#"{"type":"teleport"}"#).unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }
}
