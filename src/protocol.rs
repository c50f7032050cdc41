//! Wire protocol between clients and the signaling relay.
//!
//! Every frame is a JSON text frame tagged by `message_type`. Negotiation
//! payloads are opaque to the relay and forwarded verbatim.

use serde::{Deserialize, Serialize};

pub type SessionId = String;
pub type RoomId = String;

/// Join rejection reasons as they appear on the wire.
pub mod reasons {
    pub const FULL: &str = "full";
    pub const FORBIDDEN: &str = "forbidden";
    pub const ALREADY_JOINED: &str = "already-joined";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationKind {
    Offer,
    Answer,
    IceCandidate,
}

/// One step of an offer/answer/candidate exchange between two members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationMessage {
    pub to: SessionId,
    pub from: SessionId,
    #[serde(rename = "type")]
    pub kind: NegotiationKind,
    pub payload: serde_json::Value,
}

/// A room member as reported to other clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub session_id: SessionId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum ClientMessage {
    Join {
        room_id: RoomId,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Leave {
        room_id: RoomId,
    },
    Signal(NegotiationMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum ServerMessage {
    Welcome {
        session_id: SessionId,
    },
    JoinResult {
        accepted: bool,
        #[serde(default)]
        members: Vec<MemberInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ParticipantJoined {
        session_id: SessionId,
        name: String,
    },
    ParticipantLeft {
        session_id: SessionId,
    },
    Signal(NegotiationMessage),
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn accepted(members: Vec<MemberInfo>) -> Self {
        ServerMessage::JoinResult {
            accepted: true,
            members,
            reason: None,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        ServerMessage::JoinResult {
            accepted: false,
            members: Vec::new(),
            reason: Some(reason.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn negotiation_message_wire_field_names() {
        let msg = ClientMessage::Signal(NegotiationMessage {
            to: "b".into(),
            from: "a".into(),
            kind: NegotiationKind::IceCandidate,
            payload: json!({"attempt": 1}),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["message_type"], "Signal");
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["to"], "b");
        assert_eq!(value["from"], "a");
    }

    #[test]
    fn full_room_rejection_shape() {
        let value = serde_json::to_value(ServerMessage::rejected(reasons::FULL)).unwrap();
        assert_eq!(
            value,
            json!({
                "message_type": "JoinResult",
                "accepted": false,
                "members": [],
                "reason": "full"
            })
        );
    }

    #[test]
    fn join_without_user_id_parses() {
        let text = r#"{"message_type":"Join","room_id":"r","display_name":"Ann"}"#;
        let msg: ClientMessage = serde_json::from_str(text).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Join {
                room_id: "r".into(),
                display_name: "Ann".into(),
                user_id: None,
            }
        );
    }
}
