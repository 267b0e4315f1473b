//! OrbitDock Protocol
//!
//! Shared types for communication between OrbitDock server and clients.
//! These types are serialized as JSON over WebSocket, one object per frame.
//!
//! Session-scoped frames replayed from the event log carry a top-level
//! `revision` field; live frames do not.

use uuid::Uuid;

pub mod client;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::{error_code, ServerMessage};
pub use types::*;

/// Wire protocol version, sent in the `hello` frame.
pub const PROTOCOL_VERSION: u32 = 3;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Serialize a frame for live delivery (no revision field).
pub fn encode_frame(msg: &ServerMessage) -> String {
    serde_json::to_string(msg).unwrap_or_else(|_| {
        r#"{"type":"error","code":"internal","message":"serialization failure"}"#.to_string()
    })
}

/// Serialize a frame for the replay log, injecting `revision` at the
/// top level of the JSON object.
pub fn encode_frame_with_revision(msg: &ServerMessage, revision: u64) -> String {
    match serde_json::to_value(msg) {
        Ok(serde_json::Value::Object(mut map)) => {
            map.insert("revision".to_string(), serde_json::json!(revision));
            serde_json::Value::Object(map).to_string()
        }
        _ => encode_frame(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_tagged_snake_case() {
        let frame = encode_frame(&ServerMessage::SessionRemoved {
            session_id: "s1".into(),
        });
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "session_removed");
        assert_eq!(value["session_id"], "s1");
        assert!(value.get("revision").is_none());
    }

    #[test]
    fn replay_frames_carry_top_level_revision() {
        let frame = encode_frame_with_revision(
            &ServerMessage::TokensUpdated {
                session_id: "s1".into(),
                usage: TokenUsage::default(),
            },
            42,
        );
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "tokens_updated");
        assert_eq!(value["revision"], 42);
    }

    #[test]
    fn client_messages_round_trip() {
        let json = r#"{"type":"subscribe_session","session_id":"s1","since_revision":10}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SubscribeSession {
                session_id: "s1".into(),
                since_revision: Some(10),
            }
        );

        let json = r#"{"type":"approve_tool","session_id":"s1","request_id":"r1","decision":"approved_for_session"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::ApproveTool {
                decision: ApprovalDecision::ApprovedForSession,
                ..
            }
        ));
    }
}
