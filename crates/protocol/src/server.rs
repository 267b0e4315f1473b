//! Server → Client messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::*;

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Handshake
    Hello {
        version: String,
        protocol_version: u32,
    },

    // Full state sync
    SessionsList {
        sessions: Vec<SessionSummary>,
    },
    SessionSnapshot {
        session: SessionSnapshot,
    },

    // List lifecycle
    SessionAdded {
        session: SessionSummary,
    },
    SessionRemoved {
        session_id: String,
    },

    // Incremental updates
    SessionDelta {
        session_id: String,
        changes: StateChanges,
    },
    MessageAppended {
        session_id: String,
        message: Message,
    },
    MessageUpdated {
        session_id: String,
        message_id: String,
        changes: MessageChanges,
    },
    ApprovalRequested {
        session_id: String,
        request: ApprovalRequest,
    },
    TokensUpdated {
        session_id: String,
        usage: TokenUsage,
    },
    SessionEnded {
        session_id: String,
        reason: String,
    },

    // Context management
    UndoStarted {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    UndoCompleted {
        session_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ThreadRolledBack {
        session_id: String,
        num_turns: u32,
    },
    ContextCompacted {
        session_id: String,
    },

    // Pass-through capability state
    SkillsUpdated {
        session_id: String,
        skills: Vec<String>,
    },
    McpState {
        session_id: String,
        servers: Value,
    },

    // Review comments
    ReviewComments {
        session_id: String,
        comments: Vec<ReviewComment>,
    },

    // Errors
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl ServerMessage {
    /// Error codes are a closed set; helpers keep callsites aligned.
    pub fn error(code: &str, message: impl Into<String>, session_id: Option<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
            session_id,
        }
    }

    /// The session this frame is scoped to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::SessionSnapshot { session } => Some(&session.id),
            ServerMessage::SessionDelta { session_id, .. }
            | ServerMessage::MessageAppended { session_id, .. }
            | ServerMessage::MessageUpdated { session_id, .. }
            | ServerMessage::ApprovalRequested { session_id, .. }
            | ServerMessage::TokensUpdated { session_id, .. }
            | ServerMessage::SessionEnded { session_id, .. }
            | ServerMessage::UndoStarted { session_id, .. }
            | ServerMessage::UndoCompleted { session_id, .. }
            | ServerMessage::ThreadRolledBack { session_id, .. }
            | ServerMessage::ContextCompacted { session_id }
            | ServerMessage::SkillsUpdated { session_id, .. }
            | ServerMessage::McpState { session_id, .. }
            | ServerMessage::ReviewComments { session_id, .. }
            | ServerMessage::SessionRemoved { session_id } => Some(session_id),
            ServerMessage::Error { session_id, .. } => session_id.as_deref(),
            _ => None,
        }
    }
}

/// Error codes the gateway emits. Clients switch on these.
pub mod error_code {
    pub const LAGGED: &str = "lagged";
    pub const UNKNOWN_SESSION: &str = "unknown_session";
    pub const INVALID_PAYLOAD: &str = "invalid_payload";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const INTERNAL: &str = "internal";
}
