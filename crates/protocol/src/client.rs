//! Client → Server messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ApprovalDecision, Attachment, HookPhase, Provider};

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Subscriptions
    SubscribeList,
    SubscribeSession {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        since_revision: Option<u64>,
    },
    UnsubscribeSession {
        session_id: String,
    },

    // Session management
    CreateSession {
        provider: Provider,
        cwd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        approval_policy: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sandbox_mode: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        workstream_id: Option<String>,
    },
    ResumeSession {
        session_id: String,
    },
    ForkSession {
        source_session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        nth_user_message: Option<u32>,
    },

    // Session actions
    SendMessage {
        session_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
    SteerTurn {
        session_id: String,
        content: String,
    },
    ApproveTool {
        session_id: String,
        request_id: String,
        decision: ApprovalDecision,
        #[serde(skip_serializing_if = "Option::is_none")]
        amended_input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    AnswerQuestion {
        session_id: String,
        request_id: String,
        answer: String,
    },
    InterruptSession {
        session_id: String,
    },
    EndSession {
        session_id: String,
    },
    RenameSession {
        session_id: String,
        name: Option<String>,
    },

    // Context management
    CompactContext {
        session_id: String,
    },
    UndoLastTurn {
        session_id: String,
    },
    RollbackTurns {
        session_id: String,
        num_turns: u32,
    },

    // Review comments
    AddReviewComment {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        line: Option<i64>,
        content: String,
    },
    UpdateReviewComment {
        session_id: String,
        comment_id: i64,
        content: String,
    },
    DeleteReviewComment {
        session_id: String,
        comment_id: i64,
    },
    ListReviewComments {
        session_id: String,
    },

    // Claude hook-bridge transport (posted by the CLI hook script)
    ClaudeSessionStart {
        session_id: String,
        cwd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcript_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_mode: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        terminal_session_id: Option<String>,
    },
    ClaudeSessionEnd {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ClaudeStatusEvent {
        session_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ClaudeToolEvent {
        session_id: String,
        phase: HookPhase,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_output: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    ClaudeSubagentEvent {
        session_id: String,
        phase: HookPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}
