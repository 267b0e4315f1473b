//! Claude CLI hook bridge.
//!
//! The CLI hook script POSTs JSON to `/api/hook`; the same five message
//! types are also accepted over the WebSocket (fused transport). Hook
//! sessions are observed, not driven: they run with a `NullConnector` and
//! every hook event is translated into a transition `Input`.
//!
//! **Deferred session creation:** `claude_session_start` only caches
//! metadata in memory. The session is materialized when the first
//! actionable hook (status/tool/subagent) arrives; a `claude_session_end`
//! that arrives first discards the pending entry silently, so bootstrap
//! invocations (`claude -c`) never leave ghost rows.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use orbitdock_connector_core::NullConnector;
use orbitdock_protocol::{
    ApprovalDecision, ApprovalKind, ApprovalRequest, ClientMessage, HookPhase, IntegrationMode,
    Message, MessageChanges, MessageRole, Provider, StateChanges,
};

use crate::registry::SessionRegistry;
use crate::session::SessionConfig;
use crate::session_command::SessionCommand;
use crate::transition::{Input, SessionState};
use crate::util::now_iso8601;
use crate::git;

/// Cached metadata from a `claude_session_start` hook, held in memory until
/// the first actionable hook materializes the session.
pub struct PendingHookSession {
    pub cwd: String,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub terminal_session_id: Option<String>,
    pub cached_at: Instant,
}

/// HTTP POST handler for `/api/hook`.
///
/// Accepts a `ClientMessage` JSON body, validates it is one of the hook
/// types, spawns fire-and-forget processing, and returns 204 immediately so
/// the hook script never blocks the CLI.
pub async fn hook_handler(
    State(state): State<Arc<SessionRegistry>>,
    Json(msg): Json<ClientMessage>,
) -> StatusCode {
    if !is_hook_message(&msg) {
        return StatusCode::BAD_REQUEST;
    }
    tokio::spawn(async move {
        handle_hook_message(msg, &state).await;
    });
    StatusCode::NO_CONTENT
}

fn is_hook_message(msg: &ClientMessage) -> bool {
    matches!(
        msg,
        ClientMessage::ClaudeSessionStart { .. }
            | ClientMessage::ClaudeSessionEnd { .. }
            | ClientMessage::ClaudeStatusEvent { .. }
            | ClientMessage::ClaudeToolEvent { .. }
            | ClientMessage::ClaudeSubagentEvent { .. }
    )
}

/// Process a hook message from either transport.
pub async fn handle_hook_message(msg: ClientMessage, state: &Arc<SessionRegistry>) {
    match msg {
        ClientMessage::ClaudeSessionStart {
            session_id,
            cwd,
            model,
            source: _,
            transcript_path: _,
            permission_mode,
            terminal_session_id,
        } => {
            if state.contains(&session_id) {
                // Restored or reconnecting session: refresh metadata.
                let _ = state
                    .send(&session_id, SessionCommand::SetModel { model })
                    .await;
                let branch = git::resolve_branch(&cwd).await;
                let _ = state
                    .send(
                        &session_id,
                        SessionCommand::ApplyDelta {
                            changes: StateChanges {
                                last_activity_at: Some(now_iso8601()),
                                ..Default::default()
                            },
                            persist: branch.map(|b| crate::persistence::PersistCommand::SetBranch {
                                session_id: session_id.clone(),
                                branch: Some(b),
                            }),
                        },
                    )
                    .await;
                return;
            }

            state.cache_pending_hook(
                session_id,
                PendingHookSession {
                    cwd,
                    model,
                    permission_mode,
                    terminal_session_id,
                    cached_at: Instant::now(),
                },
            );
        }

        ClientMessage::ClaudeSessionEnd { session_id, reason } => {
            // Never materialized — ghost from a bootstrap invocation.
            if state.discard_pending_hook(&session_id) {
                return;
            }
            let _ = state
                .send(
                    &session_id,
                    SessionCommand::Action(Input::SessionEnded {
                        reason: reason.unwrap_or_else(|| "hook_session_end".to_string()),
                    }),
                )
                .await;
        }

        ClientMessage::ClaudeStatusEvent {
            session_id,
            status,
            message,
        } => {
            if !ensure_session(state, &session_id).await {
                return;
            }
            let input = match status.as_str() {
                "working" => Some(Input::TurnStarted),
                "waiting" | "idle" => Some(Input::TurnCompleted { usage: None }),
                "permission" | "question" => Some(Input::ApprovalRequested(ApprovalRequest {
                    request_id: orbitdock_protocol::new_id(),
                    kind: if status == "question" {
                        ApprovalKind::Question
                    } else {
                        ApprovalKind::ToolUse
                    },
                    tool_name: None,
                    tool_input: None,
                    prompt: message.clone(),
                    // Hook sessions are decided in the terminal; the list is
                    // advisory for UI rendering.
                    decision_options: vec![ApprovalDecision::Approved, ApprovalDecision::Denied],
                    proposed_amendment: None,
                })),
                "ended" => Some(Input::SessionEnded {
                    reason: "hook_reported_end".to_string(),
                }),
                other => {
                    debug!(
                        component = "hooks",
                        session_id = %session_id,
                        status = %other,
                        "Unmapped hook status"
                    );
                    None
                }
            };
            if let Some(input) = input {
                let _ = state.send(&session_id, SessionCommand::Action(input)).await;
            }
        }

        ClientMessage::ClaudeToolEvent {
            session_id,
            phase,
            tool_name,
            tool_use_id,
            tool_input,
            tool_output,
            is_error,
        } => {
            if !ensure_session(state, &session_id).await {
                return;
            }
            match phase {
                HookPhase::Pre => {
                    let now = now_iso8601();
                    let message = Message {
                        id: tool_message_id(&tool_use_id),
                        session_id: session_id.clone(),
                        role: MessageRole::Tool,
                        content: tool_content(&tool_name, tool_input.as_ref()),
                        created_at: now.clone(),
                        updated_at: now,
                        tool_use_id,
                        parent_message_id: None,
                    };
                    let _ = state
                        .send(
                            &session_id,
                            SessionCommand::Action(Input::MessageCreated(message)),
                        )
                        .await;
                }
                HookPhase::Post => {
                    // Without a tool_use_id there is nothing to correlate.
                    let Some(tool_use_id) = tool_use_id else {
                        return;
                    };
                    let mut content = tool_output.unwrap_or_default();
                    if is_error == Some(true) && !content.is_empty() {
                        content = format!("[error] {content}");
                    }
                    let _ = state
                        .send(
                            &session_id,
                            SessionCommand::Action(Input::MessageUpdated {
                                id: tool_message_id(&Some(tool_use_id)),
                                delta: MessageChanges {
                                    content: if content.is_empty() {
                                        None
                                    } else {
                                        Some(content)
                                    },
                                    updated_at: None,
                                },
                            }),
                        )
                        .await;
                }
            }
        }

        ClientMessage::ClaudeSubagentEvent {
            session_id,
            phase,
            agent_type,
            description,
        } => {
            if !ensure_session(state, &session_id).await {
                return;
            }
            if phase != HookPhase::Pre {
                return;
            }
            let now = now_iso8601();
            let label = agent_type.unwrap_or_else(|| "subagent".to_string());
            let content = match description {
                Some(d) => format!("Task({label}): {d}"),
                None => format!("Task({label})"),
            };
            let message = Message {
                id: orbitdock_protocol::new_id(),
                session_id: session_id.clone(),
                role: MessageRole::Tool,
                content,
                created_at: now.clone(),
                updated_at: now,
                tool_use_id: None,
                parent_message_id: None,
            };
            let _ = state
                .send(
                    &session_id,
                    SessionCommand::Action(Input::MessageCreated(message)),
                )
                .await;
        }

        _ => {}
    }
}

/// Materialize a pending hook session on its first actionable event.
/// Returns false when the id is neither live nor pending.
async fn ensure_session(state: &Arc<SessionRegistry>, session_id: &str) -> bool {
    if state.contains(session_id) {
        return true;
    }
    let Some(pending) = state.take_pending_hook(session_id) else {
        warn!(
            component = "hooks",
            session_id = %session_id,
            "Hook event for unknown session dropped"
        );
        return false;
    };

    let branch = git::resolve_branch(&pending.cwd).await;
    let config = SessionConfig {
        id: session_id.to_string(),
        provider: Provider::Claude,
        integration_mode: IntegrationMode::Hook,
        project_path: pending.cwd,
        branch,
        model: pending.model,
        approval_policy: pending.permission_mode,
        sandbox_mode: None,
        workstream_id: None,
        terminal_session_id: pending.terminal_session_id,
        forked_from: None,
    };
    let session = SessionState::new(config, &now_iso8601());
    let (connector, _event_tx) = NullConnector::spawn(CancellationToken::new());
    state.spawn_session(session, connector).await;
    true
}

fn tool_message_id(tool_use_id: &Option<String>) -> String {
    match tool_use_id {
        Some(id) => format!("tool-{id}"),
        None => orbitdock_protocol::new_id(),
    }
}

fn tool_content(tool_name: &str, tool_input: Option<&Value>) -> String {
    match tool_input {
        Some(input) => format!("{tool_name} {input}"),
        None => tool_name.to_string(),
    }
}
