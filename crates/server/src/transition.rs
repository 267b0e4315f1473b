//! Pure state transition function
//!
//! All business logic for session state changes lives here as a pure,
//! synchronous function: `transition(state, input, now) -> (state, effects)`.
//! No IO, no async, no locking — fully unit-testable.
//!
//! `revision` is incremented exactly once per `Effect::Emit`, inside this
//! function, so tests can assert exact revision sequences.

use serde_json::Value;

use orbitdock_connector_core::{ConnectorCall, ConnectorEvent};
use orbitdock_protocol::{
    ApprovalDecision, ApprovalKind, ApprovalRequest, Attachment, IntegrationMode, Message,
    MessageChanges, MessageRole, Phase, Provider, ServerMessage, SessionStatus, StateChanges,
    TokenUsage,
};

use crate::persistence::PersistCommand;
use crate::session_naming;

// ---------------------------------------------------------------------------
// WorkPhase — internal state machine (maps to Phase for the wire)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum WorkPhase {
    Idle,
    Working,
    AwaitingApproval {
        request_id: String,
        kind: ApprovalKind,
        proposed_amendment: Option<Value>,
    },
    Ended {
        reason: String,
    },
}

impl WorkPhase {
    pub fn to_wire(&self) -> Phase {
        match self {
            WorkPhase::Idle => Phase::Idle,
            WorkPhase::Working => Phase::Working,
            WorkPhase::AwaitingApproval { .. } => Phase::AwaitingApproval,
            WorkPhase::Ended { .. } => Phase::Ended,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionState — the session value owned by its actor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionState {
    pub id: String,
    pub revision: u64,
    pub phase: WorkPhase,
    pub status: SessionStatus,
    pub provider: Provider,
    pub integration_mode: IntegrationMode,
    pub project_path: String,
    pub branch: Option<String>,
    pub model: Option<String>,
    pub custom_name: Option<String>,
    pub summary: Option<String>,
    pub first_prompt: Option<String>,
    pub approval_policy: Option<String>,
    pub sandbox_mode: Option<String>,
    pub created_at: String,
    pub last_activity_at: Option<String>,
    pub forked_from: Option<String>,
    pub workstream_id: Option<String>,
    pub terminal_session_id: Option<String>,
    pub messages: Vec<Message>,
    pub tokens: TokenUsage,
    pub current_diff: Option<String>,
    pub current_plan: Option<String>,
    pub prompt_count: u64,
    pub tool_count: u64,
    pub pending_approval: Option<ApprovalRequest>,
    pub end_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Input — the closed set of things that can happen to a session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Input {
    // Connector-originated
    TurnStarted,
    TurnCompleted {
        usage: Option<TokenUsage>,
    },
    TurnAborted {
        reason: String,
    },
    MessageCreated(Message),
    MessageUpdated {
        id: String,
        delta: MessageChanges,
    },
    ApprovalRequested(ApprovalRequest),
    TokensUpdated(TokenUsage),
    DiffUpdated(String),
    PlanUpdated(String),
    ThreadNameUpdated(String),
    SessionEnded {
        reason: String,
    },
    UndoStarted {
        message: Option<String>,
    },
    UndoCompleted {
        success: bool,
        message: Option<String>,
    },
    ThreadRolledBack {
        num_turns: u32,
    },
    ContextCompacted,
    SkillsRefreshed {
        skills: Vec<String>,
    },
    McpStateChanged {
        servers: Value,
    },
    Error {
        class: String,
        message: String,
    },

    // Client-originated
    UserSentMessage {
        content: String,
        attachments: Vec<Attachment>,
    },
    UserSteered {
        content: String,
    },
    UserApproved {
        request_id: String,
        decision: ApprovalDecision,
        amended_input: Option<Value>,
    },
    UserDenied {
        request_id: String,
        reason: Option<String>,
    },
    UserAnsweredQuestion {
        request_id: String,
        answer: String,
    },
    UserInterrupted,
    UserEndedSession,
}

impl From<ConnectorEvent> for Input {
    fn from(event: ConnectorEvent) -> Self {
        match event {
            ConnectorEvent::TurnStarted => Input::TurnStarted,
            ConnectorEvent::TurnCompleted { usage } => Input::TurnCompleted { usage },
            ConnectorEvent::TurnAborted { reason } => Input::TurnAborted { reason },
            ConnectorEvent::MessageCreated(msg) => Input::MessageCreated(msg),
            ConnectorEvent::MessageUpdated {
                message_id,
                content,
            } => Input::MessageUpdated {
                id: message_id,
                delta: MessageChanges {
                    content: Some(content),
                    updated_at: None,
                },
            },
            ConnectorEvent::ApprovalRequested(req) => Input::ApprovalRequested(req),
            ConnectorEvent::TokensUpdated(usage) => Input::TokensUpdated(usage),
            ConnectorEvent::DiffUpdated(diff) => Input::DiffUpdated(diff),
            ConnectorEvent::PlanUpdated(plan) => Input::PlanUpdated(plan),
            ConnectorEvent::ThreadNameUpdated(name) => Input::ThreadNameUpdated(name),
            ConnectorEvent::SessionEnded { reason } => Input::SessionEnded { reason },
            ConnectorEvent::UndoStarted { message } => Input::UndoStarted { message },
            ConnectorEvent::UndoCompleted { success, message } => {
                Input::UndoCompleted { success, message }
            }
            ConnectorEvent::ThreadRolledBack { num_turns } => {
                Input::ThreadRolledBack { num_turns }
            }
            ConnectorEvent::ContextCompacted => Input::ContextCompacted,
            ConnectorEvent::SkillsRefreshed { skills } => Input::SkillsRefreshed { skills },
            ConnectorEvent::McpStateChanged { servers } => Input::McpStateChanged { servers },
            ConnectorEvent::Error { class, message } => Input::Error { class, message },
        }
    }
}

// ---------------------------------------------------------------------------
// Effects — describe IO to be executed by the caller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Effect {
    Persist(Box<PersistCommand>),
    Emit(Box<ServerMessage>),
    Connector(ConnectorCall),
}

// ---------------------------------------------------------------------------
// transition() — the pure core
// ---------------------------------------------------------------------------

/// Pure, synchronous state transition.
///
/// Given the current state and an input, returns the new state and the
/// effects (persistence writes, broadcasts, connector calls) to execute.
/// Inputs against an `Ended` session return the state unchanged with no
/// effects — the terminal phase is absorbing.
pub fn transition(mut state: SessionState, input: Input, now: &str) -> (SessionState, Vec<Effect>) {
    if matches!(state.phase, WorkPhase::Ended { .. }) {
        tracing::warn!(
            component = "transition",
            session_id = %state.id,
            input = ?input_name(&input),
            "Input dropped — session already ended"
        );
        return (state, Vec::new());
    }

    let sid = state.id.clone();
    let mut effects: Vec<Effect> = Vec::new();

    macro_rules! emit {
        ($msg:expr) => {{
            state.revision += 1;
            effects.push(Effect::Emit(Box::new($msg)));
        }};
    }
    macro_rules! persist {
        ($cmd:expr) => {
            effects.push(Effect::Persist(Box::new($cmd)))
        };
    }

    match input {
        // -- Turn lifecycle ---------------------------------------------------
        Input::TurnStarted => {
            // Valid from Idle and Working: a user message already moved the
            // session to Working before the connector confirms the turn.
            if matches!(state.phase, WorkPhase::AwaitingApproval { .. }) {
                return invalid(state, "TurnStarted");
            }
            state.phase = WorkPhase::Working;
            state.last_activity_at = Some(now.to_string());

            persist!(PersistCommand::UpdateSessionFields {
                id: sid.clone(),
                status: None,
                phase: Some(Phase::Working),
                end_reason: None,
                last_activity_at: Some(now.to_string()),
            });
            emit!(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    phase: Some(Phase::Working),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            });
        }

        Input::TurnCompleted { usage } => {
            if state.phase != WorkPhase::Working {
                return invalid(state, "TurnCompleted");
            }
            state.phase = WorkPhase::Idle;
            state.last_activity_at = Some(now.to_string());

            if let Some(usage) = usage {
                state.tokens = usage.clone();
                persist!(PersistCommand::SetTokens {
                    session_id: sid.clone(),
                    usage: usage.clone(),
                });
                emit!(ServerMessage::TokensUpdated {
                    session_id: sid.clone(),
                    usage,
                });
            }

            persist!(PersistCommand::UpdateSessionFields {
                id: sid.clone(),
                status: None,
                phase: Some(Phase::Idle),
                end_reason: None,
                last_activity_at: Some(now.to_string()),
            });
            emit!(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    phase: Some(Phase::Idle),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            });
        }

        Input::TurnAborted { reason } => {
            if state.phase != WorkPhase::Working {
                return invalid(state, "TurnAborted");
            }
            tracing::debug!(
                component = "transition",
                session_id = %sid,
                reason = %reason,
                "Turn aborted"
            );
            state.phase = WorkPhase::Idle;
            state.last_activity_at = Some(now.to_string());

            persist!(PersistCommand::UpdateSessionFields {
                id: sid.clone(),
                status: None,
                phase: Some(Phase::Idle),
                end_reason: None,
                last_activity_at: Some(now.to_string()),
            });
            emit!(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    phase: Some(Phase::Idle),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            });
        }

        Input::Error { class, message } => {
            state.phase = WorkPhase::Idle;
            state.last_activity_at = Some(now.to_string());

            persist!(PersistCommand::UpdateSessionFields {
                id: sid.clone(),
                status: None,
                phase: Some(Phase::Idle),
                end_reason: None,
                last_activity_at: Some(now.to_string()),
            });
            emit!(ServerMessage::Error {
                code: class,
                message,
                session_id: Some(sid.clone()),
            });
            emit!(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    phase: Some(Phase::Idle),
                    pending_approval: Some(None),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            });
        }

        // -- Messages ---------------------------------------------------------
        Input::MessageCreated(mut message) => {
            message.session_id = sid.clone();

            // Dedup: skip user messages echoed back by the connector
            let is_dup = message.role == MessageRole::User
                && state
                    .messages
                    .iter()
                    .rev()
                    .take(5)
                    .any(|m| m.role == MessageRole::User && m.content == message.content);

            if !is_dup {
                state.messages.push(message.clone());
                state.last_activity_at = Some(now.to_string());

                persist!(PersistCommand::InsertMessage {
                    message: message.clone(),
                });
                if message.role == MessageRole::Tool {
                    state.tool_count += 1;
                    persist!(PersistCommand::IncrementToolCount {
                        session_id: sid.clone(),
                    });
                }
                emit!(ServerMessage::MessageAppended {
                    session_id: sid,
                    message,
                });
            }
        }

        Input::MessageUpdated { id, delta } => {
            let Some(existing) = state.messages.iter_mut().find(|m| m.id == id) else {
                // Unknown message id is a no-op
                return (state, Vec::new());
            };
            if let Some(content) = &delta.content {
                existing.content = content.clone();
            }
            existing.updated_at = now.to_string();

            let changes = MessageChanges {
                content: delta.content.clone(),
                updated_at: Some(now.to_string()),
            };
            persist!(PersistCommand::UpdateMessage {
                session_id: sid.clone(),
                message_id: id.clone(),
                content: delta.content,
                updated_at: now.to_string(),
            });
            emit!(ServerMessage::MessageUpdated {
                session_id: sid,
                message_id: id,
                changes,
            });
        }

        // -- Approval ---------------------------------------------------------
        Input::ApprovalRequested(request) => {
            if matches!(state.phase, WorkPhase::AwaitingApproval { .. }) {
                return invalid(state, "ApprovalRequested");
            }
            state.phase = WorkPhase::AwaitingApproval {
                request_id: request.request_id.clone(),
                kind: request.kind,
                proposed_amendment: request.proposed_amendment.clone(),
            };
            state.pending_approval = Some(request.clone());
            state.last_activity_at = Some(now.to_string());

            persist!(PersistCommand::UpdateSessionFields {
                id: sid.clone(),
                status: None,
                phase: Some(Phase::AwaitingApproval),
                end_reason: None,
                last_activity_at: Some(now.to_string()),
            });
            persist!(PersistCommand::RecordApprovalRequest {
                session_id: sid.clone(),
                request: request.clone(),
                created_at: now.to_string(),
            });
            emit!(ServerMessage::ApprovalRequested {
                session_id: sid,
                request,
            });
        }

        Input::UserApproved {
            request_id,
            decision,
            amended_input,
        } => {
            if !awaiting(&state, &request_id) {
                return invalid(state, "UserApproved");
            }
            state.phase = WorkPhase::Working;
            state.pending_approval = None;
            state.last_activity_at = Some(now.to_string());

            effects.push(Effect::Connector(ConnectorCall::Approve {
                request_id: request_id.clone(),
                amended_input,
            }));
            persist!(PersistCommand::AppendApprovalDecision {
                session_id: sid.clone(),
                request_id,
                decision: decision.as_str().to_string(),
                decided_at: now.to_string(),
            });
            persist!(PersistCommand::UpdateSessionFields {
                id: sid.clone(),
                status: None,
                phase: Some(Phase::Working),
                end_reason: None,
                last_activity_at: Some(now.to_string()),
            });
            emit!(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    phase: Some(Phase::Working),
                    pending_approval: Some(None),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            });
        }

        Input::UserDenied { request_id, reason } => {
            if !awaiting(&state, &request_id) {
                return invalid(state, "UserDenied");
            }
            state.phase = WorkPhase::Idle;
            state.pending_approval = None;
            state.last_activity_at = Some(now.to_string());

            effects.push(Effect::Connector(ConnectorCall::Deny {
                request_id: request_id.clone(),
                reason,
            }));
            persist!(PersistCommand::AppendApprovalDecision {
                session_id: sid.clone(),
                request_id,
                decision: ApprovalDecision::Denied.as_str().to_string(),
                decided_at: now.to_string(),
            });
            persist!(PersistCommand::UpdateSessionFields {
                id: sid.clone(),
                status: None,
                phase: Some(Phase::Idle),
                end_reason: None,
                last_activity_at: Some(now.to_string()),
            });
            emit!(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    phase: Some(Phase::Idle),
                    pending_approval: Some(None),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            });
        }

        Input::UserAnsweredQuestion { request_id, answer } => {
            if !awaiting(&state, &request_id) {
                return invalid(state, "UserAnsweredQuestion");
            }
            state.phase = WorkPhase::Working;
            state.pending_approval = None;
            state.last_activity_at = Some(now.to_string());

            effects.push(Effect::Connector(ConnectorCall::Answer {
                request_id: request_id.clone(),
                text: answer,
            }));
            persist!(PersistCommand::AppendApprovalDecision {
                session_id: sid.clone(),
                request_id,
                decision: "answered".to_string(),
                decided_at: now.to_string(),
            });
            persist!(PersistCommand::UpdateSessionFields {
                id: sid.clone(),
                status: None,
                phase: Some(Phase::Working),
                end_reason: None,
                last_activity_at: Some(now.to_string()),
            });
            emit!(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    phase: Some(Phase::Working),
                    pending_approval: Some(None),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            });
        }

        // -- User actions -----------------------------------------------------
        Input::UserSentMessage {
            content,
            attachments,
        } => {
            if matches!(state.phase, WorkPhase::AwaitingApproval { .. }) {
                return invalid(state, "UserSentMessage");
            }
            state.phase = WorkPhase::Working;
            state.prompt_count += 1;
            state.last_activity_at = Some(now.to_string());
            if state.first_prompt.is_none() {
                state.first_prompt = Some(content.clone());
                if state.custom_name.is_none() {
                    state.custom_name = session_naming::name_from_first_prompt(&content);
                }
            }

            let message = Message {
                id: orbitdock_protocol::new_id(),
                session_id: sid.clone(),
                role: MessageRole::User,
                content: content.clone(),
                created_at: now.to_string(),
                updated_at: now.to_string(),
                tool_use_id: None,
                parent_message_id: None,
            };
            state.messages.push(message.clone());

            persist!(PersistCommand::InsertMessage {
                message: message.clone(),
            });
            persist!(PersistCommand::UpdateSessionFields {
                id: sid.clone(),
                status: None,
                phase: Some(Phase::Working),
                end_reason: None,
                last_activity_at: Some(now.to_string()),
            });
            persist!(PersistCommand::RecordPrompt {
                session_id: sid.clone(),
                first_prompt: state.first_prompt.clone(),
                custom_name: state.custom_name.clone(),
            });
            emit!(ServerMessage::MessageAppended {
                session_id: sid,
                message,
            });
            effects.push(Effect::Connector(ConnectorCall::SendMessage {
                content,
                attachments,
            }));
        }

        Input::UserSteered { content } => {
            if state.phase != WorkPhase::Working {
                return invalid(state, "UserSteered");
            }
            state.last_activity_at = Some(now.to_string());

            let message = Message {
                id: orbitdock_protocol::new_id(),
                session_id: sid.clone(),
                role: MessageRole::User,
                content: content.clone(),
                created_at: now.to_string(),
                updated_at: now.to_string(),
                tool_use_id: None,
                parent_message_id: None,
            };
            state.messages.push(message.clone());

            persist!(PersistCommand::InsertMessage {
                message: message.clone(),
            });
            emit!(ServerMessage::MessageAppended {
                session_id: sid,
                message,
            });
            effects.push(Effect::Connector(ConnectorCall::Steer { content }));
        }

        Input::UserInterrupted => {
            if state.phase == WorkPhase::Idle {
                // Nothing in flight
                return (state, Vec::new());
            }
            state.phase = WorkPhase::Idle;
            state.pending_approval = None;
            state.last_activity_at = Some(now.to_string());

            effects.push(Effect::Connector(ConnectorCall::Interrupt));
            persist!(PersistCommand::UpdateSessionFields {
                id: sid.clone(),
                status: None,
                phase: Some(Phase::Idle),
                end_reason: None,
                last_activity_at: Some(now.to_string()),
            });
            emit!(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    phase: Some(Phase::Idle),
                    pending_approval: Some(None),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            });
        }

        Input::UserEndedSession => {
            effects.push(Effect::Connector(ConnectorCall::End));
            end_session(&mut state, &mut effects, "user_ended", now);
        }

        Input::SessionEnded { reason } => {
            end_session(&mut state, &mut effects, &reason, now);
        }

        // -- Metadata ---------------------------------------------------------
        Input::TokensUpdated(usage) => {
            // Cumulative: replace, do not add
            state.tokens = usage.clone();
            state.last_activity_at = Some(now.to_string());

            persist!(PersistCommand::SetTokens {
                session_id: sid.clone(),
                usage: usage.clone(),
            });
            emit!(ServerMessage::TokensUpdated {
                session_id: sid,
                usage,
            });
        }

        Input::DiffUpdated(diff) => {
            state.current_diff = Some(diff.clone());

            persist!(PersistCommand::UpdateTurnArtifacts {
                session_id: sid.clone(),
                diff: Some(diff.clone()),
                plan: None,
            });
            emit!(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    current_diff: Some(Some(diff)),
                    ..Default::default()
                },
            });
        }

        Input::PlanUpdated(plan) => {
            state.current_plan = Some(plan.clone());

            persist!(PersistCommand::UpdateTurnArtifacts {
                session_id: sid.clone(),
                diff: None,
                plan: Some(plan.clone()),
            });
            emit!(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    current_plan: Some(Some(plan)),
                    ..Default::default()
                },
            });
        }

        Input::ThreadNameUpdated(name) => {
            state.custom_name = Some(name.clone());
            state.last_activity_at = Some(now.to_string());

            persist!(PersistCommand::SetCustomName {
                session_id: sid.clone(),
                custom_name: Some(name.clone()),
            });
            emit!(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    custom_name: Some(Some(name)),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            });
        }

        // -- Undo / rollback / compaction --------------------------------------
        Input::UndoStarted { message } => {
            state.phase = WorkPhase::Working;
            state.last_activity_at = Some(now.to_string());

            persist!(PersistCommand::UpdateSessionFields {
                id: sid.clone(),
                status: None,
                phase: Some(Phase::Working),
                end_reason: None,
                last_activity_at: Some(now.to_string()),
            });
            emit!(ServerMessage::SessionDelta {
                session_id: sid.clone(),
                changes: StateChanges {
                    phase: Some(Phase::Working),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            });
            emit!(ServerMessage::UndoStarted {
                session_id: sid,
                message,
            });
        }

        Input::UndoCompleted { success, message } => {
            state.phase = WorkPhase::Idle;
            state.last_activity_at = Some(now.to_string());

            persist!(PersistCommand::UpdateSessionFields {
                id: sid.clone(),
                status: None,
                phase: Some(Phase::Idle),
                end_reason: None,
                last_activity_at: Some(now.to_string()),
            });
            emit!(ServerMessage::SessionDelta {
                session_id: sid.clone(),
                changes: StateChanges {
                    phase: Some(Phase::Idle),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            });
            emit!(ServerMessage::UndoCompleted {
                session_id: sid,
                success,
                message,
            });
        }

        Input::ThreadRolledBack { num_turns } => {
            state.phase = WorkPhase::Idle;
            state.last_activity_at = Some(now.to_string());

            persist!(PersistCommand::UpdateSessionFields {
                id: sid.clone(),
                status: None,
                phase: Some(Phase::Idle),
                end_reason: None,
                last_activity_at: Some(now.to_string()),
            });
            emit!(ServerMessage::SessionDelta {
                session_id: sid.clone(),
                changes: StateChanges {
                    phase: Some(Phase::Idle),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            });
            emit!(ServerMessage::ThreadRolledBack {
                session_id: sid,
                num_turns,
            });
        }

        // -- Pass-through (broadcast only, no state change) -------------------
        Input::ContextCompacted => {
            emit!(ServerMessage::ContextCompacted { session_id: sid });
        }

        Input::SkillsRefreshed { skills } => {
            emit!(ServerMessage::SkillsUpdated {
                session_id: sid,
                skills,
            });
        }

        Input::McpStateChanged { servers } => {
            emit!(ServerMessage::McpState {
                session_id: sid,
                servers,
            });
        }
    }

    // Pending approval never survives outside AwaitingApproval.
    if !matches!(state.phase, WorkPhase::AwaitingApproval { .. }) {
        state.pending_approval = None;
    }

    (state, effects)
}

/// Shared terminal transition: clear transient artifacts, mark ended.
fn end_session(state: &mut SessionState, effects: &mut Vec<Effect>, reason: &str, now: &str) {
    state.phase = WorkPhase::Ended {
        reason: reason.to_string(),
    };
    state.status = SessionStatus::Ended;
    state.end_reason = Some(reason.to_string());
    state.current_diff = None;
    state.current_plan = None;
    state.pending_approval = None;
    state.last_activity_at = Some(now.to_string());

    effects.push(Effect::Persist(Box::new(
        PersistCommand::UpdateSessionFields {
            id: state.id.clone(),
            status: Some(SessionStatus::Ended),
            phase: Some(Phase::Ended),
            end_reason: Some(reason.to_string()),
            last_activity_at: Some(now.to_string()),
        },
    )));
    state.revision += 1;
    effects.push(Effect::Emit(Box::new(ServerMessage::SessionEnded {
        session_id: state.id.clone(),
        reason: reason.to_string(),
    })));
}

fn awaiting(state: &SessionState, request_id: &str) -> bool {
    matches!(
        &state.phase,
        WorkPhase::AwaitingApproval { request_id: rid, .. } if rid == request_id
    )
}

/// Invalid transition: unchanged state, no effects, warning trace.
fn invalid(state: SessionState, input: &str) -> (SessionState, Vec<Effect>) {
    tracing::warn!(
        component = "transition",
        session_id = %state.id,
        phase = ?state.phase.to_wire(),
        input = input,
        "Invalid transition ignored"
    );
    (state, Vec::new())
}

fn input_name(input: &Input) -> &'static str {
    match input {
        Input::TurnStarted => "TurnStarted",
        Input::TurnCompleted { .. } => "TurnCompleted",
        Input::TurnAborted { .. } => "TurnAborted",
        Input::MessageCreated(_) => "MessageCreated",
        Input::MessageUpdated { .. } => "MessageUpdated",
        Input::ApprovalRequested(_) => "ApprovalRequested",
        Input::TokensUpdated(_) => "TokensUpdated",
        Input::DiffUpdated(_) => "DiffUpdated",
        Input::PlanUpdated(_) => "PlanUpdated",
        Input::ThreadNameUpdated(_) => "ThreadNameUpdated",
        Input::SessionEnded { .. } => "SessionEnded",
        Input::UndoStarted { .. } => "UndoStarted",
        Input::UndoCompleted { .. } => "UndoCompleted",
        Input::ThreadRolledBack { .. } => "ThreadRolledBack",
        Input::ContextCompacted => "ContextCompacted",
        Input::SkillsRefreshed { .. } => "SkillsRefreshed",
        Input::McpStateChanged { .. } => "McpStateChanged",
        Input::Error { .. } => "Error",
        Input::UserSentMessage { .. } => "UserSentMessage",
        Input::UserSteered { .. } => "UserSteered",
        Input::UserApproved { .. } => "UserApproved",
        Input::UserDenied { .. } => "UserDenied",
        Input::UserAnsweredQuestion { .. } => "UserAnsweredQuestion",
        Input::UserInterrupted => "UserInterrupted",
        Input::UserEndedSession => "UserEndedSession",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::test_state;

    const NOW: &str = "2026-03-01T10:00:00Z";

    fn exec_request(id: &str) -> ApprovalRequest {
        ApprovalRequest {
            request_id: id.to_string(),
            kind: ApprovalKind::Exec,
            tool_name: Some("Bash".into()),
            tool_input: Some(serde_json::json!({ "cmd": "rm foo" })),
            prompt: None,
            decision_options: vec![ApprovalDecision::Approved, ApprovalDecision::Denied],
            proposed_amendment: None,
        }
    }

    fn emits(effects: &[Effect]) -> Vec<&ServerMessage> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(msg) => Some(msg.as_ref()),
                _ => None,
            })
            .collect()
    }

    fn connector_calls(effects: &[Effect]) -> Vec<&ConnectorCall> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Connector(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn turn_started_transitions_to_working() {
        let state = test_state();
        let (new_state, effects) = transition(state, Input::TurnStarted, NOW);

        assert_eq!(new_state.phase, WorkPhase::Working);
        assert_eq!(new_state.revision, 1);
        assert!(matches!(
            effects[0],
            Effect::Persist(ref cmd) if matches!(**cmd, PersistCommand::UpdateSessionFields { .. })
        ));
        assert!(matches!(
            emits(&effects)[0],
            ServerMessage::SessionDelta { .. }
        ));
    }

    #[test]
    fn turn_completed_when_idle_is_noop() {
        let state = test_state();
        let revision = state.revision;
        let (new_state, effects) = transition(state, Input::TurnCompleted { usage: None }, NOW);

        assert_eq!(new_state.phase, WorkPhase::Idle);
        assert_eq!(new_state.revision, revision);
        assert!(effects.is_empty());
    }

    #[test]
    fn revision_increments_once_per_emit() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;

        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            cached_tokens: 20,
            context_window: 128_000,
        };
        let (new_state, effects) = transition(
            state,
            Input::TurnCompleted {
                usage: Some(usage),
            },
            NOW,
        );

        // tokens_updated then session_delta — two emits, revision +2
        let emitted = emits(&effects);
        assert_eq!(emitted.len(), 2);
        assert!(matches!(emitted[0], ServerMessage::TokensUpdated { .. }));
        assert!(matches!(emitted[1], ServerMessage::SessionDelta { .. }));
        assert_eq!(new_state.revision, 2);
        assert_eq!(new_state.phase, WorkPhase::Idle);
    }

    #[test]
    fn user_sent_message_goes_to_working_and_calls_connector() {
        let state = test_state();
        let (new_state, effects) = transition(
            state,
            Input::UserSentMessage {
                content: "hello".into(),
                attachments: vec![],
            },
            NOW,
        );

        assert_eq!(new_state.phase, WorkPhase::Working);
        assert_eq!(new_state.prompt_count, 1);
        assert_eq!(new_state.first_prompt.as_deref(), Some("hello"));
        assert_eq!(new_state.revision, 1);
        assert_eq!(new_state.messages.len(), 1);
        assert_eq!(new_state.messages[0].role, MessageRole::User);

        let emitted = emits(&effects);
        assert_eq!(emitted.len(), 1);
        assert!(matches!(emitted[0], ServerMessage::MessageAppended { .. }));
        assert_eq!(
            connector_calls(&effects),
            vec![&ConnectorCall::SendMessage {
                content: "hello".into(),
                attachments: vec![],
            }]
        );
    }

    #[test]
    fn approval_round_trip_with_amendment() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;

        let (state, effects) =
            transition(state, Input::ApprovalRequested(exec_request("req-1")), NOW);
        assert!(matches!(
            state.phase,
            WorkPhase::AwaitingApproval { ref request_id, kind: ApprovalKind::Exec, .. }
                if request_id == "req-1"
        ));
        assert!(state.pending_approval.is_some());
        let emitted = emits(&effects);
        assert_eq!(emitted.len(), 1);
        assert!(matches!(
            emitted[0],
            ServerMessage::ApprovalRequested { .. }
        ));
        let revision_after_request = state.revision;

        let amended = serde_json::json!({ "cmd": "rm ./foo" });
        let (state, effects) = transition(
            state,
            Input::UserApproved {
                request_id: "req-1".into(),
                decision: ApprovalDecision::Approved,
                amended_input: Some(amended.clone()),
            },
            NOW,
        );
        assert_eq!(state.phase, WorkPhase::Working);
        assert!(state.pending_approval.is_none());
        assert_eq!(state.revision, revision_after_request + 1);
        assert_eq!(
            connector_calls(&effects),
            vec![&ConnectorCall::Approve {
                request_id: "req-1".into(),
                amended_input: Some(amended),
            }]
        );
    }

    #[test]
    fn approval_with_wrong_request_id_is_noop() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;
        let (state, _) = transition(state, Input::ApprovalRequested(exec_request("req-1")), NOW);

        let (state, effects) = transition(
            state,
            Input::UserApproved {
                request_id: "req-other".into(),
                decision: ApprovalDecision::Approved,
                amended_input: None,
            },
            NOW,
        );
        assert!(effects.is_empty());
        assert!(matches!(state.phase, WorkPhase::AwaitingApproval { .. }));
    }

    #[test]
    fn user_approved_when_not_awaiting_is_noop() {
        let state = test_state();
        let (state, effects) = transition(
            state,
            Input::UserApproved {
                request_id: "req-1".into(),
                decision: ApprovalDecision::Approved,
                amended_input: None,
            },
            NOW,
        );
        assert!(effects.is_empty());
        assert_eq!(state.phase, WorkPhase::Idle);
    }

    #[test]
    fn user_denied_returns_to_idle() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;
        let (state, _) = transition(state, Input::ApprovalRequested(exec_request("req-9")), NOW);

        let (state, effects) = transition(
            state,
            Input::UserDenied {
                request_id: "req-9".into(),
                reason: Some("too risky".into()),
            },
            NOW,
        );
        assert_eq!(state.phase, WorkPhase::Idle);
        assert!(state.pending_approval.is_none());
        assert_eq!(
            connector_calls(&effects),
            vec![&ConnectorCall::Deny {
                request_id: "req-9".into(),
                reason: Some("too risky".into()),
            }]
        );
    }

    #[test]
    fn user_interrupted_when_idle_is_noop() {
        let state = test_state();
        let (state, effects) = transition(state, Input::UserInterrupted, NOW);
        assert!(effects.is_empty());
        assert_eq!(state.phase, WorkPhase::Idle);
    }

    #[test]
    fn user_interrupted_while_awaiting_clears_approval() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;
        let (state, _) = transition(state, Input::ApprovalRequested(exec_request("req-2")), NOW);

        let (state, effects) = transition(state, Input::UserInterrupted, NOW);
        assert_eq!(state.phase, WorkPhase::Idle);
        assert!(state.pending_approval.is_none());
        assert_eq!(connector_calls(&effects), vec![&ConnectorCall::Interrupt]);
    }

    #[test]
    fn session_ended_clears_transient_state() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;
        state.current_diff = Some("diff".into());
        state.current_plan = Some("plan".into());

        let (state, effects) = transition(
            state,
            Input::SessionEnded {
                reason: "provider_exited".into(),
            },
            NOW,
        );
        assert!(matches!(
            state.phase,
            WorkPhase::Ended { ref reason } if reason == "provider_exited"
        ));
        assert_eq!(state.status, SessionStatus::Ended);
        assert!(state.current_diff.is_none());
        assert!(state.current_plan.is_none());
        let emitted = emits(&effects);
        assert_eq!(emitted.len(), 1);
        assert!(matches!(emitted[0], ServerMessage::SessionEnded { .. }));
    }

    #[test]
    fn ended_phase_is_absorbing() {
        let mut state = test_state();
        state.phase = WorkPhase::Ended {
            reason: "user_ended".into(),
        };
        state.status = SessionStatus::Ended;
        let revision = state.revision;

        for input in [
            Input::TurnStarted,
            Input::UserSentMessage {
                content: "hi".into(),
                attachments: vec![],
            },
            Input::SessionEnded {
                reason: "again".into(),
            },
            Input::TokensUpdated(TokenUsage::default()),
        ] {
            let (next, effects) = transition(state.clone(), input, NOW);
            assert!(effects.is_empty());
            assert_eq!(next.revision, revision);
            assert!(matches!(next.phase, WorkPhase::Ended { ref reason } if reason == "user_ended"));
        }
    }

    #[test]
    fn message_updated_with_unknown_id_is_noop() {
        let state = test_state();
        let (state, effects) = transition(
            state,
            Input::MessageUpdated {
                id: "missing".into(),
                delta: MessageChanges {
                    content: Some("new".into()),
                    updated_at: None,
                },
            },
            NOW,
        );
        assert!(effects.is_empty());
        assert_eq!(state.revision, 0);
    }

    #[test]
    fn user_message_dedup_skips_echo() {
        let state = test_state();
        let (state, _) = transition(
            state,
            Input::UserSentMessage {
                content: "do something".into(),
                attachments: vec![],
            },
            NOW,
        );
        let revision = state.revision;

        let echo = Message {
            id: "echo-1".into(),
            session_id: String::new(),
            role: MessageRole::User,
            content: "do something".into(),
            created_at: NOW.into(),
            updated_at: NOW.into(),
            tool_use_id: None,
            parent_message_id: None,
        };
        let (state, effects) = transition(state, Input::MessageCreated(echo), NOW);
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.revision, revision);
        assert!(effects.is_empty());
    }

    #[test]
    fn tool_message_increments_tool_count() {
        let state = test_state();
        let tool_msg = Message {
            id: "t1".into(),
            session_id: String::new(),
            role: MessageRole::Tool,
            content: "Bash(ls)".into(),
            created_at: NOW.into(),
            updated_at: NOW.into(),
            tool_use_id: Some("tu-1".into()),
            parent_message_id: None,
        };
        let (state, effects) = transition(state, Input::MessageCreated(tool_msg), NOW);
        assert_eq!(state.tool_count, 1);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Persist(cmd) if matches!(**cmd, PersistCommand::IncrementToolCount { .. })
        )));
    }

    #[test]
    fn tokens_updated_replaces_not_adds() {
        let mut state = test_state();
        state.tokens = TokenUsage {
            input_tokens: 500,
            output_tokens: 100,
            cached_tokens: 0,
            context_window: 128_000,
        };

        let next = TokenUsage {
            input_tokens: 200,
            output_tokens: 50,
            cached_tokens: 10,
            context_window: 128_000,
        };
        let (state, _) = transition(state, Input::TokensUpdated(next.clone()), NOW);
        assert_eq!(state.tokens, next);
    }

    #[test]
    fn error_emits_payload_and_delta_and_returns_to_idle() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;

        let (state, effects) = transition(
            state,
            Input::Error {
                class: "connector".into(),
                message: "stream broke".into(),
            },
            NOW,
        );
        assert_eq!(state.phase, WorkPhase::Idle);
        let emitted = emits(&effects);
        assert_eq!(emitted.len(), 2);
        assert!(matches!(emitted[0], ServerMessage::Error { .. }));
        assert!(matches!(emitted[1], ServerMessage::SessionDelta { .. }));
        assert_eq!(state.revision, 2);
    }

    #[test]
    fn undo_events_bracket_working_phase() {
        let state = test_state();
        let (state, effects) = transition(state, Input::UndoStarted { message: None }, NOW);
        assert_eq!(state.phase, WorkPhase::Working);
        assert_eq!(emits(&effects).len(), 2);

        let (state, effects) = transition(
            state,
            Input::UndoCompleted {
                success: true,
                message: None,
            },
            NOW,
        );
        assert_eq!(state.phase, WorkPhase::Idle);
        assert_eq!(emits(&effects).len(), 2);
        assert_eq!(state.revision, 4);
    }

    #[test]
    fn pass_through_events_only_emit() {
        let state = test_state();
        let (next, effects) = transition(state.clone(), Input::ContextCompacted, NOW);
        assert_eq!(next.phase, state.phase);
        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0], Effect::Emit(_)));
        assert_eq!(next.revision, 1);

        let (_, effects) = transition(
            state,
            Input::SkillsRefreshed {
                skills: vec!["review".into()],
            },
            NOW,
        );
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn first_prompt_derives_custom_name() {
        let state = test_state();
        let (state, _) = transition(
            state,
            Input::UserSentMessage {
                content: "Fix the race in the session registry".into(),
                attachments: vec![],
            },
            NOW,
        );
        assert_eq!(
            state.custom_name.as_deref(),
            Some("Fix the race in the session registry")
        );

        // Second prompt does not overwrite
        let (state, _) = transition(
            state,
            Input::TurnCompleted { usage: None },
            NOW,
        );
        let (state, _) = transition(
            state,
            Input::UserSentMessage {
                content: "Another prompt".into(),
                attachments: vec![],
            },
            NOW,
        );
        assert_eq!(state.prompt_count, 2);
        assert_eq!(
            state.first_prompt.as_deref(),
            Some("Fix the race in the session registry")
        );
    }
}
