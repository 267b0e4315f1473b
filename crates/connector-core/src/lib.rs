//! OrbitDock connector boundary
//!
//! A connector drives one AI provider session (subprocess, library, or hook
//! bridge) on behalf of exactly one session actor. The actor consumes the
//! connector's event stream and invokes [`Connector`] methods when the
//! transition function produces [`ConnectorCall`] effects.
//!
//! Connectors never touch session state; they translate provider wire
//! formats into [`ConnectorEvent`] values and back.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use orbitdock_protocol::{ApprovalRequest, Attachment, Message, TokenUsage};

mod channel;
mod null;

pub use channel::ChannelConnector;
pub use null::NullConnector;

/// Errors that can occur in connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("failed to spawn provider process: {0}")]
    Spawn(String),

    #[error("provider io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider wire format error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connector channel closed")]
    ChannelClosed,

    #[error("operation not supported by this connector: {0}")]
    Unsupported(&'static str),

    #[error("provider error: {0}")]
    Provider(String),
}

/// What the runtime hands a connector at session start.
#[derive(Debug, Clone)]
pub struct ConnectorContext {
    pub session_id: String,
    pub project_path: String,
    pub model: Option<String>,
    pub approval_policy: Option<String>,
    pub sandbox_mode: Option<String>,
    /// Cancelled when the user interrupts or the session shuts down.
    pub cancel: CancellationToken,
}

/// Events emitted by connectors, converted 1:1 to transition inputs.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    TurnStarted,
    TurnCompleted { usage: Option<TokenUsage> },
    TurnAborted { reason: String },
    MessageCreated(Message),
    MessageUpdated { message_id: String, content: String },
    ApprovalRequested(ApprovalRequest),
    TokensUpdated(TokenUsage),
    DiffUpdated(String),
    PlanUpdated(String),
    ThreadNameUpdated(String),
    SessionEnded { reason: String },
    UndoStarted { message: Option<String> },
    UndoCompleted { success: bool, message: Option<String> },
    ThreadRolledBack { num_turns: u32 },
    ContextCompacted,
    SkillsRefreshed { skills: Vec<String> },
    McpStateChanged { servers: Value },
    Error { class: String, message: String },
}

/// Calls the runtime makes against a connector, produced as
/// `Effect::Connector` values by the pure transition function.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorCall {
    SendMessage {
        content: String,
        attachments: Vec<Attachment>,
    },
    Steer {
        content: String,
    },
    Approve {
        request_id: String,
        amended_input: Option<Value>,
    },
    Deny {
        request_id: String,
        reason: Option<String>,
    },
    Answer {
        request_id: String,
        text: String,
    },
    Interrupt,
    End,
    CompactContext,
    UndoLastTurn,
    RollbackTurns {
        num_turns: u32,
    },
}

/// The driver side of a provider session.
///
/// All methods are best-effort: a failing call surfaces as an `Error` input
/// in the owning actor, never as a panic or a poisoned session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn send_message(
        &self,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<(), ConnectorError>;

    async fn steer(&self, content: &str) -> Result<(), ConnectorError>;

    async fn approve(
        &self,
        request_id: &str,
        amended_input: Option<&Value>,
    ) -> Result<(), ConnectorError>;

    async fn deny(&self, request_id: &str, reason: Option<&str>) -> Result<(), ConnectorError>;

    async fn answer(&self, request_id: &str, text: &str) -> Result<(), ConnectorError>;

    async fn interrupt(&self) -> Result<(), ConnectorError>;

    async fn end(&self) -> Result<(), ConnectorError>;

    async fn compact_context(&self) -> Result<(), ConnectorError>;

    async fn undo_last_turn(&self) -> Result<(), ConnectorError>;

    async fn rollback_turns(&self, num_turns: u32) -> Result<(), ConnectorError>;
}

impl dyn Connector {
    /// Dispatch a [`ConnectorCall`] effect onto the trait surface.
    pub async fn dispatch(&self, call: ConnectorCall) -> Result<(), ConnectorError> {
        match call {
            ConnectorCall::SendMessage {
                content,
                attachments,
            } => self.send_message(&content, &attachments).await,
            ConnectorCall::Steer { content } => self.steer(&content).await,
            ConnectorCall::Approve {
                request_id,
                amended_input,
            } => self.approve(&request_id, amended_input.as_ref()).await,
            ConnectorCall::Deny { request_id, reason } => {
                self.deny(&request_id, reason.as_deref()).await
            }
            ConnectorCall::Answer { request_id, text } => self.answer(&request_id, &text).await,
            ConnectorCall::Interrupt => self.interrupt().await,
            ConnectorCall::End => self.end().await,
            ConnectorCall::CompactContext => self.compact_context().await,
            ConnectorCall::UndoLastTurn => self.undo_last_turn().await,
            ConnectorCall::RollbackTurns { num_turns } => self.rollback_turns(num_turns).await,
        }
    }
}

/// A spawned connector: the driver plus its event stream. The actor takes
/// the receiver; the boxed connector answers calls.
pub struct ConnectorHandle {
    pub connector: Box<dyn Connector>,
    pub events: mpsc::Receiver<ConnectorEvent>,
}

/// Capacity of connector event streams.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
