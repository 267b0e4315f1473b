//! Commands sent to a session actor by the gateway, hook bridge, and
//! background tasks. All external mutation goes through this inbox.

use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};

use orbitdock_connector_core::{ConnectorCall, ConnectorEvent};
use orbitdock_protocol::{Message, SessionSnapshot, SessionSummary, StateChanges};

use crate::persistence::PersistCommand;
use crate::transition::Input;

/// A command that can be sent to a session actor.
pub enum SessionCommand {
    /// Connector event, converted to an `Input` and fed to the transition
    ProcessEvent(ConnectorEvent),

    /// Client-originated input (send message, approve, steer, interrupt, end)
    Action(Input),

    /// Direct connector dispatch for operations with no immediate state
    /// change (compact, undo, rollback). The resulting connector events
    /// flow back through `ProcessEvent`.
    Connector(ConnectorCall),

    /// Subscribe to session updates, optionally replaying from a revision
    Subscribe {
        since_revision: Option<u64>,
        reply: oneshot::Sender<SubscribeResult>,
    },

    // -- Compound operations --
    /// Apply a metadata delta, optionally persist, and broadcast SessionDelta
    ApplyDelta {
        changes: StateChanges,
        persist: Option<PersistCommand>,
    },

    /// Mark session ended locally without a connector round-trip
    EndLocally {
        reason: String,
    },

    /// Set custom name, persist, broadcast delta, and return the summary
    SetCustomNameAndNotify {
        name: Option<String>,
        reply: oneshot::Sender<SessionSummary>,
    },

    // -- Fire-and-forget setters for out-of-band sources --
    SetModel {
        model: Option<String>,
    },
    SetBranch {
        branch: Option<String>,
    },
    SetConfig {
        approval_policy: Option<String>,
        sandbox_mode: Option<String>,
    },
    SetSummary {
        summary: Option<String>,
    },

    // -- Queries --
    GetMessages {
        reply: oneshot::Sender<Vec<Message>>,
    },

    /// Drain, persist a final checkpoint, and exit the actor task
    Shutdown,
}

/// Result of a Subscribe command.
pub enum SubscribeResult {
    /// Full snapshot plus message history (no baseline, or none requested)
    Snapshot {
        snapshot: Box<SessionSnapshot>,
        messages: Vec<Message>,
        rx: broadcast::Receiver<Arc<str>>,
    },
    /// Replay frames with revisions > the requested baseline
    Replay {
        events: Vec<Arc<str>>,
        rx: broadcast::Receiver<Arc<str>>,
    },
    /// The baseline fell off the ring buffer; client must re-snapshot
    Lagged,
}
