//! WebSocket gateway
//!
//! Connection lifecycle, per-connection subscription fan-in, revision-aware
//! replay, and lagged-recovery signalling. The gateway holds no locks: every
//! session-directed message becomes a `SessionCommand` routed through the
//! registry, and every active subscription runs a forwarder task that owns a
//! broadcast receiver and writes frames to the single per-connection writer
//! channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use orbitdock_connector_core::{ConnectorCall, ConnectorContext, NullConnector};
use orbitdock_protocol::{
    encode_frame, error_code, ApprovalDecision, ClientMessage, IntegrationMode, Provider,
    ServerMessage, SessionStatus, PROTOCOL_VERSION,
};

use crate::persistence::{self, PersistCommand};
use crate::registry::SessionRegistry;
use crate::session::SessionConfig;
use crate::session_command::{SessionCommand, SubscribeResult};
use crate::transition::{Input, SessionState};
use crate::util::now_iso8601;
use crate::{git, hooks, paths};

/// Per-connection outbound channel capacity.
const OUTBOUND_CAPACITY: usize = 256;
/// Connections with no inbound frames (including pings) for this long are dropped.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Messages queued for the single WebSocket writer task.
enum Outbound {
    /// Pre-serialized frame from a session event bus
    Frame(Arc<str>),
    /// Frame serialized at write time
    Message(Box<ServerMessage>),
    /// Raw pong response
    Pong(axum::body::Bytes),
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SessionRegistry>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<SessionRegistry>) {
    info!(component = "websocket", "New WebSocket connection");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);

    // Single writer task: forwarders never touch the socket directly, so two
    // subscriptions cannot interleave partial frames.
    let send_task = tokio::spawn(async move {
        while let Some(out) = outbound_rx.recv().await {
            let result = match out {
                Outbound::Frame(frame) => {
                    ws_tx.send(WsMessage::Text(frame.to_string().into())).await
                }
                Outbound::Message(msg) => {
                    ws_tx
                        .send(WsMessage::Text(encode_frame(&msg).into()))
                        .await
                }
                Outbound::Pong(data) => ws_tx.send(WsMessage::Pong(data)).await,
            };
            if result.is_err() {
                debug!(
                    component = "websocket",
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let mut conn = ClientConnection {
        state,
        tx: outbound_tx.clone(),
        forwarders: HashMap::new(),
        list_forwarder: None,
    };

    conn.send(ServerMessage::Hello {
        version: crate::VERSION.to_string(),
        protocol_version: PROTOCOL_VERSION,
    })
    .await;

    loop {
        let next = match tokio::time::timeout(READ_IDLE_TIMEOUT, ws_rx.next()).await {
            Err(_) => {
                info!(
                    component = "websocket",
                    "Read-idle timeout, dropping connection"
                );
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!(component = "websocket", error = %e, "WebSocket error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match next {
            WsMessage::Text(text) => {
                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(
                            component = "websocket",
                            error = %e,
                            "Failed to parse client message"
                        );
                        conn.send(ServerMessage::error(
                            error_code::INVALID_PAYLOAD,
                            e.to_string(),
                            None,
                        ))
                        .await;
                        continue;
                    }
                };
                conn.handle(client_msg).await;
            }
            WsMessage::Ping(data) => {
                let _ = outbound_tx.send(Outbound::Pong(data)).await;
            }
            WsMessage::Close(_) => {
                info!(component = "websocket", "Client sent close frame");
                break;
            }
            _ => {}
        }
    }

    conn.shutdown();
    send_task.abort();
    info!(component = "websocket", "WebSocket connection closed");
}

struct ClientConnection {
    state: Arc<SessionRegistry>,
    tx: mpsc::Sender<Outbound>,
    /// One forwarder task per active session subscription.
    forwarders: HashMap<String, JoinHandle<()>>,
    list_forwarder: Option<JoinHandle<()>>,
}

impl ClientConnection {
    async fn send(&self, msg: ServerMessage) {
        let _ = self.tx.send(Outbound::Message(Box::new(msg))).await;
    }

    async fn send_frame(&self, frame: Arc<str>) {
        let _ = self.tx.send(Outbound::Frame(frame)).await;
    }

    async fn error(&self, code: &str, message: impl Into<String>, session_id: Option<String>) {
        self.send(ServerMessage::error(code, message, session_id))
            .await;
    }

    /// Route an action input to a session, reporting routing failures.
    async fn action(&self, session_id: String, input: Input) {
        if let Err(e) = self
            .state
            .send(&session_id, SessionCommand::Action(input))
            .await
        {
            self.error(error_code::UNKNOWN_SESSION, e.to_string(), Some(session_id))
                .await;
        }
    }

    async fn handle(&mut self, msg: ClientMessage) {
        match msg {
            // -- Subscriptions ------------------------------------------------
            ClientMessage::SubscribeList => {
                // Subscribe before snapshotting: a session spawned in
                // between is then delivered twice (merge-by-id on the
                // client) instead of dropped.
                let rx = self.state.subscribe_list();
                let sessions = self.state.list_summaries();
                self.send(ServerMessage::SessionsList { sessions }).await;

                let tx = self.tx.clone();
                if let Some(old) = self.list_forwarder.replace(tokio::spawn(async move {
                    forward_list_events(rx, tx).await;
                })) {
                    old.abort();
                }
            }

            ClientMessage::SubscribeSession {
                session_id,
                since_revision,
            } => {
                self.subscribe_session(session_id, since_revision).await;
            }

            ClientMessage::UnsubscribeSession { session_id } => {
                if let Some(task) = self.forwarders.remove(&session_id) {
                    task.abort();
                }
            }

            // -- Session management -------------------------------------------
            ClientMessage::CreateSession {
                provider,
                cwd,
                model,
                approval_policy,
                sandbox_mode,
                workstream_id,
            } => {
                self.create_session(
                    provider,
                    cwd,
                    model,
                    approval_policy,
                    sandbox_mode,
                    workstream_id,
                )
                .await;
            }

            ClientMessage::ResumeSession { session_id } => {
                self.resume_session(session_id).await;
            }

            ClientMessage::ForkSession {
                source_session_id,
                nth_user_message,
            } => {
                self.fork_session(source_session_id, nth_user_message).await;
            }

            // -- Session actions ----------------------------------------------
            ClientMessage::SendMessage {
                session_id,
                content,
                attachments,
            } => {
                self.action(
                    session_id,
                    Input::UserSentMessage {
                        content,
                        attachments,
                    },
                )
                .await;
            }

            ClientMessage::SteerTurn {
                session_id,
                content,
            } => {
                self.action(session_id, Input::UserSteered { content }).await;
            }

            ClientMessage::ApproveTool {
                session_id,
                request_id,
                decision,
                amended_input,
                reason,
            } => {
                let input = if decision == ApprovalDecision::Denied {
                    Input::UserDenied { request_id, reason }
                } else {
                    Input::UserApproved {
                        request_id,
                        decision,
                        amended_input,
                    }
                };
                self.action(session_id, input).await;
            }

            ClientMessage::AnswerQuestion {
                session_id,
                request_id,
                answer,
            } => {
                self.action(session_id, Input::UserAnsweredQuestion { request_id, answer })
                    .await;
            }

            ClientMessage::InterruptSession { session_id } => {
                self.action(session_id, Input::UserInterrupted).await;
            }

            ClientMessage::EndSession { session_id } => {
                self.action(session_id, Input::UserEndedSession).await;
            }

            ClientMessage::RenameSession { session_id, name } => {
                let (reply, rx) = oneshot::channel();
                match self
                    .state
                    .send(&session_id, SessionCommand::SetCustomNameAndNotify { name, reply })
                    .await
                {
                    Ok(()) => {
                        let _ = rx.await;
                    }
                    Err(e) => {
                        self.error(error_code::UNKNOWN_SESSION, e.to_string(), Some(session_id))
                            .await;
                    }
                }
            }

            // -- Context management -------------------------------------------
            ClientMessage::CompactContext { session_id } => {
                self.connector_call(session_id, ConnectorCall::CompactContext)
                    .await;
            }
            ClientMessage::UndoLastTurn { session_id } => {
                self.connector_call(session_id, ConnectorCall::UndoLastTurn)
                    .await;
            }
            ClientMessage::RollbackTurns {
                session_id,
                num_turns,
            } => {
                self.connector_call(session_id, ConnectorCall::RollbackTurns { num_turns })
                    .await;
            }

            // -- Review comments ----------------------------------------------
            ClientMessage::AddReviewComment {
                session_id,
                message_id,
                file_path,
                line,
                content,
            } => {
                let _ = self
                    .state
                    .persist()
                    .send(PersistCommand::InsertReviewComment {
                        session_id,
                        message_id,
                        file_path,
                        line,
                        content,
                        created_at: now_iso8601(),
                    })
                    .await;
            }
            ClientMessage::UpdateReviewComment {
                session_id,
                comment_id,
                content,
            } => {
                let _ = self
                    .state
                    .persist()
                    .send(PersistCommand::UpdateReviewComment {
                        session_id,
                        comment_id,
                        content,
                        updated_at: now_iso8601(),
                    })
                    .await;
            }
            ClientMessage::DeleteReviewComment {
                session_id,
                comment_id,
            } => {
                let _ = self
                    .state
                    .persist()
                    .send(PersistCommand::DeleteReviewComment {
                        session_id,
                        comment_id,
                    })
                    .await;
            }
            ClientMessage::ListReviewComments { session_id } => {
                match persistence::list_review_comments(paths::db_path(), session_id.clone()).await
                {
                    Ok(comments) => {
                        self.send(ServerMessage::ReviewComments {
                            session_id,
                            comments,
                        })
                        .await;
                    }
                    Err(e) => {
                        self.error(error_code::INTERNAL, e.to_string(), Some(session_id))
                            .await;
                    }
                }
            }

            // -- Hook-bridge transport (fused with /api/hook) -----------------
            msg @ (ClientMessage::ClaudeSessionStart { .. }
            | ClientMessage::ClaudeSessionEnd { .. }
            | ClientMessage::ClaudeStatusEvent { .. }
            | ClientMessage::ClaudeToolEvent { .. }
            | ClientMessage::ClaudeSubagentEvent { .. }) => {
                hooks::handle_hook_message(msg, &self.state).await;
            }
        }
    }

    /// Dispatch a connector call with no immediate state change.
    async fn connector_call(&self, session_id: String, call: ConnectorCall) {
        if let Err(e) = self
            .state
            .send(&session_id, SessionCommand::Connector(call))
            .await
        {
            self.error(error_code::UNKNOWN_SESSION, e.to_string(), Some(session_id))
                .await;
        }
    }

    async fn subscribe_session(&mut self, session_id: String, since_revision: Option<u64>) {
        let (reply, rx_reply) = oneshot::channel();
        if let Err(e) = self
            .state
            .send(
                &session_id,
                SessionCommand::Subscribe {
                    since_revision,
                    reply,
                },
            )
            .await
        {
            self.error(error_code::UNKNOWN_SESSION, e.to_string(), Some(session_id))
                .await;
            return;
        }

        let result = match rx_reply.await {
            Ok(result) => result,
            Err(_) => {
                self.error(
                    error_code::INTERNAL,
                    "subscription reply dropped",
                    Some(session_id),
                )
                .await;
                return;
            }
        };

        match result {
            SubscribeResult::Snapshot {
                snapshot,
                messages,
                rx,
            } => {
                self.send(ServerMessage::SessionSnapshot { session: *snapshot })
                    .await;
                for message in messages {
                    self.send(ServerMessage::MessageAppended {
                        session_id: session_id.clone(),
                        message,
                    })
                    .await;
                }
                self.attach_forwarder(session_id, rx);
            }
            SubscribeResult::Replay { events, rx } => {
                for frame in events {
                    self.send_frame(frame).await;
                }
                self.attach_forwarder(session_id, rx);
            }
            SubscribeResult::Lagged => {
                // Baseline fell off the ring buffer; client must re-snapshot
                // with since_revision = null.
                self.error(error_code::LAGGED, "replay window exceeded", Some(session_id))
                    .await;
            }
        }
    }

    fn attach_forwarder(&mut self, session_id: String, rx: broadcast::Receiver<Arc<str>>) {
        let tx = self.tx.clone();
        let sid = session_id.clone();
        let task = tokio::spawn(async move {
            forward_session_events(sid, rx, tx).await;
        });
        if let Some(old) = self.forwarders.insert(session_id, task) {
            old.abort();
        }
    }

    async fn create_session(
        &mut self,
        provider: Provider,
        cwd: String,
        model: Option<String>,
        approval_policy: Option<String>,
        sandbox_mode: Option<String>,
        workstream_id: Option<String>,
    ) {
        info!(
            component = "websocket",
            provider = ?provider,
            cwd = %cwd,
            "Creating session"
        );

        if provider == Provider::Codex {
            self.error(
                error_code::INTERNAL,
                "codex direct integration is not available in this build",
                None,
            )
            .await;
            return;
        }

        let id = orbitdock_protocol::new_id();
        let branch = git::resolve_branch(&cwd).await;
        let config = SessionConfig {
            id: id.clone(),
            provider,
            integration_mode: IntegrationMode::Direct,
            project_path: cwd.clone(),
            branch,
            model: model.clone(),
            approval_policy: approval_policy.clone(),
            sandbox_mode: sandbox_mode.clone(),
            workstream_id,
            terminal_session_id: None,
            forked_from: None,
        };
        let session = SessionState::new(config, &now_iso8601());

        let ctx = ConnectorContext {
            session_id: id.clone(),
            project_path: cwd,
            model,
            approval_policy,
            sandbox_mode,
            cancel: CancellationToken::new(),
        };
        let connector = match orbitdock_connector_claude::ClaudeConnector::spawn(&ctx, None).await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    component = "websocket",
                    session_id = %id,
                    error = %e,
                    "Failed to spawn Claude connector"
                );
                self.error(error_code::INTERNAL, e.to_string(), Some(id)).await;
                return;
            }
        };

        let snapshot = session.snapshot();
        self.state.spawn_session(session, connector).await;
        self.send(ServerMessage::SessionSnapshot { session: snapshot })
            .await;
    }

    async fn resume_session(&mut self, session_id: String) {
        if let Some(snapshot) = self.state.snapshot(&session_id) {
            if snapshot.status == SessionStatus::Active {
                // Already live — just hand back the current view.
                self.send(ServerMessage::SessionSnapshot {
                    session: (*snapshot).clone(),
                })
                .await;
                return;
            }
            // Ended but not yet swept: drop the dead actor so resume takes
            // the same reactivation path as an evicted session.
            self.state.remove(&session_id);
        }

        let restored =
            match persistence::load_session_by_id(paths::db_path(), session_id.clone()).await {
                Ok(Some(rs)) => rs,
                Ok(None) => {
                    self.error(
                        error_code::UNKNOWN_SESSION,
                        "no such session in storage",
                        Some(session_id),
                    )
                    .await;
                    return;
                }
                Err(e) => {
                    self.error(error_code::INTERNAL, e.to_string(), Some(session_id))
                        .await;
                    return;
                }
            };

        let _ = self
            .state
            .persist()
            .send(PersistCommand::ReactivateSession {
                id: session_id.clone(),
            })
            .await;

        let session = restored_to_state(&restored);
        let connector = match restored.integration_mode {
            IntegrationMode::Direct if restored.provider == Provider::Claude => {
                let ctx = ConnectorContext {
                    session_id: session_id.clone(),
                    project_path: restored.project_path.clone(),
                    model: restored.model.clone(),
                    approval_policy: restored.approval_policy.clone(),
                    sandbox_mode: restored.sandbox_mode.clone(),
                    cancel: CancellationToken::new(),
                };
                match orbitdock_connector_claude::ClaudeConnector::spawn(&ctx, Some(&session_id))
                    .await
                {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(
                            component = "websocket",
                            session_id = %session_id,
                            error = %e,
                            "Resume without live connector"
                        );
                        NullConnector::spawn(CancellationToken::new()).0
                    }
                }
            }
            _ => NullConnector::spawn(CancellationToken::new()).0,
        };

        let snapshot = session.snapshot();
        self.state.spawn_session(session, connector).await;
        self.send(ServerMessage::SessionSnapshot { session: snapshot })
            .await;
    }

    async fn fork_session(&mut self, source_session_id: String, nth_user_message: Option<u32>) {
        // Prefer the live actor's view of the source; fall back to storage.
        let (source_snapshot, source_messages) = if self.state.contains(&source_session_id) {
            let Some(snapshot) = self.state.snapshot(&source_session_id) else {
                self.error(
                    error_code::UNKNOWN_SESSION,
                    "source session vanished",
                    Some(source_session_id),
                )
                .await;
                return;
            };
            let (reply, rx) = oneshot::channel();
            let messages = match self
                .state
                .send(&source_session_id, SessionCommand::GetMessages { reply })
                .await
            {
                Ok(()) => rx.await.unwrap_or_default(),
                Err(_) => Vec::new(),
            };
            ((*snapshot).clone(), messages)
        } else {
            match persistence::load_session_by_id(paths::db_path(), source_session_id.clone())
                .await
            {
                Ok(Some(rs)) => (restored_to_state(&rs).snapshot(), rs.messages),
                Ok(None) => {
                    self.error(
                        error_code::UNKNOWN_SESSION,
                        "no such session in storage",
                        Some(source_session_id),
                    )
                    .await;
                    return;
                }
                Err(e) => {
                    self.error(
                        error_code::INTERNAL,
                        e.to_string(),
                        Some(source_session_id),
                    )
                    .await;
                    return;
                }
            }
        };

        let id = orbitdock_protocol::new_id();
        let now = now_iso8601();
        let config = SessionConfig {
            id: id.clone(),
            provider: source_snapshot.provider,
            integration_mode: IntegrationMode::Hook,
            project_path: source_snapshot.project_path.clone(),
            branch: source_snapshot.branch.clone(),
            model: source_snapshot.model.clone(),
            approval_policy: source_snapshot.approval_policy.clone(),
            sandbox_mode: source_snapshot.sandbox_mode.clone(),
            workstream_id: source_snapshot.workstream_id.clone(),
            terminal_session_id: None,
            forked_from: Some(source_session_id.clone()),
        };
        let mut session = SessionState::new(config, &now);

        // Copy history up to (excluding) the nth user message so the fork
        // can take a different path from that point.
        let mut messages = Vec::new();
        let mut user_seen = 0u32;
        for source_msg in source_messages {
            if source_msg.role == orbitdock_protocol::MessageRole::User {
                user_seen += 1;
                if let Some(n) = nth_user_message {
                    if user_seen >= n {
                        break;
                    }
                }
            }
            let mut copy = source_msg;
            copy.id = orbitdock_protocol::new_id();
            copy.session_id = id.clone();
            messages.push(copy);
        }
        session.messages = messages.clone();

        let connector = NullConnector::spawn(CancellationToken::new()).0;
        let snapshot = session.snapshot();
        self.state.spawn_session(session, connector).await;
        for message in messages {
            let _ = self
                .state
                .persist()
                .send(PersistCommand::InsertMessage { message })
                .await;
        }
        self.send(ServerMessage::SessionSnapshot { session: snapshot })
            .await;
    }

    /// Cancel all forwarders; session actors are untouched.
    fn shutdown(&mut self) {
        for (_, task) in self.forwarders.drain() {
            task.abort();
        }
        if let Some(task) = self.list_forwarder.take() {
            task.abort();
        }
    }
}

/// Forwarder: owns a broadcast receiver for one session subscription. On lag
/// it reports `lagged` to the client and exits — the emit path never blocks.
async fn forward_session_events(
    session_id: String,
    mut rx: broadcast::Receiver<Arc<str>>,
    tx: mpsc::Sender<Outbound>,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if tx.send(Outbound::Frame(frame)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    component = "websocket",
                    session_id = %session_id,
                    skipped = skipped,
                    "Subscriber lagged, terminating forwarder"
                );
                let _ = tx
                    .send(Outbound::Message(Box::new(ServerMessage::error(
                        error_code::LAGGED,
                        "event stream lagged",
                        Some(session_id.clone()),
                    ))))
                    .await;
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// List-bus forwarder. Lagged list subscribers must re-subscribe to get a
/// fresh `sessions_list`.
async fn forward_list_events(
    mut rx: broadcast::Receiver<ServerMessage>,
    tx: mpsc::Sender<Outbound>,
) {
    loop {
        match rx.recv().await {
            Ok(msg) => {
                if tx.send(Outbound::Message(Box::new(msg))).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                let _ = tx
                    .send(Outbound::Message(Box::new(ServerMessage::error(
                        error_code::LAGGED,
                        "list stream lagged",
                        None,
                    ))))
                    .await;
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Build a live `SessionState` from a restored row. Restored sessions come
/// back `Active`/`Idle` with `revision = 0`.
pub fn restored_to_state(rs: &persistence::RestoredSession) -> SessionState {
    let config = SessionConfig {
        id: rs.id.clone(),
        provider: rs.provider,
        integration_mode: rs.integration_mode,
        project_path: rs.project_path.clone(),
        branch: rs.branch.clone(),
        model: rs.model.clone(),
        approval_policy: rs.approval_policy.clone(),
        sandbox_mode: rs.sandbox_mode.clone(),
        workstream_id: rs.workstream_id.clone(),
        terminal_session_id: rs.terminal_session_id.clone(),
        forked_from: rs.forked_from.clone(),
    };
    let mut state = SessionState::restore(
        config,
        rs.custom_name.clone(),
        rs.summary.clone(),
        rs.first_prompt.clone(),
        rs.created_at.clone(),
        rs.last_activity_at.clone(),
        rs.tokens.clone(),
        rs.prompt_count,
        rs.tool_count,
        rs.messages.clone(),
    );
    state.status = SessionStatus::Active;
    state
}
