//! Session actor — owns a `SessionState` and processes commands sequentially.
//!
//! Each session runs as an independent tokio task. External callers
//! communicate via `SessionActorHandle`, which sends `SessionCommand`
//! messages over a bounded mpsc channel. Lock-free snapshot reads go
//! through `ArcSwap`; emitted frames fan out on a broadcast channel with
//! per-receiver lag detection.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use orbitdock_connector_core::{Connector, ConnectorHandle};
use orbitdock_protocol::{
    encode_frame, encode_frame_with_revision, ServerMessage, SessionSnapshot, StateChanges,
};

use crate::event_log::EventLog;
use crate::persistence::PersistCommand;
use crate::session_command::{SessionCommand, SubscribeResult};
use crate::transition::{transition, Effect, Input, SessionState};
use crate::util::now_iso8601;

/// Inbox capacity; senders await when full, backpressuring one session only.
const COMMAND_CHANNEL_CAPACITY: usize = 256;
/// Broadcast capacity; slow subscribers lag and must re-subscribe.
const BROADCAST_CAPACITY: usize = 256;

/// Actor closed its inbox (shutdown or crash).
#[derive(Debug)]
pub struct ActorClosed;

/// Handle to a running session actor (cheap to Clone).
#[derive(Clone)]
pub struct SessionActorHandle {
    pub id: String,
    command_tx: mpsc::Sender<SessionCommand>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    events_tx: broadcast::Sender<Arc<str>>,
}

impl SessionActorHandle {
    /// Spawn an actor owning `state`, driven by `connector`.
    pub fn spawn(
        state: SessionState,
        connector: ConnectorHandle,
        persist_tx: mpsc::Sender<PersistCommand>,
    ) -> SessionActorHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let snapshot = Arc::new(ArcSwap::from_pointee(state.snapshot()));
        let id = state.id.clone();

        let actor = SessionActor {
            state,
            ring: EventLog::default(),
            events_tx: events_tx.clone(),
            snapshot: snapshot.clone(),
            persist_tx,
            connector: connector.connector,
        };
        tokio::spawn(actor.run(command_rx, connector.events));

        SessionActorHandle {
            id,
            command_tx,
            snapshot,
            events_tx,
        }
    }

    /// Send a command; awaits when the inbox is full so no command is lost.
    pub async fn send(&self, cmd: SessionCommand) -> Result<(), ActorClosed> {
        self.command_tx.send(cmd).await.map_err(|_| ActorClosed)
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }

    /// Raw event-bus receiver (frames only, no replay).
    pub fn subscribe_events(&self) -> broadcast::Receiver<Arc<str>> {
        self.events_tx.subscribe()
    }
}

struct SessionActor {
    state: SessionState,
    ring: EventLog,
    events_tx: broadcast::Sender<Arc<str>>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    persist_tx: mpsc::Sender<PersistCommand>,
    connector: Box<dyn Connector>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SessionCommand>,
        mut connector_events: mpsc::Receiver<orbitdock_connector_core::ConnectorEvent>,
    ) {
        let mut events_open = true;
        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Shutdown) => {
                            self.checkpoint().await;
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                ev = connector_events.recv(), if events_open => {
                    match ev {
                        Some(ev) => self.apply_input(Input::from(ev)).await,
                        None => {
                            debug!(
                                component = "session_actor",
                                session_id = %self.state.id,
                                "Connector event stream closed"
                            );
                            events_open = false;
                        }
                    }
                }
            }
            // Publish after every handled item so readers never observe a
            // state older than one a previous reader saw.
            self.publish_snapshot();
        }

        info!(
            component = "session_actor",
            session_id = %self.state.id,
            "Session actor stopped"
        );
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::ProcessEvent(event) => {
                self.apply_input(Input::from(event)).await;
            }
            SessionCommand::Action(input) => {
                self.apply_input(input).await;
            }
            SessionCommand::Connector(call) => {
                if let Err(e) = self.connector.dispatch(call).await {
                    self.apply_input(Input::Error {
                        class: "connector_error".to_string(),
                        message: e.to_string(),
                    })
                    .await;
                }
            }
            SessionCommand::Subscribe {
                since_revision,
                reply,
            } => {
                let result = self.subscribe(since_revision);
                let _ = reply.send(result);
            }
            SessionCommand::ApplyDelta { changes, persist } => {
                self.apply_changes(&changes);
                if let Some(cmd) = persist {
                    self.persist(cmd).await;
                }
                self.emit_now(ServerMessage::SessionDelta {
                    session_id: self.state.id.clone(),
                    changes,
                });
            }
            SessionCommand::EndLocally { reason } => {
                self.apply_input(Input::SessionEnded { reason }).await;
            }
            SessionCommand::SetCustomNameAndNotify { name, reply } => {
                self.state.custom_name = name.clone();
                self.persist(PersistCommand::SetCustomName {
                    session_id: self.state.id.clone(),
                    custom_name: name.clone(),
                })
                .await;
                self.emit_now(ServerMessage::SessionDelta {
                    session_id: self.state.id.clone(),
                    changes: StateChanges {
                        custom_name: Some(name),
                        last_activity_at: Some(now_iso8601()),
                        ..Default::default()
                    },
                });
                let _ = reply.send(self.state.snapshot().to_summary());
            }
            SessionCommand::SetModel { model } => {
                self.state.model = model.clone();
                self.persist(PersistCommand::SetModel {
                    session_id: self.state.id.clone(),
                    model,
                })
                .await;
            }
            SessionCommand::SetBranch { branch } => {
                self.state.branch = branch.clone();
                self.persist(PersistCommand::SetBranch {
                    session_id: self.state.id.clone(),
                    branch,
                })
                .await;
            }
            SessionCommand::SetConfig {
                approval_policy,
                sandbox_mode,
            } => {
                self.state.approval_policy = approval_policy.clone();
                self.state.sandbox_mode = sandbox_mode.clone();
                self.persist(PersistCommand::SetSessionConfig {
                    session_id: self.state.id.clone(),
                    approval_policy,
                    sandbox_mode,
                })
                .await;
            }
            SessionCommand::SetSummary { summary } => {
                self.state.summary = summary.clone();
                self.persist(PersistCommand::SetSummary {
                    session_id: self.state.id.clone(),
                    summary,
                })
                .await;
            }
            SessionCommand::GetMessages { reply } => {
                let _ = reply.send(self.state.messages.clone());
            }
            SessionCommand::Shutdown => unreachable!("handled in run()"),
        }
    }

    /// Feed an input through the pure transition and execute its effects in
    /// order. A failing connector call produces a synthetic `Input::Error`
    /// for the next iteration; the loop is bounded because `Input::Error`
    /// yields no connector effects.
    async fn apply_input(&mut self, input: Input) {
        let mut next = Some(input);
        while let Some(input) = next.take() {
            let now = now_iso8601();
            let prior_revision = self.state.revision;
            let (state, effects) = transition(self.state.clone(), input, &now);
            self.state = state;

            let mut revision = prior_revision;
            for effect in effects {
                match effect {
                    Effect::Persist(cmd) => {
                        self.persist(*cmd).await;
                    }
                    Effect::Emit(msg) => {
                        revision += 1;
                        self.emit_frame(&msg, revision);
                    }
                    Effect::Connector(call) => {
                        if let Err(e) = self.connector.dispatch(call).await {
                            warn!(
                                component = "session_actor",
                                session_id = %self.state.id,
                                error = %e,
                                "Connector call failed"
                            );
                            next = Some(Input::Error {
                                class: "connector_error".to_string(),
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    fn subscribe(&self, since_revision: Option<u64>) -> SubscribeResult {
        // Receiver creation, replay collection, and snapshot read all happen
        // inside this single command — no events can interleave.
        match since_revision {
            None => SubscribeResult::Snapshot {
                snapshot: Box::new(self.state.snapshot()),
                messages: self.state.messages.clone(),
                rx: self.events_tx.subscribe(),
            },
            Some(since) => match self.ring.replay_since(since, self.state.revision) {
                Some(events) => SubscribeResult::Replay {
                    events,
                    rx: self.events_tx.subscribe(),
                },
                None => SubscribeResult::Lagged,
            },
        }
    }

    /// Emit outside the transition (compound commands). Keeps the revision
    /// stream contiguous with transition-produced events.
    fn emit_now(&mut self, msg: ServerMessage) {
        self.state.revision += 1;
        let revision = self.state.revision;
        self.emit_frame(&msg, revision);
    }

    fn emit_frame(&mut self, msg: &ServerMessage, revision: u64) {
        let live: Arc<str> = Arc::from(encode_frame(msg));
        let tagged: Arc<str> = Arc::from(encode_frame_with_revision(msg, revision));
        self.ring.push(revision, tagged);
        // No receivers is fine; send only fails when all have dropped.
        let _ = self.events_tx.send(live);
    }

    async fn persist(&self, cmd: PersistCommand) {
        if self.persist_tx.send(cmd).await.is_err() {
            warn!(
                component = "session_actor",
                session_id = %self.state.id,
                "Persistence channel closed, write dropped"
            );
        }
    }

    fn apply_changes(&mut self, changes: &StateChanges) {
        if let Some(custom_name) = &changes.custom_name {
            self.state.custom_name = custom_name.clone();
        }
        if let Some(model) = &changes.model {
            self.state.model = model.clone();
        }
        if let Some(approval_policy) = &changes.approval_policy {
            self.state.approval_policy = approval_policy.clone();
        }
        if let Some(sandbox_mode) = &changes.sandbox_mode {
            self.state.sandbox_mode = sandbox_mode.clone();
        }
        if let Some(first_prompt) = &changes.first_prompt {
            self.state.first_prompt = Some(first_prompt.clone());
        }
        if let Some(ts) = &changes.last_activity_at {
            self.state.last_activity_at = Some(ts.clone());
        }
    }

    async fn checkpoint(&mut self) {
        self.persist(PersistCommand::UpdateSessionFields {
            id: self.state.id.clone(),
            status: None,
            phase: None,
            end_reason: None,
            last_activity_at: Some(now_iso8601()),
        })
        .await;
    }

    fn publish_snapshot(&self) {
        self.snapshot.store(Arc::new(self.state.snapshot()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::test_config;
    use orbitdock_connector_core::{ChannelConnector, ConnectorCall, ConnectorEvent};
    use orbitdock_protocol::{Phase, TokenUsage};
    use serde_json::Value;

    fn spawn_actor() -> (
        SessionActorHandle,
        mpsc::Sender<ConnectorEvent>,
        mpsc::UnboundedReceiver<ConnectorCall>,
        mpsc::Receiver<PersistCommand>,
    ) {
        let (persist_tx, persist_rx) = mpsc::channel(1024);
        let (handle, event_tx, call_rx) = ChannelConnector::spawn();
        let state = SessionState::new(test_config("s1"), "2026-03-01T09:00:00Z");
        let actor = SessionActorHandle::spawn(state, handle, persist_tx);
        (actor, event_tx, call_rx, persist_rx)
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    fn frame_json(frame: &Arc<str>) -> Value {
        serde_json::from_str(frame).expect("valid frame json")
    }

    #[tokio::test]
    async fn basic_turn_produces_contiguous_revisions() {
        let (actor, event_tx, mut call_rx, _persist_rx) = spawn_actor();
        let mut rx = actor.subscribe_events();

        // Scenario: user message, connector starts turn, replies, completes.
        actor
            .send(SessionCommand::Action(Input::UserSentMessage {
                content: "hello".into(),
                attachments: vec![],
            }))
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            call_rx.recv().await,
            Some(ConnectorCall::SendMessage {
                content: "hello".into(),
                attachments: vec![],
            })
        );

        event_tx.send(ConnectorEvent::TurnStarted).await.unwrap();
        event_tx
            .send(ConnectorEvent::MessageCreated(orbitdock_protocol::Message {
                id: "m2".into(),
                session_id: String::new(),
                role: orbitdock_protocol::MessageRole::Assistant,
                content: "hi".into(),
                created_at: "0Z".into(),
                updated_at: "0Z".into(),
                tool_use_id: None,
                parent_message_id: None,
            }))
            .await
            .unwrap();
        event_tx
            .send(ConnectorEvent::TurnCompleted {
                usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    cached_tokens: 0,
                    context_window: 1000,
                }),
            })
            .await
            .unwrap();
        settle().await;

        let snap = actor.snapshot();
        assert_eq!(snap.phase, Phase::Idle);
        assert_eq!(snap.revision, 5);

        let mut types = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            types.push(frame_json(&frame)["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            types,
            vec![
                "message_appended",
                "session_delta",
                "message_appended",
                "tokens_updated",
                "session_delta",
            ]
        );
    }

    #[tokio::test]
    async fn snapshot_updates_after_each_command() {
        let (actor, event_tx, _call_rx, _persist_rx) = spawn_actor();

        assert_eq!(actor.snapshot().phase, Phase::Idle);

        event_tx.send(ConnectorEvent::TurnStarted).await.unwrap();
        settle().await;
        assert_eq!(actor.snapshot().phase, Phase::Working);
        assert_eq!(actor.snapshot().revision, 1);
    }

    #[tokio::test]
    async fn subscribe_without_baseline_returns_snapshot_and_history() {
        let (actor, event_tx, _call_rx, _persist_rx) = spawn_actor();
        event_tx.send(ConnectorEvent::TurnStarted).await.unwrap();
        settle().await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        actor
            .send(SessionCommand::Subscribe {
                since_revision: None,
                reply: tx,
            })
            .await
            .unwrap();
        match rx.await.unwrap() {
            SubscribeResult::Snapshot {
                snapshot, messages, ..
            } => {
                assert_eq!(snapshot.id, "s1");
                assert_eq!(snapshot.phase, Phase::Working);
                assert!(messages.is_empty());
            }
            _ => panic!("expected snapshot"),
        }
    }

    #[tokio::test]
    async fn subscribe_with_baseline_replays_tagged_frames() {
        let (actor, event_tx, _call_rx, _persist_rx) = spawn_actor();

        // Three events: revisions 1..=3
        event_tx.send(ConnectorEvent::TurnStarted).await.unwrap();
        event_tx
            .send(ConnectorEvent::DiffUpdated("diff-a".into()))
            .await
            .unwrap();
        event_tx
            .send(ConnectorEvent::PlanUpdated("plan-a".into()))
            .await
            .unwrap();
        settle().await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        actor
            .send(SessionCommand::Subscribe {
                since_revision: Some(1),
                reply: tx,
            })
            .await
            .unwrap();
        match rx.await.unwrap() {
            SubscribeResult::Replay { events, .. } => {
                assert_eq!(events.len(), 2);
                let revisions: Vec<u64> = events
                    .iter()
                    .map(|f| frame_json(f)["revision"].as_u64().unwrap())
                    .collect();
                assert_eq!(revisions, vec![2, 3]);
            }
            _ => panic!("expected replay"),
        }
    }

    #[tokio::test]
    async fn connector_error_surfaces_as_error_input() {
        let (persist_tx, _persist_rx) = mpsc::channel(1024);
        let (handle, _event_tx) =
            orbitdock_connector_core::NullConnector::spawn(Default::default());
        let state = SessionState::new(test_config("s1"), "2026-03-01T09:00:00Z");
        let actor = SessionActorHandle::spawn(state, handle, persist_tx);
        let mut rx = actor.subscribe_events();

        // NullConnector rejects send_message; the actor feeds the failure
        // back through the transition as an error event.
        actor
            .send(SessionCommand::Action(Input::UserSentMessage {
                content: "hello".into(),
                attachments: vec![],
            }))
            .await
            .unwrap();
        settle().await;

        let mut saw_error = false;
        while let Ok(frame) = rx.try_recv() {
            if frame_json(&frame)["type"] == "error" {
                saw_error = true;
            }
        }
        assert!(saw_error, "connector failure should emit an error frame");
        assert_eq!(actor.snapshot().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn ended_session_drops_late_events() {
        let (actor, event_tx, _call_rx, _persist_rx) = spawn_actor();
        actor
            .send(SessionCommand::EndLocally {
                reason: "test_over".into(),
            })
            .await
            .unwrap();
        settle().await;

        let revision = actor.snapshot().revision;
        event_tx.send(ConnectorEvent::TurnStarted).await.unwrap();
        settle().await;

        let snap = actor.snapshot();
        assert_eq!(snap.phase, Phase::Ended);
        assert_eq!(snap.revision, revision);
    }
}
