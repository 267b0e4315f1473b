//! End-to-end scenarios for the session runtime: registry, actor,
//! transition, ring-buffer replay, and restart recovery working together.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use orbitdock_connector_core::{ChannelConnector, ConnectorCall, ConnectorEvent};
use orbitdock_protocol::{
    ApprovalDecision, ApprovalKind, ApprovalRequest, Message, MessageRole, Phase, TokenUsage,
};

use crate::persistence::{create_persistence_channel, PersistenceWriter};
use crate::registry::{RegistryError, SessionRegistry};
use crate::session::test_support::test_config;
use crate::session_actor::SessionActorHandle;
use crate::session_command::{SessionCommand, SubscribeResult};
use crate::transition::{Input, SessionState};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn frame_json(frame: &Arc<str>) -> serde_json::Value {
    serde_json::from_str(frame).expect("valid frame json")
}

struct Harness {
    registry: Arc<SessionRegistry>,
    _persist_rx: mpsc::Receiver<crate::persistence::PersistCommand>,
}

impl Harness {
    fn new() -> Self {
        let (persist_tx, persist_rx) = mpsc::channel(4096);
        Harness {
            registry: Arc::new(SessionRegistry::new(persist_tx)),
            _persist_rx: persist_rx,
        }
    }

    async fn spawn(
        &self,
        id: &str,
    ) -> (
        SessionActorHandle,
        mpsc::Sender<ConnectorEvent>,
        mpsc::UnboundedReceiver<ConnectorCall>,
    ) {
        let (connector, event_tx, call_rx) = ChannelConnector::spawn();
        let state = SessionState::new(test_config(id), "2026-03-01T09:00:00Z");
        let handle = self.registry.spawn_session(state, connector).await;
        (handle, event_tx, call_rx)
    }
}

async fn subscribe(
    registry: &SessionRegistry,
    id: &str,
    since_revision: Option<u64>,
) -> SubscribeResult {
    let (reply, rx) = oneshot::channel();
    registry
        .send(
            id,
            SessionCommand::Subscribe {
                since_revision,
                reply,
            },
        )
        .await
        .expect("session routable");
    rx.await.expect("subscribe reply")
}

// Scenario A — basic turn: message in, turn, reply, completion, with exact
// revision numbering observed through replay.
#[tokio::test]
async fn basic_turn_assigns_expected_revisions() {
    let harness = Harness::new();
    let (_handle, event_tx, mut call_rx) = harness.spawn("S1").await;

    harness
        .registry
        .send(
            "S1",
            SessionCommand::Action(Input::UserSentMessage {
                content: "hello".into(),
                attachments: vec![],
            }),
        )
        .await
        .unwrap();
    settle().await;

    assert!(matches!(
        call_rx.recv().await,
        Some(ConnectorCall::SendMessage { content, .. }) if content == "hello"
    ));

    event_tx.send(ConnectorEvent::TurnStarted).await.unwrap();
    event_tx
        .send(ConnectorEvent::MessageCreated(Message {
            id: "m-reply".into(),
            session_id: String::new(),
            role: MessageRole::Assistant,
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
                input_tokens: 12,
                output_tokens: 4,
                cached_tokens: 0,
                context_window: 1000,
            }),
        })
        .await
        .unwrap();
    settle().await;

    // Replay from 0 shows the full numbered sequence.
    let SubscribeResult::Replay { events, .. } =
        subscribe(&harness.registry, "S1", Some(0)).await
    else {
        panic!("expected replay");
    };
    let seen: Vec<(u64, String)> = events
        .iter()
        .map(|f| {
            let v = frame_json(f);
            (
                v["revision"].as_u64().unwrap(),
                v["type"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(
        seen,
        vec![
            (1, "message_appended".to_string()),
            (2, "session_delta".to_string()),
            (3, "message_appended".to_string()),
            (4, "tokens_updated".to_string()),
            (5, "session_delta".to_string()),
        ]
    );

    let snap = harness.registry.snapshot("S1").unwrap();
    assert_eq!(snap.phase, Phase::Idle);
    assert_eq!(snap.revision, 5);
    assert_eq!(snap.prompt_count, 1);
}

// Scenario B — approval with amendment: phase round-trips through
// AwaitingApproval and the connector receives the amended input.
#[tokio::test]
async fn approval_amend_reaches_connector() {
    let harness = Harness::new();
    let (_handle, event_tx, mut call_rx) = harness.spawn("S1").await;

    event_tx.send(ConnectorEvent::TurnStarted).await.unwrap();
    event_tx
        .send(ConnectorEvent::ApprovalRequested(ApprovalRequest {
            request_id: "R".into(),
            kind: ApprovalKind::Exec,
            tool_name: Some("Bash".into()),
            tool_input: Some(serde_json::json!({ "cmd": "rm foo" })),
            prompt: None,
            decision_options: vec![ApprovalDecision::Approved, ApprovalDecision::Denied],
            proposed_amendment: None,
        }))
        .await
        .unwrap();
    settle().await;

    let snap = harness.registry.snapshot("S1").unwrap();
    assert_eq!(snap.phase, Phase::AwaitingApproval);
    let revision_at_request = snap.revision;
    assert!(snap.pending_approval.is_some());

    let amended = serde_json::json!({ "cmd": "rm ./foo" });
    harness
        .registry
        .send(
            "S1",
            SessionCommand::Action(Input::UserApproved {
                request_id: "R".into(),
                decision: ApprovalDecision::Approved,
                amended_input: Some(amended.clone()),
            }),
        )
        .await
        .unwrap();
    settle().await;

    let snap = harness.registry.snapshot("S1").unwrap();
    assert_eq!(snap.phase, Phase::Working);
    assert_eq!(snap.revision, revision_at_request + 1);
    assert!(snap.pending_approval.is_none());

    assert_eq!(
        call_rx.recv().await,
        Some(ConnectorCall::Approve {
            request_id: "R".into(),
            amended_input: Some(amended),
        })
    );
}

// Scenario C — replay from a baseline, and lagged refusal once the ring
// buffer has wrapped past it.
#[tokio::test]
async fn replay_then_lagged_after_ring_wrap() {
    let harness = Harness::new();
    let (_handle, event_tx, _call_rx) = harness.spawn("S1").await;

    for i in 0..10 {
        event_tx
            .send(ConnectorEvent::DiffUpdated(format!("d{i}")))
            .await
            .unwrap();
    }
    settle().await;

    // Three events after the subscriber's baseline of 10.
    for i in 0..3 {
        event_tx
            .send(ConnectorEvent::PlanUpdated(format!("p{i}")))
            .await
            .unwrap();
    }
    settle().await;

    let SubscribeResult::Replay { events, mut rx } =
        subscribe(&harness.registry, "S1", Some(10)).await
    else {
        panic!("expected replay");
    };
    let revisions: Vec<u64> = events
        .iter()
        .map(|f| frame_json(f)["revision"].as_u64().unwrap())
        .collect();
    assert_eq!(revisions, vec![11, 12, 13]);

    // Live events resume after the replayed ones.
    event_tx
        .send(ConnectorEvent::DiffUpdated("after".into()))
        .await
        .unwrap();
    settle().await;
    let live = rx.recv().await.expect("live frame");
    assert_eq!(frame_json(&live)["type"], "session_delta");

    // Push the ring past capacity: the old baseline is no longer servable.
    for i in 0..crate::event_log::EVENT_LOG_CAPACITY + 1 {
        event_tx
            .send(ConnectorEvent::DiffUpdated(format!("w{i}")))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(matches!(
        subscribe(&harness.registry, "S1", Some(10)).await,
        SubscribeResult::Lagged
    ));
}

// Scenario D — slow client isolation: one lagging subscriber is cut off
// with a lag signal while the other receives every event in order.
#[tokio::test]
async fn slow_subscriber_does_not_affect_fast_one() {
    let harness = Harness::new();
    let (_handle, event_tx, _call_rx) = harness.spawn("S1").await;

    let mut slow_rx = harness.registry.subscribe_events("S1").unwrap();
    let mut fast_rx = harness.registry.subscribe_events("S1").unwrap();

    const TOTAL: usize = 300;
    let collector = tokio::spawn(async move {
        let mut count = 0usize;
        while count < TOTAL {
            match fast_rx.recv().await {
                Ok(_) => count += 1,
                Err(e) => panic!("fast subscriber saw {e:?} after {count} events"),
            }
        }
        count
    });

    // Chunked sends give the fast subscriber room to drain; the idle one
    // accumulates past the broadcast capacity regardless.
    for chunk in 0..6 {
        for i in 0..50 {
            event_tx
                .send(ConnectorEvent::DiffUpdated(format!("d{chunk}-{i}")))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(collector.await.unwrap(), TOTAL);

    // The broadcast capacity (256) is below TOTAL, so the idle receiver
    // must observe a lag rather than silently missing frames.
    assert!(matches!(
        slow_rx.recv().await,
        Err(tokio::sync::broadcast::error::RecvError::Lagged(_))
    ));
}

// Scenario E — terminal phase is absorbing and eviction makes the session
// unroutable.
#[tokio::test]
async fn ended_session_then_eviction() {
    let harness = Harness::new();
    let (_handle, event_tx, _call_rx) = harness.spawn("S1").await;

    harness
        .registry
        .send("S1", SessionCommand::Action(Input::UserEndedSession))
        .await
        .unwrap();
    settle().await;

    let snap = harness.registry.snapshot("S1").unwrap();
    assert_eq!(snap.phase, Phase::Ended);
    assert_eq!(snap.end_reason.as_deref(), Some("user_ended"));
    assert!(snap.pending_approval.is_none());
    let revision = snap.revision;

    // Late connector events and user actions are dropped.
    event_tx.send(ConnectorEvent::TurnStarted).await.unwrap();
    harness
        .registry
        .send(
            "S1",
            SessionCommand::Action(Input::UserSentMessage {
                content: "too late".into(),
                attachments: vec![],
            }),
        )
        .await
        .unwrap();
    settle().await;
    assert_eq!(harness.registry.snapshot("S1").unwrap().revision, revision);

    // After the grace period the sweep removes the handle entirely.
    harness.registry.sweep_ended(Duration::ZERO);
    harness.registry.sweep_ended(Duration::ZERO);
    let err = harness
        .registry
        .send(
            "S1",
            SessionCommand::Action(Input::UserSentMessage {
                content: "gone".into(),
                attachments: vec![],
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));
}

// Scenario F — restart recovery: sessions and messages written through the
// real persistence writer come back Active/Idle at revision 0.
#[tokio::test]
async fn restart_recovers_sessions_and_messages() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("orbitdock.db");
    {
        let mut conn = rusqlite::Connection::open(&db_path).expect("open");
        crate::migration_runner::run_migrations(&mut conn).expect("migrations");
    }

    let (persist_tx, persist_rx) = create_persistence_channel();
    let writer = tokio::spawn(PersistenceWriter::new(persist_rx, db_path.clone()).run());
    let registry = Arc::new(SessionRegistry::new(persist_tx.clone()));

    for id in ["F1", "F2"] {
        let (connector, _event_tx, mut call_rx) = ChannelConnector::spawn();
        // Keep the call stream alive for the session's lifetime.
        tokio::spawn(async move { while call_rx.recv().await.is_some() {} });
        let state = SessionState::new(test_config(id), "2026-03-01T09:00:00Z");
        registry.spawn_session(state, connector).await;
        for i in 0..5 {
            registry
                .send(
                    id,
                    SessionCommand::Action(Input::UserSentMessage {
                        content: format!("{id} message {i}"),
                        attachments: vec![],
                    }),
                )
                .await
                .unwrap();
        }
    }

    // Let the 16ms batch window flush everything, then "kill" the process.
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(registry);
    drop(persist_tx);

    let restored = crate::persistence::load_sessions_for_startup(db_path)
        .await
        .expect("restore");
    assert_eq!(restored.len(), 2);
    for rs in &restored {
        assert_eq!(rs.status, orbitdock_protocol::SessionStatus::Active);
        assert_eq!(rs.messages.len(), 5);
        assert_eq!(rs.prompt_count, 5);

        let state = crate::websocket::restored_to_state(rs);
        assert_eq!(state.revision, 0);
        assert_eq!(state.phase, crate::transition::WorkPhase::Idle);
    }

    // The writer exits once every sender is gone (actors included).
    let _ = tokio::time::timeout(Duration::from_secs(5), writer).await;
}
