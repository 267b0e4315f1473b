//! Session registry — lock-free map of session id to actor handle.
//!
//! All methods take `&self`; there is no coarse global mutex. Reads go
//! through `DashMap` shards and the per-session `ArcSwap` snapshots, so
//! list enumeration never blocks an actor.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use orbitdock_connector_core::ConnectorHandle;
use orbitdock_protocol::{ServerMessage, SessionSummary};

use crate::hooks::PendingHookSession;
use crate::persistence::PersistCommand;
use crate::session_actor::SessionActorHandle;
use crate::session_command::SessionCommand;
use crate::transition::SessionState;

/// List bus capacity; slow list subscribers lag and re-subscribe.
const LIST_BUS_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown session: {0}")]
    NotFound(String),

    #[error("session actor closed: {0}")]
    Closed(String),
}

struct SessionEntry {
    handle: SessionActorHandle,
    /// When the sweep first observed this session ended.
    ended_seen_at: Mutex<Option<Instant>>,
}

pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,

    /// Broadcast channel for list-level events
    list_tx: broadcast::Sender<ServerMessage>,

    /// Persistence channel
    persist_tx: mpsc::Sender<PersistCommand>,

    /// Hook sessions awaiting their first actionable event before
    /// materialization. Keyed by the CLI-reported session id.
    pending_hooks: DashMap<String, PendingHookSession>,
}

impl SessionRegistry {
    pub fn new(persist_tx: mpsc::Sender<PersistCommand>) -> Self {
        let (list_tx, _) = broadcast::channel(LIST_BUS_CAPACITY);
        Self {
            sessions: DashMap::new(),
            list_tx,
            persist_tx,
            pending_hooks: DashMap::new(),
        }
    }

    pub fn persist(&self) -> &mpsc::Sender<PersistCommand> {
        &self.persist_tx
    }

    /// Spawn an actor for `state`, enqueue the durable upsert, and announce
    /// it on the list bus.
    pub async fn spawn_session(
        &self,
        state: SessionState,
        connector: ConnectorHandle,
    ) -> SessionActorHandle {
        let snapshot = state.snapshot();
        let summary = snapshot.to_summary();

        if self
            .persist_tx
            .send(PersistCommand::UpsertSession(Box::new(snapshot)))
            .await
            .is_err()
        {
            warn!(
                component = "registry",
                session_id = %summary.id,
                "Persistence channel closed, session upsert dropped"
            );
        }

        let handle = SessionActorHandle::spawn(state, connector, self.persist_tx.clone());
        self.sessions.insert(
            handle.id.clone(),
            SessionEntry {
                handle: handle.clone(),
                ended_seen_at: Mutex::new(None),
            },
        );
        self.broadcast_to_list(ServerMessage::SessionAdded { session: summary });

        info!(
            component = "registry",
            session_id = %handle.id,
            "Session registered"
        );
        handle
    }

    /// Route a command to a session's inbox.
    pub async fn send(&self, id: &str, cmd: SessionCommand) -> Result<(), RegistryError> {
        // Clone the handle out so no shard guard is held across the await.
        let handle = self
            .sessions
            .get(id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        handle
            .send(cmd)
            .await
            .map_err(|_| RegistryError::Closed(id.to_string()))
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self, id: &str) -> Option<std::sync::Arc<orbitdock_protocol::SessionSnapshot>> {
        self.sessions.get(id).map(|entry| entry.handle.snapshot())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Enumerate summaries via the atomic snapshots.
    pub fn list_summaries(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .map(|entry| entry.handle.snapshot().to_summary())
            .collect()
    }

    /// Raw per-session event bus receiver.
    #[allow(dead_code)]
    pub fn subscribe_events(&self, id: &str) -> Option<broadcast::Receiver<std::sync::Arc<str>>> {
        self.sessions
            .get(id)
            .map(|entry| entry.handle.subscribe_events())
    }

    /// List bus receiver.
    pub fn subscribe_list(&self) -> broadcast::Receiver<ServerMessage> {
        self.list_tx.subscribe()
    }

    pub fn broadcast_to_list(&self, msg: ServerMessage) {
        let _ = self.list_tx.send(msg);
    }

    /// Remove a session from the registry (durable rows remain).
    pub fn remove(&self, id: &str) -> Option<SessionActorHandle> {
        let removed = self.sessions.remove(id).map(|(_, entry)| entry.handle);
        if removed.is_some() {
            self.broadcast_to_list(ServerMessage::SessionRemoved {
                session_id: id.to_string(),
            });
        }
        removed
    }

    /// Evict sessions that have been observed ended for longer than `grace`.
    /// Returns the evicted ids.
    pub fn sweep_ended(&self, grace: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut evict = Vec::new();

        for entry in self.sessions.iter() {
            let snap = entry.handle.snapshot();
            if snap.status != orbitdock_protocol::SessionStatus::Ended {
                continue;
            }
            let mut seen = entry
                .ended_seen_at
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            match *seen {
                Some(at) if now.duration_since(at) >= grace => evict.push(entry.key().clone()),
                Some(_) => {}
                None => *seen = Some(now),
            }
        }

        for id in &evict {
            info!(
                component = "registry",
                session_id = %id,
                "Evicting ended session after grace period"
            );
            self.remove(id);
        }
        evict
    }

    /// Ask every actor to drain, checkpoint, and exit.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionActorHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.handle.clone())
            .collect();
        for handle in handles {
            let _ = handle.send(SessionCommand::Shutdown).await;
        }
    }

    // ── Pending hook session cache ──────────────────────────────────────

    pub fn cache_pending_hook(&self, session_id: String, pending: PendingHookSession) {
        self.pending_hooks.insert(session_id, pending);
    }

    pub fn take_pending_hook(&self, session_id: &str) -> Option<PendingHookSession> {
        self.pending_hooks.remove(session_id).map(|(_, v)| v)
    }

    /// Returns true if there was a pending entry to discard.
    pub fn discard_pending_hook(&self, session_id: &str) -> bool {
        self.pending_hooks.remove(session_id).is_some()
    }

    /// Drop pending entries older than `ttl` (bootstrap ghosts).
    pub fn expire_pending_hooks(&self, ttl: Duration) {
        let cutoff = Instant::now() - ttl;
        self.pending_hooks
            .retain(|_, pending| pending.cached_at > cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::test_config;
    use crate::transition::Input;
    use orbitdock_connector_core::ChannelConnector;
    use orbitdock_protocol::{Phase, SessionStatus};

    fn registry() -> (SessionRegistry, mpsc::Receiver<PersistCommand>) {
        let (persist_tx, persist_rx) = mpsc::channel(1024);
        (SessionRegistry::new(persist_tx), persist_rx)
    }

    async fn spawn_in(registry: &SessionRegistry, id: &str) -> SessionActorHandle {
        let (connector, _event_tx, _call_rx) = ChannelConnector::spawn();
        let state = SessionState::new(test_config(id), "2026-03-01T09:00:00Z");
        registry.spawn_session(state, connector).await
    }

    #[tokio::test]
    async fn spawn_emits_session_added_and_upserts() {
        let (registry, mut persist_rx) = registry();
        let mut list_rx = registry.subscribe_list();

        spawn_in(&registry, "s1").await;

        assert!(matches!(
            persist_rx.recv().await,
            Some(PersistCommand::UpsertSession(_))
        ));
        assert!(matches!(
            list_rx.recv().await,
            Ok(ServerMessage::SessionAdded { .. })
        ));
        assert!(registry.contains("s1"));
        assert_eq!(registry.list_summaries().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_creation_yields_distinct_handles() {
        let (registry, _persist_rx) = registry();
        let a = spawn_in(&registry, "s-a").await;
        let b = spawn_in(&registry, "s-b").await;
        assert_ne!(a.id, b.id);
        assert!(registry.snapshot("s-a").is_some());
        assert!(registry.snapshot("s-b").is_some());
    }

    #[tokio::test]
    async fn send_to_unknown_session_errors() {
        let (registry, _persist_rx) = registry();
        let err = registry
            .send("nope", SessionCommand::Action(Input::UserInterrupted))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn sweep_evicts_only_after_grace() {
        let (registry, _persist_rx) = registry();
        spawn_in(&registry, "s1").await;

        registry
            .send(
                "s1",
                SessionCommand::EndLocally {
                    reason: "test".into(),
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            registry.snapshot("s1").unwrap().status,
            SessionStatus::Ended
        );

        // First sweep records the observation, second (after grace) evicts.
        assert!(registry.sweep_ended(Duration::from_millis(20)).is_empty());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut list_rx = registry.subscribe_list();
        let evicted = registry.sweep_ended(Duration::from_millis(20));
        assert_eq!(evicted, vec!["s1".to_string()]);
        assert!(!registry.contains("s1"));
        assert!(matches!(
            list_rx.recv().await,
            Ok(ServerMessage::SessionRemoved { session_id }) if session_id == "s1"
        ));
    }

    #[tokio::test]
    async fn active_sessions_survive_sweep() {
        let (registry, _persist_rx) = registry();
        let handle = spawn_in(&registry, "s1").await;
        assert!(registry.sweep_ended(Duration::ZERO).is_empty());
        assert!(registry.contains("s1"));
        assert_eq!(handle.snapshot().phase, Phase::Idle);
    }
}
