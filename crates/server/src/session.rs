//! Session construction and snapshot projection.
//!
//! `SessionState` itself lives in `transition.rs` (the pure core owns the
//! shape); this module builds fresh, restored, and forked sessions and
//! projects the atomic `SessionSnapshot` the actor publishes.

use orbitdock_protocol::{
    IntegrationMode, Message, Provider, SessionSnapshot, SessionStatus, TokenUsage,
};

use crate::transition::{SessionState, WorkPhase};

/// Parameters for creating a brand-new session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub id: String,
    pub provider: Provider,
    pub integration_mode: IntegrationMode,
    pub project_path: String,
    pub branch: Option<String>,
    pub model: Option<String>,
    pub approval_policy: Option<String>,
    pub sandbox_mode: Option<String>,
    pub workstream_id: Option<String>,
    pub terminal_session_id: Option<String>,
    pub forked_from: Option<String>,
}

impl SessionState {
    /// A fresh session: `phase = Idle`, `status = Active`, `revision = 0`.
    pub fn new(config: SessionConfig, now: &str) -> Self {
        SessionState {
            id: config.id,
            revision: 0,
            phase: WorkPhase::Idle,
            status: SessionStatus::Active,
            provider: config.provider,
            integration_mode: config.integration_mode,
            project_path: config.project_path,
            branch: config.branch,
            model: config.model,
            custom_name: None,
            summary: None,
            first_prompt: None,
            approval_policy: config.approval_policy,
            sandbox_mode: config.sandbox_mode,
            created_at: now.to_string(),
            last_activity_at: Some(now.to_string()),
            forked_from: config.forked_from,
            workstream_id: config.workstream_id,
            terminal_session_id: config.terminal_session_id,
            messages: Vec::new(),
            tokens: TokenUsage::default(),
            current_diff: None,
            current_plan: None,
            prompt_count: 0,
            tool_count: 0,
            pending_approval: None,
            end_reason: None,
        }
    }

    /// Rebuild a session from durable storage. Restored sessions always come
    /// back `Active`/`Idle` with an empty event log and `revision = 0`.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        config: SessionConfig,
        custom_name: Option<String>,
        summary: Option<String>,
        first_prompt: Option<String>,
        created_at: String,
        last_activity_at: Option<String>,
        tokens: TokenUsage,
        prompt_count: u64,
        tool_count: u64,
        messages: Vec<Message>,
    ) -> Self {
        let mut state = SessionState::new(config, &created_at);
        state.custom_name = custom_name;
        state.summary = summary;
        state.first_prompt = first_prompt;
        state.last_activity_at = last_activity_at;
        state.tokens = tokens;
        state.prompt_count = prompt_count;
        state.tool_count = tool_count;
        state.messages = messages;
        state
    }

    /// Project the public snapshot. Messages and diffs stream separately.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            revision: self.revision,
            provider: self.provider,
            integration_mode: self.integration_mode,
            status: self.status,
            phase: self.phase.to_wire(),
            pending_approval: self.pending_approval.clone(),
            project_path: self.project_path.clone(),
            branch: self.branch.clone(),
            model: self.model.clone(),
            custom_name: self.custom_name.clone(),
            summary: self.summary.clone(),
            first_prompt: self.first_prompt.clone(),
            approval_policy: self.approval_policy.clone(),
            sandbox_mode: self.sandbox_mode.clone(),
            tokens: self.tokens.clone(),
            prompt_count: self.prompt_count,
            tool_count: self.tool_count,
            created_at: self.created_at.clone(),
            last_activity_at: self.last_activity_at.clone(),
            forked_from: self.forked_from.clone(),
            workstream_id: self.workstream_id.clone(),
            terminal_session_id: self.terminal_session_id.clone(),
            end_reason: self.end_reason.clone(),
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub fn test_config(id: &str) -> SessionConfig {
        SessionConfig {
            id: id.to_string(),
            provider: Provider::Claude,
            integration_mode: IntegrationMode::Direct,
            project_path: "/tmp/project".to_string(),
            branch: None,
            model: Some("claude-sonnet".to_string()),
            approval_policy: None,
            sandbox_mode: None,
            workstream_id: None,
            terminal_session_id: None,
            forked_from: None,
        }
    }

    pub fn test_state() -> SessionState {
        SessionState::new(test_config("test-session"), "2026-03-01T09:00:00Z")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn new_session_starts_idle_active_revision_zero() {
        let state = SessionState::new(test_config("s1"), "2026-03-01T09:00:00Z");
        assert_eq!(state.revision, 0);
        assert_eq!(state.status, SessionStatus::Active);
        assert_eq!(state.phase, WorkPhase::Idle);
        assert!(state.messages.is_empty());
    }

    #[test]
    fn snapshot_projects_wire_phase() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;
        let snap = state.snapshot();
        assert_eq!(snap.phase, orbitdock_protocol::Phase::Working);
        assert_eq!(snap.id, "test-session");
        assert_eq!(snap.revision, 0);
    }
}
