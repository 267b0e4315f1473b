//! Persistence layer — batched SQLite writes.
//!
//! A single writer task drains a bounded command channel and flushes
//! batches inside one transaction, using `spawn_blocking` for async-safe
//! SQLite access. Writes are fire-and-forget from the actors' perspective;
//! per-session ordering is preserved by channel FIFO. In-memory state stays
//! authoritative when a batch is dropped — restart reloads from storage.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use orbitdock_protocol::{
    ApprovalKind, ApprovalRequest, IntegrationMode, Message, MessageRole, Phase, Provider,
    ReviewComment, SessionSnapshot, SessionStatus, TokenUsage,
};

use crate::util::now_iso8601;

/// Bounded command channel; a saturated channel backpressures the sending
/// actor only.
const PERSIST_CHANNEL_CAPACITY: usize = 1024;
/// Flush once this many commands are buffered, or when the window elapses.
const BATCH_MAX_COMMANDS: usize = 32;
const BATCH_WINDOW: Duration = Duration::from_millis(16);
/// Transient-failure retry schedule (busy/locked).
const RETRY_BACKOFF: &[Duration] = &[
    Duration::from_millis(50),
    Duration::from_millis(100),
    Duration::from_millis(200),
];

/// Commands that can be persisted
#[derive(Debug, Clone)]
pub enum PersistCommand {
    /// Create or refresh a session row from its snapshot
    UpsertSession(Box<SessionSnapshot>),

    /// Update session lifecycle fields
    UpdateSessionFields {
        id: String,
        status: Option<SessionStatus>,
        phase: Option<Phase>,
        end_reason: Option<String>,
        last_activity_at: Option<String>,
    },

    /// Append a message
    InsertMessage { message: Message },

    /// Update a message's content
    UpdateMessage {
        session_id: String,
        message_id: String,
        content: Option<String>,
        updated_at: String,
    },

    /// Replace cumulative token usage
    SetTokens {
        session_id: String,
        usage: TokenUsage,
    },

    /// Bump the tool counter
    IncrementToolCount { session_id: String },

    /// Bump the prompt counter; set first_prompt / derived name if unset
    RecordPrompt {
        session_id: String,
        first_prompt: Option<String>,
        custom_name: Option<String>,
    },

    SetCustomName {
        session_id: String,
        custom_name: Option<String>,
    },

    SetModel {
        session_id: String,
        model: Option<String>,
    },

    SetBranch {
        session_id: String,
        branch: Option<String>,
    },

    SetSessionConfig {
        session_id: String,
        approval_policy: Option<String>,
        sandbox_mode: Option<String>,
    },

    SetSummary {
        session_id: String,
        summary: Option<String>,
    },

    /// Update the transient diff/plan columns
    UpdateTurnArtifacts {
        session_id: String,
        diff: Option<String>,
        plan: Option<String>,
    },

    /// Record an approval request (decision left NULL until decided)
    RecordApprovalRequest {
        session_id: String,
        request: ApprovalRequest,
        created_at: String,
    },

    /// Record the user decision for an approval request
    AppendApprovalDecision {
        session_id: String,
        request_id: String,
        decision: String,
        decided_at: String,
    },

    InsertReviewComment {
        session_id: String,
        message_id: Option<String>,
        file_path: Option<String>,
        line: Option<i64>,
        content: String,
        created_at: String,
    },

    UpdateReviewComment {
        session_id: String,
        comment_id: i64,
        content: String,
        updated_at: String,
    },

    DeleteReviewComment {
        session_id: String,
        comment_id: i64,
    },

    /// Reactivate an ended session (resume)
    ReactivateSession { id: String },
}

/// Create the bounded channel feeding the writer.
pub fn create_persistence_channel() -> (mpsc::Sender<PersistCommand>, mpsc::Receiver<PersistCommand>)
{
    mpsc::channel(PERSIST_CHANNEL_CAPACITY)
}

/// Persistence writer that batches SQLite writes.
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistCommand>,
    db_path: PathBuf,
    batch: Vec<PersistCommand>,
}

impl PersistenceWriter {
    pub fn new(rx: mpsc::Receiver<PersistCommand>, db_path: PathBuf) -> Self {
        Self {
            rx,
            db_path,
            batch: Vec::with_capacity(BATCH_MAX_COMMANDS * 2),
        }
    }

    /// Run the persistence writer (call from tokio::spawn).
    pub async fn run(mut self) {
        info!(
            component = "persistence",
            event = "persistence.started",
            db_path = %self.db_path.display(),
            "Persistence writer started"
        );

        let mut interval = tokio::time::interval(BATCH_WINDOW);
        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            self.batch.push(cmd);
                            if self.batch.len() >= BATCH_MAX_COMMANDS {
                                self.flush().await;
                            }
                        }
                        None => {
                            // All senders gone: final flush, then exit.
                            self.flush().await;
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        info!(
            component = "persistence",
            event = "persistence.stopped",
            "Persistence writer stopped"
        );
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batch);
        let db_path = self.db_path.clone();

        let result = tokio::task::spawn_blocking(move || flush_batch(&db_path, batch)).await;
        match result {
            Ok(Ok(count)) => {
                debug!(
                    component = "persistence",
                    event = "persistence.flushed",
                    commands = count,
                );
            }
            Ok(Err(e)) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_failed",
                    error = %e,
                    "Batch dropped — in-memory state remains authoritative"
                );
            }
            Err(e) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_panicked",
                    error = %e,
                );
            }
        }
    }
}

/// Flush a batch in one transaction, retrying transient busy/locked errors
/// with bounded backoff (runs on a blocking thread).
pub fn flush_batch(db_path: &Path, batch: Vec<PersistCommand>) -> Result<usize, rusqlite::Error> {
    let mut last_err = None;
    for (attempt, backoff) in std::iter::once(&Duration::ZERO)
        .chain(RETRY_BACKOFF.iter())
        .enumerate()
    {
        if !backoff.is_zero() {
            std::thread::sleep(*backoff);
        }
        match try_flush(db_path, &batch) {
            Ok(count) => return Ok(count),
            Err(e) if is_transient(&e) => {
                warn!(
                    component = "persistence",
                    event = "persistence.retry",
                    attempt = attempt,
                    error = %e,
                    "Transient SQLite error, retrying batch"
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or(rusqlite::Error::InvalidQuery))
}

fn try_flush(db_path: &Path, batch: &[PersistCommand]) -> Result<usize, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    let tx = conn.unchecked_transaction()?;
    for cmd in batch {
        if let Err(e) = execute_command(&tx, cmd) {
            if is_transient(&e) {
                return Err(e);
            }
            // Per-command failures (constraint violations etc.) don't sink
            // the batch; ordering for the session is already lost anyway.
            warn!(
                component = "persistence",
                event = "persistence.command_failed",
                error = %e,
            );
        }
    }
    tx.commit()?;
    Ok(batch.len())
}

fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::DatabaseBusy || inner.code == ErrorCode::DatabaseLocked
    )
}

fn execute_command(conn: &Connection, cmd: &PersistCommand) -> Result<(), rusqlite::Error> {
    match cmd {
        PersistCommand::UpsertSession(snapshot) => {
            conn.execute(
                "INSERT INTO sessions (
                    id, provider, integration_mode, project_path, branch, model,
                    custom_name, summary, first_prompt, status, phase,
                    approval_policy, sandbox_mode, prompt_count, tool_count,
                    forked_from_session_id, workstream_id, terminal_session_id,
                    created_at, last_activity_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
                 ON CONFLICT(id) DO UPDATE SET
                    project_path = excluded.project_path,
                    branch = COALESCE(excluded.branch, sessions.branch),
                    model = COALESCE(excluded.model, sessions.model),
                    custom_name = COALESCE(excluded.custom_name, sessions.custom_name),
                    status = excluded.status,
                    phase = excluded.phase,
                    last_activity_at = excluded.last_activity_at",
                params![
                    snapshot.id,
                    provider_str(snapshot.provider),
                    integration_mode_str(snapshot.integration_mode),
                    snapshot.project_path,
                    snapshot.branch,
                    snapshot.model,
                    snapshot.custom_name,
                    snapshot.summary,
                    snapshot.first_prompt,
                    status_str(snapshot.status),
                    phase_str(snapshot.phase),
                    snapshot.approval_policy,
                    snapshot.sandbox_mode,
                    snapshot.prompt_count as i64,
                    snapshot.tool_count as i64,
                    snapshot.forked_from,
                    snapshot.workstream_id,
                    snapshot.terminal_session_id,
                    snapshot.created_at,
                    snapshot.last_activity_at,
                ],
            )?;
        }

        PersistCommand::UpdateSessionFields {
            id,
            status,
            phase,
            end_reason,
            last_activity_at,
        } => {
            let mut updates: Vec<&str> = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(s) = status {
                updates.push("status = ?");
                values.push(Box::new(status_str(*s)));
                if *s == SessionStatus::Ended {
                    updates.push("ended_at = COALESCE(ended_at, ?)");
                    values.push(Box::new(now_iso8601()));
                }
            }
            if let Some(p) = phase {
                updates.push("phase = ?");
                values.push(Box::new(phase_str(*p)));
            }
            if let Some(reason) = end_reason {
                updates.push("end_reason = ?");
                values.push(Box::new(reason.clone()));
            }
            if let Some(ts) = last_activity_at {
                updates.push("last_activity_at = ?");
                values.push(Box::new(ts.clone()));
            }

            if !updates.is_empty() {
                let sql = format!("UPDATE sessions SET {} WHERE id = ?", updates.join(", "));
                values.push(Box::new(id.clone()));
                let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();
                conn.execute(&sql, rusqlite::params_from_iter(refs))?;
            }
        }

        PersistCommand::InsertMessage { message } => {
            let seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence), -1) + 1 FROM messages WHERE session_id = ?",
                params![message.session_id],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT OR REPLACE INTO messages (
                    id, session_id, role, content, sequence, tool_use_id,
                    parent_message_id, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    message.id,
                    message.session_id,
                    role_str(message.role),
                    message.content,
                    seq,
                    message.tool_use_id,
                    message.parent_message_id,
                    message.created_at,
                    message.updated_at,
                ],
            )?;
        }

        PersistCommand::UpdateMessage {
            session_id,
            message_id,
            content,
            updated_at,
        } => {
            if let Some(content) = content {
                conn.execute(
                    "UPDATE messages SET content = ?1, updated_at = ?2 WHERE id = ?3 AND session_id = ?4",
                    params![content, updated_at, message_id, session_id],
                )?;
            } else {
                conn.execute(
                    "UPDATE messages SET updated_at = ?1 WHERE id = ?2 AND session_id = ?3",
                    params![updated_at, message_id, session_id],
                )?;
            }
        }

        PersistCommand::SetTokens { session_id, usage } => {
            conn.execute(
                "INSERT INTO token_usage (session_id, input_tokens, output_tokens, cached_tokens, context_window, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(session_id) DO UPDATE SET
                    input_tokens = excluded.input_tokens,
                    output_tokens = excluded.output_tokens,
                    cached_tokens = excluded.cached_tokens,
                    context_window = excluded.context_window,
                    updated_at = excluded.updated_at",
                params![
                    session_id,
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    usage.cached_tokens as i64,
                    usage.context_window as i64,
                    now_iso8601(),
                ],
            )?;
        }

        PersistCommand::IncrementToolCount { session_id } => {
            conn.execute(
                "UPDATE sessions SET tool_count = tool_count + 1, last_activity_at = ?1 WHERE id = ?2",
                params![now_iso8601(), session_id],
            )?;
        }

        PersistCommand::RecordPrompt {
            session_id,
            first_prompt,
            custom_name,
        } => {
            conn.execute(
                "UPDATE sessions
                 SET prompt_count = prompt_count + 1,
                     first_prompt = COALESCE(first_prompt, ?1),
                     custom_name = COALESCE(custom_name, ?2),
                     last_activity_at = ?3
                 WHERE id = ?4",
                params![first_prompt, custom_name, now_iso8601(), session_id],
            )?;
        }

        PersistCommand::SetCustomName {
            session_id,
            custom_name,
        } => {
            conn.execute(
                "UPDATE sessions SET custom_name = ?1, last_activity_at = ?2 WHERE id = ?3",
                params![custom_name, now_iso8601(), session_id],
            )?;
        }

        PersistCommand::SetModel { session_id, model } => {
            conn.execute(
                "UPDATE sessions SET model = ?1 WHERE id = ?2",
                params![model, session_id],
            )?;
        }

        PersistCommand::SetBranch { session_id, branch } => {
            conn.execute(
                "UPDATE sessions SET branch = ?1 WHERE id = ?2",
                params![branch, session_id],
            )?;
        }

        PersistCommand::SetSessionConfig {
            session_id,
            approval_policy,
            sandbox_mode,
        } => {
            conn.execute(
                "UPDATE sessions SET approval_policy = ?1, sandbox_mode = ?2, last_activity_at = ?3 WHERE id = ?4",
                params![approval_policy, sandbox_mode, now_iso8601(), session_id],
            )?;
        }

        PersistCommand::SetSummary {
            session_id,
            summary,
        } => {
            conn.execute(
                "UPDATE sessions SET summary = ?1 WHERE id = ?2",
                params![summary, session_id],
            )?;
        }

        PersistCommand::UpdateTurnArtifacts {
            session_id,
            diff,
            plan,
        } => {
            let mut updates: Vec<&str> = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(d) = diff {
                updates.push("current_diff = ?");
                values.push(Box::new(d.clone()));
            }
            if let Some(p) = plan {
                updates.push("current_plan = ?");
                values.push(Box::new(p.clone()));
            }
            if !updates.is_empty() {
                let sql = format!("UPDATE sessions SET {} WHERE id = ?", updates.join(", "));
                values.push(Box::new(session_id.clone()));
                let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();
                conn.execute(&sql, rusqlite::params_from_iter(refs))?;
            }
        }

        PersistCommand::RecordApprovalRequest {
            session_id,
            request,
            created_at,
        } => {
            let tool_input_json = request
                .tool_input
                .as_ref()
                .and_then(|v| serde_json::to_string(v).ok());
            let amendment_json = request
                .proposed_amendment
                .as_ref()
                .and_then(|v| serde_json::to_string(v).ok());
            conn.execute(
                "INSERT INTO approval_decisions (
                    session_id, request_id, kind, tool_name, tool_input, prompt,
                    proposed_amendment, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    session_id,
                    request.request_id,
                    kind_str(request.kind),
                    request.tool_name,
                    tool_input_json,
                    request.prompt,
                    amendment_json,
                    created_at,
                ],
            )?;
        }

        PersistCommand::AppendApprovalDecision {
            session_id,
            request_id,
            decision,
            decided_at,
        } => {
            conn.execute(
                "UPDATE approval_decisions
                 SET decision = ?1, decided_at = ?2
                 WHERE id = (
                   SELECT id FROM approval_decisions
                   WHERE session_id = ?3 AND request_id = ?4 AND decision IS NULL
                   ORDER BY id DESC
                   LIMIT 1
                 )",
                params![decision, decided_at, session_id, request_id],
            )?;
        }

        PersistCommand::InsertReviewComment {
            session_id,
            message_id,
            file_path,
            line,
            content,
            created_at,
        } => {
            conn.execute(
                "INSERT INTO review_comments (session_id, message_id, file_path, line, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![session_id, message_id, file_path, line, content, created_at],
            )?;
        }

        PersistCommand::UpdateReviewComment {
            session_id,
            comment_id,
            content,
            updated_at,
        } => {
            conn.execute(
                "UPDATE review_comments SET content = ?1, updated_at = ?2 WHERE id = ?3 AND session_id = ?4",
                params![content, updated_at, comment_id, session_id],
            )?;
        }

        PersistCommand::DeleteReviewComment {
            session_id,
            comment_id,
        } => {
            conn.execute(
                "DELETE FROM review_comments WHERE id = ?1 AND session_id = ?2",
                params![comment_id, session_id],
            )?;
        }

        PersistCommand::ReactivateSession { id } => {
            conn.execute(
                "UPDATE sessions
                 SET status = 'active', phase = 'idle', ended_at = NULL, end_reason = NULL, last_activity_at = ?1
                 WHERE id = ?2",
                params![now_iso8601(), id],
            )?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Enum <-> column helpers
// ---------------------------------------------------------------------------

fn provider_str(p: Provider) -> &'static str {
    match p {
        Provider::Claude => "claude",
        Provider::Codex => "codex",
    }
}

fn parse_provider(s: &str) -> Provider {
    match s {
        "codex" => Provider::Codex,
        _ => Provider::Claude,
    }
}

fn integration_mode_str(m: IntegrationMode) -> &'static str {
    match m {
        IntegrationMode::Direct => "direct",
        IntegrationMode::Hook => "hook",
    }
}

fn parse_integration_mode(s: &str) -> IntegrationMode {
    match s {
        "direct" => IntegrationMode::Direct,
        _ => IntegrationMode::Hook,
    }
}

fn status_str(s: SessionStatus) -> &'static str {
    match s {
        SessionStatus::Active => "active",
        SessionStatus::Ended => "ended",
    }
}

fn phase_str(p: Phase) -> &'static str {
    match p {
        Phase::Idle => "idle",
        Phase::Working => "working",
        Phase::AwaitingApproval => "awaiting_approval",
        Phase::Ended => "ended",
    }
}

fn role_str(r: MessageRole) -> &'static str {
    match r {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
        MessageRole::System => "system",
    }
}

fn parse_role(s: &str) -> MessageRole {
    match s {
        "user" => MessageRole::User,
        "tool" => MessageRole::Tool,
        "system" => MessageRole::System,
        _ => MessageRole::Assistant,
    }
}

fn kind_str(k: ApprovalKind) -> &'static str {
    match k {
        ApprovalKind::ToolUse => "tool_use",
        ApprovalKind::Exec => "exec",
        ApprovalKind::Question => "question",
    }
}

// ---------------------------------------------------------------------------
// Startup restore & reads
// ---------------------------------------------------------------------------

/// A session restored from the database on startup or resume.
#[derive(Debug)]
pub struct RestoredSession {
    pub id: String,
    pub provider: Provider,
    pub integration_mode: IntegrationMode,
    pub status: SessionStatus,
    pub project_path: String,
    pub branch: Option<String>,
    pub model: Option<String>,
    pub custom_name: Option<String>,
    pub summary: Option<String>,
    pub first_prompt: Option<String>,
    pub approval_policy: Option<String>,
    pub sandbox_mode: Option<String>,
    pub forked_from: Option<String>,
    pub workstream_id: Option<String>,
    pub terminal_session_id: Option<String>,
    pub created_at: String,
    pub last_activity_at: Option<String>,
    pub prompt_count: u64,
    pub tool_count: u64,
    pub tokens: TokenUsage,
    pub messages: Vec<Message>,
}

const SESSION_COLUMNS: &str = "s.id, s.provider, s.integration_mode, s.status, s.project_path, \
     s.branch, s.model, s.custom_name, s.summary, s.first_prompt, s.approval_policy, \
     s.sandbox_mode, s.forked_from_session_id, s.workstream_id, s.terminal_session_id, \
     s.created_at, s.last_activity_at, s.prompt_count, s.tool_count, \
     COALESCE(t.input_tokens, 0), COALESCE(t.output_tokens, 0), \
     COALESCE(t.cached_tokens, 0), COALESCE(t.context_window, 0)";

fn row_to_restored(row: &rusqlite::Row<'_>) -> Result<RestoredSession, rusqlite::Error> {
    let provider: String = row.get(1)?;
    let integration_mode: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(RestoredSession {
        id: row.get(0)?,
        provider: parse_provider(&provider),
        integration_mode: parse_integration_mode(&integration_mode),
        status: if status == "ended" {
            SessionStatus::Ended
        } else {
            SessionStatus::Active
        },
        project_path: row.get(4)?,
        branch: row.get(5)?,
        model: row.get(6)?,
        custom_name: row.get(7)?,
        summary: row.get(8)?,
        first_prompt: row.get(9)?,
        approval_policy: row.get(10)?,
        sandbox_mode: row.get(11)?,
        forked_from: row.get(12)?,
        workstream_id: row.get(13)?,
        terminal_session_id: row.get(14)?,
        created_at: row.get(15)?,
        last_activity_at: row.get(16)?,
        prompt_count: row.get::<_, i64>(17)?.max(0) as u64,
        tool_count: row.get::<_, i64>(18)?.max(0) as u64,
        tokens: TokenUsage {
            input_tokens: row.get::<_, i64>(19)?.max(0) as u64,
            output_tokens: row.get::<_, i64>(20)?.max(0) as u64,
            cached_tokens: row.get::<_, i64>(21)?.max(0) as u64,
            context_window: row.get::<_, i64>(22)?.max(0) as u64,
        },
        messages: Vec::new(),
    })
}

fn open_reader(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

fn load_messages_sync(conn: &Connection, session_id: &str) -> Result<Vec<Message>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, role, content, tool_use_id, parent_message_id, created_at, updated_at
         FROM messages
         WHERE session_id = ?
         ORDER BY sequence",
    )?;
    let messages = stmt
        .query_map(params![session_id], |row| {
            let role: String = row.get(1)?;
            Ok(Message {
                id: row.get(0)?,
                session_id: session_id.to_string(),
                role: parse_role(&role),
                content: row.get(2)?,
                tool_use_id: row.get(3)?,
                parent_message_id: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(messages)
}

/// Load active sessions for server restart recovery. Ended sessions are
/// loaded on demand (resume) and are not hydrated into the live registry.
pub async fn load_sessions_for_startup(db_path: PathBuf) -> anyhow::Result<Vec<RestoredSession>> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<RestoredSession>> {
        if !db_path.exists() {
            return Ok(Vec::new());
        }
        let conn = open_reader(&db_path)?;

        let sql = format!(
            "SELECT {SESSION_COLUMNS}
             FROM sessions s
             LEFT JOIN token_usage t ON t.session_id = s.id
             WHERE s.status = 'active'
             ORDER BY s.last_activity_at DESC, s.created_at DESC
             LIMIT 1000"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut sessions: Vec<RestoredSession> = stmt
            .query_map([], row_to_restored)?
            .filter_map(|r| r.ok())
            .collect();

        for session in &mut sessions {
            session.messages = load_messages_sync(&conn, &session.id)?;
        }
        Ok(sessions)
    })
    .await?
}

/// Load one session by id — includes ended sessions, for resume/fork.
pub async fn load_session_by_id(
    db_path: PathBuf,
    id: String,
) -> anyhow::Result<Option<RestoredSession>> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<Option<RestoredSession>> {
        if !db_path.exists() {
            return Ok(None);
        }
        let conn = open_reader(&db_path)?;

        let sql = format!(
            "SELECT {SESSION_COLUMNS}
             FROM sessions s
             LEFT JOIN token_usage t ON t.session_id = s.id
             WHERE s.id = ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let session = stmt.query_row(params![id], row_to_restored).optional()?;

        let Some(mut session) = session else {
            return Ok(None);
        };
        session.messages = load_messages_sync(&conn, &session.id)?;
        Ok(Some(session))
    })
    .await?
}

/// List review comments for a session, oldest first.
pub async fn list_review_comments(
    db_path: PathBuf,
    session_id: String,
) -> anyhow::Result<Vec<ReviewComment>> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<ReviewComment>> {
        if !db_path.exists() {
            return Ok(Vec::new());
        }
        let conn = open_reader(&db_path)?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, message_id, file_path, line, content, created_at, updated_at
             FROM review_comments
             WHERE session_id = ?1
             ORDER BY id",
        )?;
        let comments = stmt
            .query_map(params![session_id], |row| {
                Ok(ReviewComment {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    message_id: row.get(2)?,
                    file_path: row.get(3)?,
                    line: row.get(4)?,
                    content: row.get(5)?,
                    created_at: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(comments)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration_runner;
    use orbitdock_protocol::new_id;

    fn test_db() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("orbitdock.db");
        let mut conn = Connection::open(&db_path).expect("open db");
        migration_runner::run_migrations(&mut conn).expect("migrations");
        (dir, db_path)
    }

    fn snapshot(id: &str) -> SessionSnapshot {
        SessionSnapshot {
            id: id.to_string(),
            revision: 0,
            provider: Provider::Claude,
            integration_mode: IntegrationMode::Hook,
            status: SessionStatus::Active,
            phase: Phase::Idle,
            pending_approval: None,
            project_path: "/tmp/project".into(),
            branch: Some("main".into()),
            model: Some("claude-sonnet".into()),
            custom_name: None,
            summary: None,
            first_prompt: None,
            approval_policy: None,
            sandbox_mode: None,
            tokens: TokenUsage::default(),
            prompt_count: 0,
            tool_count: 0,
            created_at: "2026-03-01T09:00:00Z".into(),
            last_activity_at: Some("2026-03-01T09:00:00Z".into()),
            forked_from: None,
            workstream_id: None,
            terminal_session_id: None,
            end_reason: None,
        }
    }

    fn message(session_id: &str, content: &str) -> Message {
        Message {
            id: new_id(),
            session_id: session_id.to_string(),
            role: MessageRole::User,
            content: content.to_string(),
            created_at: "2026-03-01T09:00:01Z".into(),
            updated_at: "2026-03-01T09:00:01Z".into(),
            tool_use_id: None,
            parent_message_id: None,
        }
    }

    #[tokio::test]
    async fn startup_restore_includes_only_active_sessions() {
        let (_dir, db_path) = test_db();

        let mut batch = vec![
            PersistCommand::UpsertSession(Box::new(snapshot("active-1"))),
            PersistCommand::UpsertSession(Box::new(snapshot("ended-1"))),
            PersistCommand::UpdateSessionFields {
                id: "ended-1".into(),
                status: Some(SessionStatus::Ended),
                phase: Some(Phase::Ended),
                end_reason: Some("user_ended".into()),
                last_activity_at: None,
            },
        ];
        for i in 0..5 {
            batch.push(PersistCommand::InsertMessage {
                message: message("active-1", &format!("msg {i}")),
            });
        }
        flush_batch(&db_path, batch).expect("flush");

        let restored = load_sessions_for_startup(db_path).await.expect("restore");
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id, "active-1");
        assert_eq!(restored[0].status, SessionStatus::Active);
        assert_eq!(restored[0].messages.len(), 5);
        assert_eq!(restored[0].messages[0].content, "msg 0");
        assert_eq!(restored[0].messages[4].content, "msg 4");
    }

    #[tokio::test]
    async fn tokens_round_trip_through_token_usage_table() {
        let (_dir, db_path) = test_db();

        flush_batch(
            &db_path,
            vec![
                PersistCommand::UpsertSession(Box::new(snapshot("s1"))),
                PersistCommand::SetTokens {
                    session_id: "s1".into(),
                    usage: TokenUsage {
                        input_tokens: 1000,
                        output_tokens: 250,
                        cached_tokens: 600,
                        context_window: 200_000,
                    },
                },
            ],
        )
        .expect("flush");

        let restored = load_session_by_id(db_path, "s1".into())
            .await
            .expect("load")
            .expect("present");
        assert_eq!(restored.tokens.input_tokens, 1000);
        assert_eq!(restored.tokens.cached_tokens, 600);
    }

    #[tokio::test]
    async fn approval_request_then_decision_updates_same_row() {
        let (_dir, db_path) = test_db();

        let request = ApprovalRequest {
            request_id: "req-1".into(),
            kind: ApprovalKind::Exec,
            tool_name: Some("Bash".into()),
            tool_input: Some(serde_json::json!({ "cmd": "rm foo" })),
            prompt: None,
            decision_options: vec![],
            proposed_amendment: None,
        };
        flush_batch(
            &db_path,
            vec![
                PersistCommand::UpsertSession(Box::new(snapshot("s1"))),
                PersistCommand::RecordApprovalRequest {
                    session_id: "s1".into(),
                    request,
                    created_at: "2026-03-01T09:00:02Z".into(),
                },
                PersistCommand::AppendApprovalDecision {
                    session_id: "s1".into(),
                    request_id: "req-1".into(),
                    decision: "approved".into(),
                    decided_at: "2026-03-01T09:00:03Z".into(),
                },
            ],
        )
        .expect("flush");

        let conn = Connection::open(dbg_path(&_dir)).expect("open");
        let (count, decision): (i64, Option<String>) = conn
            .query_row(
                "SELECT COUNT(*), MAX(decision) FROM approval_decisions WHERE session_id = 's1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("query");
        assert_eq!(count, 1);
        assert_eq!(decision.as_deref(), Some("approved"));
    }

    fn dbg_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("orbitdock.db")
    }

    #[tokio::test]
    async fn review_comments_crud() {
        let (_dir, db_path) = test_db();

        flush_batch(
            &db_path,
            vec![
                PersistCommand::UpsertSession(Box::new(snapshot("s1"))),
                PersistCommand::InsertReviewComment {
                    session_id: "s1".into(),
                    message_id: None,
                    file_path: Some("src/main.rs".into()),
                    line: Some(42),
                    content: "this looks wrong".into(),
                    created_at: "2026-03-01T09:00:05Z".into(),
                },
            ],
        )
        .expect("flush insert");

        let comments = list_review_comments(db_path.clone(), "s1".into())
            .await
            .expect("list");
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].file_path.as_deref(), Some("src/main.rs"));

        flush_batch(
            &db_path,
            vec![PersistCommand::DeleteReviewComment {
                session_id: "s1".into(),
                comment_id: comments[0].id,
            }],
        )
        .expect("flush delete");
        let comments = list_review_comments(db_path, "s1".into())
            .await
            .expect("list");
        assert!(comments.is_empty());
    }

    #[tokio::test]
    async fn reactivate_brings_session_back() {
        let (_dir, db_path) = test_db();

        flush_batch(
            &db_path,
            vec![
                PersistCommand::UpsertSession(Box::new(snapshot("s1"))),
                PersistCommand::UpdateSessionFields {
                    id: "s1".into(),
                    status: Some(SessionStatus::Ended),
                    phase: Some(Phase::Ended),
                    end_reason: Some("user_ended".into()),
                    last_activity_at: None,
                },
                PersistCommand::ReactivateSession { id: "s1".into() },
            ],
        )
        .expect("flush");

        let restored = load_sessions_for_startup(db_path).await.expect("restore");
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id, "s1");
    }
}
