//! Claude CLI direct connector
//!
//! Spawns the `claude` CLI as a subprocess and communicates via stdin/stdout
//! using the NDJSON stream-json protocol. The stdout reader translates CLI
//! messages into [`ConnectorEvent`] values; [`Connector`] methods write
//! control requests and user messages to stdin.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use orbitdock_connector_core::{
    Connector, ConnectorContext, ConnectorError, ConnectorEvent, ConnectorHandle,
    EVENT_CHANNEL_CAPACITY,
};
use orbitdock_protocol::{
    ApprovalDecision, ApprovalKind, ApprovalRequest, Attachment, Message, MessageRole, TokenUsage,
};

// ---------------------------------------------------------------------------
// Stdin messages (server → CLI)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdinMessage {
    User {
        session_id: String,
        message: UserMessagePayload,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequestBody,
    },
    ControlResponse {
        response: ControlResponsePayload,
    },
}

#[derive(Debug, Serialize)]
struct UserMessagePayload {
    role: &'static str,
    content: Vec<UserContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserContentBlock {
    Text { text: String },
    Image { path: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlRequestBody {
    Initialize {},
    Interrupt,
}

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlResponsePayload {
    Success { request_id: String, response: Value },
    Error { request_id: String, error: String },
}

/// Stores the `input` and `tool_use_id` from a `can_use_tool` control
/// request so the approval response can echo them back (required by the CLI).
struct PendingApproval {
    input: Value,
    tool_use_id: Option<String>,
}

// ---------------------------------------------------------------------------
// ClaudeConnector
// ---------------------------------------------------------------------------

pub struct ClaudeConnector {
    session_id: String,
    stdin_tx: mpsc::Sender<String>,
    child: Arc<Mutex<Child>>,
    pending_approvals: Arc<Mutex<HashMap<String, PendingApproval>>>,
}

impl ClaudeConnector {
    /// Spawn a `claude` CLI subprocess for the given session context.
    /// Pass `resume_id` to continue an existing CLI conversation.
    pub async fn spawn(
        ctx: &ConnectorContext,
        resume_id: Option<&str>,
    ) -> Result<ConnectorHandle, ConnectorError> {
        let claude_bin = resolve_claude_binary()?;

        let mut args: Vec<String> = vec![
            "--output-format".into(),
            "stream-json".into(),
            "--input-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--permission-prompt-tool".into(),
            "stdio".into(),
        ];
        if let Some(model) = &ctx.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        if let Some(sid) = resume_id {
            args.push("--resume".into());
            args.push(sid.to_string());
        }
        if let Some(mode) = &ctx.approval_policy {
            args.push("--permission-mode".into());
            args.push(mode.clone());
        }

        info!(
            component = "claude_connector",
            event = "claude.spawn",
            session_id = %ctx.session_id,
            cwd = %ctx.project_path,
            claude_bin = %claude_bin,
            resume_id = ?resume_id,
            "Spawning Claude CLI"
        );

        let mut child = tokio::process::Command::new(&claude_bin)
            .args(&args)
            .current_dir(&ctx.project_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("CLAUDE_CODE_ENTRYPOINT", "orbitdock")
            .spawn()
            .map_err(|e| ConnectorError::Spawn(format!("claude CLI: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnectorError::Spawn("no stdin on child".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectorError::Spawn("no stdout on child".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let session_id = ctx.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(
                        component = "claude_connector",
                        event = "claude.stderr",
                        session_id = %session_id,
                        line = %line,
                    );
                }
            });
        }

        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(256);
        let pending_approvals: Arc<Mutex<HashMap<String, PendingApproval>>> =
            Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(stdin_writer(stdin, stdin_rx));

        let reader = EventLoop {
            session_id: ctx.session_id.clone(),
            event_tx,
            stdin_tx: stdin_tx.clone(),
            pending_approvals: pending_approvals.clone(),
            msg_counter: AtomicU64::new(epoch_millis()),
            in_turn: false,
        };
        tokio::spawn(reader.run(stdout));

        let connector = ClaudeConnector {
            session_id: ctx.session_id.clone(),
            stdin_tx,
            child: Arc::new(Mutex::new(child)),
            pending_approvals,
        };
        connector
            .write_stdin(&StdinMessage::ControlRequest {
                request_id: format!("init-{}", epoch_millis()),
                request: ControlRequestBody::Initialize {},
            })
            .await?;

        Ok(ConnectorHandle {
            connector: Box::new(connector),
            events,
        })
    }

    async fn write_stdin(&self, msg: &StdinMessage) -> Result<(), ConnectorError> {
        let line = serde_json::to_string(msg)?;
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| ConnectorError::ChannelClosed)
    }

    async fn respond_approval(
        &self,
        request_id: &str,
        response: Value,
    ) -> Result<(), ConnectorError> {
        self.write_stdin(&StdinMessage::ControlResponse {
            response: ControlResponsePayload::Success {
                request_id: request_id.to_string(),
                response,
            },
        })
        .await
    }
}

#[async_trait]
impl Connector for ClaudeConnector {
    async fn send_message(
        &self,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<(), ConnectorError> {
        let mut blocks = vec![UserContentBlock::Text {
            text: content.to_string(),
        }];
        for attachment in attachments {
            if let Some(path) = &attachment.path {
                blocks.push(UserContentBlock::Image { path: path.clone() });
            }
        }
        self.write_stdin(&StdinMessage::User {
            session_id: self.session_id.clone(),
            message: UserMessagePayload {
                role: "user",
                content: blocks,
            },
        })
        .await
    }

    async fn steer(&self, content: &str) -> Result<(), ConnectorError> {
        // Mid-turn user messages are injected the same way; the CLI queues
        // them into the running turn.
        self.send_message(content, &[]).await
    }

    async fn approve(
        &self,
        request_id: &str,
        amended_input: Option<&Value>,
    ) -> Result<(), ConnectorError> {
        let pending = self.pending_approvals.lock().await.remove(request_id);
        let mut allow = json!({ "behavior": "allow" });
        if let Some(p) = &pending {
            allow["updatedInput"] = amended_input.cloned().unwrap_or_else(|| p.input.clone());
            if let Some(id) = &p.tool_use_id {
                allow["toolUseID"] = json!(id);
            }
        } else if let Some(ui) = amended_input {
            allow["updatedInput"] = ui.clone();
        }
        self.respond_approval(request_id, allow).await
    }

    async fn deny(&self, request_id: &str, reason: Option<&str>) -> Result<(), ConnectorError> {
        let pending = self.pending_approvals.lock().await.remove(request_id);
        let mut deny = json!({
            "behavior": "deny",
            "message": reason.unwrap_or("User denied this operation"),
            "interrupt": false,
        });
        if let Some(p) = &pending {
            if let Some(id) = &p.tool_use_id {
                deny["toolUseID"] = json!(id);
            }
        }
        self.respond_approval(request_id, deny).await
    }

    async fn answer(&self, request_id: &str, text: &str) -> Result<(), ConnectorError> {
        self.respond_approval(request_id, json!({ "behavior": "allow", "answer": text }))
            .await
    }

    async fn interrupt(&self) -> Result<(), ConnectorError> {
        self.write_stdin(&StdinMessage::ControlRequest {
            request_id: format!("int-{}", epoch_millis()),
            request: ControlRequestBody::Interrupt,
        })
        .await
    }

    async fn end(&self) -> Result<(), ConnectorError> {
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
        Ok(())
    }

    async fn compact_context(&self) -> Result<(), ConnectorError> {
        self.send_message("/compact", &[]).await
    }

    async fn undo_last_turn(&self) -> Result<(), ConnectorError> {
        Err(ConnectorError::Unsupported("undo_last_turn"))
    }

    async fn rollback_turns(&self, _num_turns: u32) -> Result<(), ConnectorError> {
        Err(ConnectorError::Unsupported("rollback_turns"))
    }
}

// ---------------------------------------------------------------------------
// Stdout event loop (CLI → server)
// ---------------------------------------------------------------------------

struct EventLoop {
    session_id: String,
    event_tx: mpsc::Sender<ConnectorEvent>,
    stdin_tx: mpsc::Sender<String>,
    pending_approvals: Arc<Mutex<HashMap<String, PendingApproval>>>,
    msg_counter: AtomicU64,
    in_turn: bool,
}

impl EventLoop {
    async fn run(mut self, stdout: tokio::process::ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let value: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    debug!(
                        component = "claude_connector",
                        event = "claude.parse_skip",
                        session_id = %self.session_id,
                        error = %e,
                    );
                    continue;
                }
            };
            self.handle_line(value).await;
        }

        let _ = self
            .event_tx
            .send(ConnectorEvent::SessionEnded {
                reason: "provider_exited".to_string(),
            })
            .await;
        info!(
            component = "claude_connector",
            event = "claude.stdout_closed",
            session_id = %self.session_id,
            "Claude CLI stdout closed"
        );
    }

    async fn handle_line(&mut self, value: Value) {
        let msg_type = value.get("type").and_then(Value::as_str).unwrap_or("");
        match msg_type {
            "assistant" => {
                if !self.in_turn {
                    self.in_turn = true;
                    let _ = self.event_tx.send(ConnectorEvent::TurnStarted).await;
                }
                if let Some(text) = extract_text(&value) {
                    let message = self.build_message(MessageRole::Assistant, text, None);
                    let _ = self
                        .event_tx
                        .send(ConnectorEvent::MessageCreated(message))
                        .await;
                }
            }
            "result" => {
                self.in_turn = false;
                let usage = value.get("usage").map(parse_usage);
                if let Some(usage) = usage.clone() {
                    let _ = self
                        .event_tx
                        .send(ConnectorEvent::TokensUpdated(usage))
                        .await;
                }
                let aborted = value
                    .get("subtype")
                    .and_then(Value::as_str)
                    .map(|s| s.contains("error"))
                    .unwrap_or(false);
                let event = if aborted {
                    ConnectorEvent::TurnAborted {
                        reason: value
                            .get("subtype")
                            .and_then(Value::as_str)
                            .unwrap_or("error")
                            .to_string(),
                    }
                } else {
                    ConnectorEvent::TurnCompleted { usage }
                };
                let _ = self.event_tx.send(event).await;
            }
            "control_request" => self.handle_control_request(&value).await,
            "system" => {
                // init carries capabilities; compact_boundary marks compaction
                match value.get("subtype").and_then(Value::as_str) {
                    Some("init") => {
                        if let Some(skills) = value.get("skills").and_then(Value::as_array) {
                            let skills = skills
                                .iter()
                                .filter_map(Value::as_str)
                                .map(String::from)
                                .collect();
                            let _ = self
                                .event_tx
                                .send(ConnectorEvent::SkillsRefreshed { skills })
                                .await;
                        }
                    }
                    Some("compact_boundary") => {
                        let _ = self.event_tx.send(ConnectorEvent::ContextCompacted).await;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    async fn handle_control_request(&self, value: &Value) {
        let Some(request_id) = value.get("request_id").and_then(Value::as_str) else {
            return;
        };
        let Some(request) = value.get("request") else {
            return;
        };
        if request.get("subtype").and_then(Value::as_str) != Some("can_use_tool") {
            // Unknown control requests get an error response so the CLI
            // doesn't hang waiting.
            let line = serde_json::to_string(&StdinMessage::ControlResponse {
                response: ControlResponsePayload::Error {
                    request_id: request_id.to_string(),
                    error: "unsupported control request".to_string(),
                },
            });
            if let Ok(line) = line {
                let _ = self.stdin_tx.send(line).await;
            }
            return;
        }

        let tool_name = request
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let input = request.get("input").cloned().unwrap_or(Value::Null);
        let tool_use_id = request
            .get("tool_use_id")
            .and_then(Value::as_str)
            .map(String::from);

        self.pending_approvals.lock().await.insert(
            request_id.to_string(),
            PendingApproval {
                input: input.clone(),
                tool_use_id,
            },
        );

        let kind = if tool_name == "AskUserQuestion" {
            ApprovalKind::Question
        } else if tool_name == "Bash" {
            ApprovalKind::Exec
        } else {
            ApprovalKind::ToolUse
        };

        let request = ApprovalRequest {
            request_id: request_id.to_string(),
            kind,
            tool_name: Some(tool_name),
            tool_input: Some(input),
            prompt: request
                .get("question")
                .and_then(Value::as_str)
                .map(String::from),
            decision_options: vec![
                ApprovalDecision::Approved,
                ApprovalDecision::ApprovedForSession,
                ApprovalDecision::ApprovedAlways,
                ApprovalDecision::Denied,
            ],
            proposed_amendment: None,
        };
        let _ = self
            .event_tx
            .send(ConnectorEvent::ApprovalRequested(request))
            .await;
    }

    fn build_message(&self, role: MessageRole, content: String, tool_use_id: Option<String>) -> Message {
        let n = self.msg_counter.fetch_add(1, Ordering::Relaxed);
        let now = now_iso8601();
        Message {
            id: format!("msg-{n}"),
            session_id: self.session_id.clone(),
            role,
            content,
            created_at: now.clone(),
            updated_at: now,
            tool_use_id,
            parent_message_id: None,
        }
    }
}

async fn stdin_writer(
    mut stdin: tokio::process::ChildStdin,
    mut stdin_rx: mpsc::Receiver<String>,
) {
    while let Some(line) = stdin_rx.recv().await {
        if stdin.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
}

fn extract_text(value: &Value) -> Option<String> {
    let content = value.get("message")?.get("content")?.as_array()?;
    let parts: Vec<&str> = content
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn parse_usage(usage: &Value) -> TokenUsage {
    let read = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        input_tokens: read("input_tokens"),
        output_tokens: read("output_tokens"),
        cached_tokens: read("cache_read_input_tokens"),
        context_window: read("context_window"),
    }
}

fn resolve_claude_binary() -> Result<String, ConnectorError> {
    if let Ok(bin) = std::env::var("CLAUDE_BIN") {
        if std::path::Path::new(&bin).exists() {
            return Ok(bin);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        let local = format!("{home}/.claude/local/claude");
        if std::path::Path::new(&local).exists() {
            return Ok(local);
        }
    }
    match std::process::Command::new("which").arg("claude").output() {
        Ok(output) if output.status.success() => {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if path.is_empty() {
                Err(ConnectorError::Spawn("claude CLI not found".into()))
            } else {
                Ok(path)
            }
        }
        _ => Err(ConnectorError::Spawn("claude CLI not found".into())),
    }
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn now_iso8601() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{secs}Z")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_joins_text_blocks() {
        let value = json!({
            "type": "assistant",
            "message": {
                "content": [
                    { "type": "text", "text": "hello" },
                    { "type": "tool_use", "name": "Bash" },
                    { "type": "text", "text": "world" },
                ]
            }
        });
        assert_eq!(extract_text(&value).as_deref(), Some("hello\nworld"));
    }

    #[test]
    fn parse_usage_reads_cache_fields() {
        let usage = parse_usage(&json!({
            "input_tokens": 120,
            "output_tokens": 40,
            "cache_read_input_tokens": 80,
            "context_window": 200000,
        }));
        assert_eq!(usage.input_tokens, 120);
        assert_eq!(usage.cached_tokens, 80);
        assert_eq!(usage.context_window, 200000);
    }
}
