//! Connector for hook-driven sessions.
//!
//! Hook-bridge sessions are observed, not driven: the CLI on the other side
//! reports events through `/api/hook`, and there is no process to steer.
//! Every drivable call is therefore `Unsupported`, except `interrupt` and
//! `end` which only fire the cancellation token.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use orbitdock_protocol::Attachment;

use crate::{Connector, ConnectorError, ConnectorEvent, ConnectorHandle, EVENT_CHANNEL_CAPACITY};

pub struct NullConnector {
    cancel: CancellationToken,
}

impl NullConnector {
    /// Build a handle whose event stream is fed externally (the hook bridge
    /// pushes events through the returned sender).
    pub fn spawn(cancel: CancellationToken) -> (ConnectorHandle, mpsc::Sender<ConnectorEvent>) {
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = ConnectorHandle {
            connector: Box::new(NullConnector { cancel }),
            events,
        };
        (handle, event_tx)
    }
}

#[async_trait]
impl Connector for NullConnector {
    async fn send_message(
        &self,
        _content: &str,
        _attachments: &[Attachment],
    ) -> Result<(), ConnectorError> {
        Err(ConnectorError::Unsupported("send_message"))
    }

    async fn steer(&self, _content: &str) -> Result<(), ConnectorError> {
        Err(ConnectorError::Unsupported("steer"))
    }

    async fn approve(
        &self,
        _request_id: &str,
        _amended_input: Option<&Value>,
    ) -> Result<(), ConnectorError> {
        Err(ConnectorError::Unsupported("approve"))
    }

    async fn deny(&self, _request_id: &str, _reason: Option<&str>) -> Result<(), ConnectorError> {
        Err(ConnectorError::Unsupported("deny"))
    }

    async fn answer(&self, _request_id: &str, _text: &str) -> Result<(), ConnectorError> {
        Err(ConnectorError::Unsupported("answer"))
    }

    async fn interrupt(&self) -> Result<(), ConnectorError> {
        self.cancel.cancel();
        Ok(())
    }

    async fn end(&self) -> Result<(), ConnectorError> {
        self.cancel.cancel();
        Ok(())
    }

    async fn compact_context(&self) -> Result<(), ConnectorError> {
        Err(ConnectorError::Unsupported("compact_context"))
    }

    async fn undo_last_turn(&self) -> Result<(), ConnectorError> {
        Err(ConnectorError::Unsupported("undo_last_turn"))
    }

    async fn rollback_turns(&self, _num_turns: u32) -> Result<(), ConnectorError> {
        Err(ConnectorError::Unsupported("rollback_turns"))
    }
}
