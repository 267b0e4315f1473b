//! Channel-backed connector used by the actor test harness.
//!
//! Calls are forwarded onto an mpsc so a test can assert exactly which
//! [`ConnectorCall`] values the runtime produced; events are injected
//! through the handle's sender.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use orbitdock_protocol::Attachment;

use crate::{
    Connector, ConnectorCall, ConnectorError, ConnectorEvent, ConnectorHandle,
    EVENT_CHANNEL_CAPACITY,
};

pub struct ChannelConnector {
    call_tx: mpsc::UnboundedSender<ConnectorCall>,
}

impl ChannelConnector {
    /// Returns the handle for the actor, the event injector, and the call
    /// receiver for assertions.
    pub fn spawn() -> (
        ConnectorHandle,
        mpsc::Sender<ConnectorEvent>,
        mpsc::UnboundedReceiver<ConnectorCall>,
    ) {
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let handle = ConnectorHandle {
            connector: Box::new(ChannelConnector { call_tx }),
            events,
        };
        (handle, event_tx, call_rx)
    }

    fn record(&self, call: ConnectorCall) -> Result<(), ConnectorError> {
        self.call_tx
            .send(call)
            .map_err(|_| ConnectorError::ChannelClosed)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn send_message(
        &self,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<(), ConnectorError> {
        self.record(ConnectorCall::SendMessage {
            content: content.to_string(),
            attachments: attachments.to_vec(),
        })
    }

    async fn steer(&self, content: &str) -> Result<(), ConnectorError> {
        self.record(ConnectorCall::Steer {
            content: content.to_string(),
        })
    }

    async fn approve(
        &self,
        request_id: &str,
        amended_input: Option<&Value>,
    ) -> Result<(), ConnectorError> {
        self.record(ConnectorCall::Approve {
            request_id: request_id.to_string(),
            amended_input: amended_input.cloned(),
        })
    }

    async fn deny(&self, request_id: &str, reason: Option<&str>) -> Result<(), ConnectorError> {
        self.record(ConnectorCall::Deny {
            request_id: request_id.to_string(),
            reason: reason.map(String::from),
        })
    }

    async fn answer(&self, request_id: &str, text: &str) -> Result<(), ConnectorError> {
        self.record(ConnectorCall::Answer {
            request_id: request_id.to_string(),
            text: text.to_string(),
        })
    }

    async fn interrupt(&self) -> Result<(), ConnectorError> {
        self.record(ConnectorCall::Interrupt)
    }

    async fn end(&self) -> Result<(), ConnectorError> {
        self.record(ConnectorCall::End)
    }

    async fn compact_context(&self) -> Result<(), ConnectorError> {
        self.record(ConnectorCall::CompactContext)
    }

    async fn undo_last_turn(&self) -> Result<(), ConnectorError> {
        self.record(ConnectorCall::UndoLastTurn)
    }

    async fn rollback_turns(&self, num_turns: u32) -> Result<(), ConnectorError> {
        self.record(ConnectorCall::RollbackTurns { num_turns })
    }
}
