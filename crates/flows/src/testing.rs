//! In-memory transport for exercising flows without a chat platform.

use std::sync::{
    Mutex, MutexGuard,
    atomic::{AtomicI32, Ordering},
};

use async_trait::async_trait;

use parley_common::MessageRef;

use crate::transport::{FlowTransport, OutboundMessage};

/// Side effect recorded by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Send(OutboundMessage),
    Acknowledge {
        callback_id: String,
        notice: Option<String>,
    },
    DeleteMessage(MessageRef),
    ClearKeyboard(MessageRef),
}

/// Records every call and hands out increasing message ids.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
    next_message_id: AtomicI32,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TransportCall>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().clone()
    }

    /// Messages sent so far, in order.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Send(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn last_sent(&self) -> Option<OutboundMessage> {
        self.sent().pop()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|m| m.text).collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[async_trait]
impl FlowTransport for RecordingTransport {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<Option<MessageRef>> {
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1;
        let chat_id = message.chat_id;
        self.lock().push(TransportCall::Send(message));
        Ok(Some(MessageRef::new(chat_id, id)))
    }

    async fn acknowledge(&self, callback_id: &str, notice: Option<&str>) -> anyhow::Result<()> {
        self.lock().push(TransportCall::Acknowledge {
            callback_id: callback_id.to_string(),
            notice: notice.map(str::to_string),
        });
        Ok(())
    }

    async fn delete_message(&self, message: MessageRef) -> anyhow::Result<()> {
        self.lock().push(TransportCall::DeleteMessage(message));
        Ok(())
    }

    async fn clear_keyboard(&self, message: MessageRef) -> anyhow::Result<()> {
        self.lock().push(TransportCall::ClearKeyboard(message));
        Ok(())
    }
}
