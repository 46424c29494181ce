//! Narrow outbound-delivery abstraction shared by the components that need
//! to speak back to a channel transport without depending on one.
//!
//! Channel wire protocols are explicitly out of scope for this crate (see
//! the crate-level overview): Telegram/Slack/WhatsApp clients are external
//! collaborators. [`ChannelSink`] is the one seam Agent Run (C7),
//! Notification Dispatcher (C11), and the Hook/Webhook Manager (C16) depend
//! on instead of a concrete transport.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::Channel;

/// Failure delivering an outbound message through a [`ChannelSink`].
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The transport rejected or failed to deliver the message.
    #[error("channel send failed: {0}")]
    Send(String),
}

/// Delivers a single text message to a chat on some channel.
///
/// Implementations live outside this crate; callers receive one as a
/// capability handle (`Arc<dyn ChannelSink>`), never a concrete type.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    /// Send `text` to `chat_id` on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the transport cannot deliver the message.
    async fn send(&self, channel: Channel, chat_id: &str, text: &str) -> Result<(), ChannelError>;
}

/// In-memory sink for tests: records every send in call order instead of
/// delivering anywhere.
#[derive(Default)]
pub struct RecordingChannelSink {
    sent: std::sync::Mutex<Vec<(Channel, String, String)>>,
}

impl RecordingChannelSink {
    /// Build an empty recording sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All sends recorded so far, in order.
    pub fn sent(&self) -> Vec<(Channel, String, String)> {
        self.sent.lock().expect("recording sink lock").clone()
    }
}

#[async_trait]
impl ChannelSink for RecordingChannelSink {
    async fn send(&self, channel: Channel, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .expect("recording sink lock")
            .push((channel, chat_id.to_owned(), text.to_owned()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_sink_preserves_send_order() {
        let sink = RecordingChannelSink::new();
        sink.send(Channel::Telegram, "1", "first").await.expect("send should succeed");
        sink.send(Channel::Telegram, "1", "second").await.expect("send should succeed");
        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].2, "first");
        assert_eq!(sent[1].2, "second");
    }
}
