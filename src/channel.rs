//! Remote channel contract
//!
//! A connector opens a duplex channel to the conversational service and hands
//! back a [`ChannelHandle`] for outbound traffic plus the receiving end of the
//! inbound [`ServerEvent`] stream. Outbound sends never block: messages are
//! queued for the transport's writer task.

use crate::codec::EncodedChunk;
use crate::config::SessionConfig;
use crate::events::{ServerEvent, ToolResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Error raised while opening a channel
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection closed before the session was ready")]
    Closed,

    #[error("session setup rejected: {0}")]
    Rejected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Messages queued for the transport writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Audio(EncodedChunk),
    ToolResult {
        id: String,
        name: String,
        result: ToolResult,
    },
    Close,
}

/// Sending half of an open channel. Clones share the same closed flag.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    tx: UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl ChannelHandle {
    pub fn new(tx: UnboundedSender<Outbound>) -> Self {
        Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle plus the queue a transport writer drains.
    pub fn pair() -> (Self, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Queue an audio chunk. Returns false once the channel is closed.
    pub fn send_audio(&self, chunk: EncodedChunk) -> bool {
        self.enqueue(Outbound::Audio(chunk))
    }

    pub fn send_tool_result(&self, id: &str, name: &str, result: ToolResult) -> bool {
        self.enqueue(Outbound::ToolResult {
            id: id.to_string(),
            name: name.to_string(),
            result,
        })
    }

    /// Close the channel. Only the first call reaches the transport.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Closing remote channel");
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn enqueue(&self, msg: Outbound) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(msg).is_ok()
    }
}

/// An open channel: outbound handle and the single inbound event stream.
#[derive(Debug)]
pub struct ChannelPair {
    pub handle: ChannelHandle,
    pub events: UnboundedReceiver<ServerEvent>,
}

/// Opens channels to the conversational service.
pub trait Connector: Send + Sync + 'static {
    fn open(
        &self,
        config: &SessionConfig,
    ) -> impl Future<Output = Result<ChannelPair, ConnectError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_frame, AudioFrame};

    #[test]
    fn close_is_forwarded_once() {
        let (handle, mut rx) = ChannelHandle::pair();
        let clone = handle.clone();

        handle.close();
        clone.close();
        handle.close();

        assert!(clone.is_closed());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sends_after_close_are_dropped() {
        let (handle, mut rx) = ChannelHandle::pair();
        let chunk = encode_frame(&AudioFrame::new(vec![0.0; 4], 16_000));

        assert!(handle.send_audio(chunk.clone()));
        handle.close();
        assert!(!handle.send_audio(chunk.clone()));
        assert!(!handle.send_tool_result("t1", "capture-note", ToolResult::Success("ok".into())));

        assert_eq!(rx.try_recv().unwrap(), Outbound::Audio(chunk));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_fails_when_transport_is_gone() {
        let (handle, rx) = ChannelHandle::pair();
        drop(rx);
        assert!(!handle.send_tool_result("t1", "capture-note", ToolResult::Failure("x".into())));
    }
}
