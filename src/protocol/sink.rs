//! The single, append-only writer for one request's frame stream.

use tokio::sync::mpsc;

use super::frame::StreamFrame;

/// What happened to a frame handed to [`FrameSink::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame was queued for the transport
    Sent,
    /// A terminal frame was already sent; the write was suppressed
    AfterTerminal,
    /// The transport went away; the write was dropped
    Disconnected,
}

/// Guards the output stream: at most one terminal frame, nothing after it,
/// and writes after a client disconnect are silently dropped.
#[derive(Debug)]
pub struct FrameSink {
    tx: Option<mpsc::Sender<StreamFrame>>,
    terminated: bool,
    disconnected: bool,
    sent: usize,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<StreamFrame>) -> Self {
        Self {
            tx: Some(tx),
            terminated: false,
            disconnected: false,
            sent: 0,
        }
    }

    /// Create a sink and the receiver the transport drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Append a frame. Waits for channel capacity so deltas are forwarded
    /// in order as they arrive.
    pub async fn send(&mut self, frame: StreamFrame) -> SendOutcome {
        if self.terminated {
            tracing::debug!(frame = frame.type_name(), "Suppressing frame after terminal frame");
            return SendOutcome::AfterTerminal;
        }
        if frame.is_terminal() {
            self.terminated = true;
        }
        if self.disconnected {
            return SendOutcome::Disconnected;
        }

        let Some(tx) = &self.tx else {
            self.disconnected = true;
            return SendOutcome::Disconnected;
        };

        match tx.send(frame).await {
            Ok(()) => {
                self.sent += 1;
                SendOutcome::Sent
            }
            Err(_) => {
                tracing::info!("Client disconnected; dropping further frames");
                self.disconnected = true;
                self.tx = None;
                SendOutcome::Disconnected
            }
        }
    }

    /// Close the stream. Idempotent.
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected || self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    /// Frames actually handed to the transport.
    pub fn sent_count(&self) -> usize {
        self.sent
    }
}
