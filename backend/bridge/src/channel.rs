//! Frame transports for the action bridge.
//!
//! A frame is one JSON-encoded action with no embedded newline. Frames that
//! arrive before a receive handler is installed are buffered and replayed,
//! in order, when the handler is set.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub type FrameHandler = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("bridge channel is closed")]
    ChannelClosed,

    #[error("failed to encode action: {0}")]
    Encode(String),

    #[error("failed to decode frame: {0}")]
    Decode(String),
}

/// Ordered, bidirectional message transport between two processes.
pub trait BridgeChannel: Send + Sync {
    fn send(&self, frame: String) -> Result<(), BridgeError>;

    /// Install the receive handler, replacing any previous one.
    fn on_receive(&self, handler: FrameHandler);
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InboxState {
    handler: Option<FrameHandler>,
    backlog: VecDeque<String>,
    /// Set while the backlog is being replayed; new frames queue behind it.
    replaying: bool,
}

#[derive(Default)]
struct Inbox {
    state: Mutex<InboxState>,
}

impl Inbox {
    fn deliver(&self, frame: String) {
        let handler = {
            let mut state = self.state.lock();
            match state.handler.clone() {
                Some(handler) if !state.replaying => handler,
                _ => {
                    state.backlog.push_back(frame);
                    return;
                }
            }
        };
        handler(frame);
    }

    fn set_handler(&self, handler: FrameHandler) {
        {
            let mut state = self.state.lock();
            state.handler = Some(handler);
            if state.replaying || state.backlog.is_empty() {
                return;
            }
            state.replaying = true;
            debug!(frames = state.backlog.len(), "Replaying buffered bridge frames");
        }

        loop {
            let next = {
                let mut state = self.state.lock();
                match (state.backlog.pop_front(), state.handler.clone()) {
                    (Some(frame), Some(handler)) => Some((frame, handler)),
                    (leftover, _) => {
                        if let Some(frame) = leftover {
                            state.backlog.push_front(frame);
                        }
                        state.replaying = false;
                        None
                    }
                }
            };
            let Some((frame, handler)) = next else { break };
            handler(frame);
        }
    }
}

// ---------------------------------------------------------------------------
// In-process pair
// ---------------------------------------------------------------------------

/// One end of an in-process channel pair. Delivery is synchronous.
pub struct MemoryChannel {
    inbox: Arc<Inbox>,
    peer: Arc<Inbox>,
    closed: Arc<AtomicBool>,
    frames_sent: AtomicU64,
}

impl MemoryChannel {
    pub fn pair() -> (Self, Self) {
        let left = Arc::new(Inbox::default());
        let right = Arc::new(Inbox::default());
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                inbox: left.clone(),
                peer: right.clone(),
                closed: closed.clone(),
                frames_sent: AtomicU64::new(0),
            },
            Self {
                inbox: right,
                peer: left,
                closed,
                frames_sent: AtomicU64::new(0),
            },
        )
    }

    /// Close both ends.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::SeqCst)
    }
}

impl BridgeChannel for MemoryChannel {
    fn send(&self, frame: String) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::ChannelClosed);
        }
        self.frames_sent.fetch_add(1, Ordering::SeqCst);
        self.peer.deliver(frame);
        Ok(())
    }

    fn on_receive(&self, handler: FrameHandler) {
        self.inbox.set_handler(handler);
    }
}

// ---------------------------------------------------------------------------
// NDJSON over a byte stream
// ---------------------------------------------------------------------------

/// Newline-delimited frames over any async byte stream (pipe, socket, stdio).
///
/// Spawns a reader and a writer task; both stop when the channel is dropped.
pub struct StreamChannel {
    outbound: mpsc::UnboundedSender<String>,
    inbox: Arc<Inbox>,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamChannel {
    /// Must be called inside a Tokio runtime.
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let inbox = Arc::new(Inbox::default());
        let (outbound, rx) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(read_frames(reader, inbox.clone())),
            tokio::spawn(write_frames(writer, rx)),
        ];
        Self { outbound, inbox, tasks }
    }
}

impl BridgeChannel for StreamChannel {
    fn send(&self, frame: String) -> Result<(), BridgeError> {
        if frame.contains('\n') {
            return Err(BridgeError::Encode("frame contains a newline".to_string()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| BridgeError::ChannelClosed)
    }

    fn on_receive(&self, handler: FrameHandler) {
        self.inbox.set_handler(handler);
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn read_frames<R>(reader: R, inbox: Arc<Inbox>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                inbox.deliver(trimmed.to_string());
            }
            Ok(None) => {
                debug!("Bridge peer closed the stream");
                break;
            }
            Err(e) => {
                error!("Bridge stream read error: {e}");
                break;
            }
        }
    }
}

async fn write_frames<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if writer.write_all(frame.as_bytes()).await.is_err()
            || writer.write_all(b"\n").await.is_err()
            || writer.flush().await.is_err()
        {
            warn!("Bridge stream write failed; closing channel");
            break;
        }
    }
}
