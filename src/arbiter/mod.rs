//! Input arbiter - the only writer of the serial transport
//!
//! Keyboard bridge, pointer bridge and the running command all produce frames
//! concurrently. The arbiter takes exclusive ownership of the
//! [`SerialTransport`] and serializes their writes:
//!
//! ```text
//! KeyboardSource ─┐
//! PointerSource  ─┼─[Request]─► mpsc (FIFO) ─► worker thread ─► SerialTransport
//! Command        ─┘                               │
//!      ▲                                          │
//!      └──────────── oneshot reply ◄──────────────┘
//! ```
//!
//! A single worker thread performs every write, so frames from different
//! sources never interleave on the wire, and requests are served in arrival
//! order so no source starves. Closing the arbiter cancels a shared token
//! that every waiting submitter races against its reply: pending and future
//! submits fail fast with [`ArbiterError::Closed`] even while the worker is
//! stuck inside a slow driver call.

mod worker;

use crate::transport::{Frame, SerialTransport, TransportError};
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Producer of frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Keyboard,
    Pointer,
    Command,
}

impl SourceKind {
    const ALL: [SourceKind; 3] = [SourceKind::Keyboard, SourceKind::Pointer, SourceKind::Command];

    fn index(self) -> usize {
        self as usize
    }
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Keyboard => write!(f, "Keyboard"),
            SourceKind::Pointer => write!(f, "Pointer"),
            SourceKind::Command => write!(f, "Command"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArbiterError {
    #[error("Transport is closed")]
    Closed,

    #[error("Frame write failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Arbiter worker failed: {0}")]
    Worker(String),
}

pub(crate) enum Request {
    Write {
        source: SourceKind,
        frame: Frame,
        reply: oneshot::Sender<Result<(), ArbiterError>>,
    },
    Shutdown,
}

/// Submitted/written frame counters per source.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    submitted: [AtomicU64; 3],
    written: [AtomicU64; 3],
}

impl Counters {
    pub(crate) fn submitted(&self, source: SourceKind) {
        self.submitted[source.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn written(&self, source: SourceKind) {
        self.written[source.index()].fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of the arbiter counters for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceStats {
    pub submitted: u64,
    pub written: u64,
}

/// Cloneable write access for one source.
#[derive(Clone)]
pub struct Submitter {
    source: SourceKind,
    tx: mpsc::UnboundedSender<Request>,
    closed: CancellationToken,
    counters: Arc<Counters>,
}

impl Submitter {
    pub fn source(&self) -> SourceKind {
        self.source
    }

    /// Queues `frame` and waits until the worker has written it.
    ///
    /// Frames submitted through one submitter are written in submission
    /// order as long as the caller awaits each submit before the next.
    pub async fn submit(&self, frame: Frame) -> Result<(), ArbiterError> {
        if self.closed.is_cancelled() {
            return Err(ArbiterError::Closed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request::Write {
                source: self.source,
                frame,
                reply: reply_tx,
            })
            .map_err(|_| ArbiterError::Closed)?;
        self.counters.submitted(self.source);

        tokio::select! {
            biased;
            reply = reply_rx => reply.unwrap_or(Err(ArbiterError::Closed)),
            _ = self.closed.cancelled() => Err(ArbiterError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the arbiter is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl fmt::Debug for Submitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submitter")
            .field("source", &self.source)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

/// Exclusive owner of the transport while it is open.
pub struct InputArbiter {
    tx: mpsc::UnboundedSender<Request>,
    closed: CancellationToken,
    counters: Arc<Counters>,
    worker: Option<std::thread::JoinHandle<SerialTransport>>,
}

impl InputArbiter {
    /// Moves `transport` onto the write worker thread.
    pub fn spawn(transport: SerialTransport) -> Result<Self, ArbiterError> {
        if !transport.is_open() {
            warn!("Arbiter spawned on a closed transport, every write will fail");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let worker = {
            let closed = closed.clone();
            let counters = counters.clone();
            std::thread::Builder::new()
                .name("padpilot-arbiter".to_string())
                .spawn(move || worker::run(transport, rx, closed, counters))
                .map_err(|e| ArbiterError::Worker(e.to_string()))?
        };
        info!("Input arbiter started");

        Ok(Self {
            tx,
            closed,
            counters,
            worker: Some(worker),
        })
    }

    pub fn submitter(&self, source: SourceKind) -> Submitter {
        debug!("New submitter for source {}", source);
        Submitter {
            source,
            tx: self.tx.clone(),
            closed: self.closed.clone(),
            counters: self.counters.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the arbiter closes, either explicitly or after a
    /// failed write.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn stats(&self, source: SourceKind) -> SourceStats {
        SourceStats {
            submitted: self.counters.submitted[source.index()].load(Ordering::Relaxed),
            written: self.counters.written[source.index()].load(Ordering::Relaxed),
        }
    }

    /// Fails every pending submit, closes the transport and hands it back.
    pub async fn close(mut self) -> Result<SerialTransport, ArbiterError> {
        self.signal_shutdown();
        let Some(worker) = self.worker.take() else {
            return Err(ArbiterError::Worker("worker already joined".to_string()));
        };

        let transport = tokio::task::spawn_blocking(move || worker.join())
            .await
            .map_err(|e| ArbiterError::Worker(e.to_string()))?
            .map_err(|_| ArbiterError::Worker("arbiter worker panicked".to_string()))?;

        for source in SourceKind::ALL {
            let stats = self.stats(source);
            debug!(
                "{}: {} frames submitted, {} written",
                source, stats.submitted, stats.written
            );
        }
        info!("Input arbiter closed");
        Ok(transport)
    }

    fn signal_shutdown(&self) {
        self.closed.cancel();
        // The worker may be parked in `blocking_recv`.
        let _ = self.tx.send(Request::Shutdown);
    }
}

impl Drop for InputArbiter {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.signal_shutdown();
        }
    }
}
