//! Fan-out of task output to observer connections.
//!
//! Remote observers subscribe to a broadcast channel carrying tagged lines;
//! the harness writes into it from the runner task and never blocks on slow
//! or absent subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Which of the two observer streams a line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    /// Output read from the child's pty.
    Stdout,
    /// Harness messages and heartbeats.
    Stderr,
}

/// One line of observer output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// Stream tag.
    pub stream: StreamKind,
    /// Line content, without the trailing newline.
    pub line: String,
}

/// Registry of observer connections.
#[derive(Debug, Clone)]
pub struct ObserverHub {
    tx: broadcast::Sender<Output>,
}

impl ObserverHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Attach a new observer.
    pub fn subscribe(&self) -> broadcast::Receiver<Output> {
        self.tx.subscribe()
    }

    pub(crate) fn write(&self, stream: StreamKind, line: impl Into<String>) {
        // send only errors when there are no subscribers, which is fine
        let _ = self.tx.send(Output {
            stream,
            line: line.into(),
        });
    }
}
