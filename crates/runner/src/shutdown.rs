use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

#[derive(Debug)]
pub struct ShutdownController {
    presses: AtomicU8,
}

#[derive(Debug, Clone, Copy)]
pub enum ShutdownEvent {
    /// Cancel the recipe and let the runner wind down.
    Cancel,
    /// Stop waiting and exit right away.
    Immediate,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            presses: AtomicU8::new(0),
        }
    }

    pub fn bump(&self) -> u8 {
        self.presses.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub fn spawn_ctrl_c_handler(
    shutdown: Arc<ShutdownController>,
    shutdown_tx: mpsc::UnboundedSender<ShutdownEvent>,
) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let n = shutdown.bump();
            if n == 1 {
                let _ = shutdown_tx.send(ShutdownEvent::Cancel);
            } else {
                let _ = shutdown_tx.send(ShutdownEvent::Immediate);
                return;
            }
        }
    });
}
