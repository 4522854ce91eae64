// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Internal control-plane command bus.
//!
//! Signals flow from CLI handlers, the WebSocket surface, or tests into the
//! daemon's supervisor loop over one channel. Queries carry a oneshot for
//! the reply.

use tokio::sync::{mpsc, oneshot};

use crate::status::DaemonSnapshot;

/// Control-plane signals the daemon responds to.
#[derive(Debug)]
pub enum DaemonCommand {
    /// Stop admitting new tasks; running tasks continue.
    Pause,
    /// Resume admission.
    Resume,
    /// Drain and shut down.
    Stop,
    /// Put a task back in the queue (clears its recovery count).
    Requeue { spec_id: String },
    /// Current snapshot of the world.
    Snapshot {
        reply: oneshot::Sender<DaemonSnapshot>,
    },
}

/// Cloneable sender half handed to command producers.
#[derive(Clone)]
pub struct CommandBus {
    tx: mpsc::Sender<DaemonCommand>,
}

impl CommandBus {
    pub fn new() -> (Self, mpsc::Receiver<DaemonCommand>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, rx)
    }

    pub async fn send(&self, command: DaemonCommand) -> bool {
        self.tx.send(command).await.is_ok()
    }

    /// Fire a command from sync code without waiting for queue space.
    pub fn try_send(&self, command: DaemonCommand) -> bool {
        self.tx.try_send(command).is_ok()
    }

    /// Ask the daemon for its current snapshot.
    pub async fn snapshot(&self) -> Option<DaemonSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.send(DaemonCommand::Snapshot { reply }).await {
            return None;
        }
        rx.await.ok()
    }
}
