// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! WebSocket surface of the status bridge.
//!
//! Binds `127.0.0.1` on the first free port in `[18800, 18809]`; the chosen
//! port is published in the status file's `wsPort`. A connecting client
//! receives one full snapshot, then `{"kind":"status_update"}` hints after
//! each file write — the file stays the source of truth. Loopback only, no
//! authentication, no request/response.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::DaemonSnapshot;
use crate::cancel::CancelToken;

/// Port range scanned at startup, first free wins.
pub const PORT_RANGE: std::ops::RangeInclusive<u16> = 18800..=18809;

/// Cloneable handle to the running WebSocket server.
#[derive(Clone)]
pub struct WsServer {
    port: u16,
    updates: broadcast::Sender<String>,
    latest: watch::Receiver<DaemonSnapshot>,
}

#[derive(Clone)]
struct WsState {
    updates: broadcast::Sender<String>,
    latest: watch::Receiver<DaemonSnapshot>,
}

impl WsServer {
    /// Bind the first free port in range and start serving.
    ///
    /// Returns `None` when every port is taken — the bridge then degrades
    /// to file-only operation.
    pub async fn bind(
        latest: watch::Receiver<DaemonSnapshot>,
        cancel: CancelToken,
    ) -> Option<Self> {
        let mut bound = None;
        for port in PORT_RANGE {
            match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    bound = Some((listener, port));
                    break;
                }
                Err(_) => continue,
            }
        }
        let (listener, port) = bound?;

        let (updates, _) = broadcast::channel(64);
        let state = WsState {
            updates: updates.clone(),
            latest: latest.clone(),
        };

        let app = Router::new().route("/ws", get(ws_handler)).with_state(state);

        info!(port, "status WebSocket listening on 127.0.0.1");
        tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "status WebSocket server stopped");
            }
        });

        Some(Self {
            port,
            updates,
            latest,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Push a change hint. Fires after the corresponding file write.
    pub fn notify_change(&self) {
        let hint = serde_json::json!({
            "kind": "status_update",
            "ts": Utc::now().to_rfc3339(),
        });
        let _ = self.updates.send(hint.to_string());
    }

    /// Re-send the full snapshot (observer-resync path).
    pub fn resend_snapshot(&self) {
        let snapshot = self.latest.borrow().clone();
        if let Ok(json) = serde_json::to_string(&snapshot) {
            let _ = self.updates.send(json);
        }
    }
}

async fn ws_handler(State(state): State<WsState>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| client_loop(socket, state))
}

async fn client_loop(mut socket: WebSocket, state: WsState) {
    // Initial snapshot on connect.
    let snapshot = state.latest.borrow().clone();
    if let Ok(json) = serde_json::to_string(&snapshot) {
        if socket.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    let mut updates = state.updates.subscribe();
    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "slow WebSocket client lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // No request/response protocol; client text is ignored.
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_picks_free_port_in_range() {
        let (tx, rx) = watch::channel(DaemonSnapshot::default());
        let cancel = CancelToken::new();

        let Some(server) = WsServer::bind(rx.clone(), cancel.clone()).await else {
            // Entire range occupied on this machine; nothing to assert.
            return;
        };
        assert!(PORT_RANGE.contains(&server.port()));

        // A second daemon lands on a different port.
        let second = WsServer::bind(rx, cancel.clone()).await;
        if let Some(second) = &second {
            assert_ne!(second.port(), server.port());
        }
        drop(tx);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_hint_shape() {
        let (_tx, rx) = watch::channel(DaemonSnapshot::default());
        let cancel = CancelToken::new();
        let Some(server) = WsServer::bind(rx, cancel.clone()).await else {
            return;
        };

        let mut updates = server.updates.subscribe();
        server.notify_change();
        let text = updates.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["kind"], "status_update");
        assert!(value["ts"].is_string());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_resend_carries_full_snapshot() {
        let (tx, rx) = watch::channel(DaemonSnapshot::default());
        let cancel = CancelToken::new();
        let Some(server) = WsServer::bind(rx, cancel.clone()).await else {
            return;
        };

        tx.send(DaemonSnapshot {
            running: true,
            pid: 77,
            ..Default::default()
        })
        .unwrap();

        let mut updates = server.updates.subscribe();
        server.resend_snapshot();
        let text = updates.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["running"], true);
        assert_eq!(value["pid"], 77);
        cancel.cancel();
    }
}
