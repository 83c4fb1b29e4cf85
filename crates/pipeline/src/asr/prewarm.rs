//! Pre-established recognizer connections
//!
//! Dials handshake-less websockets (auth headers applied) ahead of demand so
//! a conversation start does not pay the cold dial. Idle pre-connections get
//! a control ping every 30 s; any failure discards the socket.

use futures::SinkExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::Message;

use super::client::{dial, AsrConfig, WsStream};

const PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct PreConnectPool {
    config: AsrConfig,
    idle: Mutex<VecDeque<WsStream>>,
    shutdown_tx: parking_lot::Mutex<Option<watch::Sender<bool>>>,
}

impl PreConnectPool {
    pub fn new(config: AsrConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            idle: Mutex::new(VecDeque::new()),
            shutdown_tx: parking_lot::Mutex::new(None),
        })
    }

    /// Start the maintenance task: ping what's idle, top up to the target.
    pub fn start(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            // Fill eagerly so the very first conversation is warm.
            pool.maintain().await;

            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.maintain().await,
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            pool.drain().await;
        });
    }

    /// Take a warm connection, if any.
    pub async fn adopt(&self) -> Option<WsStream> {
        self.idle.lock().await.pop_front()
    }

    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
        self.drain().await;
    }

    async fn drain(&self) {
        let mut idle = self.idle.lock().await;
        while let Some(mut ws) = idle.pop_front() {
            let _ = ws.close(None).await;
        }
    }

    async fn maintain(&self) {
        let mut idle = self.idle.lock().await;

        // Ping pass: a failed write means the socket is dead.
        let mut survivors = VecDeque::with_capacity(idle.len());
        while let Some(mut ws) = idle.pop_front() {
            match ws.send(Message::Ping(Vec::new())).await {
                Ok(()) => survivors.push_back(ws),
                Err(e) => {
                    tracing::debug!(error = %e, "discarding dead pre-connection");
                }
            }
        }
        *idle = survivors;

        // Top-up pass.
        while idle.len() < self.config.prewarm_size {
            match dial(&self.config).await {
                Ok(ws) => {
                    tracing::debug!(warm = idle.len() + 1, "asr pre-connection established");
                    idle.push_back(ws);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "asr pre-connect failed, will retry next tick");
                    break;
                }
            }
        }
    }
}
