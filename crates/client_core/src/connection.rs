use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use shared::protocol::ServerEvent;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{error::ClientError, types::Session};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Retry bounds for the live channel. Counted per consecutive failed dial;
/// the counter resets after any successful connection.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl ReconnectPolicy {
    fn delay_for_failure(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(10);
        self.base_delay * 2u32.saturating_pow(exponent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Parsed push event, delivered in transport arrival order.
    Server(ServerEvent),
    /// The retry bound was exhausted. Emitted once; no further attempts until
    /// `connect` is called again.
    ConnectionLost,
}

enum DialOutcome {
    ConnectedThenLost,
    DialFailed(anyhow::Error),
    Cancelled,
}

/// Owns the push channel for exactly one authenticated session at a time.
/// Constructed once and handed to the engine; lifecycle follows the session.
pub struct ConnectionManager {
    server_url: String,
    policy: ReconnectPolicy,
    inner: Mutex<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

struct ConnectionState {
    session: Option<Session>,
    status: ConnectionStatus,
    epoch: u64,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(server_url: impl Into<String>, policy: ReconnectPolicy) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            server_url: server_url.into(),
            policy,
            inner: Mutex::new(ConnectionState {
                session: None,
                status: ConnectionStatus::Disconnected,
                epoch: 0,
                task: None,
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.inner.lock().await.status
    }

    /// Binds the channel to `session` and starts dialing. A no-op while a
    /// connection for the same session is alive; a different session tears
    /// the old channel down first.
    pub async fn connect(self: &Arc<Self>, session: Session) -> Result<(), ClientError> {
        if let Err(err) = live_channel_url(&self.server_url, &session.auth_token) {
            return Err(ClientError::Validation(err.to_string()));
        }

        let epoch = {
            let mut guard = self.inner.lock().await;
            if guard.session.as_ref() == Some(&session)
                && guard.status != ConnectionStatus::Disconnected
            {
                return Ok(());
            }
            if let Some(task) = guard.task.take() {
                task.abort();
            }
            guard.epoch += 1;
            guard.session = Some(session.clone());
            guard.status = ConnectionStatus::Connecting;
            guard.epoch
        };

        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            manager.run_dial_loop(epoch, session).await;
        });

        let mut guard = self.inner.lock().await;
        if guard.epoch == epoch {
            guard.task = Some(task);
        } else {
            task.abort();
        }
        Ok(())
    }

    /// Tears the channel down without emitting `ConnectionLost`.
    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        guard.epoch += 1;
        if let Some(task) = guard.task.take() {
            task.abort();
        }
        guard.session = None;
        guard.status = ConnectionStatus::Disconnected;
    }

    async fn run_dial_loop(self: Arc<Self>, epoch: u64, session: Session) {
        let mut failures: u32 = 0;
        loop {
            match self.run_connection(epoch, &session).await {
                DialOutcome::Cancelled => return,
                DialOutcome::ConnectedThenLost => {
                    failures = 0;
                    if !self.mark_status(epoch, ConnectionStatus::Reconnecting).await {
                        return;
                    }
                    info!("live channel lost, reconnecting");
                }
                DialOutcome::DialFailed(err) => {
                    failures += 1;
                    if failures >= self.policy.max_attempts {
                        warn!(
                            attempts = failures,
                            error = %err,
                            "live channel retries exhausted"
                        );
                        self.mark_lost(epoch).await;
                        return;
                    }
                    if !self.mark_status(epoch, ConnectionStatus::Reconnecting).await {
                        return;
                    }
                    let delay = self.policy.delay_for_failure(failures);
                    debug!(
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "live channel dial failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn run_connection(&self, epoch: u64, session: &Session) -> DialOutcome {
        let ws_url = match live_channel_url(&self.server_url, &session.auth_token) {
            Ok(url) => url,
            Err(err) => return DialOutcome::DialFailed(err),
        };

        let (ws_stream, _) = match connect_async(ws_url.as_str()).await {
            Ok(connected) => connected,
            Err(err) => {
                return DialOutcome::DialFailed(
                    anyhow!(err).context("failed to connect live channel"),
                )
            }
        };

        if !self.mark_status(epoch, ConnectionStatus::Connected).await {
            return DialOutcome::Cancelled;
        }
        info!("live channel connected");

        let (_, mut ws_reader) = ws_stream.split();
        while let Some(frame) = ws_reader.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => {
                        let _ = self.events.send(ConnectionEvent::Server(event));
                    }
                    Err(err) => {
                        warn!(error = %err, "ignoring malformed live event");
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "live channel receive failed");
                    break;
                }
            }
        }
        DialOutcome::ConnectedThenLost
    }

    async fn mark_status(&self, epoch: u64, status: ConnectionStatus) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.epoch != epoch {
            return false;
        }
        guard.status = status;
        true
    }

    async fn mark_lost(&self, epoch: u64) {
        {
            let mut guard = self.inner.lock().await;
            if guard.epoch != epoch {
                return;
            }
            guard.status = ConnectionStatus::Disconnected;
            guard.task = None;
        }
        let _ = self.events.send(ConnectionEvent::ConnectionLost);
    }
}

fn live_channel_url(server_url: &str, auth_token: &str) -> Result<Url> {
    let mut url = Url::parse(server_url)
        .with_context(|| format!("invalid server url: {server_url}"))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(anyhow!("server url must be http or https, got {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot derive websocket scheme for {server_url}"))?;
    url.set_path("/ws");
    url.query_pairs_mut().clear().append_pair("token", auth_token);
    Ok(url)
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
