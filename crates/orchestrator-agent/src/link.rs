//! Reconnecting client side of the internal agent protocol (spec §4.5).
//! Grounded on the `connect_async` / split-sink-stream / `Message::Text`
//! pattern in the teacher's own `ai-session/src/mcp/transport.rs`
//! `HttpTransport`, turned into a long-lived reconnecting loop instead of a
//! lazily-reconnected one-shot transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use orchestrator_core::wire::{AgentMessage, MasterMessage};

use crate::error::{AgentError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Dispatches frames the master sends down to the agent. Implemented by the
/// binary's message-routing loop; kept as a trait so `AgentLink` doesn't
/// need to know about the prompt bridge or the backend.
pub trait MasterMessageHandler: Send + Sync {
    fn handle(&self, msg: MasterMessage);
}

/// Reconnect backoff sequence per spec §4.5 / §8: `min(1000*2^attempt,
/// 30000)` ms, i.e. `1,2,4,8,16,30,30,...` seconds. `attempt` is 0-indexed
/// and reset to 0 on every successful re-authentication.
pub fn backoff_duration(attempt: u32) -> Duration {
    let millis = 1000u64.saturating_mul(1u64 << attempt.min(32));
    Duration::from_millis(millis.min(30_000))
}

pub struct AgentLink {
    url: String,
    session_id: String,
    token: StdMutex<String>,
    sender: StdMutex<Option<mpsc::UnboundedSender<Message>>>,
    should_reconnect: AtomicBool,
}

impl AgentLink {
    pub fn new(url: String, session_id: String, token: String) -> Arc<Self> {
        Arc::new(Self {
            url,
            session_id,
            token: StdMutex::new(token),
            sender: StdMutex::new(None),
            should_reconnect: AtomicBool::new(true),
        })
    }

    /// Applies a `token_update` frame (spec §6 internal protocol) so the
    /// *next* reconnect authenticates with the refreshed token. Does not
    /// affect the already-open connection.
    pub fn update_token(&self, token: String) {
        *self.token.lock().unwrap() = token;
    }

    /// Connects, authenticates, and serves the connection until it drops,
    /// then reconnects with exponential backoff forever (until `shutdown`
    /// is called). If the *first* connection never authenticates, returns
    /// the error instead of entering the reconnect loop (spec §4.5: "If the
    /// first connection never authenticates, the initial connect promise is
    /// rejected and no reconnect is scheduled").
    pub async fn run(self: Arc<Self>, handler: Arc<dyn MasterMessageHandler>) -> Result<()> {
        let stream = self.connect_and_authenticate().await?;
        self.serve_connection(stream, Arc::clone(&handler)).await;

        let mut attempt = 0u32;
        while self.should_reconnect.load(Ordering::SeqCst) {
            let wait = backoff_duration(attempt);
            debug!(?wait, attempt, "reconnecting after backoff");
            tokio::time::sleep(wait).await;
            if !self.should_reconnect.load(Ordering::SeqCst) {
                break;
            }
            match self.connect_and_authenticate().await {
                Ok(stream) => {
                    attempt = 0;
                    info!(session_id = %self.session_id, "agent link reconnected");
                    self.serve_connection(stream, Arc::clone(&handler)).await;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    warn!(error = %e, attempt, "reconnect attempt failed");
                }
            }
        }
        Ok(())
    }

    /// Stops the reconnect loop; the process is expected to exit shortly
    /// after (spec §4.5: "Reconnection is abandoned only when the process
    /// is told to close").
    pub fn shutdown(&self) {
        self.should_reconnect.store(false, Ordering::SeqCst);
    }

    /// Outbound writes on a non-open socket are silent no-ops (spec §4.5) —
    /// the agent is expected to tolerate dropped outbound telemetry during
    /// reconnects.
    pub fn send(&self, msg: AgentMessage) {
        let Ok(text) = serde_json::to_string(&msg) else { return };
        let guard = self.sender.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(Message::Text(text));
        }
    }

    async fn connect_and_authenticate(&self) -> Result<WsStream> {
        let (mut stream, _) = connect_async(&self.url)
            .await
            .map_err(|e| AgentError::link(format!("connect failed: {e}")))?;

        let auth = AgentMessage::Auth {
            session_id: self.session_id.clone(),
            token: self.token.lock().unwrap().clone(),
        };
        let text = serde_json::to_string(&auth).map_err(|e| AgentError::link(e.to_string()))?;
        stream
            .send(Message::Text(text))
            .await
            .map_err(|e| AgentError::link(format!("auth send failed: {e}")))?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let msg: MasterMessage = serde_json::from_str(&text)
                    .map_err(|e| AgentError::link(format!("malformed auth reply: {e}")))?;
                if matches!(msg, MasterMessage::AuthOk) {
                    Ok(stream)
                } else {
                    Err(AgentError::link("master did not reply with auth_ok"))
                }
            }
            Some(Ok(_)) => Err(AgentError::link("master replied with a non-text frame")),
            Some(Err(e)) => Err(AgentError::link(format!("auth reply error: {e}"))),
            None => Err(AgentError::link("connection closed before auth_ok")),
        }
    }

    async fn serve_connection(&self, stream: WsStream, handler: Arc<dyn MasterMessageHandler>) {
        let (mut sink, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.sender.lock().unwrap() = Some(tx);

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<MasterMessage>(&text) {
                    Ok(msg) => handler.handle(msg),
                    Err(e) => debug!(error = %e, "dropping malformed master frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "master ws error");
                    break;
                }
            }
        }

        *self.sender.lock().unwrap() = None;
        writer.abort();
    }
}
