//! Internal WS Hub (spec §4.3): terminates inbound agent connections on a
//! raw `tokio-tungstenite` listener (a separate socket from the client
//! hub's axum router — see `Config::internal_port`), authenticates them
//! against the per-session bearer token, and bridges them to the Session
//! Manager. Grounded on the `tokio-tungstenite` accept/split pattern in
//! ai-session's `mcp/transport.rs`, turned inside-out from a client to a
//! server since this hub accepts connections rather than dialing out.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use orchestrator_core::manager::{AgentLink, SessionManager};
use orchestrator_core::model::SessionId;
use orchestrator_core::wire::{AgentMessage, MasterMessage};

/// Spec §4.3 / §5 "Timeouts": 30s for the first (auth) frame.
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_UNAUTHORIZED: u16 = 4001;

enum OutFrame {
    Text(String),
    Close(u16),
}

struct TungsteniteAgentLink {
    tx: mpsc::UnboundedSender<OutFrame>,
}

impl AgentLink for TungsteniteAgentLink {
    fn send(&self, msg: MasterMessage) {
        if let Ok(text) = serde_json::to_string(&msg) {
            // Silent no-op on a closed socket (spec §4.3 send path).
            let _ = self.tx.send(OutFrame::Text(text));
        }
    }

    fn close(&self) {
        let _ = self.tx.send(OutFrame::Close(1000));
    }
}

pub struct InternalHub {
    manager: Arc<SessionManager>,
}

impl InternalHub {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Takes an already-bound listener (rather than binding here itself) so
    /// callers can bind an ephemeral port and read back the real address,
    /// matching the split `TcpListener::bind` / `axum::serve` already used
    /// for the client hub in `main`.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = ?listener.local_addr(), "internal ws hub listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream).await {
                    debug!(%peer, error = %e, "internal ws connection ended");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut stream) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<OutFrame>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let outcome = match frame {
                    OutFrame::Text(text) => sink.send(Message::Text(text)).await,
                    OutFrame::Close(code) => {
                        let result = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: "".into(),
                            })))
                            .await;
                        let _ = sink.close().await;
                        rx.close();
                        result
                    }
                };
                if outcome.is_err() {
                    break;
                }
            }
        });

        let Some(session_id) = self.authenticate(&mut stream, &tx).await else {
            drop(tx);
            let _ = writer.await;
            return Ok(());
        };

        let link = Arc::new(TungsteniteAgentLink { tx: tx.clone() });
        self.manager.register_agent_connection(session_id.clone(), link);
        self.manager.handle_agent_authenticated(&session_id).await;
        let _ = tx.send(OutFrame::Text(serde_json::to_string(&MasterMessage::AuthOk)?));

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<AgentMessage>(&text) {
                    Ok(msg) => {
                        if let Err(e) = self.manager.handle_agent_message(&session_id, msg).await {
                            warn!(session_id = %session_id, error = %e, "agent message rejected");
                        }
                    }
                    Err(e) => {
                        debug!(session_id = %session_id, error = %e, "dropping malformed agent frame");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id = %session_id, error = %e, "agent ws error");
                    break;
                }
            }
        }

        self.manager.handle_agent_disconnect(&session_id).await;
        writer.abort();
        Ok(())
    }

    /// First message must be `{type:'auth', sessionId, token}`; on success
    /// returns the session id with the timer cleared, on any failure
    /// (timeout, non-auth first message, bad token, invalid JSON) closes
    /// with WS code 4001 and returns `None`.
    async fn authenticate(
        &self,
        stream: &mut futures_util::stream::SplitStream<
            tokio_tungstenite::WebSocketStream<TcpStream>,
        >,
        tx: &mpsc::UnboundedSender<OutFrame>,
    ) -> Option<SessionId> {
        let frame = tokio::time::timeout(AUTH_TIMEOUT, stream.next()).await;
        let reject = |reason: &str| {
            debug!(reason, "internal ws auth rejected");
            let _ = tx.send(OutFrame::Close(CLOSE_UNAUTHORIZED));
        };

        let text = match frame {
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(_))) => {
                reject("first frame was not text");
                return None;
            }
            Ok(Some(Err(e))) => {
                reject(&e.to_string());
                return None;
            }
            Ok(None) => {
                reject("connection closed before auth");
                return None;
            }
            Err(_) => {
                reject("auth timed out");
                return None;
            }
        };

        let msg: AgentMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                reject(&e.to_string());
                return None;
            }
        };

        let AgentMessage::Auth { session_id, token } = msg else {
            reject("first message was not an auth frame");
            return None;
        };

        let Some(token_bytes) = decode_hex(&token) else {
            reject("token was not valid hex");
            return None;
        };

        if !self.manager.authenticate_agent(&session_id, &token_bytes).await {
            reject("token mismatch");
            return None;
        }

        Some(session_id)
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_hex_roundtrips() {
        assert_eq!(decode_hex("deadbeef"), Some(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(decode_hex("xyz"), None);
        assert_eq!(decode_hex("abc"), None);
    }
}
