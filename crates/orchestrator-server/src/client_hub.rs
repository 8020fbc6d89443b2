//! Client WS Hub (spec §4.4): terminates outbound user connections over
//! axum (grounded on the `WebSocketUpgrade`/split/forward-task pattern in
//! `stupid-db`'s `live.rs`, the clearest axum-websocket example in the
//! retrieval pack), authenticates them with a bearer JWT (or a manager API
//! token via the pluggable `ManagerTokenValidator`), tracks per-session
//! subscriptions, broadcasts Session Manager events, and owns the
//! push-notification debounce policy.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use orchestrator_core::manager::ManagerEvent;
use orchestrator_core::model::{SessionId, SessionStatus};
use orchestrator_core::wire::{AuthAlertStatus, ClientMessage, ServerEvent};

use crate::auth::{verify_bearer_jwt, ManagerTokenValidator};
use crate::manager_handle::ManagerHandle;
use crate::push::PushNotifier;

/// Spec §4.4 / §5 "Timeouts": 10s for the first (auth) frame.
const CLIENT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);
/// Spec §4.4 "Push-notification debouncing": 3s after `result`.
const RESULT_NOTIFY_DEBOUNCE: Duration = Duration::from_secs(3);

struct ClientConnection {
    id: u64,
    username: String,
    tx: mpsc::UnboundedSender<ServerEvent>,
    subscriptions: StdMutex<HashSet<SessionId>>,
}

pub struct ClientHub {
    manager: Arc<ManagerHandle>,
    jwt_secret: String,
    manager_validator: Arc<dyn ManagerTokenValidator>,
    push: Arc<dyn PushNotifier>,
    clients: DashMap<u64, Arc<ClientConnection>>,
    next_client_id: AtomicU64,
    pending_notifies: DashMap<SessionId, JoinHandle<()>>,
    event_tx: mpsc::UnboundedSender<ManagerEvent>,
    weak_self: std::sync::OnceLock<std::sync::Weak<ClientHub>>,
}

impl ClientHub {
    pub fn new(
        manager: Arc<ManagerHandle>,
        jwt_secret: String,
        manager_validator: Arc<dyn ManagerTokenValidator>,
        push: Arc<dyn PushNotifier>,
    ) -> Arc<Self> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ManagerEvent>();
        let hub = Arc::new(Self {
            manager,
            jwt_secret,
            manager_validator,
            push,
            clients: DashMap::new(),
            next_client_id: AtomicU64::new(0),
            pending_notifies: DashMap::new(),
            event_tx,
            weak_self: std::sync::OnceLock::new(),
        });
        let _ = hub.weak_self.set(Arc::downgrade(&hub));

        // A single consumer processes events strictly in arrival order, so
        // per-session event ordering (spec §5 "Per-session event
        // ordering") holds without needing a lock shared with the Session
        // Manager.
        let consumer = Arc::clone(&hub);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                consumer.process_event(event).await;
            }
        });

        hub
    }

    fn self_arc(&self) -> Arc<Self> {
        self.weak_self.get().and_then(|w| w.upgrade()).expect("ClientHub always constructed via new()")
    }

    // -----------------------------------------------------------------
    // Session Manager event fan-out
    // -----------------------------------------------------------------

    async fn process_event(&self, event: ManagerEvent) {
        match event {
            ManagerEvent::SessionUpdate { info } => {
                if matches!(info.status, SessionStatus::Running | SessionStatus::Terminated) {
                    self.cancel_pending_notify(&info.id);
                }
                self.broadcast_all(ServerEvent::SessionUpdate { session: info });
            }
            ManagerEvent::Messages { session_id, messages } => {
                self.broadcast(&session_id, ServerEvent::Messages { session_id, messages });
            }
            ManagerEvent::Stream { session_id, message_id, token } => {
                self.broadcast(&session_id, ServerEvent::Stream { session_id, message_id, token });
            }
            ManagerEvent::ApprovalRequest { session_id, approval } => {
                self.broadcast(
                    &session_id,
                    ServerEvent::ApprovalRequest { session_id: session_id.clone(), approval },
                );
                self.push_immediately(&session_id, "Approval Needed").await;
            }
            ManagerEvent::Question { session_id, question } => {
                self.broadcast(&session_id, ServerEvent::Question { session_id: session_id.clone(), question });
                self.push_immediately(&session_id, "Question").await;
            }
            ManagerEvent::Result { session_id } => {
                self.broadcast(&session_id, ServerEvent::Result { session_id: session_id.clone() });
                self.schedule_result_notify(session_id);
            }
            ManagerEvent::ModelsList { session_id, models } => {
                self.broadcast(&session_id, ServerEvent::ModelsList { session_id, models });
            }
        }
    }

    /// Used by `SessionManager::restore` callers: the manager emits one
    /// `SessionUpdate` per restored session directly through this hub's
    /// `EventSink` implementation, so nothing extra is needed here — kept
    /// as a named entry point for readability at the call site in main.rs.
    pub fn event_sink(self: &Arc<Self>) -> Arc<dyn orchestrator_core::manager::EventSink> {
        self.clone()
    }

    async fn push_immediately(&self, session_id: &SessionId, title: &str) {
        if self.has_subscribers(session_id) {
            return;
        }
        if let Ok(info) = self.manager.get().get_session(session_id).await {
            if info.notifications_enabled {
                self.push.notify(session_id, title, &info.last_message_preview.unwrap_or_default());
            }
        }
    }

    fn schedule_result_notify(&self, session_id: SessionId) {
        self.cancel_pending_notify(&session_id);
        let this = self.self_arc();
        let id_for_task = session_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(RESULT_NOTIFY_DEBOUNCE).await;
            if this.has_subscribers(&id_for_task) {
                return;
            }
            if let Ok(info) = this.manager.get().get_session(&id_for_task).await {
                if info.notifications_enabled {
                    this.push.notify(&id_for_task, "Task Complete", "");
                }
            }
            this.pending_notifies.remove(&id_for_task);
        });
        self.pending_notifies.insert(session_id, handle);
    }

    fn cancel_pending_notify(&self, session_id: &SessionId) {
        if let Some((_, handle)) = self.pending_notifies.remove(session_id) {
            handle.abort();
        }
    }

    fn has_subscribers(&self, session_id: &SessionId) -> bool {
        self.clients
            .iter()
            .any(|entry| entry.value().subscriptions.lock().unwrap().contains(session_id))
    }

    fn broadcast(&self, session_id: &SessionId, event: ServerEvent) {
        for entry in self.clients.iter() {
            let client = entry.value();
            if client.subscriptions.lock().unwrap().contains(session_id) {
                let _ = client.tx.send(event.clone());
            }
        }
    }

    fn broadcast_all(&self, event: ServerEvent) {
        for entry in self.clients.iter() {
            let _ = entry.value().tx.send(event.clone());
        }
    }

    // -----------------------------------------------------------------
    // Connection handling
    // -----------------------------------------------------------------

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut sender, mut receiver) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

        let forward = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let Some((client_id, username)) = self.authenticate(&mut receiver, &tx).await else {
            drop(tx);
            let _ = forward.await;
            return;
        };

        let client = Arc::new(ClientConnection {
            id: client_id,
            username,
            tx: tx.clone(),
            subscriptions: StdMutex::new(HashSet::new()),
        });
        self.clients.insert(client_id, client.clone());
        let _ = tx.send(ServerEvent::AuthOk);

        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
                continue;
            };
            let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
            match parsed {
                Ok(ClientMessage::Auth { .. }) => {
                    debug!(client_id, "unexpected post-auth auth frame, ignoring");
                }
                Ok(msg) => self.dispatch(&client, msg).await,
                Err(e) => {
                    debug!(client_id, error = %e, "dropping malformed client frame");
                }
            }
        }

        self.clients.remove(&client_id);
        forward.abort();
    }

    async fn authenticate(
        &self,
        receiver: &mut futures_util::stream::SplitStream<WebSocket>,
        tx: &mpsc::UnboundedSender<ServerEvent>,
    ) -> Option<(u64, String)> {
        let frame = tokio::time::timeout(CLIENT_AUTH_TIMEOUT, receiver.next()).await;
        let text = match frame {
            Ok(Some(Ok(Message::Text(text)))) => text,
            _ => {
                let _ = tx.send(ServerEvent::AuthError { message: "auth timed out or connection closed".into() });
                return None;
            }
        };

        let Ok(ClientMessage::Auth { token }) = serde_json::from_str::<ClientMessage>(&text) else {
            let _ = tx.send(ServerEvent::AuthError { message: "first message must be an auth frame".into() });
            return None;
        };

        let username = if let Ok(claims) = verify_bearer_jwt(&token, &self.jwt_secret) {
            claims.username
        } else if self.manager_validator.validate(&token).await {
            "manager".to_string()
        } else {
            let _ = tx.send(ServerEvent::AuthError { message: "invalid token".into() });
            return None;
        };

        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        Some((id, username))
    }

    async fn dispatch(&self, client: &Arc<ClientConnection>, msg: ClientMessage) {
        let result = match msg {
            ClientMessage::Auth { .. } => unreachable!("handled before dispatch"),
            ClientMessage::Subscribe { session_id } => {
                client.subscriptions.lock().unwrap().insert(session_id);
                Ok(())
            }
            ClientMessage::Unsubscribe { session_id } => {
                client.subscriptions.lock().unwrap().remove(&session_id);
                Ok(())
            }
            ClientMessage::SendPrompt { session_id, content } => {
                self.manager.get().send_message(&session_id, content).await.map(|_| ())
            }
            ClientMessage::ApproveTool { session_id, approval_id, allow, message } => self
                .manager
                .get()
                .approve_tool_use(&session_id, &approval_id, allow, message)
                .await
                .map(|_| ()),
            ClientMessage::AnswerQuestion { session_id, question_id, answers } => self
                .manager
                .get()
                .answer_question(&session_id, &question_id, answers)
                .await
                .map(|_| ()),
            ClientMessage::Interrupt { session_id } => {
                self.manager.get().interrupt_session(&session_id).await.map(|_| ())
            }
            ClientMessage::UpdateSettings { session_id, name, permission_mode, notifications_enabled } => self
                .manager
                .get()
                .update_session_settings(&session_id, name, permission_mode, notifications_enabled)
                .await
                .map(|_| ()),
            ClientMessage::SetModel { session_id, model } => {
                self.manager.get().set_model(&session_id, model).await.map(|_| ())
            }
            ClientMessage::GetModels { session_id } => {
                self.manager.get().get_supported_models(&session_id).await.map(|_| ())
            }
        };

        // The client protocol (spec §6) defines no generic error frame for
        // a failed operation — only auth_error/auth_alert are part of the
        // broadcast set — so rejected operations are logged here and left
        // for the client to infer from the absence of the expected
        // session_update/result event, per DESIGN.md's resolution of this
        // gap.
        if let Err(e) = result {
            warn!(client_id = client.id, username = %client.username, error = %e, "client operation rejected");
        }
    }

    /// Used by the auth-refresh collaborator (out of scope here) to push
    /// `auth_alert` to every connected client, per spec §6.
    pub fn broadcast_auth_alert(&self, status: AuthAlertStatus, message: String) {
        self.broadcast_all(ServerEvent::AuthAlert { status, message });
    }
}

impl orchestrator_core::manager::EventSink for ClientHub {
    fn emit(&self, event: ManagerEvent) {
        let _ = self.event_tx.send(event);
    }
}

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(hub): State<Arc<ClientHub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysValid;
    #[async_trait::async_trait]
    impl ManagerTokenValidator for AlwaysValid {
        async fn validate(&self, _token: &str) -> bool {
            false
        }
    }

    struct RecordingPush {
        calls: StdMutex<Vec<(String, String)>>,
    }
    impl PushNotifier for RecordingPush {
        fn notify(&self, session_id: &str, title: &str, _body: &str) {
            self.calls.lock().unwrap().push((session_id.to_string(), title.to_string()));
        }
    }

    #[tokio::test]
    async fn subscribe_unsubscribe_is_idempotent_on_subscriber_state() {
        // hasSubscribers is exercised indirectly through process_event in
        // the integration tests; here we check the pure subscription set
        // semantics that back it.
        let subs: StdMutex<HashSet<String>> = StdMutex::new(HashSet::new());
        subs.lock().unwrap().insert("s1".to_string());
        assert!(subs.lock().unwrap().contains("s1"));
        subs.lock().unwrap().remove("s1");
        assert!(!subs.lock().unwrap().contains("s1"));
    }

    fn test_hub() -> Arc<ClientHub> {
        ClientHub::new(
            ManagerHandle::new(),
            "secret".into(),
            Arc::new(AlwaysValid),
            Arc::new(RecordingPush { calls: StdMutex::new(Vec::new()) }),
        )
    }

    fn fake_client(hub: &ClientHub, id: u64) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.clients.insert(
            id,
            Arc::new(ClientConnection { id, username: "u".into(), tx, subscriptions: StdMutex::new(HashSet::new()) }),
        );
        rx
    }

    #[tokio::test]
    async fn broadcast_only_reaches_subscribed_clients() {
        let hub = test_hub();
        let mut rx1 = fake_client(&hub, 1);
        let mut rx2 = fake_client(&hub, 2);
        hub.clients.get(&1).unwrap().subscriptions.lock().unwrap().insert("s1".to_string());

        hub.process_event(ManagerEvent::Messages { session_id: "s1".into(), messages: vec![] }).await;

        assert!(matches!(rx1.try_recv().unwrap(), ServerEvent::Messages { .. }));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn session_update_always_broadcasts_to_every_client() {
        let hub = test_hub();
        let mut rx = fake_client(&hub, 1);
        let info = orchestrator_core::model::SessionInfo {
            id: "s1".into(),
            name: "demo".into(),
            creator: "alice".into(),
            repo_url: "https://github.com/a/b".into(),
            branch: "main".into(),
            docker_access: false,
            is_manager: false,
            permission_mode: Default::default(),
            model: "opus".into(),
            notifications_enabled: true,
            container_id: None,
            status: SessionStatus::Idle,
            created_at: chrono::Utc::now(),
            last_message_at: None,
            last_message_preview: None,
            total_cost_usd: 0.0,
            context_usage: Default::default(),
            last_turn_usage: Default::default(),
            pending_approval: None,
            pending_question: None,
            manager_state: None,
        };
        hub.process_event(ManagerEvent::SessionUpdate { info }).await;
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::SessionUpdate { .. }));
    }
}
