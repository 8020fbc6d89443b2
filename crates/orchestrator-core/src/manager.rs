//! Session Manager: the authoritative in-memory map of sessions, their
//! finite state machines, message logs, pending approvals/questions, and
//! the event bus that drives the Client WS Hub (spec §4.1).
//!
//! Mutations are serialized behind a single `tokio::sync::Mutex`, matching
//! the coarse-lock design in §5; the separate, more contended registry of
//! live agent-link senders lives in its own `DashMap` so sending to an
//! agent never needs the session-map lock (grounded on ccswarm's
//! `dashmap`-backed agent/session registries).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::container::{ContainerProvider, ContainerStatus, SessionContainerSpec, SessionSecrets};
use crate::error::{OrchestratorError, Result};
use crate::model::{
    ContextUsage, ManagerStep, MessageKind, PendingApproval, PendingQuestion, PermissionMode,
    Session, SessionId, SessionInfo, SessionMessage, SessionStatus,
};
use crate::store::{PersistedSession, PersistedState, SessionStore};
use crate::wire::{AgentMessage, MasterMessage};

/// Sink for an authenticated agent connection. The Internal WS Hub
/// implements this over a websocket sender; tests substitute an in-memory
/// queue. Writes on a closed/dropped sink are silent no-ops (spec §4.3).
pub trait AgentLink: Send + Sync {
    fn send(&self, msg: MasterMessage);

    /// Closes the underlying connection. Called when a new auth from the
    /// same session id displaces this link (invariant 2: "closes the old
    /// one"). Default no-op for links that don't own a socket (test
    /// doubles).
    fn close(&self) {}
}

/// Events emitted to the single subscriber (the Client WS Hub), mirroring
/// the broadcast frame names of §6.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    SessionUpdate { info: SessionInfo },
    Messages { session_id: SessionId, messages: Vec<SessionMessage> },
    Stream { session_id: SessionId, message_id: u64, token: String },
    ApprovalRequest { session_id: SessionId, approval: PendingApproval },
    Question { session_id: SessionId, question: PendingQuestion },
    Result { session_id: SessionId },
    ModelsList { session_id: SessionId, models: Vec<String> },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ManagerEvent);
}

struct SessionManagerInner {
    sessions: HashMap<SessionId, Session>,
}

/// Parameters accepted by `createSession`. Grouped into a struct since the
/// operation takes more fields than reads comfortably as positional args.
pub struct CreateSessionParams {
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub docker_access: bool,
    pub manager_mode: bool,
    pub creator: String,
    pub git_user_name: Option<String>,
    pub git_user_email: Option<String>,
    pub github_token: Option<String>,
    pub claude_code_oauth_token: Option<String>,
    pub credentials_host_path: Option<String>,
}

pub struct SessionManager {
    inner: Mutex<SessionManagerInner>,
    agent_links: DashMap<SessionId, Arc<dyn AgentLink>>,
    config: Config,
    containers: Arc<dyn ContainerProvider>,
    store: SessionStore,
    sink: Arc<dyn EventSink>,
    internal_secret: String,
    pending_saves: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// A weak handle to the enclosing `Arc`, populated by `new`, so methods
    /// taking plain `&self` can still spawn detached tasks (the debounced
    /// save, the delete-grace timer) that outlive the call.
    weak_self: std::sync::OnceLock<std::sync::Weak<SessionManager>>,
}

impl SessionManager {
    pub fn new(
        config: Config,
        containers: Arc<dyn ContainerProvider>,
        store: SessionStore,
        sink: Arc<dyn EventSink>,
        internal_secret: String,
    ) -> Arc<Self> {
        let arc = Arc::new(Self {
            inner: Mutex::new(SessionManagerInner { sessions: HashMap::new() }),
            agent_links: DashMap::new(),
            config,
            containers,
            store,
            sink,
            internal_secret,
            pending_saves: Mutex::new(None),
            weak_self: std::sync::OnceLock::new(),
        });
        let _ = arc.weak_self.set(Arc::downgrade(&arc));
        arc
    }

    fn self_arc(&self) -> Arc<Self> {
        self.weak_self
            .get()
            .and_then(|w| w.upgrade())
            .expect("SessionManager always constructed via new()")
    }

    // -----------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------

    /// Loads the snapshot, ensures the instance network exists, then
    /// reconciles against the container daemon (spec §4.1 "Persistence",
    /// §4.2 "Startup reconciliation"). Emits one `session_update` per
    /// restored session.
    pub async fn restore(&self) -> Result<()> {
        self.containers.ensure_network(&self.config.instance_id).await?;

        let Some(persisted) = self.store.load().await else {
            info!("no session snapshot found, starting empty");
            return Ok(());
        };

        let mut sessions = HashMap::new();
        for ps in persisted.sessions {
            let mut info = ps.info;
            let container_ok = match &info.container_id {
                Some(id) => matches!(self.containers.status(id).await?, ContainerStatus::Running),
                None => false,
            };
            if info.status.implies_container() && !container_ok {
                info.status = SessionStatus::Error;
                info.container_id = None;
            }
            sessions.insert(
                info.id.clone(),
                Session {
                    info,
                    session_token: decode_token(&ps.session_token),
                    messages: ps.messages,
                    next_message_id: 0,
                    manager_api_token: ps.manager_api_token,
                    pre_disconnect_status: None,
                },
            );
        }
        for session in sessions.values_mut() {
            session.next_message_id = session.messages.last().map(|m| m.id + 1).unwrap_or(0);
        }

        let labelled = self.containers.list_labelled(&self.config.instance_id).await?;
        for container in labelled {
            let known = container
                .session_id
                .as_ref()
                .is_some_and(|id| sessions.contains_key(id));
            if !known {
                info!(container_id = %container.id, "pruning unreconciled container");
                if let Err(e) = self.containers.stop_and_remove(&container.id, 5).await {
                    warn!(error = %e, "failed to prune stray container");
                }
            }
        }

        let infos: Vec<SessionInfo> = sessions.values().map(|s| s.info.clone()).collect();
        {
            let mut inner = self.inner.lock().await;
            inner.sessions = sessions;
        }
        for info in infos {
            self.sink.emit(ManagerEvent::SessionUpdate { info });
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Read-only operations
    // -----------------------------------------------------------------

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock().await;
        inner.sessions.values().map(|s| s.info.clone()).collect()
    }

    pub async fn get_session(&self, id: &SessionId) -> Result<SessionInfo> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .get(id)
            .map(|s| s.info.clone())
            .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))
    }

    pub async fn get_messages(&self, id: &SessionId) -> Result<Vec<SessionMessage>> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .get(id)
            .map(|s| s.messages.clone())
            .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))
    }

    // -----------------------------------------------------------------
    // createSession
    // -----------------------------------------------------------------

    pub async fn create_session(&self, params: CreateSessionParams) -> Result<SessionInfo> {
        if params.name.trim().is_empty() {
            return Err(OrchestratorError::invalid_argument("name must not be empty"));
        }
        let (git_repo_url, git_branch) = (params.repo_url.clone(), params.branch.clone());
        parse_owner_repo(&params.repo_url)
            .ok_or_else(|| OrchestratorError::invalid_argument("repoUrl is not a parseable host[:/]owner/repo"))?;

        {
            let inner = self.inner.lock().await;
            if self.config.max_sessions > 0 {
                let running = inner
                    .sessions
                    .values()
                    .filter(|s| !s.info.status.is_terminal())
                    .count();
                if running >= self.config.max_sessions {
                    return Err(OrchestratorError::resource_exhausted(format!(
                        "session cap of {} reached",
                        self.config.max_sessions
                    )));
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        let mut token_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut token_bytes);
        let session_token_hex = hex_encode(&token_bytes);
        let manager_api_token = params.manager_mode.then(|| Uuid::new_v4().to_string());

        let info = SessionInfo {
            id: id.clone(),
            name: params.name.clone(),
            creator: params.creator.clone(),
            repo_url: git_repo_url.clone(),
            branch: git_branch.clone(),
            docker_access: params.docker_access,
            is_manager: params.manager_mode,
            permission_mode: PermissionMode::default(),
            model: "opus".to_string(),
            notifications_enabled: true,
            container_id: None,
            status: SessionStatus::Starting,
            created_at: Utc::now(),
            last_message_at: None,
            last_message_preview: None,
            total_cost_usd: 0.0,
            context_usage: ContextUsage::default(),
            last_turn_usage: ContextUsage::default(),
            pending_approval: None,
            pending_question: None,
            manager_state: params.manager_mode.then(crate::model::ManagerState::default),
        };

        let session = Session {
            info: info.clone(),
            session_token: token_bytes,
            messages: Vec::new(),
            next_message_id: 0,
            manager_api_token: manager_api_token.clone(),
            pre_disconnect_status: None,
        };

        {
            let mut inner = self.inner.lock().await;
            inner.sessions.insert(id.clone(), session);
        }
        self.schedule_save();
        self.sink.emit(ManagerEvent::SessionUpdate { info: info.clone() });

        let spec = SessionContainerSpec {
            session_id: id.clone(),
            instance_id: self.config.instance_id.clone(),
            image: self.config.session_image.clone(),
            permission_mode: "normal".to_string(),
            git_repo_url,
            git_branch,
            git_user_name: params.git_user_name,
            git_user_email: params.git_user_email,
            docker_access: params.docker_access,
            is_manager: params.manager_mode,
            master_http_url: params
                .manager_mode
                .then(|| format!("http://{}:{}", self.config.master_hostname, self.config.port)),
            anthropic_model: info.model.clone(),
            credentials_host_path: params.credentials_host_path,
            secrets: SessionSecrets {
                session_token: session_token_hex,
                master_ws_url: format!(
                    "ws://{}:{}/internal/session",
                    self.config.master_hostname, self.config.port
                ),
                github_token: params.github_token,
                claude_code_oauth_token: params.claude_code_oauth_token,
                manager_api_token,
            },
            resources: crate::container::ResourceLimits {
                memory_bytes: self.config.session_memory_limit,
                cpu_shares: self.config.session_cpu_shares,
                pids_limit: self.config.session_pids_limit,
            },
        };

        match self.containers.create_and_start(&spec).await {
            Ok(container_id) => {
                self.set_container_id(&id, Some(container_id)).await?;
                Ok(self.get_session(&id).await?)
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "container create failed");
                self.set_status(&id, SessionStatus::Error).await?;
                Err(e)
            }
        }
    }

    async fn set_container_id(&self, id: &SessionId, container_id: Option<String>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
        session.info.container_id = container_id;
        drop(inner);
        self.schedule_save();
        Ok(())
    }

    async fn set_status(&self, id: &SessionId, status: SessionStatus) -> Result<()> {
        let info = {
            let mut inner = self.inner.lock().await;
            let session = inner
                .sessions
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
            session.info.status = status;
            session.info.clone()
        };
        self.schedule_save();
        self.sink.emit(ManagerEvent::SessionUpdate { info });
        Ok(())
    }

    // -----------------------------------------------------------------
    // deleteSession
    // -----------------------------------------------------------------

    pub async fn delete_session(&self, id: &SessionId) -> Result<()> {
        let (container_id, info) = {
            let mut inner = self.inner.lock().await;
            let session = inner
                .sessions
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
            session.info.status = SessionStatus::Terminated;
            session.info.pending_approval = None;
            session.info.pending_question = None;
            let container_id = session.info.container_id.take();
            (container_id, session.info.clone())
        };

        self.agent_links.remove(id);
        self.schedule_save();
        self.sink.emit(ManagerEvent::SessionUpdate { info });

        if let Some(container_id) = container_id {
            if let Err(e) = self.containers.stop_and_remove(&container_id, 10).await {
                warn!(session_id = %id, error = %e, "container teardown failed, removing session anyway");
            }
        }

        let this = self.self_arc();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let mut inner = this.inner.lock().await;
            inner.sessions.remove(&id);
            drop(inner);
            this.schedule_save();
        });
        Ok(())
    }

    // -----------------------------------------------------------------
    // sendMessage / approveToolUse / answerQuestion / interruptSession
    // -----------------------------------------------------------------

    pub async fn send_message(&self, id: &SessionId, content: String) -> Result<()> {
        let link = self.require_link(id)?;
        let (info, pushed) = {
            let mut inner = self.inner.lock().await;
            let session = inner
                .sessions
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
            if session.info.pending_approval.is_some() || session.info.pending_question.is_some() {
                return Err(OrchestratorError::conflict(
                    "session has a pending approval or question",
                ));
            }
            let msg = SessionMessage {
                id: 0,
                kind: MessageKind::User,
                content: content.clone(),
                tool_name: None,
                tool_input: None,
                timestamp: Utc::now(),
                is_streaming: false,
                auto_continue: None,
            };
            let pushed = session.push_message(msg).clone();
            if session.info.status == SessionStatus::Idle {
                session.info.status = SessionStatus::Running;
            }
            (session.info.clone(), pushed)
        };
        self.schedule_save();
        self.sink.emit(ManagerEvent::SessionUpdate { info });
        self.sink.emit(ManagerEvent::Messages {
            session_id: id.clone(),
            messages: vec![pushed],
        });
        link.send(MasterMessage::UserMessage { content });
        Ok(())
    }

    pub async fn approve_tool_use(
        &self,
        id: &SessionId,
        approval_id: &str,
        allow: bool,
        message: Option<String>,
    ) -> Result<()> {
        let link = self.require_link(id)?;
        let info = {
            let mut inner = self.inner.lock().await;
            let session = inner
                .sessions
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
            let matches = session
                .info
                .pending_approval
                .as_ref()
                .is_some_and(|a| a.id == approval_id);
            if !matches {
                return Err(OrchestratorError::conflict("no matching pending approval"));
            }
            session.info.pending_approval = None;
            session.info.status = SessionStatus::Running;
            session.info.clone()
        };
        self.schedule_save();
        self.sink.emit(ManagerEvent::SessionUpdate { info });
        link.send(MasterMessage::ApprovalResponse {
            approval_id: approval_id.to_string(),
            allow,
            message,
        });
        Ok(())
    }

    pub async fn answer_question(
        &self,
        id: &SessionId,
        question_id: &str,
        answers: Vec<String>,
    ) -> Result<()> {
        let link = self.require_link(id)?;
        let info = {
            let mut inner = self.inner.lock().await;
            let session = inner
                .sessions
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
            let matches = session
                .info
                .pending_question
                .as_ref()
                .is_some_and(|q| q.id == question_id);
            if !matches {
                return Err(OrchestratorError::conflict("no matching pending question"));
            }
            session.info.pending_question = None;
            session.info.status = SessionStatus::Running;
            session.info.clone()
        };
        self.schedule_save();
        self.sink.emit(ManagerEvent::SessionUpdate { info });
        link.send(MasterMessage::QuestionResponse {
            question_id: question_id.to_string(),
            answers,
        });
        Ok(())
    }

    pub async fn interrupt_session(&self, id: &SessionId) -> Result<()> {
        let link = self.require_link(id)?;
        link.send(MasterMessage::Interrupt);
        Ok(())
    }

    pub async fn update_session_settings(
        &self,
        id: &SessionId,
        name: Option<String>,
        permission_mode: Option<PermissionMode>,
        notifications_enabled: Option<bool>,
    ) -> Result<()> {
        let (info, forward) = {
            let mut inner = self.inner.lock().await;
            let session = inner
                .sessions
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
            if session.info.status.is_terminal() {
                return Err(OrchestratorError::conflict("session is terminated"));
            }
            if let Some(name) = name {
                session.info.name = name;
            }
            if let Some(mode) = permission_mode {
                session.info.permission_mode = mode;
            }
            if let Some(enabled) = notifications_enabled {
                session.info.notifications_enabled = enabled;
            }
            (session.info.clone(), permission_mode)
        };
        self.schedule_save();
        self.sink.emit(ManagerEvent::SessionUpdate { info });
        if let Some(mode) = forward {
            if let Some(link) = self.agent_links.get(id) {
                link.send(MasterMessage::UpdateSettings { permission_mode: Some(mode) });
            }
        }
        Ok(())
    }

    pub async fn set_model(&self, id: &SessionId, model: String) -> Result<()> {
        let link = self.require_link(id)?;
        link.send(MasterMessage::SetModel { model });
        Ok(())
    }

    pub async fn get_supported_models(&self, id: &SessionId) -> Result<()> {
        let link = self.require_link(id)?;
        link.send(MasterMessage::GetModels);
        Ok(())
    }

    pub async fn update_manager_step(&self, id: &SessionId, step: ManagerStep) -> Result<()> {
        let info = {
            let mut inner = self.inner.lock().await;
            let session = inner
                .sessions
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
            if session.info.status.is_terminal() {
                return Err(OrchestratorError::conflict("session is terminated"));
            }
            let state = session
                .info
                .manager_state
                .as_mut()
                .ok_or_else(|| OrchestratorError::invalid_argument("session is not manager-mode"))?;
            state.step = step;
            session.info.clone()
        };
        self.schedule_save();
        self.sink.emit(ManagerEvent::SessionUpdate { info });
        Ok(())
    }

    // -----------------------------------------------------------------
    // Agent connection lifecycle
    // -----------------------------------------------------------------

    /// Constant-time comparison against the stored `sessionToken` (spec
    /// §4.1 `authenticateAgent`).
    pub async fn authenticate_agent(&self, session_id: &SessionId, token: &[u8]) -> bool {
        let inner = self.inner.lock().await;
        match inner.sessions.get(session_id) {
            Some(session) => constant_time_eq(&session.session_token, token),
            None => false,
        }
    }

    /// Replaces any prior link for the same session id, closing it first
    /// (spec invariant 2: at most one live agent connection per session; a
    /// new auth from the same session id replaces the old one).
    pub fn register_agent_connection(&self, session_id: SessionId, link: Arc<dyn AgentLink>) {
        if let Some((_, old)) = self.agent_links.remove(&session_id) {
            old.close();
        }
        self.agent_links.insert(session_id, link);
    }

    pub fn unregister_agent_connection(&self, session_id: &SessionId) {
        self.agent_links.remove(session_id);
    }

    /// Called by the Internal WS Hub immediately after a connection
    /// authenticates (spec §4.1 FSM: "reconnecting | agent reconnects and
    /// authenticates | prior state restored OR idle if unknown"). A first
    /// connection (status `starting`) is left alone — it still needs the
    /// agent's `ready` frame before moving to `idle`.
    pub async fn handle_agent_authenticated(&self, id: &SessionId) {
        let info = {
            let mut inner = self.inner.lock().await;
            match inner.sessions.get_mut(id) {
                Some(session) if session.info.status == SessionStatus::Reconnecting => {
                    session.info.status = session
                        .pre_disconnect_status
                        .take()
                        .unwrap_or(SessionStatus::Idle);
                    Some(session.info.clone())
                }
                _ => None,
            }
        };
        if let Some(info) = info {
            self.schedule_save();
            self.sink.emit(ManagerEvent::SessionUpdate { info });
        }
    }

    /// Pluggable-validator hook for the Client WS Hub's manager-API-token
    /// auth path (spec §4.4).
    pub async fn has_manager_api_token(&self, token: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .values()
            .any(|s| s.manager_api_token.as_deref() == Some(token))
    }

    /// The process-wide secret manager->master HTTP calls authenticate
    /// with (spec §3 "persisted state"). Exposed read-only; the REST
    /// dispatcher that would consume it is an external collaborator.
    pub fn internal_secret(&self) -> &str {
        &self.internal_secret
    }

    fn require_link(&self, id: &SessionId) -> Result<Arc<dyn AgentLink>> {
        self.agent_links
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| OrchestratorError::conflict("agent is not connected"))
    }

    /// Agent connection dropped unexpectedly (spec §4.1 FSM: "any (not
    /// terminated) | agent disconnect | reconnecting").
    pub async fn handle_agent_disconnect(&self, id: &SessionId) {
        self.agent_links.remove(id);
        let info = {
            let mut inner = self.inner.lock().await;
            match inner.sessions.get_mut(id) {
                Some(session) if !session.info.status.is_terminal() => {
                    session.pre_disconnect_status = Some(session.info.status);
                    session.info.status = SessionStatus::Reconnecting;
                    Some(session.info.clone())
                }
                _ => None,
            }
        };
        if let Some(info) = info {
            self.schedule_save();
            self.sink.emit(ManagerEvent::SessionUpdate { info });
        }
    }

    // -----------------------------------------------------------------
    // Agent -> master dispatch (spec §4.1 "Agent->master dispatch")
    // -----------------------------------------------------------------

    pub async fn handle_agent_message(&self, id: &SessionId, msg: AgentMessage) -> Result<()> {
        // `terminated` is absorbing (spec §8): a session lingers in the map
        // for the delete grace window purely so subscribed clients can
        // observe the terminal state, and a straggling agent frame from
        // that window must not resurrect it.
        {
            let inner = self.inner.lock().await;
            match inner.sessions.get(id) {
                Some(session) if session.info.status.is_terminal() => {
                    debug!(session_id = %id, "dropping agent message for terminated session");
                    return Ok(());
                }
                None => return Err(OrchestratorError::not_found(format!("session {id} not found"))),
                _ => {}
            }
        }
        match msg {
            AgentMessage::Auth { .. } => {
                debug!(session_id = %id, "unexpected post-auth auth frame, ignoring");
                Ok(())
            }
            AgentMessage::Ready => {
                let info = {
                    let mut inner = self.inner.lock().await;
                    let session = inner
                        .sessions
                        .get_mut(id)
                        .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
                    if session.info.status == SessionStatus::Starting {
                        session.info.status = SessionStatus::Idle;
                    }
                    session.info.clone()
                };
                self.schedule_save();
                self.sink.emit(ManagerEvent::SessionUpdate { info });
                Ok(())
            }
            AgentMessage::SetupProgress { text } => {
                self.append_system_message(id, text).await
            }
            AgentMessage::SdkMessage { message } => {
                let pushed = {
                    let mut inner = self.inner.lock().await;
                    let session = inner
                        .sessions
                        .get_mut(id)
                        .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
                    session.push_message(message).clone()
                };
                self.schedule_save();
                self.sink.emit(ManagerEvent::Messages {
                    session_id: id.clone(),
                    messages: vec![pushed],
                });
                Ok(())
            }
            AgentMessage::Stream { message_id, token } => {
                self.sink.emit(ManagerEvent::Stream {
                    session_id: id.clone(),
                    message_id,
                    token,
                });
                Ok(())
            }
            AgentMessage::ApprovalRequest { id: approval_id, tool_name, tool_input, reason } => {
                let approval = PendingApproval { id: approval_id, tool_name, tool_input, reason };
                let info = {
                    let mut inner = self.inner.lock().await;
                    let session = inner
                        .sessions
                        .get_mut(id)
                        .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
                    session.info.pending_approval = Some(approval.clone());
                    session.info.status = SessionStatus::AwaitingApproval;
                    session.info.clone()
                };
                self.schedule_save();
                self.sink.emit(ManagerEvent::SessionUpdate { info });
                self.sink.emit(ManagerEvent::ApprovalRequest { session_id: id.clone(), approval });
                Ok(())
            }
            AgentMessage::Question { id: question_id, questions } => {
                let question = PendingQuestion { id: question_id, questions: questions.clone() };
                let info = {
                    let mut inner = self.inner.lock().await;
                    let session = inner
                        .sessions
                        .get_mut(id)
                        .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
                    session.info.pending_question = Some(question.clone());
                    session.info.status = SessionStatus::AwaitingAnswer;
                    session.info.clone()
                };
                self.schedule_save();
                self.sink.emit(ManagerEvent::SessionUpdate { info });
                self.sink.emit(ManagerEvent::Question { session_id: id.clone(), question });
                Ok(())
            }
            AgentMessage::Result { total_cost_usd, context_usage } => {
                let info = {
                    let mut inner = self.inner.lock().await;
                    let session = inner
                        .sessions
                        .get_mut(id)
                        .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
                    session.info.total_cost_usd = total_cost_usd;
                    session.info.last_turn_usage = context_usage.clone();
                    session.info.context_usage.input_tokens += context_usage.input_tokens;
                    session.info.context_usage.output_tokens += context_usage.output_tokens;
                    session.info.context_usage.cache_read_tokens += context_usage.cache_read_tokens;
                    session.info.context_usage.cache_creation_tokens += context_usage.cache_creation_tokens;
                    session.info.context_usage.turns += context_usage.turns;
                    session.info.context_usage.wall_duration_ms += context_usage.wall_duration_ms;
                    session.info.context_usage.api_duration_ms += context_usage.api_duration_ms;
                    session.info.status = SessionStatus::Idle;
                    session.info.clone()
                };
                self.schedule_save();
                self.sink.emit(ManagerEvent::SessionUpdate { info });
                self.sink.emit(ManagerEvent::Result { session_id: id.clone() });
                Ok(())
            }
            AgentMessage::StatusUpdate { status } => {
                let info = {
                    let mut inner = self.inner.lock().await;
                    let session = inner
                        .sessions
                        .get_mut(id)
                        .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
                    session.info.status = status;
                    session.info.clone()
                };
                self.schedule_save();
                self.sink.emit(ManagerEvent::SessionUpdate { info });
                Ok(())
            }
            AgentMessage::SessionInfoUpdate { model, permission_mode, total_cost_usd, context_usage } => {
                let info = {
                    let mut inner = self.inner.lock().await;
                    let session = inner
                        .sessions
                        .get_mut(id)
                        .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
                    if let Some(model) = model {
                        session.info.model = model;
                    }
                    if let Some(mode) = permission_mode {
                        session.info.permission_mode = mode;
                    }
                    if let Some(cost) = total_cost_usd {
                        session.info.total_cost_usd = cost;
                    }
                    if let Some(usage) = context_usage {
                        session.info.context_usage = usage;
                    }
                    session.info.clone()
                };
                self.schedule_save();
                self.sink.emit(ManagerEvent::SessionUpdate { info });
                Ok(())
            }
            AgentMessage::ModelsList { models } => {
                self.sink.emit(ManagerEvent::ModelsList { session_id: id.clone(), models });
                Ok(())
            }
            AgentMessage::Error { message } => {
                let info = {
                    let mut inner = self.inner.lock().await;
                    let session = inner
                        .sessions
                        .get_mut(id)
                        .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
                    let err_msg = SessionMessage {
                        id: 0,
                        kind: MessageKind::Error,
                        content: message,
                        tool_name: None,
                        tool_input: None,
                        timestamp: Utc::now(),
                        is_streaming: false,
                        auto_continue: None,
                    };
                    session.push_message(err_msg);
                    session.info.status = SessionStatus::Error;
                    session.info.clone()
                };
                self.schedule_save();
                self.sink.emit(ManagerEvent::SessionUpdate { info });
                Ok(())
            }
        }
    }

    async fn append_system_message(&self, id: &SessionId, text: String) -> Result<()> {
        let pushed = {
            let mut inner = self.inner.lock().await;
            let session = inner
                .sessions
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::not_found(format!("session {id} not found")))?;
            let msg = SessionMessage {
                id: 0,
                kind: MessageKind::System,
                content: text,
                tool_name: None,
                tool_input: None,
                timestamp: Utc::now(),
                is_streaming: false,
                auto_continue: None,
            };
            session.push_message(msg).clone()
        };
        self.schedule_save();
        self.sink.emit(ManagerEvent::Messages {
            session_id: id.clone(),
            messages: vec![pushed],
        });
        Ok(())
    }

    // -----------------------------------------------------------------
    // Debounced persistence (<=250ms coalesce, spec §4.1)
    // -----------------------------------------------------------------

    fn schedule_save(&self) {
        let this = self.self_arc();
        tokio::spawn(async move {
            let mut pending = this.pending_saves.lock().await;
            if pending.is_some() {
                return;
            }
            let this2 = Arc::clone(&this);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                if let Err(e) = this2.save_now().await {
                    warn!(error = %e, "debounced session snapshot save failed, will retry on next mutation");
                }
                let mut pending = this2.pending_saves.lock().await;
                *pending = None;
            });
            *pending = Some(handle);
        });
    }

    async fn save_now(&self) -> Result<()> {
        let persisted = {
            let inner = self.inner.lock().await;
            PersistedState {
                sessions: inner
                    .sessions
                    .values()
                    .map(|s| PersistedSession {
                        info: s.info.clone(),
                        messages: s.messages.clone(),
                        session_token: hex_encode(&s.session_token),
                        container_id: s.info.container_id.clone(),
                        manager_api_token: s.manager_api_token.clone(),
                        manager_state: s.info.manager_state.clone(),
                    })
                    .collect(),
                internal_secret: self.internal_secret.clone(),
            }
        };
        self.store.save(&persisted).await
    }

    #[cfg(test)]
    pub async fn flush_for_test(&self) {
        // Give the detached debounce task a chance to register itself
        // before we look for it.
        tokio::task::yield_now().await;
        let handle = {
            let mut pending = self.pending_saves.lock().await;
            pending.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_token(hex: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        if let Some(chunk) = hex.get(i * 2..i * 2 + 2) {
            *byte = u8::from_str_radix(chunk, 16).unwrap_or(0);
        }
    }
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Extracts `owner/repo` from a GitHub URL shaped `host[:/]owner/repo`
/// (spec §8 "parseOwnerRepo idempotence"). Returns `None` on non-GitHub
/// inputs.
pub fn parse_owner_repo(url: &str) -> Option<(String, String)> {
    let trimmed = url
        .trim_end_matches(".git")
        .trim_end_matches('/');
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .or_else(|| trimmed.strip_prefix("git@"))
        .unwrap_or(trimmed);
    let without_scheme = without_scheme.replacen(':', "/", 1);
    let mut parts = without_scheme.rsplitn(3, '/');
    let repo = parts.next()?;
    let owner = parts.next()?;
    let host = parts.next().unwrap_or("github.com");
    if !host.contains("github.com") {
        return None;
    }
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerStatus as CS, LabelledContainer};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeContainerProvider {
        next_id: AtomicU64,
    }

    #[async_trait::async_trait]
    impl ContainerProvider for FakeContainerProvider {
        async fn ensure_network(&self, _instance_id: &str) -> Result<()> {
            Ok(())
        }
        async fn create_and_start(&self, _spec: &SessionContainerSpec) -> Result<String> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(format!("container-{id}"))
        }
        async fn stop_and_remove(&self, _container_id: &str, _grace_secs: u32) -> Result<()> {
            Ok(())
        }
        async fn status(&self, _container_id: &str) -> Result<CS> {
            Ok(CS::Running)
        }
        async fn list_labelled(&self, _instance_id: &str) -> Result<Vec<LabelledContainer>> {
            Ok(Vec::new())
        }
    }

    struct RecordingSink {
        events: StdMutex<Vec<ManagerEvent>>,
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: ManagerEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct RecordingLink {
        sent: StdMutex<Vec<MasterMessage>>,
    }

    impl AgentLink for RecordingLink {
        fn send(&self, msg: MasterMessage) {
            self.sent.lock().unwrap().push(msg);
        }
    }

    fn test_config() -> Config {
        Config {
            port: 8080,
            internal_port: 8081,
            host: "0.0.0.0".into(),
            instance_id: "test".into(),
            master_hostname: "localhost".into(),
            session_image: "clawd/agent:latest".into(),
            network: "clawd-network-test".into(),
            session_memory_limit: 1,
            session_cpu_shares: 1,
            session_pids_limit: 1,
            max_sessions: 0,
            session_store_path: "/tmp/does-not-matter.json".into(),
            jwt_secret: "secret".into(),
            host_drive_prefix: None,
        }
    }

    async fn make_manager(max_sessions: usize) -> (Arc<SessionManager>, Arc<RecordingSink>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.max_sessions = max_sessions;
        let store = SessionStore::new(dir.path().join("sessions.json"));
        let sink = Arc::new(RecordingSink { events: StdMutex::new(Vec::new()) });
        let containers = Arc::new(FakeContainerProvider { next_id: AtomicU64::new(0) });
        let manager = SessionManager::new(config, containers, store, sink.clone(), "internal-secret".into());
        (manager, sink, dir)
    }

    #[tokio::test]
    async fn create_session_starts_container_and_transitions_to_starting() {
        let (manager, _sink, _dir) = make_manager(0).await;
        let info = manager
            .create_session(CreateSessionParams {
                name: "demo".into(),
                repo_url: "https://github.com/a/b".into(),
                branch: "main".into(),
                docker_access: false,
                manager_mode: false,
                creator: "alice".into(),
                git_user_name: None,
                git_user_email: None,
                github_token: None,
                claude_code_oauth_token: None,
                credentials_host_path: None,
            })
            .await
            .unwrap();

        assert_eq!(info.status, SessionStatus::Starting);
        assert!(info.container_id.is_some());
    }

    #[tokio::test]
    async fn create_session_rejects_bad_repo_url() {
        let (manager, _sink, _dir) = make_manager(0).await;
        let err = manager
            .create_session(CreateSessionParams {
                name: "demo".into(),
                repo_url: "not-a-url".into(),
                branch: "main".into(),
                docker_access: false,
                manager_mode: false,
                creator: "alice".into(),
                git_user_name: None,
                git_user_email: None,
                github_token: None,
                claude_code_oauth_token: None,
                credentials_host_path: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn session_cap_rejects_over_capacity() {
        let (manager, _sink, _dir) = make_manager(1).await;
        manager
            .create_session(CreateSessionParams {
                name: "one".into(),
                repo_url: "https://github.com/a/b".into(),
                branch: "main".into(),
                docker_access: false,
                manager_mode: false,
                creator: "alice".into(),
                git_user_name: None,
                git_user_email: None,
                github_token: None,
                claude_code_oauth_token: None,
                credentials_host_path: None,
            })
            .await
            .unwrap();

        let err = manager
            .create_session(CreateSessionParams {
                name: "two".into(),
                repo_url: "https://github.com/a/b".into(),
                branch: "main".into(),
                docker_access: false,
                manager_mode: false,
                creator: "alice".into(),
                git_user_name: None,
                git_user_email: None,
                github_token: None,
                claude_code_oauth_token: None,
                credentials_host_path: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn send_message_rejects_when_approval_pending() {
        let (manager, _sink, _dir) = make_manager(0).await;
        let info = manager
            .create_session(CreateSessionParams {
                name: "demo".into(),
                repo_url: "https://github.com/a/b".into(),
                branch: "main".into(),
                docker_access: false,
                manager_mode: false,
                creator: "alice".into(),
                git_user_name: None,
                git_user_email: None,
                github_token: None,
                claude_code_oauth_token: None,
                credentials_host_path: None,
            })
            .await
            .unwrap();

        manager.register_agent_connection(
            info.id.clone(),
            Arc::new(RecordingLink { sent: StdMutex::new(Vec::new()) }),
        );
        manager
            .handle_agent_message(
                &info.id,
                AgentMessage::ApprovalRequest {
                    id: "a1".into(),
                    tool_name: "Bash".into(),
                    tool_input: serde_json::json!({"cmd": "rm -rf /"}),
                    reason: None,
                },
            )
            .await
            .unwrap();

        let err = manager.send_message(&info.id, "hello".into()).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn approve_tool_use_clears_pending_and_resumes_running() {
        let (manager, _sink, _dir) = make_manager(0).await;
        let info = manager
            .create_session(CreateSessionParams {
                name: "demo".into(),
                repo_url: "https://github.com/a/b".into(),
                branch: "main".into(),
                docker_access: false,
                manager_mode: false,
                creator: "alice".into(),
                git_user_name: None,
                git_user_email: None,
                github_token: None,
                claude_code_oauth_token: None,
                credentials_host_path: None,
            })
            .await
            .unwrap();
        let link = Arc::new(RecordingLink { sent: StdMutex::new(Vec::new()) });
        manager.register_agent_connection(info.id.clone(), link.clone());
        manager
            .handle_agent_message(
                &info.id,
                AgentMessage::ApprovalRequest {
                    id: "a1".into(),
                    tool_name: "Bash".into(),
                    tool_input: serde_json::json!({"cmd": "rm -rf /"}),
                    reason: None,
                },
            )
            .await
            .unwrap();

        manager.approve_tool_use(&info.id, "a1", false, None).await.unwrap();
        let reloaded = manager.get_session(&info.id).await.unwrap();
        assert!(reloaded.pending_approval.is_none());
        assert_eq!(reloaded.status, SessionStatus::Running);
        assert_eq!(link.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn agent_disconnect_moves_to_reconnecting() {
        let (manager, _sink, _dir) = make_manager(0).await;
        let info = manager
            .create_session(CreateSessionParams {
                name: "demo".into(),
                repo_url: "https://github.com/a/b".into(),
                branch: "main".into(),
                docker_access: false,
                manager_mode: false,
                creator: "alice".into(),
                git_user_name: None,
                git_user_email: None,
                github_token: None,
                claude_code_oauth_token: None,
                credentials_host_path: None,
            })
            .await
            .unwrap();
        manager.handle_agent_disconnect(&info.id).await;
        let reloaded = manager.get_session(&info.id).await.unwrap();
        assert_eq!(reloaded.status, SessionStatus::Reconnecting);
    }

    #[tokio::test]
    async fn reconnect_restores_pre_disconnect_status_not_idle() {
        let (manager, _sink, _dir) = make_manager(0).await;
        let info = manager
            .create_session(CreateSessionParams {
                name: "demo".into(),
                repo_url: "https://github.com/a/b".into(),
                branch: "main".into(),
                docker_access: false,
                manager_mode: false,
                creator: "alice".into(),
                git_user_name: None,
                git_user_email: None,
                github_token: None,
                claude_code_oauth_token: None,
                credentials_host_path: None,
            })
            .await
            .unwrap();
        manager.register_agent_connection(
            info.id.clone(),
            Arc::new(RecordingLink { sent: StdMutex::new(Vec::new()) }),
        );
        manager
            .handle_agent_message(
                &info.id,
                AgentMessage::ApprovalRequest {
                    id: "a1".into(),
                    tool_name: "Bash".into(),
                    tool_input: serde_json::json!({"cmd": "rm -rf /"}),
                    reason: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            manager.get_session(&info.id).await.unwrap().status,
            SessionStatus::AwaitingApproval
        );

        manager.handle_agent_disconnect(&info.id).await;
        assert_eq!(
            manager.get_session(&info.id).await.unwrap().status,
            SessionStatus::Reconnecting
        );

        manager.handle_agent_authenticated(&info.id).await;
        let restored = manager.get_session(&info.id).await.unwrap();
        assert_eq!(restored.status, SessionStatus::AwaitingApproval);
        assert!(restored.pending_approval.is_some());
    }

    #[tokio::test]
    async fn manager_mode_session_issues_verifiable_api_token() {
        let (manager, _sink, _dir) = make_manager(0).await;
        let info = manager
            .create_session(CreateSessionParams {
                name: "orchestrator".into(),
                repo_url: "https://github.com/a/b".into(),
                branch: "main".into(),
                docker_access: false,
                manager_mode: true,
                creator: "alice".into(),
                git_user_name: None,
                git_user_email: None,
                github_token: None,
                claude_code_oauth_token: None,
                credentials_host_path: None,
            })
            .await
            .unwrap();
        assert!(info.manager_state.is_some());
        assert!(!manager.has_manager_api_token("bogus").await);
    }

    #[test]
    fn parse_owner_repo_handles_https_and_ssh() {
        assert_eq!(
            parse_owner_repo("https://github.com/a/b"),
            Some(("a".to_string(), "b".to_string()))
        );
        assert_eq!(
            parse_owner_repo("git@github.com:a/b.git"),
            Some(("a".to_string(), "b".to_string()))
        );
        assert_eq!(parse_owner_repo("https://gitlab.com/a/b"), None);
    }

    proptest! {
        /// Invariant: re-parsing the canonical URL built from a parse
        /// result always yields the same (owner, repo) pair.
        #[test]
        fn parse_owner_repo_is_idempotent(
            owner in "[a-zA-Z0-9_-]{1,20}",
            repo in "[a-zA-Z0-9_-]{1,20}",
        ) {
            let url = format!("https://github.com/{owner}/{repo}");
            let first = parse_owner_repo(&url);
            prop_assert!(first.is_some());
            let (owner, repo) = first.clone().unwrap();
            let canonical = format!("https://github.com/{owner}/{repo}");
            let second = parse_owner_repo(&canonical);
            prop_assert_eq!(first, second);
        }

        /// Invariant: a non-GitHub host is always rejected, regardless of
        /// otherwise-valid owner/repo segments.
        #[test]
        fn parse_owner_repo_rejects_non_github_hosts(
            host in "[a-z]{3,10}\\.com",
            owner in "[a-zA-Z0-9_-]{1,20}",
            repo in "[a-zA-Z0-9_-]{1,20}",
        ) {
            prop_assume!(!host.contains("github.com"));
            let url = format!("https://{host}/{owner}/{repo}");
            prop_assert_eq!(parse_owner_repo(&url), None);
        }
    }

    #[tokio::test]
    async fn terminated_session_ignores_straggling_agent_messages() {
        let (manager, _sink, _dir) = make_manager(0).await;
        let info = manager
            .create_session(CreateSessionParams {
                name: "demo".into(),
                repo_url: "https://github.com/a/b".into(),
                branch: "main".into(),
                docker_access: false,
                manager_mode: false,
                creator: "alice".into(),
                git_user_name: None,
                git_user_email: None,
                github_token: None,
                claude_code_oauth_token: None,
                credentials_host_path: None,
            })
            .await
            .unwrap();

        manager.delete_session(&info.id).await.unwrap();
        let before = manager.get_session(&info.id).await.unwrap();
        assert_eq!(before.status, SessionStatus::Terminated);

        // A frame from an agent whose teardown raced the delete must not
        // resurrect the session (spec §8: "status == terminated is
        // absorbing").
        manager
            .handle_agent_message(
                &info.id,
                AgentMessage::Result { total_cost_usd: 1.0, context_usage: Default::default() },
            )
            .await
            .unwrap();

        let after = manager.get_session(&info.id).await.unwrap();
        assert_eq!(after.status, SessionStatus::Terminated);
        assert_eq!(after.total_cost_usd, 0.0);
    }

    #[tokio::test]
    async fn terminated_session_rejects_settings_updates() {
        let (manager, _sink, _dir) = make_manager(0).await;
        let info = manager
            .create_session(CreateSessionParams {
                name: "demo".into(),
                repo_url: "https://github.com/a/b".into(),
                branch: "main".into(),
                docker_access: false,
                manager_mode: false,
                creator: "alice".into(),
                git_user_name: None,
                git_user_email: None,
                github_token: None,
                claude_code_oauth_token: None,
                credentials_host_path: None,
            })
            .await
            .unwrap();

        manager.delete_session(&info.id).await.unwrap();
        let err = manager
            .update_session_settings(&info.id, Some("renamed".into()), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
        let after = manager.get_session(&info.id).await.unwrap();
        assert_eq!(after.name, "demo");
    }
}
