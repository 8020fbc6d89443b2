//! Core data model: sessions, messages, pending approvals/questions, and
//! the manager-mode state that a session orchestrating child sessions
//! carries. See spec §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type SessionId = String;

/// Lifecycle states of a session's finite state machine (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Idle,
    Running,
    AwaitingApproval,
    AwaitingAnswer,
    Reconnecting,
    Error,
    Terminated,
}

impl SessionStatus {
    /// Invariant 1: containerId is non-null iff status is one of these.
    pub fn implies_container(self) -> bool {
        matches!(
            self,
            Self::Starting
                | Self::Idle
                | Self::Running
                | Self::AwaitingApproval
                | Self::AwaitingAnswer
                | Self::Reconnecting
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    Normal,
    AutoEdits,
    Dangerous,
    Plan,
}

impl Default for PermissionMode {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    ToolCall,
    ToolResult,
    System,
    Error,
}

/// Cumulative / last-turn token and duration accounting (spec §3, §3.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub max_output_tokens: u64,
    pub turns: u64,
    pub wall_duration_ms: u64,
    pub api_duration_ms: u64,
}

/// A single entry in a session's append-only message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub id: u64,
    pub kind: MessageKind,
    pub content: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub is_streaming: bool,
    /// Opaque metadata threaded through by child sessions created under a
    /// manager session (spec §9 open question (b)); never interpreted here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_continue: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionOption {
    pub label: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionBlock {
    pub question: String,
    pub header: Option<String>,
    pub options: Vec<QuestionOption>,
    pub multi_select: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuestion {
    pub id: String,
    pub questions: Vec<QuestionBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerStep {
    Idle,
    Exploring,
    Triaging,
    Planning,
    Reviewing,
    Fixing,
    Testing,
    Merging,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerPreferences {
    pub focus: Option<String>,
    pub skip_exploration: bool,
    pub require_plan_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerState {
    pub target_branch: String,
    pub step: ManagerStep,
    pub child_session_ids: Vec<SessionId>,
    pub preferences: ManagerPreferences,
    pub paused: bool,
    pub resume_at: Option<DateTime<Utc>>,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            target_branch: String::new(),
            step: ManagerStep::Idle,
            child_session_ids: Vec::new(),
            preferences: ManagerPreferences::default(),
            paused: false,
            resume_at: None,
        }
    }
}

/// Read-only view of a session, safe to hand to clients (no token, no
/// messages). Returned by `list_sessions` / embedded in `session_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub creator: String,
    pub repo_url: String,
    pub branch: String,
    pub docker_access: bool,
    pub is_manager: bool,
    pub permission_mode: PermissionMode,
    pub model: String,
    pub notifications_enabled: bool,
    pub container_id: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_preview: Option<String>,
    pub total_cost_usd: f64,
    pub context_usage: ContextUsage,
    pub last_turn_usage: ContextUsage,
    pub pending_approval: Option<PendingApproval>,
    pub pending_question: Option<PendingQuestion>,
    pub manager_state: Option<ManagerState>,
}

pub const MESSAGE_PREVIEW_MAX_LEN: usize = 160;

pub fn preview(content: &str) -> String {
    if content.chars().count() <= MESSAGE_PREVIEW_MAX_LEN {
        content.to_string()
    } else {
        content.chars().take(MESSAGE_PREVIEW_MAX_LEN).collect()
    }
}

/// Full session state as held in memory by the Session Manager. Never
/// serialized directly to clients; `sessionToken` and the message log are
/// stripped or projected before leaving the process (invariant 5).
#[derive(Debug, Clone)]
pub struct Session {
    pub info: SessionInfo,
    pub session_token: [u8; 32],
    pub messages: Vec<SessionMessage>,
    pub next_message_id: u64,
    pub manager_api_token: Option<String>,
    /// Status recorded when the agent link dropped, so a reconnecting agent
    /// that re-authenticates can have its prior state restored rather than
    /// collapsing to idle (spec §4.1 FSM, §9 open question (a): resolved as
    /// "restore" in DESIGN.md). `None` outside a reconnect window.
    pub pre_disconnect_status: Option<SessionStatus>,
}

impl Session {
    pub fn push_message(&mut self, mut msg: SessionMessage) -> &SessionMessage {
        msg.id = self.next_message_id;
        self.next_message_id += 1;
        self.info.last_message_at = Some(msg.timestamp);
        self.info.last_message_preview = Some(preview(&msg.content));
        self.messages.push(msg);
        self.messages.last().expect("just pushed")
    }
}
