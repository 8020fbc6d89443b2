//! Wire protocol types shared by the server and the in-container agent
//! binary, so both sides depend on one source of truth for frame shapes
//! (spec §6). Tagged enums with `#[serde(tag = "type")]`, generalized from
//! the single-session `ClientMessage`/`ServerMessage` split in codey-server's
//! `protocol.rs` to this spec's multi-session, approval/question-gated
//! protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ContextUsage, PendingQuestion, PermissionMode, SessionMessage, SessionStatus};

// ---------------------------------------------------------------------
// Internal protocol: agent (in-container) <-> master (this server)
// ---------------------------------------------------------------------

/// Frames sent by the in-container agent to the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentMessage {
    Auth {
        session_id: String,
        token: String,
    },
    Ready,
    SetupProgress {
        text: String,
    },
    SdkMessage {
        message: SessionMessage,
    },
    Stream {
        message_id: u64,
        token: String,
    },
    ApprovalRequest {
        id: String,
        tool_name: String,
        tool_input: Value,
        reason: Option<String>,
    },
    Question {
        id: String,
        questions: Vec<crate::model::QuestionBlock>,
    },
    Result {
        total_cost_usd: f64,
        context_usage: ContextUsage,
    },
    StatusUpdate {
        status: SessionStatus,
    },
    SessionInfoUpdate {
        model: Option<String>,
        permission_mode: Option<PermissionMode>,
        total_cost_usd: Option<f64>,
        context_usage: Option<ContextUsage>,
    },
    ModelsList {
        models: Vec<String>,
    },
    Error {
        message: String,
    },
}

/// Frames sent by the master down to the in-container agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum MasterMessage {
    AuthOk,
    UserMessage {
        content: String,
    },
    ApprovalResponse {
        approval_id: String,
        allow: bool,
        message: Option<String>,
    },
    QuestionResponse {
        question_id: String,
        answers: Vec<String>,
    },
    Interrupt,
    UpdateSettings {
        permission_mode: Option<PermissionMode>,
    },
    SetModel {
        model: String,
    },
    GetModels,
    TokenUpdate {
        token: String,
    },
}

// ---------------------------------------------------------------------
// Client protocol: authenticated user <-> this server
// ---------------------------------------------------------------------

/// Frames sent by an authenticated client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Auth {
        token: String,
    },
    Subscribe {
        session_id: String,
    },
    Unsubscribe {
        session_id: String,
    },
    SendPrompt {
        session_id: String,
        content: String,
    },
    ApproveTool {
        session_id: String,
        approval_id: String,
        allow: bool,
        message: Option<String>,
    },
    AnswerQuestion {
        session_id: String,
        question_id: String,
        answers: Vec<String>,
    },
    Interrupt {
        session_id: String,
    },
    UpdateSettings {
        session_id: String,
        name: Option<String>,
        permission_mode: Option<PermissionMode>,
        notifications_enabled: Option<bool>,
    },
    SetModel {
        session_id: String,
        model: String,
    },
    GetModels {
        session_id: String,
    },
}

/// Events broadcast (or unicast, for auth frames) to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    AuthOk,
    AuthError {
        message: String,
    },
    AuthAlert {
        status: AuthAlertStatus,
        message: String,
    },
    SessionUpdate {
        session: crate::model::SessionInfo,
    },
    Messages {
        session_id: String,
        messages: Vec<SessionMessage>,
    },
    Stream {
        session_id: String,
        message_id: u64,
        token: String,
    },
    ApprovalRequest {
        session_id: String,
        approval: crate::model::PendingApproval,
    },
    Question {
        session_id: String,
        question: PendingQuestion,
    },
    Result {
        session_id: String,
    },
    ModelsList {
        session_id: String,
        models: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthAlertStatus {
    Refreshed,
    RefreshFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_tag_roundtrip() {
        let json = r#"{"type":"subscribe","sessionId":"s1"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Subscribe { session_id } => assert_eq!(session_id, "s1"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn agent_auth_frame_parses() {
        let json = r#"{"type":"auth","sessionId":"s1","token":"deadbeef"}"#;
        let msg: AgentMessage = serde_json::from_str(json).unwrap();
        matches!(msg, AgentMessage::Auth { .. });
    }

    #[test]
    fn server_event_serializes_with_tag() {
        let event = ServerEvent::AuthOk;
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"auth_ok"}"#);
    }
}
