//! The in-container agent's own LLM SDK loop is an external collaborator
//! (original spec §1 "Out of scope"); this crate drives a pluggable
//! `AgentBackend` trait at the seam where that loop would plug in, plus a
//! deterministic test double standing in for it (SPEC_FULL.md §9
//! Non-goals). The trait shape mirrors the dispatch table the Session
//! Manager implements on the master side (spec §4.1 "Agent->master
//! dispatch"), just from the opposite end of the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::oneshot;

use orchestrator_core::model::{ContextUsage, MessageKind, PermissionMode, SessionMessage};
use orchestrator_core::wire::AgentMessage;

use crate::bridge::PromptStream;
use crate::link::AgentLink;

/// Thin wrapper over `AgentLink::send` so backends depend on a narrow,
/// mockable surface rather than the whole reconnecting client.
#[derive(Clone)]
pub struct Outbox {
    link: std::sync::Arc<AgentLink>,
}

impl Outbox {
    pub fn new(link: std::sync::Arc<AgentLink>) -> Self {
        Self { link }
    }

    pub fn send(&self, msg: AgentMessage) {
        self.link.send(msg);
    }
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Drives the turn loop: pulls prompts off `prompts` until the stream
    /// closes, emitting `AgentMessage` frames through `outbox` as it goes.
    /// Sends `Ready` once at the very start (spec §4.1 FSM `starting ->
    /// idle` on the agent's `ready` frame).
    async fn run(&self, outbox: Outbox, prompts: PromptStream);

    /// `updateSessionSettings` forwards `permissionMode` because it's
    /// agent-observable (spec §4.1); other settings fields are master-only
    /// bookkeeping and never reach the backend.
    async fn update_permission_mode(&self, mode: PermissionMode);

    async fn set_model(&self, model: String, outbox: &Outbox);

    async fn get_models(&self, outbox: &Outbox);

    async fn interrupt(&self, outbox: &Outbox);

    async fn approval_response(&self, approval_id: String, allow: bool, message: Option<String>);

    async fn question_response(&self, question_id: String, answers: Vec<String>);
}

/// Deterministic stand-in for a real LLM SDK loop. Echoes each prompt back
/// as an assistant message and reports a `result`; a prompt containing the
/// literal substring `"approve:"` instead raises an `approval_request` and
/// blocks the turn on `approval_response` before echoing, so tests can
/// exercise the awaiting_approval path end-to-end without a real model.
pub struct EchoBackend {
    permission_mode: StdMutex<PermissionMode>,
    model: StdMutex<String>,
    interrupted: AtomicBool,
    next_approval_id: AtomicU64,
    pending_approvals: StdMutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self {
            permission_mode: StdMutex::new(PermissionMode::Normal),
            model: StdMutex::new("opus".to_string()),
            interrupted: AtomicBool::new(false),
            next_approval_id: AtomicU64::new(0),
            pending_approvals: StdMutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AgentBackend for EchoBackend {
    async fn run(&self, outbox: Outbox, mut prompts: PromptStream) {
        outbox.send(AgentMessage::Ready);

        while let Some(content) = prompts.next().await {
            self.interrupted.store(false, Ordering::SeqCst);

            if let Some(rest) = content.strip_prefix("approve:") {
                let approval_id = self.next_approval_id.fetch_add(1, Ordering::SeqCst).to_string();
                let (tx, rx) = oneshot::channel();
                self.pending_approvals.lock().unwrap().insert(approval_id.clone(), tx);
                outbox.send(AgentMessage::ApprovalRequest {
                    id: approval_id,
                    tool_name: "Bash".to_string(),
                    tool_input: serde_json::json!({ "cmd": rest.trim() }),
                    reason: None,
                });
                let allowed = rx.await.unwrap_or(false);
                if !allowed {
                    outbox.send(AgentMessage::Result {
                        total_cost_usd: 0.0,
                        context_usage: ContextUsage::default(),
                    });
                    continue;
                }
            }

            if self.interrupted.load(Ordering::SeqCst) {
                outbox.send(AgentMessage::Result {
                    total_cost_usd: 0.0,
                    context_usage: ContextUsage::default(),
                });
                continue;
            }

            outbox.send(AgentMessage::SdkMessage {
                message: SessionMessage {
                    id: 0,
                    kind: MessageKind::Assistant,
                    content: format!("echo: {content}"),
                    tool_name: None,
                    tool_input: None,
                    timestamp: chrono::Utc::now(),
                    is_streaming: false,
                    auto_continue: None,
                },
            });
            outbox.send(AgentMessage::Result {
                total_cost_usd: 0.0001,
                context_usage: ContextUsage {
                    input_tokens: content.len() as u64,
                    output_tokens: 8,
                    turns: 1,
                    ..Default::default()
                },
            });
        }
    }

    async fn update_permission_mode(&self, mode: PermissionMode) {
        *self.permission_mode.lock().unwrap() = mode;
    }

    async fn set_model(&self, model: String, _outbox: &Outbox) {
        *self.model.lock().unwrap() = model;
    }

    async fn get_models(&self, outbox: &Outbox) {
        outbox.send(AgentMessage::ModelsList {
            models: vec!["opus".to_string(), "sonnet".to_string(), "haiku".to_string()],
        });
    }

    async fn interrupt(&self, _outbox: &Outbox) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    async fn approval_response(&self, approval_id: String, allow: bool, _message: Option<String>) {
        if let Some(tx) = self.pending_approvals.lock().unwrap().remove(&approval_id) {
            let _ = tx.send(allow);
        }
    }

    async fn question_response(&self, _question_id: String, _answers: Vec<String>) {
        // EchoBackend never raises a question; nothing to resolve.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::bounded_prompt_queue;
    use crate::link::AgentLink;

    fn test_outbox() -> (Outbox, std::sync::Arc<AgentLink>) {
        let link = AgentLink::new("ws://unused".into(), "s1".into(), "tok".into());
        (Outbox::new(link.clone()), link)
    }

    #[tokio::test]
    async fn echoes_each_prompt_and_emits_result() {
        let (outbox, _link) = test_outbox();
        let backend = EchoBackend::default();
        let (sink, stream) = bounded_prompt_queue(4);

        sink.push("hello".to_string()).await;
        drop(sink);
        backend.run(outbox, stream).await;
    }

    #[tokio::test]
    async fn approval_gated_prompt_waits_for_response() {
        let backend = std::sync::Arc::new(EchoBackend::default());
        let (outbox, _link) = test_outbox();
        let (sink, stream) = bounded_prompt_queue(4);

        sink.push("approve:rm -rf /".to_string()).await;
        drop(sink);

        let backend2 = backend.clone();
        let handle = tokio::spawn(async move { backend2.run(outbox, stream).await });

        // give the run loop a chance to register the pending approval
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        backend.approval_response("0".to_string(), false, None).await;

        handle.await.unwrap();
    }
}
