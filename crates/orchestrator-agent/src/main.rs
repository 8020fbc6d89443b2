//! `clawd-agent`: the in-container peer of the Internal WS Hub (spec
//! §4.5). Authenticates over a reconnecting WebSocket, bridges
//! `user_message` frames into a bounded prompt queue, and drives a
//! pluggable `AgentBackend` — a real build wires in the LLM SDK loop, this
//! binary ships the deterministic `EchoBackend` double since that loop is
//! an external collaborator (spec §1 non-goals).

mod backend;
mod bridge;
mod config;
mod error;
mod link;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use orchestrator_core::wire::MasterMessage;

use backend::{AgentBackend, EchoBackend, Outbox};
use bridge::bounded_prompt_queue;
use config::AgentConfig;
use link::{AgentLink, MasterMessageHandler};

const PROMPT_QUEUE_CAPACITY: usize = 64;

struct Router {
    tx: mpsc::UnboundedSender<MasterMessage>,
}

impl MasterMessageHandler for Router {
    fn handle(&self, msg: MasterMessage) {
        let _ = self.tx.send(msg);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AgentConfig::from_env()?;
    info!(session_id = %config.session_id, repo = %config.git_repo_url, "clawd-agent starting");

    let link = AgentLink::new(config.master_ws_url.clone(), config.session_id.clone(), config.session_token.clone());
    let outbox = Outbox::new(link.clone());
    let backend: Arc<dyn AgentBackend> = Arc::new(EchoBackend::default());

    let (prompt_sink, prompt_stream) = bounded_prompt_queue(PROMPT_QUEUE_CAPACITY);
    let (router_tx, mut router_rx) = mpsc::unbounded_channel::<MasterMessage>();
    let router = Arc::new(Router { tx: router_tx });

    // Single consumer preserves the order the master sent frames in,
    // mirroring the per-session ordering guarantee the master side relies
    // on (spec §5 "Per-session event ordering").
    let dispatch_task = {
        let backend = backend.clone();
        let outbox = outbox.clone();
        let link = link.clone();
        tokio::spawn(async move {
            while let Some(msg) = router_rx.recv().await {
                match msg {
                    MasterMessage::AuthOk => {}
                    MasterMessage::UserMessage { content } => prompt_sink.push(content).await,
                    MasterMessage::ApprovalResponse { approval_id, allow, message } => {
                        backend.approval_response(approval_id, allow, message).await
                    }
                    MasterMessage::QuestionResponse { question_id, answers } => {
                        backend.question_response(question_id, answers).await
                    }
                    MasterMessage::Interrupt => backend.interrupt(&outbox).await,
                    MasterMessage::UpdateSettings { permission_mode } => {
                        if let Some(mode) = permission_mode {
                            backend.update_permission_mode(mode).await;
                        }
                    }
                    MasterMessage::SetModel { model } => backend.set_model(model, &outbox).await,
                    MasterMessage::GetModels => backend.get_models(&outbox).await,
                    MasterMessage::TokenUpdate { token } => link.update_token(token),
                }
            }
        })
    };

    let backend_task = {
        let backend = backend.clone();
        let outbox = outbox.clone();
        tokio::spawn(async move { backend.run(outbox, prompt_stream).await })
    };

    let link_for_signal = link.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, closing agent link");
        link_for_signal.shutdown();
    });

    link.run(router).await?;
    dispatch_task.abort();
    backend_task.abort();
    Ok(())
}
