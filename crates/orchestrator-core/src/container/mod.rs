//! Container lifecycle management for session workloads (spec §4.2).
//!
//! Generalizes the `ContainerProvider` trait and Docker implementation from
//! the teacher's container module (originally written for per-agent-role
//! containers) to this spec's per-session containers: one container per
//! session, labelled for reconciliation across restarts, with a strict
//! secrets-never-in-env policy.

pub mod docker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::model::SessionId;

/// The stable label contract used for reconciliation across restarts
/// (spec §4.2, §6).
pub const LABEL_SESSION: &str = "clawd.session";
pub const LABEL_SESSION_ID: &str = "clawd.session.id";
pub const LABEL_INSTANCE: &str = "clawd.instance";

pub fn container_name(instance_id: &str, session_id: &SessionId) -> String {
    format!("clawd-session-{instance_id}-{session_id}")
}

pub fn network_name(instance_id: &str) -> String {
    format!("clawd-network-{instance_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    NotFound,
}

/// Non-secret configuration handed to the container on creation. Secret
/// values (`SESSION_TOKEN`, `MASTER_WS_URL`, `GITHUB_TOKEN`,
/// `CLAUDE_CODE_OAUTH_TOKEN`, `MANAGER_API_TOKEN`) are deliberately **not**
/// fields here — they travel through `SecretFile` mounts instead, so it is
/// structurally impossible to accidentally pass one as an env var.
#[derive(Debug, Clone)]
pub struct SessionContainerSpec {
    pub session_id: SessionId,
    pub instance_id: String,
    pub image: String,
    pub permission_mode: String,
    pub git_repo_url: String,
    pub git_branch: String,
    pub git_user_name: Option<String>,
    pub git_user_email: Option<String>,
    pub docker_access: bool,
    pub is_manager: bool,
    pub master_http_url: Option<String>,
    pub anthropic_model: String,
    pub credentials_host_path: Option<String>,
    pub secrets: SessionSecrets,
    pub resources: ResourceLimits,
}

/// Secret values bind-mounted read-only under `/run/secrets/...` rather than
/// passed as environment variables. See spec §4.2 "Environment and secrets
/// policy" — this is an auditable invariant enforced by construction.
#[derive(Debug, Clone)]
pub struct SessionSecrets {
    pub session_token: String,
    pub master_ws_url: String,
    pub github_token: Option<String>,
    pub claude_code_oauth_token: Option<String>,
    pub manager_api_token: Option<String>,
}

impl SessionSecrets {
    /// The `(filename, contents)` pairs written under `/run/secrets/`.
    /// Order is stable so tests can assert on it.
    pub fn files(&self) -> Vec<(&'static str, String)> {
        let mut files = vec![
            ("session_token", self.session_token.clone()),
            ("master_ws_url", self.master_ws_url.clone()),
        ];
        if let Some(v) = &self.github_token {
            files.push(("github_token", v.clone()));
        }
        if let Some(v) = &self.claude_code_oauth_token {
            files.push(("claude_code_oauth_token", v.clone()));
        }
        if let Some(v) = &self.manager_api_token {
            files.push(("manager_api_token", v.clone()));
        }
        files
    }
}

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub pids_limit: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 4 * 1024 * 1024 * 1024, // 4 GiB
            cpu_shares: 512,
            pids_limit: 256,
        }
    }
}

impl SessionContainerSpec {
    /// Non-secret environment variables, per spec §4.2. No secret name or
    /// value ever appears here.
    pub fn env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("SESSION_ID".into(), self.session_id.clone());
        env.insert("PERMISSION_MODE".into(), self.permission_mode.clone());
        env.insert("GIT_REPO_URL".into(), self.git_repo_url.clone());
        env.insert("GIT_BRANCH".into(), self.git_branch.clone());
        env.insert("ANTHROPIC_MODEL".into(), self.anthropic_model.clone());
        if let Some(name) = &self.git_user_name {
            env.insert("GIT_USER_NAME".into(), name.clone());
        }
        if let Some(email) = &self.git_user_email {
            env.insert("GIT_USER_EMAIL".into(), email.clone());
        }
        if self.docker_access {
            env.insert("DOCKER_HOST".into(), "unix:///var/run/docker.sock".into());
        }
        if self.is_manager {
            env.insert("MANAGER_MODE".into(), "true".into());
            if let Some(url) = &self.master_http_url {
                env.insert("MASTER_HTTP_URL".into(), url.clone());
            }
        }
        env
    }

    pub fn labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(LABEL_SESSION.to_string(), "true".to_string());
        labels.insert(LABEL_SESSION_ID.to_string(), self.session_id.clone());
        labels.insert(LABEL_INSTANCE.to_string(), self.instance_id.clone());
        labels
    }

    pub fn name(&self) -> String {
        container_name(&self.instance_id, &self.session_id)
    }
}

/// Container driver abstraction, implemented by `docker::DockerContainerProvider`.
/// Kept as a trait (rather than calling bollard directly from the Session
/// Manager) so tests can substitute an in-memory fake.
#[async_trait]
pub trait ContainerProvider: Send + Sync {
    async fn ensure_network(&self, instance_id: &str) -> Result<()>;

    async fn create_and_start(&self, spec: &SessionContainerSpec) -> Result<String>;

    /// Stop with `grace` timeout, then force-remove.
    async fn stop_and_remove(&self, container_id: &str, grace_secs: u32) -> Result<()>;

    async fn status(&self, container_id: &str) -> Result<ContainerStatus>;

    /// List containers carrying `clawd.session=true clawd.instance=<id>`.
    async fn list_labelled(&self, instance_id: &str) -> Result<Vec<LabelledContainer>>;
}

#[derive(Debug, Clone)]
pub struct LabelledContainer {
    pub id: String,
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContainerConfigKnobs {
    pub memory_limit_bytes: Option<i64>,
    pub cpu_shares: Option<i64>,
    pub pids_limit: Option<i64>,
}
