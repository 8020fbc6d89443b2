//! Reads this process's own launch configuration: the non-secret env vars
//! the Container Manager set (SPEC_FULL.md §4.2, original spec §4.2
//! "Environment and secrets policy") plus the secret files it bind-mounted
//! under `/run/secrets/...`. No secret ever arrives through the
//! environment — that split is enforced on the server side by
//! `SessionContainerSpec`, and this side simply mirrors it by never reading
//! a `std::env::var` for anything named in `SECRET_FILES`.

use std::path::{Path, PathBuf};

use orchestrator_core::model::PermissionMode;

use crate::error::{AgentError, Result};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub session_id: String,
    pub permission_mode: PermissionMode,
    pub git_repo_url: String,
    pub git_branch: String,
    pub anthropic_model: String,
    pub git_user_name: Option<String>,
    pub git_user_email: Option<String>,
    pub manager_mode: bool,
    pub master_http_url: Option<String>,

    pub session_token: String,
    pub master_ws_url: String,
    pub github_token: Option<String>,
    pub claude_code_oauth_token: Option<String>,
    pub manager_api_token: Option<String>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::load(Path::new("/run/secrets"))
    }

    /// Split out for tests: `secrets_dir` stands in for `/run/secrets`.
    pub fn load(secrets_dir: &Path) -> Result<Self> {
        let session_id = require_env("SESSION_ID")?;
        let permission_mode = match std::env::var("PERMISSION_MODE").as_deref() {
            Ok("auto_edits") => PermissionMode::AutoEdits,
            Ok("dangerous") => PermissionMode::Dangerous,
            Ok("plan") => PermissionMode::Plan,
            _ => PermissionMode::Normal,
        };
        let manager_mode = std::env::var("MANAGER_MODE").as_deref() == Ok("true");

        Ok(Self {
            session_id,
            permission_mode,
            git_repo_url: require_env("GIT_REPO_URL")?,
            git_branch: require_env("GIT_BRANCH")?,
            anthropic_model: std::env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| "opus".to_string()),
            git_user_name: std::env::var("GIT_USER_NAME").ok(),
            git_user_email: std::env::var("GIT_USER_EMAIL").ok(),
            manager_mode,
            master_http_url: std::env::var("MASTER_HTTP_URL").ok(),

            session_token: read_secret_required(secrets_dir, "session_token")?,
            master_ws_url: read_secret_required(secrets_dir, "master_ws_url")?,
            github_token: read_secret_optional(secrets_dir, "github_token"),
            claude_code_oauth_token: read_secret_optional(secrets_dir, "claude_code_oauth_token"),
            manager_api_token: read_secret_optional(secrets_dir, "manager_api_token"),
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| AgentError::config(format!("missing required env var {name}")))
}

fn read_secret_required(dir: &Path, name: &str) -> Result<String> {
    read_secret_optional(dir, name)
        .ok_or_else(|| AgentError::config(format!("missing required secret file {name}")))
}

fn read_secret_optional(dir: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(secret_path(dir, name))
        .ok()
        .map(|s| s.trim().to_string())
}

fn secret_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_reads_required_secrets_and_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("session_token"), "deadbeef\n").unwrap();
        std::fs::write(dir.path().join("master_ws_url"), "ws://master/internal/session").unwrap();

        std::env::set_var("SESSION_ID", "s1");
        std::env::set_var("GIT_REPO_URL", "https://github.com/a/b");
        std::env::set_var("GIT_BRANCH", "main");
        std::env::remove_var("PERMISSION_MODE");
        std::env::remove_var("MANAGER_MODE");
        std::env::remove_var("GIT_USER_NAME");

        let config = AgentConfig::load(dir.path()).unwrap();
        assert_eq!(config.session_id, "s1");
        assert_eq!(config.session_token, "deadbeef");
        assert_eq!(config.master_ws_url, "ws://master/internal/session");
        assert!(matches!(config.permission_mode, PermissionMode::Normal));
        assert!(!config.manager_mode);
        assert!(config.github_token.is_none());
    }

    #[test]
    fn load_fails_without_session_token_secret() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("master_ws_url"), "ws://master/internal/session").unwrap();
        std::env::set_var("SESSION_ID", "s1");
        std::env::set_var("GIT_REPO_URL", "https://github.com/a/b");
        std::env::set_var("GIT_BRANCH", "main");

        assert!(AgentConfig::load(dir.path()).is_err());
    }
}
