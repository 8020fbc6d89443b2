//! Process configuration, loaded once at startup and injected into the
//! Session Manager, Container Manager, and both WS hubs (spec §9: "single
//! global secret & config should be an injected value at construction, not
//! a process-wide singleton"). Layered over environment variables with the
//! `config` crate, the way ccswarm depends on it for its own settings
//! layering.

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    /// Port the Internal WS Hub's raw `tokio-tungstenite` listener binds to
    /// (addition: the distilled spec's knob list has only `CLAWD_PORT`, but
    /// the internal and client hubs use two different WebSocket stacks —
    /// see SPEC_FULL.md §6.1 — so they need separate listeners). Defaults
    /// to `port + 1`; overridable with `CLAWD_INTERNAL_PORT`.
    pub internal_port: u16,
    pub host: String,
    pub instance_id: String,
    pub master_hostname: String,
    pub session_image: String,
    pub network: String,
    pub session_memory_limit: i64,
    pub session_cpu_shares: i64,
    pub session_pids_limit: i64,
    pub max_sessions: usize,
    pub session_store_path: String,
    pub jwt_secret: String,
    pub host_drive_prefix: Option<String>,
}

impl Config {
    /// Builds a `config::Config` layered over `CLAWD_*`/`SESSION_*`
    /// environment variables with defaults, then deserializes into this
    /// struct. A process never reads these env vars again after this call.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("port", 8080)?
            .set_default("internal_port", 0)?
            .set_default("host", "0.0.0.0")?
            .set_default("instance_id", "default")?
            .set_default("master_hostname", "localhost")?
            .set_default("session_image", "clawd/agent:latest")?
            .set_default("network", "clawd-network-default")?
            .set_default("session_memory_limit", 4_i64 * 1024 * 1024 * 1024)?
            .set_default("session_cpu_shares", 512)?
            .set_default("session_pids_limit", 256)?
            .set_default("max_sessions", 0)?
            .set_default("session_store_path", "./session-store.json")?
            .set_default("jwt_secret", "")?
            .add_source(
                config::Environment::default()
                    .prefix("CLAWD")
                    .try_parsing(true)
                    .separator("_"),
            );

        // A handful of knobs (spec §6) don't follow the `CLAWD_` prefix
        // convention (`SESSION_MEMORY_LIMIT`, `MAX_SESSIONS`, `JWT_SECRET`,
        // `HOST_DRIVE_PREFIX`); map them onto field names explicitly.
        for (env_name, field) in Self::LEGACY_ENV_FIELDS {
            if let Ok(value) = std::env::var(env_name) {
                builder = builder
                    .set_override(*field, value)
                    .map_err(|e| OrchestratorError::internal_with_source("failed to apply override", e))?;
            }
        }

        let built = builder
            .build()
            .map_err(|e| OrchestratorError::internal_with_source("failed to build configuration", e))?;

        let mut config: Config = built
            .try_deserialize()
            .map_err(|e| OrchestratorError::internal_with_source("failed to deserialize configuration", e))?;
        if config.internal_port == 0 {
            config.internal_port = config.port + 1;
        }
        Ok(config)
    }

    const LEGACY_ENV_FIELDS: &'static [(&'static str, &'static str)] = &[
        ("SESSION_MEMORY_LIMIT", "session_memory_limit"),
        ("SESSION_CPU_SHARES", "session_cpu_shares"),
        ("SESSION_PIDS_LIMIT", "session_pids_limit"),
        ("MAX_SESSIONS", "max_sessions"),
        ("SESSION_STORE_PATH", "session_store_path"),
        ("JWT_SECRET", "jwt_secret"),
        ("HOST_DRIVE_PREFIX", "host_drive_prefix"),
    ];
}
