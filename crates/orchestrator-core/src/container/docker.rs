//! Docker container provider implementation.
//!
//! Implements [`ContainerProvider`] via the Docker API using `bollard`,
//! grounded on the teacher's `container/docker.rs` (same multi-socket-path
//! probing, same `ensure_network` idempotent create-if-missing pattern,
//! same create→start split) but reworked for one-container-per-session with
//! the label-based reconciliation and tempfile secrets mounts this spec
//! requires.

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::service::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use std::collections::HashMap;
use std::io::Write;
use tracing::{debug, info, warn};

use super::{
    ContainerProvider, ContainerStatus, LabelledContainer, SessionContainerSpec, LABEL_INSTANCE,
    LABEL_SESSION, LABEL_SESSION_ID,
};
use crate::error::{OrchestratorError, Result};

/// Real current uid, read from `/proc/self`'s owner rather than a hardcoded
/// literal, so the Podman candidate path resolves on whatever uid the
/// process actually runs as.
#[cfg(unix)]
fn current_uid() -> u32 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self").map(|m| m.uid()).unwrap_or(0)
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

pub struct DockerContainerProvider {
    docker: Docker,
    /// Windows bind-mount source translation (spec §6 `HOST_DRIVE_PREFIX`),
    /// applied to host-supplied paths (the credentials file) before they
    /// become a `Mount.source`. `None` is a no-op passthrough.
    host_drive_prefix: Option<String>,
}

impl DockerContainerProvider {
    pub async fn connect(host_drive_prefix: Option<String>) -> Result<Self> {
        let docker = Self::connect_to_docker()?;
        docker
            .ping()
            .await
            .map_err(|e| OrchestratorError::container_with_source("failed to ping docker daemon", e))?;
        info!("connected to docker daemon");
        Ok(Self { docker, host_drive_prefix })
    }

    fn translate_bind_source(&self, path: &str) -> String {
        let Some(prefix) = &self.host_drive_prefix else {
            return path.to_string();
        };
        let bytes = path.as_bytes();
        if bytes.len() >= 3 && bytes[1] == b':' && (bytes[2] == b'\\' || bytes[2] == b'/') {
            let drive = bytes[0].to_ascii_lowercase() as char;
            let rest = path[2..].replace('\\', "/");
            format!("{prefix}/{drive}{rest}")
        } else {
            path.to_string()
        }
    }

    /// Probe the usual places a daemon socket turns up before falling back
    /// to bollard's platform default, the way the teacher's
    /// `connect_to_docker` tries Docker Desktop, Colima, Podman, Rancher
    /// Desktop and Lima sockets in turn, with `$USER`/`$UID` expanded to
    /// their real values rather than left as literal placeholders.
    fn connect_to_docker() -> Result<Docker> {
        if let Ok(host) = std::env::var("DOCKER_HOST") {
            if let Some(path) = host.strip_prefix("unix://") {
                if let Ok(docker) = Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION) {
                    debug!("connected to docker via DOCKER_HOST={}", host);
                    return Ok(docker);
                }
            }
        }

        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        let uid = current_uid().to_string();

        let candidates = [
            "/var/run/docker.sock",
            "/Users/$USER/.docker/run/docker.sock",
            "/Users/$USER/.colima/default/docker.sock",
            "/Users/$USER/.colima/docker.sock",
            "/run/user/$UID/podman/podman.sock",
            "/Users/$USER/.lima/default/sock/docker.sock",
            "/Users/$USER/.rd/docker.sock",
        ];
        for path in candidates {
            let expanded = path.replace("$USER", &user).replace("$UID", &uid);
            if std::path::Path::new(&expanded).exists() {
                if let Ok(docker) = Docker::connect_with_unix(&expanded, 120, bollard::API_DEFAULT_VERSION) {
                    debug!("connected to docker via socket {}", expanded);
                    return Ok(docker);
                }
            }
        }

        Docker::connect_with_socket_defaults()
            .map_err(|e| OrchestratorError::container_with_source("failed to reach docker daemon", e))
    }

    fn to_docker_config(&self, spec: &SessionContainerSpec, secret_paths: &[(String, String)]) -> Config<String> {
        let env: Vec<String> = spec
            .env()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let mut mounts: Vec<Mount> = secret_paths
            .iter()
            .map(|(host_path, container_path)| Mount {
                target: Some(container_path.clone()),
                source: Some(host_path.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(true),
                ..Default::default()
            })
            .collect();

        if let Some(creds_path) = &spec.credentials_host_path {
            mounts.push(Mount {
                target: Some("/home/node/.claude/.credentials.json".to_string()),
                source: Some(self.translate_bind_source(creds_path)),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(true),
                ..Default::default()
            });
        }

        if spec.docker_access {
            mounts.push(Mount {
                target: Some("/var/run/docker.sock".to_string()),
                source: Some("/var/run/docker.sock".to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            });
        }

        let host_config = HostConfig {
            mounts: Some(mounts),
            memory: Some(spec.resources.memory_bytes),
            cpu_shares: Some(spec.resources.cpu_shares),
            pids_limit: Some(spec.resources.pids_limit),
            network_mode: Some(super::network_name(&spec.instance_id)),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(spec.labels()),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Write each secret to a private tempfile under `base_dir` and return
    /// `(host_path, container_path)` pairs for bind-mounting. Secrets never
    /// touch the container's environment (spec §4.2 auditable invariant).
    fn materialize_secrets(
        spec: &SessionContainerSpec,
        base_dir: &std::path::Path,
    ) -> Result<Vec<(String, String)>> {
        std::fs::create_dir_all(base_dir)
            .map_err(|e| OrchestratorError::container_with_source("failed to create secrets dir", e))?;

        let mut pairs = Vec::new();
        for (name, contents) in spec.secrets.files() {
            let host_path = base_dir.join(name);
            let mut file = std::fs::File::create(&host_path)
                .map_err(|e| OrchestratorError::container_with_source("failed to create secret file", e))?;
            file.write_all(contents.as_bytes())
                .map_err(|e| OrchestratorError::container_with_source("failed to write secret file", e))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&host_path, std::fs::Permissions::from_mode(0o400));
            }
            pairs.push((
                host_path.to_string_lossy().to_string(),
                format!("/run/secrets/{name}"),
            ));
        }
        Ok(pairs)
    }
}

#[async_trait::async_trait]
impl ContainerProvider for DockerContainerProvider {
    async fn ensure_network(&self, instance_id: &str) -> Result<()> {
        let name = super::network_name(instance_id);
        match self
            .docker
            .inspect_network(&name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => {
                debug!("network {} already exists", name);
                Ok(())
            }
            Err(_) => {
                info!("creating network {}", name);
                let mut labels = HashMap::new();
                labels.insert(LABEL_INSTANCE, instance_id);
                let options = CreateNetworkOptions {
                    name: name.as_str(),
                    driver: "bridge",
                    labels,
                    ..Default::default()
                };
                self.docker
                    .create_network(options)
                    .await
                    .map_err(|e| OrchestratorError::container_with_source("failed to create network", e))?;
                Ok(())
            }
        }
    }

    async fn create_and_start(&self, spec: &SessionContainerSpec) -> Result<String> {
        let secrets_dir = std::env::temp_dir().join(format!("clawd-secrets-{}", spec.session_id));
        let secret_paths = Self::materialize_secrets(spec, &secrets_dir)?;

        let docker_config = self.to_docker_config(spec, &secret_paths);
        let name = spec.name();

        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), docker_config)
            .await
            .map_err(|e| OrchestratorError::container_with_source("failed to create container", e))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| OrchestratorError::container_with_source("failed to start container", e))?;

        info!("started container {} for session {}", created.id, spec.session_id);
        Ok(created.id)
    }

    async fn stop_and_remove(&self, container_id: &str, grace_secs: u32) -> Result<()> {
        let stop_result = self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: grace_secs as i64 }))
            .await;
        if let Err(e) = stop_result {
            warn!("stop_container({}) failed, forcing removal: {}", container_id, e);
        }

        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| OrchestratorError::container_with_source("failed to remove container", e))?;
        Ok(())
    }

    async fn status(&self, container_id: &str) -> Result<ContainerStatus> {
        match self.docker.inspect_container(container_id, None).await {
            Ok(info) => {
                let running = info
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                Ok(if running {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Stopped
                })
            }
            Err(_) => Ok(ContainerStatus::NotFound),
        }
    }

    async fn list_labelled(&self, instance_id: &str) -> Result<Vec<LabelledContainer>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![
                format!("{LABEL_SESSION}=true"),
                format!("{LABEL_INSTANCE}={instance_id}"),
            ],
        );

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| OrchestratorError::container_with_source("failed to list containers", e))?;

        Ok(containers
            .into_iter()
            .map(|c| LabelledContainer {
                id: c.id.unwrap_or_default(),
                session_id: c
                    .labels
                    .unwrap_or_default()
                    .get(LABEL_SESSION_ID)
                    .cloned(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ResourceLimits, SessionSecrets};

    fn spec() -> SessionContainerSpec {
        SessionContainerSpec {
            session_id: "s1".into(),
            instance_id: "inst".into(),
            image: "clawd/agent:latest".into(),
            permission_mode: "normal".into(),
            git_repo_url: "https://github.com/a/b".into(),
            git_branch: "main".into(),
            git_user_name: None,
            git_user_email: None,
            docker_access: false,
            is_manager: false,
            master_http_url: None,
            anthropic_model: "opus".into(),
            credentials_host_path: None,
            secrets: SessionSecrets {
                session_token: "deadbeef".into(),
                master_ws_url: "ws://master/internal/session".into(),
                github_token: Some("gh-tok".into()),
                claude_code_oauth_token: None,
                manager_api_token: None,
            },
            resources: ResourceLimits::default(),
        }
    }

    #[test]
    fn secrets_never_appear_in_env() {
        let spec = spec();
        let env = spec.env();
        for (_, value) in spec.secrets.files() {
            assert!(
                !env.values().any(|v| v == &value),
                "secret value leaked into env vars"
            );
        }
        assert!(!env.contains_key("SESSION_TOKEN"));
        assert!(!env.contains_key("GITHUB_TOKEN"));
    }

    #[test]
    fn materialize_secrets_writes_expected_files() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec();
        let pairs = DockerContainerProvider::materialize_secrets(&spec, dir.path()).unwrap();
        assert_eq!(pairs.len(), spec.secrets.files().len());
        for (host_path, container_path) in &pairs {
            assert!(std::path::Path::new(host_path).exists());
            assert!(container_path.starts_with("/run/secrets/"));
        }
    }

    #[test]
    fn translate_bind_source_rewrites_windows_path_when_configured() {
        let docker = Docker::connect_with_local_defaults().unwrap();
        let provider = DockerContainerProvider { docker, host_drive_prefix: Some("/mnt".into()) };
        assert_eq!(
            provider.translate_bind_source(r"C:\Users\me\repo"),
            "/mnt/c/Users/me/repo"
        );
        assert_eq!(
            provider.translate_bind_source("/home/me/repo"),
            "/home/me/repo"
        );
    }
}
