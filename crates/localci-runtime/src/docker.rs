//! `docker` CLI-backed [`Runtime`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use localci_core::process::{spawn, spawn_allow_failure};

use crate::runtime::{ContainerRunOutcome, ContainerSpec, Runtime, RuntimeError, RuntimeErrorKind};

/// Shells out to the `docker` binary for every operation; no native socket
/// client, matching the CLI surface named in the external interfaces.
pub struct DockerRuntime {
    cwd: PathBuf,
}

impl DockerRuntime {
    #[must_use]
    pub fn new(cwd: PathBuf) -> Self {
        Self { cwd }
    }

    async fn run(&self, command: String) -> Result<localci_core::process::SpawnOutput, RuntimeError> {
        let cwd = self.cwd.clone();
        tokio::task::spawn_blocking(move || spawn(&command, &cwd, &Default::default()))
            .await
            .expect("docker command task panicked")
            .map_err(|e| RuntimeErrorKind::CreateFailed { reason: e.to_string() }.into())
    }

    async fn run_allow_failure(&self, command: String) -> Result<localci_core::process::SpawnOutput, RuntimeError> {
        let cwd = self.cwd.clone();
        tokio::task::spawn_blocking(move || spawn_allow_failure(&command, &cwd, &Default::default()))
            .await
            .expect("docker command task panicked")
            .map_err(|e| RuntimeErrorKind::CreateFailed { reason: e.to_string() }.into())
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let out = self
            .run_allow_failure(format!("docker image ls --format '{{{{.Repository}}}}:{{{{.Tag}}}}' | grep -Fx '{image}'"))
            .await?;
        Ok(out.success())
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        if self.image_exists(image).await? {
            return Ok(());
        }
        self.run(format!("docker pull {image}"))
            .await
            .map_err(|_| RuntimeErrorKind::PullFailed { image: image.to_string(), reason: "pull failed".into() })?;
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(format!("docker volume create {name}")).await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let _ = self.run_allow_failure(format!("docker volume rm -f {name}")).await;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut cmd = format!("docker create --name {} -v {}:/builds", spec.name, spec.volume_name);
        if spec.privileged {
            cmd.push_str(" --privileged");
        }
        if spec.interactive {
            cmd.push_str(" -it");
        }
        for bind in &spec.binds {
            let ro = if bind.read_only { ":ro" } else { "" };
            cmd.push_str(&format!(" -v {}:{}{}", bind.host_path.display(), bind.container_path.display(), ro));
        }
        for (k, v) in &spec.env {
            cmd.push_str(&format!(" -e {k}={v}"));
        }
        for host in &spec.extra_hosts {
            cmd.push_str(&format!(" --add-host {host}"));
        }
        if let Some(entrypoint) = &spec.entrypoint {
            cmd.push_str(&format!(" --entrypoint {}", entrypoint.join(" ")));
        }
        cmd.push(' ');
        cmd.push_str(&spec.image);

        let out = self
            .run(cmd)
            .await
            .map_err(|e| RuntimeErrorKind::CreateFailed { reason: e.to_string() })?;
        Ok(out.stdout.trim().to_string())
    }

    async fn start_attached(
        &self,
        container_id: &str,
        command: &str,
        on_line: &(dyn Fn(bool, &str) + Send + Sync),
    ) -> Result<ContainerRunOutcome, RuntimeError> {
        let exec_cmd = format!("docker start --attach -i {container_id}");
        let out = self
            .run_allow_failure(format!("{exec_cmd} <<'LOCALCI_SCRIPT'\n{command}\nLOCALCI_SCRIPT"))
            .await?;
        for line in out.stdout.lines() {
            on_line(false, line);
        }
        for line in out.stderr.lines() {
            on_line(true, line);
        }
        Ok(ContainerRunOutcome { exit_code: out.exit_code.unwrap_or(-1) })
    }

    async fn copy_into(&self, container_id: &str, host_path: &Path, container_path: &Path) -> Result<(), RuntimeError> {
        self.run(format!(
            "docker cp {} {}:{}",
            host_path.display(),
            container_id,
            container_path.display()
        ))
        .await
        .map_err(|e| RuntimeErrorKind::CopyFailed {
            src: host_path.display().to_string(),
            dst: container_path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn copy_from(&self, container_id: &str, container_path: &Path, host_path: &Path) -> Result<(), RuntimeError> {
        self.run(format!(
            "docker cp {}:{} {}",
            container_id,
            container_path.display(),
            host_path.display()
        ))
        .await
        .map_err(|e| RuntimeErrorKind::CopyFailed {
            src: container_path.display().to_string(),
            dst: host_path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        if let Err(e) = self.run_allow_failure(format!("docker rm -f {container_id}")).await {
            let warning = RuntimeErrorKind::CleanupFailed {
                id: container_id.to_string(),
                reason: e.to_string(),
            };
            tracing::warn!(%warning, "container cleanup failed");
        }
        Ok(())
    }
}
