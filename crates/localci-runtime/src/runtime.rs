//! The `Runtime` trait: the container operations the job engine needs.
//!
//! Kept intentionally narrow — it mirrors the exact verb set §6 of the
//! specification names (`image ls`, `pull`, `volume create`, `volume rm`,
//! `create`, `start --attach -i`, `cp`, `rm -f`), not a general container
//! API. A fake implementation backs the engine's own unit tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeErrorKind {
    #[error("container runtime not found on PATH")]
    NotInstalled,
    #[error("image pull failed for `{image}`: {reason}")]
    PullFailed { image: String, reason: String },
    #[error("container create failed: {reason}")]
    CreateFailed { reason: String },
    #[error("container start failed for `{id}`: {reason}")]
    StartFailed { id: String, reason: String },
    #[error("copy failed ({src} -> {dst}): {reason}")]
    CopyFailed { src: String, dst: String, reason: String },
    #[error("cleanup failed for `{id}`: {reason}")]
    CleanupFailed { id: String, reason: String },
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct RuntimeError(#[from] pub RuntimeErrorKind);

/// A bind mount from a host path to a path inside the container.
#[derive(Debug, Clone)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

/// Everything needed to create one job's container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub entrypoint: Option<Vec<String>>,
    pub volume_name: String,
    pub binds: Vec<BindMount>,
    pub env: BTreeMap<String, String>,
    pub extra_hosts: Vec<String>,
    pub privileged: bool,
    pub interactive: bool,
}

/// The result of running a container to completion.
#[derive(Debug, Clone)]
pub struct ContainerRunOutcome {
    pub exit_code: i32,
}

/// Container operations consumed by the job engine. One real
/// implementation ([`crate::docker::DockerRuntime`]) shells out to the
/// `docker` CLI; tests substitute an in-memory fake.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Whether the image is already present locally.
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;
    /// Pulls an image, if not already present.
    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;
    /// Creates a named volume.
    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError>;
    /// Removes a named volume.
    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;
    /// Creates a container per `spec`, returning its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    /// Runs `command` inside an already-created container, streaming
    /// stdout/stderr lines to `on_line`, and waits for exit.
    async fn start_attached(
        &self,
        container_id: &str,
        command: &str,
        on_line: &(dyn Fn(bool, &str) + Send + Sync),
    ) -> Result<ContainerRunOutcome, RuntimeError>;
    /// Copies a path from the host into the container.
    async fn copy_into(&self, container_id: &str, host_path: &Path, container_path: &Path) -> Result<(), RuntimeError>;
    /// Copies a path from the container to the host.
    async fn copy_from(&self, container_id: &str, container_path: &Path, host_path: &Path) -> Result<(), RuntimeError>;
    /// Force-removes a container.
    async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError>;
}

/// A test double for [`Runtime`], exposed unconditionally (not behind
/// `#[cfg(test)]`) so downstream crates — `localci-engine`'s own test
/// suite — can use it too.
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Records every call made against it; returns scripted exit codes.
    #[derive(Default)]
    pub struct FakeRuntime {
        pub exit_code: i32,
        pub removed_containers: Mutex<Vec<String>>,
        pub removed_volumes: Mutex<Vec<String>>,
        pub copy_from_calls: Mutex<Vec<(String, PathBuf, PathBuf)>>,
    }

    #[async_trait]
    impl Runtime for FakeRuntime {
        async fn image_exists(&self, _image: &str) -> Result<bool, RuntimeError> {
            Ok(true)
        }
        async fn pull(&self, _image: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn create_volume(&self, _name: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
            self.removed_volumes.lock().unwrap().push(name.to_string());
            Ok(())
        }
        async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
            Ok(format!("fake-{}", spec.name))
        }
        async fn start_attached(
            &self,
            _container_id: &str,
            _command: &str,
            _on_line: &(dyn Fn(bool, &str) + Send + Sync),
        ) -> Result<ContainerRunOutcome, RuntimeError> {
            Ok(ContainerRunOutcome { exit_code: self.exit_code })
        }
        async fn copy_into(&self, _container_id: &str, _host_path: &Path, _container_path: &Path) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn copy_from(&self, container_id: &str, container_path: &Path, host_path: &Path) -> Result<(), RuntimeError> {
            self.copy_from_calls.lock().unwrap().push((
                container_id.to_string(),
                container_path.to_path_buf(),
                host_path.to_path_buf(),
            ));
            Ok(())
        }
        async fn remove_container(&self, container_id: &str) -> Result<(), RuntimeError> {
            self.removed_containers.lock().unwrap().push(container_id.to_string());
            Ok(())
        }
    }
}
