//! Phase 2 — container create.
//!
//! Builds the [`ContainerSpec`] for a job's image, including cache binds,
//! extra hosts, and SSH agent injection, then hands it to the [`Runtime`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use localci_core::job::{Cache, CacheKey, Image, Job};
use localci_core::safe_name;
use localci_runtime::{BindMount, ContainerSpec, Runtime, RuntimeError};

/// Shells tried in order inside a freshly created container; the first one
/// that exists is used to run the job's script.
const SHELL_CANDIDATES: &[&str] = &["bash", "sh", "busybox sh"];

/// Builds the probe command that picks the first available shell, exiting
/// 1 with `shell not found` if none exist.
#[must_use]
pub fn shell_probe_command() -> String {
    let mut cmd = String::new();
    for (i, shell) in SHELL_CANDIDATES.iter().enumerate() {
        let bin = shell.split_whitespace().next().unwrap();
        if i > 0 {
            cmd.push_str(" || ");
        }
        cmd.push_str(&format!("command -v {bin} >/dev/null 2>&1 && exec {shell} /builds/gcl-init"));
    }
    format!("{cmd} || {{ echo 'shell not found' >&2; exit 1; }}")
}

/// The cache key a job resolves to, or `None` if it declares no cache.
/// Shared with [`crate::cache_lock`], which locks jobs per this same key.
#[must_use]
pub fn cache_key(cache: &Cache) -> Option<String> {
    match &cache.key {
        Some(CacheKey::Literal(key)) => Some(key.clone()),
        Some(CacheKey::Files { files }) => Some(files.join("-")),
        None => None,
    }
}

fn cache_host_dir(cache_dir: &std::path::Path, cache: &Cache) -> Option<String> {
    cache_key(cache).map(|key| cache_dir.join(key).to_string_lossy().to_string())
}

/// Host path used for mounting the SSH agent socket, which differs on
/// macOS (the Docker Desktop VM proxies a fixed location) vs. Linux, where
/// the host's own `SSH_AUTH_SOCK` is bind-mounted at the same path.
#[must_use]
pub fn ssh_agent_host_socket() -> Option<PathBuf> {
    if cfg!(target_os = "macos") {
        Some(PathBuf::from("/run/host-services/ssh-auth.sock"))
    } else {
        std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from)
    }
}

/// Builds a [`ContainerSpec`] for `job`, honoring cache binds, extra hosts,
/// privileged mode, and SSH agent injection.
#[must_use]
pub fn build_spec(
    job: &Job,
    job_id: u64,
    image: &Image,
    env: &BTreeMap<String, String>,
    cache_root: &std::path::Path,
    extra_hosts: &[String],
    privileged: bool,
) -> ContainerSpec {
    let name_suffix = safe_name(&job.name);
    let container_name = format!("gcl-{name_suffix}-{job_id}");
    let volume_name = format!("gcl-vol-{name_suffix}-{job_id}");

    let mut binds = Vec::new();
    if let Some(cache_base) = cache_host_dir(cache_root, &job.cache) {
        for path in &job.cache.paths {
            binds.push(BindMount {
                host_path: PathBuf::from(&cache_base).join(path),
                container_path: PathBuf::from("/builds").join(path),
                read_only: false,
            });
        }
    }

    if job.inject_ssh_agent {
        if let Some(sock) = ssh_agent_host_socket() {
            binds.push(BindMount {
                host_path: sock.clone(),
                container_path: sock,
                read_only: false,
            });
        }
    }

    ContainerSpec {
        name: container_name,
        image: image.name.clone(),
        entrypoint: image.entrypoint.clone(),
        volume_name,
        binds,
        env: env.clone(),
        extra_hosts: extra_hosts.to_vec(),
        privileged,
        interactive: job.interactive,
    }
}

/// Creates the container and its volume, pulling the image first if needed.
pub async fn create(runtime: &dyn Runtime, spec: &ContainerSpec) -> Result<String, RuntimeError> {
    runtime.pull(&spec.image).await?;
    runtime.create_volume(&spec.volume_name).await?;
    runtime.create_container(spec).await
}

/// Image for the disposable artifact-extraction sidecar: small, stable, and
/// guaranteed present without relying on the job's own image having a shell.
const ARTIFACTS_SIDECAR_IMAGE: &str = "debian:stable-slim";

/// Builds the sidecar container spec used to pull a container-mode job's
/// `/builds` volume back onto the host via `docker cp`. The sidecar is
/// never started — `cp` reads a container's filesystem whether or not it
/// is running, so `create`+`cp`+`rm` is the whole lifecycle.
#[must_use]
pub fn build_artifacts_sidecar_spec(job: &Job, job_id: u64, volume_name: &str) -> ContainerSpec {
    let name_suffix = safe_name(&job.name);
    ContainerSpec {
        name: format!("gcl-artifacts-{name_suffix}-{job_id}"),
        image: ARTIFACTS_SIDECAR_IMAGE.to_string(),
        entrypoint: None,
        volume_name: volume_name.to_string(),
        binds: Vec::new(),
        env: BTreeMap::new(),
        extra_hosts: Vec::new(),
        privileged: false,
        interactive: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localci_core::job::{Artifacts, Cache, CacheKey};
    use localci_core::rules::When;
    use localci_core::variables::Scope;

    fn job() -> Job {
        Job {
            name: "build:test".into(),
            stage: "test".into(),
            image: Some(Image::new("rust")),
            before_scripts: vec![],
            scripts: vec!["cargo test".into()],
            after_scripts: vec![],
            needs: None,
            variables: Scope::new(),
            artifacts: Artifacts::default(),
            cache: Cache { key: Some(CacheKey::Literal("cargo".into())), paths: vec!["target".into()] },
            interactive: false,
            inject_ssh_agent: false,
            coverage: None,
            when: When::OnSuccess,
            allow_failure: false,
        }
    }

    #[test]
    fn spec_name_is_filesystem_safe() {
        let j = job();
        let image = j.image.clone().unwrap();
        let spec = build_spec(&j, 7, &image, &BTreeMap::new(), std::path::Path::new("/tmp/cache"), &[], false);
        assert!(spec.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(spec.name.ends_with("-7"));
    }

    #[test]
    fn cache_paths_become_binds() {
        let j = job();
        let image = j.image.clone().unwrap();
        let spec = build_spec(&j, 1, &image, &BTreeMap::new(), std::path::Path::new("/tmp/cache"), &[], false);
        assert_eq!(spec.binds.len(), 1);
        assert!(spec.binds[0].host_path.to_string_lossy().contains("cargo"));
    }

    #[test]
    fn artifacts_sidecar_binds_the_same_volume() {
        let j = job();
        let spec = build_artifacts_sidecar_spec(&j, 3, "gcl-vol-build_B4KD8N-3");
        assert_eq!(spec.volume_name, "gcl-vol-build_B4KD8N-3");
        assert_eq!(spec.image, "debian:stable-slim");
        assert!(spec.binds.is_empty());
        assert!(!spec.interactive);
    }

    #[test]
    fn shell_probe_tries_bash_first() {
        let cmd = shell_probe_command();
        assert!(cmd.starts_with("command -v bash"));
        assert!(cmd.contains("shell not found"));
    }
}
