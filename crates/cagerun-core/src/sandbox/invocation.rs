//! Invocation building — the exact `docker run` argument vector for one
//! sandboxed run, plus its log-safe redacted copy and cleanup handle.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::{ConfigError, Result};
use crate::lifecycle::{CleanupId, LifecycleRegistry};
use crate::sandbox::config::ResolvedSandboxConfig;

/// The container runtime binary. Invoked with argument vectors only, never
/// through a shell.
pub const RUNTIME_BIN: &str = "docker";

/// Placeholder substituted for environment values in the redacted vector.
pub const REDACTED_PLACEHOLDER: &str = "<redacted>";

/// Per-run inputs for building one invocation. Ephemeral; only needed while
/// building.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Host directory bound into the container.
    pub host_dir: PathBuf,
    /// Command to run inside the container.
    pub command: String,
    pub args: Vec<String>,
    /// Per-run environment. Sandbox-configured entries win on collision.
    pub env: HashMap<String, String>,
}

/// Builds [`Invocation`]s against a lifecycle registry.
///
/// The default builder registers cleanup with the process-wide registry;
/// tests inject their own instance.
pub struct InvocationBuilder {
    registry: Arc<LifecycleRegistry>,
}

impl InvocationBuilder {
    pub fn new() -> Self {
        Self {
            registry: Arc::clone(LifecycleRegistry::global()),
        }
    }

    pub fn with_registry(registry: Arc<LifecycleRegistry>) -> Self {
        Self { registry }
    }

    /// Build the argument vector for one sandboxed run.
    ///
    /// Deterministic for fixed inputs apart from the generated container
    /// name. As a side effect, a best-effort removal of the named container
    /// is registered with the lifecycle registry; [`Invocation::dispose`]
    /// unregisters and runs it.
    pub fn build(&self, config: &ResolvedSandboxConfig, opts: &RunOptions) -> Result<Invocation> {
        let host_dir = std::path::absolute(&opts.host_dir).map_err(|source| ConfigError::HostDir {
            path: opts.host_dir.clone(),
            source,
        })?;

        let container_name = format!("{}-{}", config.name_prefix, Uuid::new_v4());

        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.clone(),
            "--user".to_string(),
            format!("{}:{}", config.user.uid, config.user.gid),
            "--memory".to_string(),
            format!("{}m", config.limits.memory_mb),
            "--cpus".to_string(),
            config.limits.cpus.to_string(),
            "--pids-limit".to_string(),
            config.limits.pids.to_string(),
            "--network".to_string(),
            config.network.runtime_arg().to_string(),
        ];

        let mut volume = format!("{}:{}", host_dir.display(), config.mount.container_path);
        if config.mount.read_only {
            volume.push_str(":ro");
        }
        args.push("-v".to_string());
        args.push(volume);
        args.push("-w".to_string());
        args.push(config.workdir.clone());

        for (key, value) in merged_env(&opts.env, &config.env) {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        args.push(config.image.clone());
        args.push(container_command(&opts.command));
        args.extend(opts.args.iter().cloned());

        let redacted_args = redact_env_args(&args);

        let cleanup_name = container_name.clone();
        let cleanup_id = self.registry.register(move || remove_container(&cleanup_name));

        debug!(container = %container_name, "built sandbox invocation");

        Ok(Invocation {
            args,
            container_name,
            redacted_args,
            cleanup_id: Some(cleanup_id),
            registry: Arc::clone(&self.registry),
        })
    }
}

impl Default for InvocationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A ready-to-execute runtime invocation for one sandboxed run.
///
/// Owned by the caller for the lifetime of the run. [`dispose`] is the
/// normal teardown path; the registered cleanup action is the fallback for
/// abnormal termination, and `Drop` covers a leaked value. The container is
/// removed exactly once whichever path fires first.
///
/// [`dispose`]: Invocation::dispose
pub struct Invocation {
    args: Vec<String>,
    container_name: String,
    redacted_args: Vec<String>,
    cleanup_id: Option<CleanupId>,
    registry: Arc<LifecycleRegistry>,
}

impl Invocation {
    /// The runtime binary to invoke.
    pub fn program(&self) -> &str {
        RUNTIME_BIN
    }

    /// The full argument vector. May contain secrets; never log this one.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The generated, unique container name.
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Log-safe copy of the argument vector: env values replaced with
    /// [`REDACTED_PLACEHOLDER`], keys preserved.
    pub fn redacted_args(&self) -> &[String] {
        &self.redacted_args
    }

    /// Unregister the cleanup action and remove the container now.
    pub fn dispose(mut self) {
        self.dispose_inner();
    }

    fn dispose_inner(&mut self) {
        if let Some(id) = self.cleanup_id.take() {
            self.registry.unregister(id);
            remove_container(&self.container_name);
        }
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        self.dispose_inner();
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("container_name", &self.container_name)
            .field("args", &self.redacted_args)
            .finish()
    }
}

/// Merge per-run env with sandbox-configured env; sandbox values win on key
/// collision. Entries that could smuggle extra flags or truncate the
/// argument (empty key, `=` in the key, NUL anywhere) are dropped. The
/// BTreeMap keeps the vector deterministic.
fn merged_env(
    run_env: &HashMap<String, String>,
    sandbox_env: &HashMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for (key, value) in run_env.iter().chain(sandbox_env.iter()) {
        if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
            continue;
        }
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Reduce a path-like command to its base name so the host filesystem
/// layout never leaks into the container and the runtime does its own
/// binary resolution.
fn container_command(command: &str) -> String {
    if !command.contains('/') {
        return command.to_string();
    }
    Path::new(command)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| command.to_string())
}

/// Produce the log-safe copy of an argument vector: the value portion of
/// every `key=value` token following a `-e` flag becomes
/// [`REDACTED_PLACEHOLDER`]. Every other token is untouched, so positions
/// line up with the real vector.
pub fn redact_env_args(args: &[String]) -> Vec<String> {
    let mut redacted = Vec::with_capacity(args.len());
    let mut prev_was_env_flag = false;
    for arg in args {
        if prev_was_env_flag {
            match arg.split_once('=') {
                Some((key, _)) => redacted.push(format!("{key}={REDACTED_PLACEHOLDER}")),
                None => redacted.push(arg.clone()),
            }
            prev_was_env_flag = false;
        } else {
            prev_was_env_flag = arg == "-e";
            redacted.push(arg.clone());
        }
    }
    redacted
}

/// Forced, synchronous, best-effort container removal.
///
/// Errors are swallowed by contract: the container may already be gone, and
/// removal races host shutdown anyway. Synchronous so it stays usable from
/// the signal and exit paths, where no async runtime exists.
fn remove_container(name: &str) {
    let result = std::process::Command::new(RUNTIME_BIN)
        .args(["rm", "-f", name])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    match result {
        Ok(status) if !status.success() => {
            debug!(container = name, %status, "container removal skipped");
        }
        Err(e) => {
            debug!(container = name, error = %e, "container removal skipped");
        }
        Ok(_) => {}
    }
}
