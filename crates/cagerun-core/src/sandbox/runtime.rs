//! Runtime probing — image presence checks and pull-if-missing against the
//! external container runtime, plus the `prepare_sandbox` orchestration
//! entry point.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Result, RuntimeError};
use crate::lifecycle::{HostProcess, LifecycleRegistry};
use crate::sandbox::config::{self, ResolvedSandboxConfig, SandboxConfig};
use crate::sandbox::invocation::RUNTIME_BIN;

/// Human-readable progress sink for long-running probe operations.
///
/// Display only; a broken or panicking sink never aborts the operation.
pub type ProgressFn = dyn Fn(&str) + Send + Sync;

/// Check whether `image` is present locally.
///
/// The probe subprocess is killed when `timeout` elapses.
pub async fn image_exists(image: &str, timeout: Duration) -> Result<bool> {
    let command = format!("{RUNTIME_BIN} image inspect {image}");
    let mut child = Command::new(RUNTIME_BIN)
        .args(["image", "inspect", image])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| RuntimeError::Invoke {
            command: command.clone(),
            source,
        })?;

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(status.success()),
        Ok(Err(source)) => Err(RuntimeError::Invoke { command, source }.into()),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(RuntimeError::Timeout {
                command,
                timeout_secs: timeout.as_secs(),
                output: String::new(),
            }
            .into())
        }
    }
}

/// Pull `image`, streaming raw output lines to `on_progress` as they
/// arrive.
///
/// Fails with the captured output when the runtime exits non-zero, and
/// kills the subprocess when `timeout` elapses.
pub async fn pull_image(
    image: &str,
    timeout: Duration,
    on_progress: Option<&ProgressFn>,
) -> Result<()> {
    let command = format!("{RUNTIME_BIN} pull {image}");
    info!(image, "pulling container image");

    let mut child = Command::new(RUNTIME_BIN)
        .args(["pull", image])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| RuntimeError::Invoke {
            command: command.clone(),
            source,
        })?;

    // Reader tasks forward output lines over a channel so both pipes drain
    // concurrently and the child can never block on a full pipe.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut captured = String::new();
    let waited = tokio::time::timeout(timeout, async {
        while let Some(line) = rx.recv().await {
            emit(on_progress, &line);
            captured.push_str(&line);
            captured.push('\n');
        }
        child.wait().await
    })
    .await;

    match waited {
        Ok(Ok(status)) if status.success() => {
            debug!(image, "image pulled");
            Ok(())
        }
        Ok(Ok(status)) => Err(RuntimeError::CommandFailed {
            command,
            code: status.code().unwrap_or(-1),
            output: captured,
        }
        .into()),
        Ok(Err(source)) => Err(RuntimeError::Invoke { command, source }.into()),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(RuntimeError::Timeout {
                command,
                timeout_secs: timeout.as_secs(),
                output: captured,
            }
            .into())
        }
    }
}

/// Resolve a sandbox configuration and make sure the runtime can serve it.
///
/// Composes: resolve, install lifecycle handlers (idempotent), check image
/// presence, pull if absent. A disabled configuration is resolved and
/// returned without touching the runtime.
pub async fn prepare_sandbox(
    config: &SandboxConfig,
    log: Option<&ProgressFn>,
) -> Result<ResolvedSandboxConfig> {
    let resolved = config::resolve(config)?;

    if !resolved.enabled {
        debug!("sandbox disabled; skipping runtime preflight");
        return Ok(resolved);
    }

    let host = HostProcess::shared();
    Arc::clone(LifecycleRegistry::global()).ensure_handlers(&host)?;

    if !image_exists(&resolved.image, resolved.preflight_timeout).await? {
        emit(log, &format!("image {} not found locally, pulling", resolved.image));
        pull_image(&resolved.image, resolved.pull_timeout, log).await?;
    }

    Ok(resolved)
}

/// Invoke a progress sink, isolating the probe from sink panics.
fn emit(on_progress: Option<&ProgressFn>, line: &str) {
    if let Some(cb) = on_progress {
        let _ = catch_unwind(AssertUnwindSafe(|| cb(line)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, SandboxError};
    use crate::sandbox::config::UserSpec;

    fn disabled_config() -> SandboxConfig {
        SandboxConfig {
            enabled: false,
            image: "alpine:3.19".to_string(),
            user: Some(UserSpec { uid: 1000, gid: 1000 }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_prepare_disabled_resolves_without_probing() {
        // Must succeed whether or not a container runtime is installed.
        let resolved = prepare_sandbox(&disabled_config(), None).await.unwrap();
        assert!(!resolved.enabled);
        assert_eq!(resolved.image, "alpine:3.19");
    }

    #[tokio::test]
    async fn test_prepare_validates_even_when_disabled() {
        let mut config = disabled_config();
        config.image = String::new();
        let err = prepare_sandbox(&config, None).await.unwrap_err();
        assert!(matches!(
            err,
            SandboxError::Config(ConfigError::EmptyImage)
        ));
    }

    #[test]
    fn test_emit_survives_a_panicking_sink() {
        let sink = |_: &str| panic!("broken progress sink");
        emit(Some(&sink), "one line");
        emit(Some(&sink), "another line");
        emit(None, "no sink at all");
    }

    #[test]
    fn test_emit_forwards_lines() {
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |line: &str| seen.lock().unwrap().push(line.to_string());
        emit(Some(&sink), "alpha");
        emit(Some(&sink), "beta");
        assert_eq!(*seen.lock().unwrap(), vec!["alpha", "beta"]);
    }
}
