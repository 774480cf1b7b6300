//! Sandbox configuration — the declarative input and its fully-defaulted,
//! validated form.
//!
//! [`SandboxConfig`] may be partially specified; every optional field has a
//! secure default. [`resolve`] turns it into a [`ResolvedSandboxConfig`],
//! refusing unsafe configurations instead of degrading them.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, PlatformError, Result};

pub const DEFAULT_MEMORY_MB: u64 = 256;
pub const DEFAULT_CPUS: f64 = 1.0;
pub const DEFAULT_PIDS: u32 = 64;
pub const DEFAULT_CONTAINER_PATH: &str = "/workspace";
pub const DEFAULT_NAME_PREFIX: &str = "cagerun";

const DEFAULT_PREFLIGHT_SECS: u64 = 10;
const DEFAULT_PULL_SECS: u64 = 300;

/// Container network mode. Isolated means no network at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Isolated,
    Bridged,
}

impl NetworkMode {
    /// The value passed to the runtime's `--network` flag.
    pub fn runtime_arg(self) -> &'static str {
        match self {
            NetworkMode::Isolated => "none",
            NetworkMode::Bridged => "bridge",
        }
    }
}

/// uid:gid mapping for the sandboxed process. Both must be non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    pub uid: u32,
    pub gid: u32,
}

/// Partial resource limits; absent fields take the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub memory_mb: Option<u64>,
    pub cpus: Option<f64>,
    pub pids: Option<u32>,
}

/// Partial workspace mount settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Absolute container-side path the host working directory is bound to.
    pub container_path: Option<String>,
    pub read_only: Option<bool>,
}

/// Timeouts for runtime preflight operations, in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub preflight_secs: Option<u64>,
    pub pull_secs: Option<u64>,
}

/// Declarative sandbox configuration, as supplied by the caller.
///
/// Immutable once passed in; resolution never mutates it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub enabled: bool,
    /// Container image reference, e.g. `alpine:3.19`.
    pub image: String,
    pub network: Option<NetworkMode>,
    pub limits: LimitsConfig,
    /// Explicit uid:gid to run as. Defaults to the host identity, which is
    /// rejected when it is root.
    pub user: Option<UserSpec>,
    pub mount: MountConfig,
    /// Container-side working directory. Defaults to the mount path.
    pub workdir: Option<String>,
    /// Environment entries baked into every invocation. These override
    /// per-run entries on key collision.
    pub env: HashMap<String, String>,
    pub timeouts: TimeoutsConfig,
    /// Prefix for generated container names.
    pub name_prefix: Option<String>,
}

/// Fully-validated resource limits. All values strictly positive.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedLimits {
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids: u32,
}

/// Fully-validated workspace mount.
#[derive(Debug, Clone)]
pub struct ResolvedMount {
    pub container_path: String,
    pub read_only: bool,
}

/// The fully-defaulted, validated counterpart of [`SandboxConfig`].
///
/// A value, never mutated after creation; recomputed fresh from each
/// [`SandboxConfig`] and reusable across many invocations without
/// re-validation.
#[derive(Debug, Clone)]
pub struct ResolvedSandboxConfig {
    pub enabled: bool,
    pub image: String,
    pub network: NetworkMode,
    pub limits: ResolvedLimits,
    pub user: UserSpec,
    pub mount: ResolvedMount,
    pub workdir: String,
    pub env: HashMap<String, String>,
    pub preflight_timeout: Duration,
    pub pull_timeout: Duration,
    pub name_prefix: String,
}

/// Validate and normalize a sandbox configuration.
///
/// When no explicit user mapping is supplied, the host identity is used,
/// and resolution fails if the host does not expose one or if it is root.
/// Running the sandboxed command as root inside the container would defeat
/// the isolation, so this is a hard gate, not a convenience default.
pub fn resolve(config: &SandboxConfig) -> Result<ResolvedSandboxConfig> {
    resolve_with_identity(config, host_identity())
}

pub(crate) fn resolve_with_identity(
    config: &SandboxConfig,
    host_identity: Option<UserSpec>,
) -> Result<ResolvedSandboxConfig> {
    validate_image(&config.image)?;

    let limits = resolve_limits(&config.limits)?;

    let user = match config.user {
        Some(user) => {
            if user.uid == 0 || user.gid == 0 {
                return Err(ConfigError::RootUser {
                    uid: user.uid,
                    gid: user.gid,
                }
                .into());
            }
            user
        }
        None => match host_identity {
            None => return Err(PlatformError::IdentityUnavailable.into()),
            Some(id) if id.uid == 0 || id.gid == 0 => {
                return Err(PlatformError::RootIdentity.into());
            }
            Some(id) => id,
        },
    };

    let container_path = config
        .mount
        .container_path
        .clone()
        .unwrap_or_else(|| DEFAULT_CONTAINER_PATH.to_string());
    if !container_path.starts_with('/') {
        return Err(ConfigError::MountPathNotAbsolute(container_path).into());
    }

    let workdir = config.workdir.clone().unwrap_or_else(|| container_path.clone());
    if !workdir.starts_with('/') {
        return Err(ConfigError::WorkdirNotAbsolute(workdir).into());
    }

    let name_prefix = config
        .name_prefix
        .clone()
        .unwrap_or_else(|| DEFAULT_NAME_PREFIX.to_string());
    if !valid_name_prefix(&name_prefix) {
        return Err(ConfigError::NamePrefix(name_prefix).into());
    }

    let resolved = ResolvedSandboxConfig {
        enabled: config.enabled,
        image: config.image.clone(),
        network: config.network.unwrap_or_default(),
        limits,
        user,
        mount: ResolvedMount {
            container_path,
            read_only: config.mount.read_only.unwrap_or(false),
        },
        workdir,
        env: config.env.clone(),
        preflight_timeout: Duration::from_secs(
            config.timeouts.preflight_secs.unwrap_or(DEFAULT_PREFLIGHT_SECS),
        ),
        pull_timeout: Duration::from_secs(config.timeouts.pull_secs.unwrap_or(DEFAULT_PULL_SECS)),
        name_prefix,
    };

    debug!(
        image = %resolved.image,
        network = ?resolved.network,
        uid = resolved.user.uid,
        gid = resolved.user.gid,
        "resolved sandbox configuration"
    );

    Ok(resolved)
}

fn resolve_limits(limits: &LimitsConfig) -> Result<ResolvedLimits> {
    let memory_mb = limits.memory_mb.unwrap_or(DEFAULT_MEMORY_MB);
    if memory_mb == 0 {
        return Err(ConfigError::MemoryLimit(memory_mb).into());
    }

    let cpus = limits.cpus.unwrap_or(DEFAULT_CPUS);
    if !cpus.is_finite() || cpus <= 0.0 {
        return Err(ConfigError::CpuLimit(cpus).into());
    }

    let pids = limits.pids.unwrap_or(DEFAULT_PIDS);
    if pids == 0 {
        return Err(ConfigError::PidsLimit(pids).into());
    }

    Ok(ResolvedLimits {
        memory_mb,
        cpus,
        pids,
    })
}

/// An image reference is passed straight to the runtime as one argument, so
/// the only hard requirements are no whitespace and no NUL.
fn validate_image(image: &str) -> Result<()> {
    if image.is_empty() {
        return Err(ConfigError::EmptyImage.into());
    }
    if image.contains('\0') {
        return Err(ConfigError::ImageNul.into());
    }
    if image.chars().any(char::is_whitespace) {
        return Err(ConfigError::ImageWhitespace(image.to_string()).into());
    }
    Ok(())
}

/// Alphanumeric start, then alphanumerics, `_`, `.`, or `-`. Matches what
/// container runtimes accept for names, so generated names never fail late.
fn valid_name_prefix(prefix: &str) -> bool {
    let mut chars = prefix.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

#[cfg(unix)]
fn host_identity() -> Option<UserSpec> {
    // SAFETY: getuid/getgid cannot fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    Some(UserSpec { uid, gid })
}

#[cfg(not(unix))]
fn host_identity() -> Option<UserSpec> {
    None
}
