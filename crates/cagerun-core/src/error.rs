//! Error types for sandbox resolution, invocation building, and runtime
//! probing.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Invalid or insecure sandbox configuration.
///
/// Always surfaced to the caller; never auto-corrected beyond the documented
/// defaults.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("image reference is empty")]
    EmptyImage,

    #[error("image reference {0:?} contains whitespace")]
    ImageWhitespace(String),

    #[error("image reference contains a NUL byte")]
    ImageNul,

    #[error("memory limit must be at least 1 MB, got {0}")]
    MemoryLimit(u64),

    #[error("cpu limit must be positive and finite, got {0}")]
    CpuLimit(f64),

    #[error("process-count limit must be at least 1, got {0}")]
    PidsLimit(u32),

    #[error("sandbox user {uid}:{gid} is not allowed: uid and gid must be non-zero")]
    RootUser { uid: u32, gid: u32 },

    #[error("container mount path {0:?} is not absolute")]
    MountPathNotAbsolute(String),

    #[error("working directory {0:?} is not an absolute container path")]
    WorkdirNotAbsolute(String),

    #[error(
        "container name prefix {0:?} is invalid: must start with an alphanumeric \
         and contain only alphanumerics, '_', '.', or '-'"
    )]
    NamePrefix(String),

    #[error("cannot resolve host directory {path:?}: {source}")]
    HostDir { path: PathBuf, source: io::Error },
}

/// The host cannot provide a required security property.
///
/// Never falls back to an unsafe choice; the caller must fix the host or
/// supply an explicit configuration.
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("host identity lookup is unavailable on this platform; configure an explicit sandbox user")]
    IdentityUnavailable,

    #[error("host identity is root; refusing to run the sandbox as uid 0, configure an explicit non-root user")]
    RootIdentity,

    #[error("failed to install lifecycle handlers: {0}")]
    HandlerInstall(#[source] io::Error),
}

/// An external runtime invocation failed, exited non-zero, or timed out.
///
/// Carries the captured output so callers can diagnose registry, daemon,
/// and image problems without re-running the command.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("failed to run `{command}`: {source}")]
    Invoke {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with status {code}: {output}")]
    CommandFailed {
        command: String,
        code: i32,
        output: String,
    },

    #[error("`{command}` timed out after {timeout_secs}s: {output}")]
    Timeout {
        command: String,
        timeout_secs: u64,
        output: String,
    },
}

/// Top-level error type for the crate.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
