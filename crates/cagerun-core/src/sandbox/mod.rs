//! Sandbox lifecycle engine — configuration resolution, invocation
//! building, and runtime probing for containerized command execution.

pub mod config;
pub mod invocation;
pub mod runtime;

pub use config::{NetworkMode, ResolvedSandboxConfig, SandboxConfig, UserSpec, resolve};
pub use invocation::{Invocation, InvocationBuilder, RunOptions};
pub use runtime::{image_exists, prepare_sandbox, pull_image};
