//! cagerun — run untrusted commands in isolated, resource-bounded
//! containers.
//!
//! The crate turns a declarative [`SandboxConfig`] into a validated
//! execution plan, builds the exact argument vector for the external
//! container runtime, and guarantees that every container it starts is
//! removed exactly once, even when the host process dies to a signal.
//!
//! ```no_run
//! use cagerun_core::sandbox::{
//!     InvocationBuilder, RunOptions, SandboxConfig, UserSpec, prepare_sandbox,
//! };
//!
//! # async fn run() -> cagerun_core::error::Result<()> {
//! let config = SandboxConfig {
//!     enabled: true,
//!     image: "alpine:3.19".to_string(),
//!     user: Some(UserSpec { uid: 1000, gid: 1000 }),
//!     ..Default::default()
//! };
//!
//! let resolved = prepare_sandbox(&config, None).await?;
//! let invocation = InvocationBuilder::new().build(
//!     &resolved,
//!     &RunOptions {
//!         host_dir: ".".into(),
//!         command: "echo".to_string(),
//!         args: vec!["hello".to_string()],
//!         ..Default::default()
//!     },
//! )?;
//!
//! // Hand invocation.program() and invocation.args() to an executor,
//! // then dispose to remove the container.
//! invocation.dispose();
//! # Ok(())
//! # }
//! ```
//!
//! [`SandboxConfig`]: sandbox::SandboxConfig

pub mod error;
pub mod lifecycle;
pub mod sandbox;

pub use error::{ConfigError, PlatformError, Result, RuntimeError, SandboxError};
