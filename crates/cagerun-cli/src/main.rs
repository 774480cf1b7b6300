//! cagerun — run a command inside an isolated, resource-bounded container.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cagerun_core::sandbox::{
    InvocationBuilder, NetworkMode, RunOptions, SandboxConfig, prepare_sandbox,
};

#[derive(Parser, Debug)]
#[command(
    name = "cagerun",
    version,
    about = "Run a command inside an isolated, resource-bounded container"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Container image to run in (overrides the config file).
    #[arg(long)]
    image: Option<String>,

    /// Network mode: isolated or bridged.
    #[arg(long)]
    network: Option<String>,

    /// Extra KEY=VALUE environment entries for the sandbox.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Container-side working directory.
    #[arg(long)]
    workdir: Option<String>,

    /// The command to run, followed by its arguments.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    let (command, args) = cli
        .command
        .split_first()
        .context("no command given")?;

    if !config.enabled {
        warn!("sandbox disabled in configuration; running directly on the host");
        let status = tokio::process::Command::new(command)
            .args(args)
            .status()
            .await
            .with_context(|| format!("failed to run {command}"))?;
        std::process::exit(status.code().unwrap_or(1));
    }

    let progress = |line: &str| eprintln!("{line}");
    let resolved = prepare_sandbox(&config, Some(&progress))
        .await
        .context("sandbox preparation failed")?;

    let host_dir = std::env::current_dir().context("cannot determine working directory")?;
    let opts = RunOptions {
        host_dir,
        command: command.clone(),
        args: args.to_vec(),
        env: Default::default(),
    };

    let invocation = InvocationBuilder::new()
        .build(&resolved, &opts)
        .context("failed to build sandbox invocation")?;

    info!(
        container = %invocation.container_name(),
        args = ?invocation.redacted_args(),
        "starting sandboxed command"
    );

    let status = tokio::process::Command::new(invocation.program())
        .args(invocation.args())
        .status()
        .await
        .with_context(|| format!("failed to run {}", invocation.program()))?;

    invocation.dispose();
    std::process::exit(status.code().unwrap_or(1));
}

/// Load the config file (if any) and apply CLI overrides.
fn build_config(cli: &Cli) -> Result<SandboxConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => match default_config_path() {
            Some(path) if path.exists() => load_config(&path)?,
            _ => SandboxConfig::default(),
        },
    };

    if let Some(image) = &cli.image {
        config.image = image.clone();
        // An image on the command line is an explicit request to sandbox.
        config.enabled = true;
    }

    if let Some(network) = &cli.network {
        config.network = Some(match network.as_str() {
            "isolated" => NetworkMode::Isolated,
            "bridged" => NetworkMode::Bridged,
            other => bail!("unknown network mode {other:?} (expected isolated or bridged)"),
        });
    }

    for entry in &cli.env {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("invalid --env entry {entry:?} (expected KEY=VALUE)");
        };
        config.env.insert(key.to_string(), value.to_string());
    }

    if let Some(workdir) = &cli.workdir {
        config.workdir = Some(workdir.clone());
    }

    Ok(config)
}

fn load_config(path: &Path) -> Result<SandboxConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("cagerun").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("cagerun").chain(args.iter().copied()))
    }

    #[test]
    fn test_image_flag_enables_sandbox() {
        let config = build_config(&cli(&["--image", "alpine:3.19", "--", "ls"])).unwrap();
        assert!(config.enabled);
        assert_eq!(config.image, "alpine:3.19");
    }

    #[test]
    fn test_env_flag_parses_key_value() {
        let config = build_config(&cli(&[
            "--image",
            "alpine:3.19",
            "--env",
            "FOO=bar",
            "--env",
            "TOKEN=a=b",
            "--",
            "ls",
        ]))
        .unwrap();
        assert_eq!(config.env.get("FOO").map(String::as_str), Some("bar"));
        // Only the first '=' splits; values may contain '='.
        assert_eq!(config.env.get("TOKEN").map(String::as_str), Some("a=b"));
    }

    #[test]
    fn test_invalid_env_flag_is_rejected() {
        assert!(build_config(&cli(&["--env", "NOVALUE", "--", "ls"])).is_err());
    }

    #[test]
    fn test_unknown_network_mode_is_rejected() {
        assert!(build_config(&cli(&["--network", "host", "--", "ls"])).is_err());
    }

    #[test]
    fn test_network_modes_parse() {
        let config = build_config(&cli(&["--network", "bridged", "--", "ls"])).unwrap();
        assert_eq!(config.network, Some(NetworkMode::Bridged));
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
enabled = true
image = "alpine:3.19"

[limits]
memory_mb = 512

[user]
uid = 1000
gid = 1000
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert!(config.enabled);
        assert_eq!(config.image, "alpine:3.19");
        assert_eq!(config.limits.memory_mb, Some(512));
    }
}
