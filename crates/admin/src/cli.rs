//! Argument parsing, configuration loading and command execution.

use std::path::{Path, PathBuf};

use anyhow::Context;
use checkpoint_authn::{RotationAdmin, RotationReport, RotationStatus, VerificationReport};
use checkpoint_core::{CheckpointConfig, SharedStore};
use clap::{Parser, Subcommand};

/// Inspect and rotate the Checkpoint signing key.
#[derive(Debug, Parser)]
#[command(name = "checkpoint-admin", version)]
pub struct Cli {
    /// Service configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long, env = "CHECKPOINT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `checkpoint_authn=debug`.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Name recorded in the audit trail.
    #[arg(long, env = "USER", default_value = "admin")]
    pub actor: String,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: AdminCommand,
}

/// Key slot operations.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum AdminCommand {
    /// Create the slot if it does not exist yet.
    Bootstrap,
    /// Show the slot state.
    Status,
    /// Rotate to a freshly generated key.
    Execute {
        /// Report what would change without writing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Check the slot for consistency.
    Verify,
    /// Remove a retired key whose grace period has ended.
    Purge,
}

/// Rendered result of one command.
#[derive(Debug)]
pub struct Outcome {
    /// Text for stdout.
    pub output: String,
    /// `false` if the command ran but found a problem.
    pub success: bool,
}

impl Outcome {
    fn ok(output: String) -> Self {
        Self { output, success: true }
    }
}

/// Reads and validates the configuration at `path`.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<CheckpointConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?
        },
        None => CheckpointConfig::default(),
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn or_dash<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_owned(), |v| v.to_string())
}

fn render_status(status: &RotationStatus) -> String {
    format!(
        "state:                {}\n\
         current kid:          {}\n\
         previous kid:         {}\n\
         rotated at:           {}\n\
         previous valid until: {}",
        status.state,
        status.current_kid,
        or_dash(status.previous_kid.as_deref()),
        or_dash(status.rotated_at),
        or_dash(status.previous_valid_until),
    )
}

fn render_rotation(report: &RotationReport) -> String {
    let verb = if report.dry_run { "Would rotate" } else { "Rotated" };
    format!(
        "{verb} {} -> {}\nprevious key verifies until {}",
        report.retired_kid, report.new_kid, report.previous_valid_until
    )
}

fn render_verification(report: &VerificationReport) -> String {
    let mut lines = vec![render_status(&report.status), String::new()];
    for check in &report.checks {
        let mark = if check.passed { "ok  " } else { "FAIL" };
        lines.push(format!("[{mark}] {}: {}", check.name, check.detail));
    }
    lines.join("\n")
}

fn to_json<T: serde::Serialize>(value: &T) -> anyhow::Result<String> {
    serde_json::to_string_pretty(value).context("failed to encode output")
}

/// Runs `command` against `admin`.
pub async fn run(
    admin: &RotationAdmin<SharedStore>,
    actor: &str,
    command: &AdminCommand,
    json: bool,
) -> anyhow::Result<Outcome> {
    let outcome = match command {
        AdminCommand::Bootstrap => {
            let status = admin.bootstrap(actor).await.context("bootstrap failed")?;
            Outcome::ok(if json { to_json(&status)? } else { render_status(&status) })
        },
        AdminCommand::Status => {
            let status = admin.status(actor).await.context("failed to read the key slot")?;
            Outcome::ok(if json { to_json(&status)? } else { render_status(&status) })
        },
        AdminCommand::Execute { dry_run } => {
            let report = admin.execute(actor, *dry_run).await.context("rotation failed")?;
            Outcome::ok(if json { to_json(&report)? } else { render_rotation(&report) })
        },
        AdminCommand::Verify => {
            let report = admin.verify(actor).await.context("verification failed")?;
            let output = if json { to_json(&report)? } else { render_verification(&report) };
            Outcome { output, success: report.is_healthy() }
        },
        AdminCommand::Purge => {
            let purged = admin.purge(actor).await.context("purge failed")?;
            Outcome::ok(match (json, purged) {
                (true, purged) => to_json(&serde_json::json!({ "purged_kid": purged }))?,
                (false, Some(kid)) => format!("Purged retired key {kid}"),
                (false, None) => "Nothing to purge".to_owned(),
            })
        },
    };
    Ok(outcome)
}
