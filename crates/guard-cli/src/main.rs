//! Command-line adapter for guard.
//!
//! The upgrade driver itself is wired together with deployment-specific
//! provider adapters; this binary covers the operator-facing plumbing that
//! needs no cloud access: validating `guard.toml`, showing the batch plan,
//! and reporting fleet status from an exported record set.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use guard::config::GuardConfig;
use guard::registry::ClusterRegistry;
use guard::store::MemoryStateStore;
use guard::types::{ClusterRecord, ClusterStatus};

#[derive(Parser)]
#[command(name = "guard", version, about = "Progressive service-mesh upgrades over GitOps")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "guard.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the configuration, then print a summary.
    ValidateConfig,

    /// Show a batch's clusters and its prerequisite gate.
    Plan {
        /// Batch to plan; omit to list every configured batch.
        #[arg(long)]
        batch: Option<String>,
    },

    /// Report cluster statuses from an exported record set (JSON array).
    ///
    /// Exits non-zero when any cluster sits in a failed terminal status.
    Status {
        /// Path to the exported cluster records.
        #[arg(long)]
        records: PathBuf,

        /// Only report clusters of this batch.
        #[arg(long)]
        batch: Option<String>,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::ValidateConfig => {
            let config = GuardConfig::from_file(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            print!("{}", render_config_summary(&config));
            Ok(ExitCode::SUCCESS)
        }
        Command::Plan { batch } => {
            let config = GuardConfig::from_file(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            print!("{}", render_plan(&config, batch.as_deref())?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { records, batch } => {
            let content = std::fs::read_to_string(&records)
                .with_context(|| format!("reading {}", records.display()))?;
            let records: Vec<ClusterRecord> =
                serde_json::from_str(&content).context("parsing cluster records")?;

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("starting runtime")?;
            let (report, healthy) = runtime.block_on(status_report(records, batch.as_deref()))?;
            print!("{report}");

            Ok(if healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn render_config_summary(config: &GuardConfig) -> String {
    let mut out = String::new();
    out.push_str("configuration OK\n");
    out.push_str(&format!(
        "  execution: {} parallel clusters, soak {}, merge wait {}\n",
        config.execution.max_parallel_clusters,
        humantime::format_duration(config.execution.soak_window),
        humantime::format_duration(config.execution.mr_merge_wait),
    ));
    out.push_str(&format!(
        "  lock: lease {}, renewed every {}\n",
        humantime::format_duration(config.lock.lease),
        humantime::format_duration(config.lock.renew_interval),
    ));
    out.push_str(&format!(
        "  control plane: {}/{}\n",
        config.control_plane.namespace, config.control_plane.deployment,
    ));
    out.push_str(&format!(
        "  rate limits: {} bucket(s); batches: {}\n",
        config.rate_limits.len(),
        config.batches.len(),
    ));
    out
}

fn render_plan(config: &GuardConfig, batch: Option<&str>) -> Result<String> {
    let mut out = String::new();

    let selected: Vec<_> = match batch {
        Some(name) => {
            let batch = config
                .batch(name)
                .with_context(|| format!("batch '{name}' is not configured"))?;
            vec![batch]
        }
        None => config.batches.iter().collect(),
    };

    for batch in selected {
        out.push_str(&format!("batch {}", batch.name));
        if !batch.description.is_empty() {
            out.push_str(&format!(" - {}", batch.description));
        }
        out.push('\n');

        match config.batch_order.get(&batch.name) {
            Some(prerequisites) if !prerequisites.is_empty() => {
                out.push_str(&format!(
                    "  requires healthy: {}\n",
                    prerequisites.join(", ")
                ));
            }
            _ => out.push_str("  no prerequisite batches\n"),
        }

        for cluster in &batch.clusters {
            out.push_str(&format!("  - {cluster}\n"));
        }
    }
    Ok(out)
}

async fn status_report(
    records: Vec<ClusterRecord>,
    batch: Option<&str>,
) -> Result<(String, bool)> {
    let registry = ClusterRegistry::new(Arc::new(MemoryStateStore::with_records(records)));
    let clusters = registry
        .list(batch, None)
        .await
        .context("listing clusters")?;

    let mut out = String::new();
    let mut all_ok = true;
    for cluster in &clusters {
        let marker = match cluster.status {
            ClusterStatus::Healthy => "ok",
            ClusterStatus::PreCheckFailed | ClusterStatus::FailedUpgradeRolledBack => {
                all_ok = false;
                "FAILED"
            }
            _ => "...",
        };
        out.push_str(&format!(
            "{:<8} {:<24} {:<28} {} -> {}\n",
            marker,
            cluster.cluster_id,
            cluster.status,
            cluster.current_version,
            cluster.target_version.as_deref().unwrap_or("-"),
        ));
    }
    out.push_str(&format!(
        "{} cluster(s), {} reported\n",
        clusters.len(),
        if all_ok { "all healthy or in flight" } else { "failures" },
    ));
    Ok((out, all_ok))
}
