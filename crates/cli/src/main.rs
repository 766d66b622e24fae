use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_apply::DiffSummary;
use keel_core::{ChangeSet, Instance, ObjectId, PruneOrdering, ReconcileConfig};
use keel_inventory::{entry_rank, InventoryStore};
use keel_kubehub::KubeCluster;
use keel_persist::{Journal, RunRecord, SqliteJournal};
use keel_reconcile::{ManifestBuilder, Mode, ObjectBuilder, Reconciler, Request, RunReport, Step};
use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Apply, prune and track Kubernetes objects per instance")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Instance namespace
    #[arg(short = 'n', long = "namespace", global = true, env = "KEEL_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Run deadline, e.g. 90s, 5m (default: KEEL_TIMEOUT_SECS or 5m)
    #[arg(long = "timeout", global = true, value_parser = parse_timeout)]
    timeout: Option<Duration>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install or upgrade an instance from a local module
    #[command(visible_aliases = ["install", "upgrade"])]
    Apply {
        /// Instance name (DNS-1123 label)
        name: String,
        /// Manifest file or directory
        module: String,
        /// Module version recorded in the inventory
        #[arg(long = "version")]
        version: Option<String>,
        /// Values overlays, merged in order
        #[arg(short = 'f', long = "values")]
        values: Vec<PathBuf>,
        /// Server-side apply dry run; nothing is written
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Dry run and print unified diffs of configured objects
        #[arg(long = "diff", action = ArgAction::SetTrue)]
        diff: bool,
        /// Wait for applied objects to become ready and pruned ones to go away
        #[arg(long = "wait", action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true", default_value_t = true)]
        wait: bool,
        /// Registry credentials, <username>[:<password>]
        #[arg(long = "creds", env = "KEEL_CREDS", hide_env_values = true)]
        creds: Option<String>,
        /// persist-first (default) or prune-first
        #[arg(long = "prune-order")]
        prune_order: Option<PruneOrdering>,
    },
    /// Print the stored inventory of an instance
    Inventory {
        name: String,
    },
    /// Print recorded runs of an instance, newest first
    History {
        name: String,
        #[arg(long = "limit", default_value_t = 10)]
        limit: usize,
    },
}

/// Logs go to stderr so `-o json` output stays parseable.
fn init_tracing() {
    let filter = std::env::var("KEEL_LOG")
        .ok()
        .and_then(|v| tracing_subscriber::EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Prometheus endpoint for run metrics, only when `KEEL_METRICS_ADDR` is set.
fn init_metrics() {
    let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") else { return };
    let res = addr
        .parse::<std::net::SocketAddr>()
        .map_err(|e| e.to_string())
        .and_then(|sock| metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install().map_err(|e| e.to_string()));
    match res {
        Ok(()) => info!(%addr, "metrics exporter listening"),
        Err(e) => warn!(%addr, error = %e, "metrics exporter not started"),
    }
}

fn parse_timeout(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, "s"),
    };
    let n: u64 = num.parse().map_err(|_| format!("invalid duration: {}", s))?;
    let scale = match unit {
        "ms" => return Ok(Duration::from_millis(n)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return Err(format!("invalid duration unit in {} (expect ms, s, m or h)", s)),
    };
    n.checked_mul(scale).map(Duration::from_secs).ok_or_else(|| format!("duration too large: {}", s))
}

fn validate_name(name: &str) -> Result<()> {
    let re = regex::Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$")?;
    if name.len() > 63 || !re.is_match(name) {
        bail!("invalid instance name {:?}: must be a DNS-1123 label (lowercase alphanumerics and '-', at most 63 chars)", name);
    }
    Ok(())
}

fn journal_enabled() -> bool {
    !std::env::var("KEEL_DISABLE_JOURNAL").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

/// Best effort: a journal failure never fails the run.
fn record_run(instance: &Instance, source: &str, version: &str, outcome: &str, changes: ChangeSet) {
    if !journal_enabled() {
        return;
    }
    let res = SqliteJournal::open_default().and_then(|j| j.record(&RunRecord::new(instance, source, version, outcome, changes)));
    if let Err(e) = res {
        counter!("journal_err", 1u64);
        warn!(error = %e, "journal write failed; continuing");
    }
}

#[derive(Serialize)]
struct FieldChanges<'a> {
    id: &'a ObjectId,
    #[serde(flatten)]
    counts: DiffSummary,
}

#[derive(Serialize)]
struct ApplyOutput<'a> {
    instance: &'a str,
    namespace: &'a str,
    steps: &'a [Step],
    applied: &'a ChangeSet,
    stale: &'a [ObjectId],
    pruned: &'a ChangeSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    diff: Option<Vec<&'a str>>,
    /// Field counts of configured objects, dry runs only.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    summaries: Vec<FieldChanges<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_step: Option<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn apply_output<'a>(instance: &'a Instance, report: &'a RunReport, failure: Option<(Step, String)>) -> ApplyOutput<'a> {
    ApplyOutput {
        instance: &instance.name,
        namespace: &instance.namespace,
        steps: &report.steps,
        applied: &report.applied,
        stale: &report.stale,
        pruned: &report.pruned,
        diff: report.diff.as_ref().map(|d| d.lines.iter().map(String::as_str).collect()),
        summaries: report
            .diff
            .iter()
            .flat_map(|d| d.summaries.iter())
            .map(|(id, counts)| FieldChanges { id, counts: *counts })
            .collect(),
        failed_step: failure.as_ref().map(|(s, _)| *s),
        error: failure.map(|(_, e)| e),
    }
}

fn print_report(output: Output, instance: &Instance, report: &RunReport, failure: Option<(Step, String)>) -> Result<()> {
    match output {
        Output::Human => {
            if let Some(diff) = &report.diff {
                print!("{}", diff.render());
                for (id, counts) in &diff.summaries {
                    println!("{} fields: {}", id, counts);
                }
                for (id, why) in &diff.skipped {
                    eprintln!("{} dry run failed: {}", id, why);
                }
            }
            for entry in report.applied.iter().chain(report.pruned.iter()) {
                println!("{}", entry);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&apply_output(instance, report, failure))?),
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_apply(
    cli_output: Output,
    cfg: ReconcileConfig,
    instance: Instance,
    module: String,
    version: Option<String>,
    values: Vec<PathBuf>,
    mode: Mode,
    creds: Option<String>,
) -> Result<()> {
    if creds.is_some() {
        warn!("--creds is only used for remote modules; ignoring");
    }
    info!(module = %module, "building");
    let objects = ManifestBuilder::new(module.clone(), instance.namespace.clone())
        .with_values(values)
        .build()
        .context("failed to build instance")?;

    let cluster = KubeCluster::try_default().await?;
    let version = version.unwrap_or_default();
    let req = Request { instance: instance.clone(), source: module.clone(), version: version.clone(), objects };
    let res = Reconciler::new(&cluster, &cfg).run(req, mode).await;
    let journal = mode == Mode::Apply;

    match res {
        Ok(report) => {
            if journal {
                record_run(&instance, &module, &version, "ok", report.changes());
            }
            print_report(cli_output, &instance, &report, None)?;
            if cfg.wait && journal && cli_output == Output::Human {
                println!("all resources are ready");
            }
            Ok(())
        }
        Err(failure) => {
            if journal {
                record_run(&instance, &module, &version, &failure.to_string(), failure.report.changes());
            }
            print_report(cli_output, &instance, &failure.report, Some((failure.step, failure.error.to_string())))?;
            Err(anyhow!(failure))
        }
    }
}

/// Coarse age of a journal row, two units at most.
fn render_age(ts: i64, now: i64) -> String {
    if ts <= 0 {
        return "-".to_string();
    }
    let secs = (now - ts).max(0);
    match (secs / 86_400, secs / 3600 % 24, secs / 60 % 60) {
        (0, 0, 0) => format!("{}s", secs),
        (0, 0, m) => format!("{}m", m),
        (0, h, m) => format!("{}h{}m", h, m),
        (d, h, _) => format!("{}d{}h", d, h),
    }
}

fn summarize(changes: &ChangeSet) -> String {
    use keel_core::Action::*;
    let parts: Vec<String> = [Created, Configured, Unchanged, Deleted, Skipped]
        .into_iter()
        .filter_map(|a| match changes.count(a) { 0 => None, n => Some(format!("{} {}", n, a)) })
        .collect();
    if parts.is_empty() { "-".to_string() } else { parts.join(", ") }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Apply { name, module, version, values, dry_run, diff, wait, creds, prune_order } => {
            validate_name(&name)?;
            let mut cfg = ReconcileConfig::from_env().with_wait(wait);
            if let Some(t) = cli.timeout {
                cfg = cfg.with_timeout(t);
            }
            if let Some(order) = prune_order {
                cfg = cfg.with_prune_ordering(order);
            }
            let mode = if dry_run || diff { Mode::DryRun { detailed: diff } } else { Mode::Apply };
            let instance = Instance::new(name, cli.namespace.clone());
            info!(instance = %instance, ?mode, "apply invoked");
            run_apply(cli.output, cfg, instance, module, version, values, mode, creds).await?;
        }
        Commands::Inventory { name } => {
            validate_name(&name)?;
            let instance = Instance::new(name, cli.namespace.clone());
            let cfg = ReconcileConfig::from_env();
            let cluster = KubeCluster::try_default().await?;
            let store = InventoryStore::new(&cluster, &cfg.owner);
            let Some(mut inv) = store.load(&instance).await? else {
                bail!("no inventory for {}", instance);
            };
            inv.entries.sort_by(|a, b| (entry_rank(a), &a.id).cmp(&(entry_rank(b), &b.id)));
            match cli.output {
                Output::Human => {
                    println!("source: {}  version: {}", inv.source, if inv.version.is_empty() { "-" } else { inv.version.as_str() });
                    println!("{:<48} VERSION", "ID");
                    for e in &inv.entries {
                        println!("{:<48} {}", e.id, e.v);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&inv)?),
            }
        }
        Commands::History { name, limit } => {
            validate_name(&name)?;
            let instance = Instance::new(name, cli.namespace.clone());
            let journal = SqliteJournal::open_default()?;
            let rows = journal.history(&instance, Some(limit))?;
            let now = keel_persist::now_ts();
            match cli.output {
                Output::Human => {
                    println!("{:<8} {:<36} {:<12} {:<24} CHANGES", "AGE", "RUN", "VERSION", "OUTCOME");
                    for r in &rows {
                        let version = if r.version.is_empty() { "-" } else { r.version.as_str() };
                        println!("{:<8} {:<36} {:<12} {:<24} {}", render_age(r.ts, now), r.run_id, version, r.outcome, summarize(&r.changes));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
    }

    Ok(())
}
