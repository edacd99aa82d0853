//! reconcile: inspect teardown manifests offline
//!
//! Loads a teardown manifest, then prints the dependency-ordered plan or
//! validates the kind declarations. Never contacts a control plane.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use reconcile_engine::config::Manifest;
use reconcile_engine::teardown::TeardownPlan;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "reconcile")]
#[command(about = "Plan and validate dependency-ordered resource teardown")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the teardown order for the resources in a manifest
    Plan {
        /// Path to the teardown manifest (TOML)
        #[arg(short, long, env = "RECONCILE_MANIFEST")]
        manifest: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Validate kind dependencies (cycle check)
    Check {
        /// Path to the teardown manifest (TOML)
        #[arg(short, long, env = "RECONCILE_MANIFEST")]
        manifest: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
}

fn main() {
    if let Err(e) = run() {
        print_error(&e);
        std::process::exit(1);
    }
}

/// Print error in a user-friendly way
fn print_error(e: &anyhow::Error) {
    use std::io::Write;

    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "\n\x1b[1;31mError:\x1b[0m {e}");

    let mut source = e.source();
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  \x1b[33mCaused by:\x1b[0m {cause}");
        source = cause.source();
    }

    if std::env::var("RUST_BACKTRACE").is_err() {
        let _ = writeln!(
            stderr,
            "\n\x1b[2mSet RUST_BACKTRACE=1 for a detailed backtrace\x1b[0m"
        );
    } else {
        let backtrace = e.backtrace();
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            let _ = writeln!(stderr, "\n\x1b[2mBacktrace:\x1b[0m\n{backtrace}");
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Plan { manifest, format } => handle_plan(manifest, format),
        Command::Check { manifest, format } => handle_check(manifest, format),
    }
}

fn load(path: &Path) -> Result<Manifest> {
    let manifest = Manifest::load(path)
        .with_context(|| format!("loading manifest {}", path.display()))?;
    info!(
        path = %path.display(),
        kinds = manifest.kinds.len(),
        resources = manifest.resources.len(),
        "Loaded manifest"
    );
    Ok(manifest)
}

/// Handle the plan command
fn handle_plan(path: PathBuf, format: OutputFormat) -> Result<()> {
    let manifest = load(&path)?;
    let plan = manifest.plan().context("planning teardown")?;

    if plan.is_empty() {
        println!("No resources to tear down.");
        return Ok(());
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&plan_json(&plan))?);
        }
        OutputFormat::Table => print_plan_table(&plan),
    }
    Ok(())
}

fn plan_json(plan: &TeardownPlan) -> serde_json::Value {
    let steps: Vec<_> = plan
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let handle = &step.handle;
            serde_json::json!({
                "step": i,
                "kind": handle.id.kind,
                "id": handle.id.id,
                "after": step.after,
                "transitions": handle
                    .transitions
                    .iter()
                    .map(|t| serde_json::json!({
                        "operation": t.operation,
                        "target_states": t.wait.target_states,
                        "timeout_secs": t.wait.timeout.as_secs(),
                    }))
                    .collect::<Vec<_>>(),
                "delete_operation": handle.delete_operation,
            })
        })
        .collect();
    serde_json::json!({ "steps": steps })
}

fn print_plan_table(plan: &TeardownPlan) {
    println!(
        "{:<5} {:<35} {:<25} {:<12} {:<30}",
        "STEP", "KIND", "ID", "AFTER", "PIPELINE"
    );
    println!("{}", "-".repeat(110));
    for (i, step) in plan.steps.iter().enumerate() {
        let handle = &step.handle;
        let after = if step.after.is_empty() {
            "-".to_string()
        } else {
            step.after
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        let pipeline = handle
            .transitions
            .iter()
            .map(|t| t.operation.as_str())
            .chain(std::iter::once(handle.delete_operation.as_str()))
            .collect::<Vec<_>>()
            .join(" -> ");
        println!(
            "{:<5} {:<35} {:<25} {:<12} {:<30}",
            i,
            handle.id.kind,
            truncate(&handle.id.id, 24),
            after,
            pipeline
        );
    }
    println!("\nTotal: {} resources", plan.len());
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    } else {
        s.to_string()
    }
}

/// Handle the check command
fn handle_check(path: PathBuf, format: OutputFormat) -> Result<()> {
    let manifest = load(&path)?;
    manifest.check().context("dependency check failed")?;

    let edges: usize = manifest.kinds.iter().map(|k| k.after.len()).sum();
    match format {
        OutputFormat::Json => {
            let out = serde_json::json!({
                "ok": true,
                "kinds": manifest.kinds.len(),
                "dependencies": edges,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!(
                "OK: {} kinds, {} dependencies, no cycles",
                manifest.kinds.len(),
                edges
            );
        }
    }
    Ok(())
}
