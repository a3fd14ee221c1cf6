use anyhow::Context;
use clap::{Parser, Subcommand};
use recovery_engine::{ActionLog, RecoveryAction};
use serde_json::Value;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use warden_core::{endpoints, validate_paths, ValidatedFleet, ValidationReport};

const DEFAULT_PLATFORM_URL: &str = "http://localhost:8081";

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Warden CLI - fleet validation, planning and status")]
#[command(version = warden_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check manifests, ports and dependencies without launching anything
    Validate {
        /// Per-host manifest (repeat for each host)
        #[arg(short, long = "manifest", required = true)]
        manifests: Vec<PathBuf>,
    },
    /// Print the batched launch plan
    Plan {
        #[arg(short, long = "manifest", required = true)]
        manifests: Vec<PathBuf>,
        /// Emit the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Live agent health from a running platform
    Status {
        #[arg(long, default_value = DEFAULT_PLATFORM_URL)]
        url: String,
    },
    /// Recovery action log, from a running platform or a journal file
    Actions {
        #[arg(long, default_value = DEFAULT_PLATFORM_URL)]
        url: String,
        /// Read a JSONL journal instead of querying the platform
        #[arg(long)]
        journal: Option<PathBuf>,
        /// Only show actions for this agent
        #[arg(long)]
        agent: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { manifests } => handle_validate(&manifests),
        Commands::Plan { manifests, json } => handle_plan(&manifests, json),
        Commands::Status { url } => handle_status(&url).await,
        Commands::Actions {
            url,
            journal,
            agent,
        } => handle_actions(&url, journal, agent.as_deref()).await,
    }
}

fn handle_validate(manifests: &[PathBuf]) -> anyhow::Result<ExitCode> {
    println!("🔍 Validating {} manifest(s)...", manifests.len());
    let report = validate_paths(manifests);
    print!("{}", render_issues(&report));

    match report.into_validated() {
        Ok(validated) => {
            println!("✅ Fleet of {} agents is valid", validated.fleet.len());
            print!("{}", render_plan(&validated));
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("❌ {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn handle_plan(manifests: &[PathBuf], json: bool) -> anyhow::Result<ExitCode> {
    let report = validate_paths(manifests);
    if !report.is_valid() {
        eprint!("{}", render_issues(&report));
        return Ok(ExitCode::FAILURE);
    }
    let validated = report.into_validated()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&validated.plan)?);
    } else {
        print!("{}", render_plan(&validated));
    }
    Ok(ExitCode::SUCCESS)
}

async fn handle_status(url: &str) -> anyhow::Result<ExitCode> {
    let body = fetch(url, endpoints::API_V1_AGENTS).await?;
    println!("📊 Warden Platform Status ({})", url);
    print!("{}", render_status(&body));
    Ok(ExitCode::SUCCESS)
}

async fn handle_actions(
    url: &str,
    journal: Option<PathBuf>,
    agent: Option<&str>,
) -> anyhow::Result<ExitCode> {
    let mut actions = match journal {
        Some(path) => ActionLog::read_journal(&path)
            .with_context(|| format!("reading journal {}", path.display()))?,
        None => {
            let body = fetch(url, endpoints::API_V1_ACTIONS).await?;
            serde_json::from_value(body["actions"].clone())
                .context("platform returned a malformed action log")?
        }
    };
    if let Some(agent) = agent {
        actions.retain(|action: &RecoveryAction| action.agent.as_str() == agent);
    }
    print!("{}", render_actions(&actions));
    Ok(ExitCode::SUCCESS)
}

async fn fetch(base: &str, path: &str) -> anyhow::Result<Value> {
    let url = format!("{}{}", base.trim_end_matches('/'), path);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("platform not reachable at {}", url))?
        .error_for_status()?;
    Ok(response.json().await?)
}

fn render_issues(report: &ValidationReport) -> String {
    let mut out = String::new();
    for warning in report.warnings() {
        let _ = writeln!(out, "⚠️  {}", warning);
    }
    for issue in &report.errors {
        let _ = writeln!(out, "❌ {}", issue);
    }
    out
}

fn render_plan(validated: &ValidatedFleet) -> String {
    let mut out = String::new();
    for (index, batch) in validated.plan.batches().iter().enumerate() {
        let members: Vec<String> = batch
            .iter()
            .map(|id| match validated.ports.get(id.as_str()) {
                Some(ports) => {
                    format!("{} ({} {}/{})", id, ports.host, ports.service, ports.health)
                }
                None => id.to_string(),
            })
            .collect();
        let _ = writeln!(out, "Batch {}: {}", index + 1, members.join(", "));
    }
    out
}

fn render_status(body: &Value) -> String {
    let mut out = String::new();
    let agents = body["agents"].as_array().cloned().unwrap_or_default();
    if agents.is_empty() {
        out.push_str("No agents reported\n");
        return out;
    }
    for agent in &agents {
        let health = &agent["health"];
        let mut line = format!(
            "{:<24} {:<16} failures={}",
            health["agent"].as_str().unwrap_or("?"),
            health["status"].as_str().unwrap_or("?"),
            health["consecutive_failures"]
        );
        if agent["recovery"]["escalated"].as_bool() == Some(true) {
            line.push_str(" [escalated]");
        }
        if let Some(error) = health["last_error"].as_str() {
            let _ = write!(line, " ({})", error);
        }
        let _ = writeln!(out, "{}", line);
    }
    out
}

fn render_actions(actions: &[RecoveryAction]) -> String {
    let mut out = String::new();
    if actions.is_empty() {
        out.push_str("No recovery actions recorded\n");
        return out;
    }
    for action in actions {
        let _ = writeln!(
            out,
            "{} {:<8} {:<20} delay={}ms {}",
            action.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            action.action,
            action.agent,
            action.delay_ms,
            action.reason
        );
    }
    out
}
