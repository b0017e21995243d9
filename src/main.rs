use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use provisio_config::{OrchestratorConfig, RunOptions, StepDef, TargetDescriptor, load_json};
use provisio_registry::ActionRegistry;
use provisio_run::{BlockInfo, Run, RunStatus, StepStatus};
use provisio_runner::{Orchestrator, OrchestratorError, RejectAction, Resolution};
use provisio_store::SqliteStore;
use provisio_trust::FsTrustStore;

/// Provisio - resumable provisioning runs against a remote host
#[derive(Parser)]
#[command(name = "provisio")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.provisio)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Path to the config file (default: <data-dir>/config.json)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Start a run and follow it until it finishes
  Run {
    /// Path to the steps file (JSON array of {action, label, params})
    steps_file: PathBuf,

    /// Path to the target descriptor (JSON)
    #[arg(long)]
    target: PathBuf,

    /// Seconds to wait after each successful step
    #[arg(long)]
    step_delay: Option<u64>,
  },

  /// Show the most recent run
  Status {
    /// Print the full run as JSON
    #[arg(long)]
    json: bool,
  },

  /// Answer a blocked run and follow it
  Resolve {
    run_id: String,

    /// Do not trust the host; the run is cancelled
    #[arg(long)]
    reject: bool,

    /// With --reject, fail the run instead of cancelling it
    #[arg(long, requires = "reject")]
    fail: bool,
  },

  /// Cancel a run at its next checkpoint
  Cancel { run_id: String },

  /// Delete a finished run
  Clear { run_id: String },

  /// Reconcile runs left behind by a previous process
  Recover,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".provisio"),
  };

  let Some(command) = cli.command else {
    println!("provisio - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run_command(command, data_dir, cli.config).await })
}

async fn run_command(command: Commands, data_dir: PathBuf, config: Option<PathBuf>) -> Result<()> {
  let (orchestrator, registry) = open(&data_dir, config.as_deref()).await?;

  match command {
    Commands::Run {
      steps_file,
      target,
      step_delay,
    } => run(&orchestrator, &registry, &steps_file, &target, step_delay).await,
    Commands::Status { json } => status(&orchestrator, json).await,
    Commands::Resolve {
      run_id,
      reject,
      fail,
    } => {
      let resolution = match (reject, fail) {
        (false, _) => Resolution::accept(),
        (true, false) => Resolution::reject(),
        (true, true) => Resolution::Reject {
          action: RejectAction::Fail,
        },
      };
      let run = orchestrator
        .resolve_block_with(&run_id, resolution)
        .await
        .context("failed to resolve block")?;
      eprintln!("Run {} is {}", run.run_id, run.status);
      follow(&orchestrator, &run_id).await
    }
    Commands::Cancel { run_id } => {
      let run = orchestrator.cancel(&run_id).await.context("failed to cancel run")?;
      if run.status == RunStatus::Cancelled {
        eprintln!("Run {} cancelled", run_id);
      } else {
        eprintln!("Run {} will stop after its current step", run_id);
      }
      Ok(())
    }
    Commands::Clear { run_id } => {
      orchestrator.clear(&run_id).await.context("failed to clear run")?;
      eprintln!("Run {} cleared", run_id);
      Ok(())
    }
    Commands::Recover => {
      let report = orchestrator.recover().await.context("recovery failed")?;
      eprintln!(
        "Recovered: {} failed, {} blocked, {} purged",
        report.failed.len(),
        report.blocked.len(),
        report.purged.len()
      );
      for run_id in &report.blocked {
        eprintln!("  {} is blocked; answer it with `provisio resolve {}`", run_id, run_id);
      }
      Ok(())
    }
  }
}

/// Build an orchestrator over the SQLite store and known-hosts file in
/// `data_dir`, along with the action registry it dispatches to.
async fn open(
  data_dir: &Path,
  config_path: Option<&Path>,
) -> Result<(Orchestrator, Arc<ActionRegistry>)> {
  tokio::fs::create_dir_all(data_dir)
    .await
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

  let default_config = data_dir.join("config.json");
  let config: OrchestratorConfig = match config_path {
    Some(path) => load_json(path).await?,
    None if default_config.exists() => load_json(&default_config).await?,
    None => OrchestratorConfig::default(),
  };

  let database_url = config
    .database_url
    .clone()
    .unwrap_or_else(|| format!("sqlite://{}", data_dir.join("runs.db").display()));
  let store = SqliteStore::connect(&database_url)
    .await
    .with_context(|| format!("failed to open run store: {}", database_url))?;

  let trust = Arc::new(FsTrustStore::new(data_dir.join("known_hosts.json")));
  let registry = Arc::new(ActionRegistry::with_builtins(trust.clone()));

  let orchestrator = Orchestrator::new(Arc::new(store), registry.clone(), trust, config);
  Ok((orchestrator, registry))
}

async fn run(
  orchestrator: &Orchestrator,
  registry: &ActionRegistry,
  steps_file: &Path,
  target_file: &Path,
  step_delay: Option<u64>,
) -> Result<()> {
  let steps: Vec<StepDef> = load_json(steps_file).await?;
  let target: TargetDescriptor = load_json(target_file).await?;
  eprintln!("Loaded {} steps for {}", steps.len(), target.address());

  let unknown: Vec<&str> = steps
    .iter()
    .map(|step| step.action.as_str())
    .filter(|action| !registry.contains(action))
    .collect();
  if !unknown.is_empty() {
    bail!("unknown actions in {}: {}", steps_file.display(), unknown.join(", "));
  }

  orchestrator.purge_expired().await?;

  let options = step_delay.map(|step_delay_secs| RunOptions { step_delay_secs });
  let run_id = match orchestrator.start(steps, target, options).await {
    Ok(run_id) => run_id,
    Err(OrchestratorError::RunAlreadyActive { run_id }) => {
      bail!(
        "run {} is still active; check it with `provisio status` or `provisio recover` after a crash",
        run_id
      );
    }
    Err(e) => return Err(e).context("failed to start run"),
  };

  eprintln!("Started run {}", run_id);
  follow(orchestrator, &run_id).await
}

/// Poll a run until it finishes, printing step transitions and prompting
/// for trust decisions. Ctrl-C requests cancellation and keeps following.
async fn follow(orchestrator: &Orchestrator, run_id: &str) -> Result<()> {
  let interrupt = CancellationToken::new();
  let listener = interrupt.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      listener.cancel();
    }
  });

  let mut seen: HashMap<usize, StepStatus> = HashMap::new();
  let mut cancel_sent = false;
  let poll_interval = orchestrator.config().poll_interval();

  loop {
    let run = orchestrator
      .get_state(Some(run_id))
      .await?
      .with_context(|| format!("run {} is gone", run_id))?;

    print_transitions(&run, &mut seen);

    match run.status {
      RunStatus::Completed => {
        eprintln!("Run {} completed", run_id);
        return Ok(());
      }
      RunStatus::Failed => {
        bail!(
          "run {} failed: {}",
          run_id,
          run.error_message.as_deref().unwrap_or("unknown error")
        );
      }
      RunStatus::Cancelled => bail!("run {} was cancelled", run_id),
      RunStatus::Blocked => {
        if let Some(info) = &run.block_info {
          let resolution = prompt_trust(info).await?;
          orchestrator
            .resolve_block_with(run_id, resolution)
            .await
            .context("failed to resolve block")?;
        }
        continue;
      }
      RunStatus::Pending | RunStatus::Running => {}
    }

    tokio::select! {
      _ = tokio::time::sleep(poll_interval) => {}
      _ = interrupt.cancelled(), if !cancel_sent => {
        eprintln!("Cancelling after the current step...");
        orchestrator.cancel(run_id).await.context("failed to cancel run")?;
        cancel_sent = true;
      }
    }
  }
}

fn print_transitions(run: &Run, seen: &mut HashMap<usize, StepStatus>) {
  let total = run.steps.len();

  for (index, step) in run.steps.iter().enumerate() {
    if seen.get(&index) == Some(&step.status) {
      continue;
    }
    seen.insert(index, step.status);

    let position = format!("[{}/{}]", index + 1, total);
    match step.status {
      StepStatus::Pending => {}
      StepStatus::InProgress => eprintln!("{} {} ...", position, step.label),
      StepStatus::Completed => match &step.completion_note {
        Some(note) => eprintln!("{} {} done ({})", position, step.label, note),
        None => eprintln!("{} {} done", position, step.label),
      },
      StepStatus::Failed => eprintln!(
        "{} {} failed: {}",
        position,
        step.label,
        step.error.as_deref().unwrap_or("unknown error")
      ),
    }
  }
}

async fn prompt_trust(info: &BlockInfo) -> Result<Resolution> {
  eprintln!();
  eprintln!("Host {}:{} needs verification ({})", info.host, info.port, info.reason.as_str());
  if let Some(message) = &info.message {
    eprintln!("  {}", message);
  }
  for fingerprint in &info.fingerprints {
    eprintln!("  {}", fingerprint);
  }
  eprint!("Trust this host? [y/N] ");
  io::stderr().flush()?;

  let answer = tokio::task::spawn_blocking(|| {
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).map(|_| line)
  })
  .await?
  .context("failed to read answer from stdin")?;

  let accept = matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes");
  Ok(Resolution::from(accept))
}

async fn status(orchestrator: &Orchestrator, json: bool) -> Result<()> {
  orchestrator.purge_expired().await?;
  let run = orchestrator.get_state(None).await?;

  if json {
    println!("{}", serde_json::to_string_pretty(&run)?);
    return Ok(());
  }

  let Some(run) = run else {
    println!("No runs");
    return Ok(());
  };

  let summary = run.summary();
  println!("Run:    {}", summary.run_id);
  println!("Status: {}", summary.status);
  println!("Target: {}", run.target.address());
  println!("Step:   {}/{}", summary.current_step, summary.total_steps);
  if let Some(error) = &run.error_message {
    println!("Error:  {}", error);
  }
  if let Some(info) = &run.block_info {
    println!(
      "Blocked: {} for {}:{}",
      info.reason.as_str(),
      info.host,
      info.port
    );
  }
  println!();
  for (index, step) in run.steps.iter().enumerate() {
    println!("  {:>2}. {:<12} {}", index + 1, step.status.as_str(), step.label);
  }

  Ok(())
}
