use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use repomirror::config::{env_vars, parse_duration};
use repomirror::logging::init_logging;
use repomirror::{
    AzureDevOpsClient, BitbucketClient, Config, CredentialProvider, EngineOptions,
    EnvTokenProvider, GitCli, HistoryHandle, HistoryService, RepoOutcome, SyncEngine,
    SyncHistoryStore, SyncSummary,
};

#[derive(Parser)]
#[command(name = "repomirror")]
#[command(about = "Mirror Bitbucket repositories to Azure DevOps, branch by branch")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one full sync pass (the default)
    Sync,

    /// List repositories that would be mirrored
    List {
        /// Show clone and destination URLs
        #[arg(long)]
        details: bool,
    },

    /// Show the recorded sync history
    History {
        /// Only show one repository
        #[arg(long)]
        repo: Option<String>,
    },

    /// Run sync passes repeatedly until interrupted
    Watch {
        /// Pause between passes, e.g. 30m, 1h (defaults to sync.watch_interval)
        #[arg(short, long)]
        interval: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Variables already set in the environment win over the file
    let dotenv = dotenvy::dotenv();

    let config = Config::resolve(cli.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&config.logging, cli.verbose)?;
    info!("Starting repomirror v{}", env!("CARGO_PKG_VERSION"));

    match dotenv {
        Ok(path) => debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => warn!("Ignoring malformed .env file: {}", e),
    }

    match cli.command {
        None | Some(Commands::Sync) => cmd_sync(&config).await,
        Some(Commands::List { details }) => cmd_list(details, &config).await,
        Some(Commands::History { repo }) => cmd_history(repo.as_deref(), &config),
        Some(Commands::Watch { interval }) => cmd_watch(interval, &config).await,
    }
}

/// Platform clients and credentials built from validated configuration
struct Platforms {
    bitbucket: Arc<BitbucketClient>,
    azure: Arc<AzureDevOpsClient>,
    source_credentials: Arc<dyn CredentialProvider>,
    destination_credentials: Arc<dyn CredentialProvider>,
}

fn connect(config: &Config) -> Result<Platforms> {
    config.validate()?;

    // validate() guarantees these are set
    let required = |value: &Option<String>| value.clone().unwrap_or_default();

    let source_credentials: Arc<dyn CredentialProvider> = Arc::new(EnvTokenProvider::new(
        required(&config.source.username),
        env_vars::BITBUCKET_PAT,
    ));
    let destination_credentials: Arc<dyn CredentialProvider> =
        Arc::new(EnvTokenProvider::token_only(env_vars::AZURE_PAT));

    // Fail before any work starts if a secret is missing
    source_credentials.credential()?;
    destination_credentials.credential()?;

    let bitbucket = Arc::new(BitbucketClient::new(
        &config.source.api_url,
        required(&config.source.workspace),
        source_credentials.clone(),
    )?);
    let azure = Arc::new(AzureDevOpsClient::new(
        &config.destination.api_url,
        required(&config.destination.organization),
        required(&config.destination.project_id),
        required(&config.destination.project_name),
        destination_credentials.clone(),
    )?);

    Ok(Platforms {
        bitbucket,
        azure,
        source_credentials,
        destination_credentials,
    })
}

fn build_engine(config: &Config) -> Result<(SyncEngine, HistoryHandle)> {
    let platforms = connect(config)?;
    let options = EngineOptions::from_config(config)?;
    let history = HistoryService::spawn(SyncHistoryStore::load(config.history_path()));

    let engine = SyncEngine::new(
        options,
        Arc::new(GitCli::new()),
        platforms.bitbucket,
        platforms.azure,
        history.clone(),
        platforms.source_credentials,
        platforms.destination_credentials,
    );

    Ok((engine, history))
}

/// Run one sync pass
async fn cmd_sync(config: &Config) -> Result<()> {
    let (engine, history) = build_engine(config)?;

    let result = engine.run_once().await;
    history
        .shutdown()
        .await
        .context("Sync history service stopped unexpectedly")?;

    let summary = result?;
    print_summary(&summary);

    // Per-repository failures are in the summary and the log; they do not
    // change the exit status.
    Ok(())
}

/// Run sync passes on an interval until Ctrl+C
async fn cmd_watch(interval: Option<String>, config: &Config) -> Result<()> {
    let period = match interval {
        Some(value) => Duration::from_secs(parse_duration(&value)?),
        None => config.watch_interval()?,
    };
    if period.is_zero() {
        anyhow::bail!("Watch interval must be greater than zero");
    }

    let (engine, history) = build_engine(config)?;
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("Watching with interval {:?} (Ctrl+C to stop)", period);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // Polled first so the handler is installed before the first pass
            biased;

            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }

            _ = timer.tick() => {
                match engine.run_once().await {
                    Ok(summary) => print_summary(&summary),
                    Err(e) => error!("Sync pass failed: {:#}", e),
                }
            }
        }
    }

    let record = history
        .shutdown()
        .await
        .context("Sync history service stopped unexpectedly")?;
    info!("Stopped with {} branches recorded", record.branch_count());
    Ok(())
}

/// List repositories that would be mirrored
async fn cmd_list(details: bool, config: &Config) -> Result<()> {
    let platforms = connect(config)?;
    let options = EngineOptions::from_config(config)?;

    let repositories = repomirror::discovery::discover(
        platforms.bitbucket.as_ref(),
        platforms.azure.as_ref(),
        &options.exclusions,
    )
    .await?;

    println!("Repositories ({}):", repositories.len());

    for repo in repositories {
        if details {
            println!("📁 {}", repo.name);
            println!("   ⬇️  {}", repo.source_clone_url);
            println!("   ⬆️  {}", repo.destination_url);
            if let Some(updated) = repo.last_updated {
                println!("   🕒 Updated: {}", updated.format("%Y-%m-%d %H:%M"));
            }
            println!();
        } else {
            println!("  📁 {}", repo.name);
        }
    }

    Ok(())
}

/// Print the recorded sync history
fn cmd_history(repo: Option<&str>, config: &Config) -> Result<()> {
    let store = SyncHistoryStore::load(config.history_path());
    let record = store.record();

    if record.is_empty() {
        println!("No sync history at {}", store.path().display());
        return Ok(());
    }

    let mut shown = 0;
    for (name, branches) in record.repositories() {
        if repo.is_some_and(|wanted| wanted != name.as_str()) {
            continue;
        }
        shown += 1;
        println!("📁 {}", name);
        for (branch, commit) in branches {
            println!("   {} {}", branch, commit);
        }
    }

    if shown == 0 {
        if let Some(wanted) = repo {
            warn!("No history recorded for {}", wanted);
        }
    }

    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    println!("\n🎉 Sync pass complete");
    println!("   📊 Repositories: {}", summary.total_repositories);
    println!("   ⬆️  Branches pushed: {}", summary.branches_pushed);
    println!("   ✅ Branches up to date: {}", summary.branches_up_to_date);
    println!("   ❌ Branches failed: {}", summary.branches_failed);
    println!("   ⏭️  Branches skipped: {}", summary.branches_skipped);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    if summary.abandoned_repositories > 0 {
        println!("\n🔍 Abandoned repositories:");
        for report in &summary.reports {
            if let RepoOutcome::Abandoned { stage, error } = &report.outcome {
                println!("   ❌ {} ({}): {}", report.name, stage, error);
            }
        }
    }

    let failed: Vec<_> = summary
        .reports
        .iter()
        .flat_map(|report| {
            report
                .branches()
                .iter()
                .filter(|branch| branch.outcome.is_failure())
                .map(move |branch| (report.name.as_str(), branch))
        })
        .collect();

    if !failed.is_empty() {
        println!("\n🔍 Failed branches:");
        for (repository, branch) in failed {
            println!("   ❌ {}:{} {}", repository, branch.name, branch.outcome);
        }
    }
}
