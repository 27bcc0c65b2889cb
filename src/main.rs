use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use imapmigrate::accounts::{load_account_list, resolve_accounts};
use imapmigrate::cancel::signals;
use imapmigrate::credentials::CredentialManager;
use imapmigrate::runlog::RunLog;
use imapmigrate::{
    Config, FolderMap, ImapConnector, JobOutcome, Scheduler, SqliteTrackingStore, TrackingStore,
};

/// Migrates IMAP mailboxes between two servers, resumably
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to config file
    #[clap(short, long, default_value = "~/.config/imapmigrate/config.json")]
    config: String,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the migration
    Sync {
        /// Maximum number of accounts migrated concurrently
        #[clap(short, long, default_value = "4")]
        workers: usize,

        /// Only migrate these accounts (canonical ids)
        accounts: Vec<String>,
    },

    /// Show migration progress per account
    Status {
        /// Only show these accounts (canonical ids)
        accounts: Vec<String>,
    },

    /// List the accounts from the account list with their resolved logins
    Accounts,

    /// Store a server password in the system keyring
    SetPassword {
        /// Which server the login belongs to
        #[clap(long, value_parser = ["source", "destination"])]
        server: String,

        /// Login name (user login or admin username)
        #[clap(long)]
        login: String,

        /// Password to store
        #[clap(long)]
        password: String,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<ExitCode> {
    if let Commands::SetPassword {
        server,
        login,
        password,
    } = &args.command
    {
        CredentialManager::new().store_password(server, login, password)?;
        println!("Password stored for {} on the {} server.", login, server);
        return Ok(ExitCode::SUCCESS);
    }

    let config_path = shellexpand::tilde(&args.config).into_owned();
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    let accounts_path = config.accounts_path();
    let lines = load_account_list(&accounts_path)
        .with_context(|| format!("Failed to load account list {}", accounts_path.display()))?;

    match args.command {
        Commands::Sync { workers, accounts } => sync(&config, &lines, workers, accounts),
        Commands::Status { accounts } => {
            let store = open_store(&config, 1)?;
            let only = restriction(accounts);
            for line in &lines {
                if !only.as_ref().map_or(true, |ids| ids.contains(&line.canonical_id)) {
                    continue;
                }
                let done = store.is_done(&line.canonical_id)?;
                let migrated = store.migrated_count(&line.canonical_id)?;
                println!(
                    "{:<24} {:<8} {} messages",
                    line.canonical_id,
                    if done { "done" } else { "pending" },
                    migrated
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Accounts => {
            println!("Accounts in {}:", accounts_path.display());
            for line in &lines {
                println!(
                    "{}: {} -> {}",
                    line.canonical_id,
                    config.source.login_for(&line.source_user),
                    config.destination.login_for(&line.destination_user)
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::SetPassword { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn sync(
    config: &Config,
    lines: &[imapmigrate::accounts::AccountListLine],
    workers: usize,
    restrict: Vec<String>,
) -> Result<ExitCode> {
    if workers == 0 {
        bail!("--workers must be at least 1");
    }

    let run_log = Arc::new(match config.run_log_pattern() {
        Some(pattern) => RunLog::create(&pattern, "imapsync").context("Failed to create run log")?,
        None => RunLog::sink(),
    });
    if let Some(path) = run_log.path() {
        log::info!("Writing run log to {}", path.display());
    }

    let accounts = resolve_accounts(config, lines, &CredentialManager::new())
        .context("Failed to resolve account credentials")?;
    let store = open_store(config, workers)?;

    let folder_map = match &config.folder_map {
        Some(rules) => FolderMap::new(rules.clone()),
        None => FolderMap::default(),
    };

    let scheduler = Scheduler::new(
        workers,
        store,
        Arc::new(ImapConnector),
        folder_map,
        run_log.clone(),
    );

    let on_signal = scheduler.clone();
    signals::on_termination_signal(move || on_signal.request_shutdown())
        .context("Failed to install signal handlers")?;

    let only = restriction(restrict);
    let stats = scheduler.schedule(&accounts, only.as_ref())?;
    scheduler.wait_for_drain();

    let summaries = scheduler.summaries();
    let mut failed = 0;
    let mut interrupted = 0;
    for summary in &summaries {
        let outcome = match &summary.outcome {
            JobOutcome::Completed => "completed".to_string(),
            JobOutcome::Interrupted => {
                interrupted += 1;
                "interrupted".to_string()
            }
            JobOutcome::Failed(reason) => {
                failed += 1;
                format!("failed: {}", reason)
            }
        };
        println!(
            "{:<24} copied {:>6} skipped {:>6} {:>8.1}s  {}",
            summary.account_id,
            summary.copied,
            summary.skipped,
            summary.elapsed.as_secs_f64(),
            outcome
        );
    }

    run_log.info(&format!(
        "MAIN: Done. {} scheduled, {} already done, {} failed, {} interrupted, peak {} workers",
        stats.scheduled,
        stats.already_done,
        failed,
        interrupted,
        scheduler.peak_workers()
    ));

    if failed > 0 || interrupted > 0 || stats.rejected > 0 {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn open_store(config: &Config, workers: usize) -> Result<Arc<SqliteTrackingStore>> {
    let path = config.tracking_store_path();
    let store = SqliteTrackingStore::open(&path, config.tracking_store_connections(workers))
        .with_context(|| format!("Failed to open tracking store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn restriction(accounts: Vec<String>) -> Option<HashSet<String>> {
    if accounts.is_empty() {
        None
    } else {
        Some(accounts.into_iter().collect())
    }
}
