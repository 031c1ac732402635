//! Tryout CLI entry point.
//!
//! Provides `migrate`, `start`, `verify`, `status` and `run` subcommands for
//! preparing the database, granting an attempt, checking a token, inspecting
//! a session and driving a session's countdown.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use tryout::access::audit::AuditLog;
use tryout::access::{AccessError, AccessGate};
use tryout::config::{self, Config, RuntimePaths};
use tryout::credentials::{self, Credentials};
use tryout::runtime::{run_countdown, CountdownExit, ExamRuntime};
use tryout::session::SessionService;
use tryout::storage::sqlite::SqliteStore;
use tryout::token::TokenSigner;

/// Tryout: quota-gated timed attempt engine.
#[derive(Parser)]
#[command(name = "tryout", version, about)]
struct Cli {
    /// Config file to use instead of `~/.tryout/config.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Create or upgrade the database schema.
    Migrate,
    /// Check access, charge quota and mint an access token.
    Start {
        /// User starting the attempt.
        #[arg(long)]
        user: i64,
        /// Tryout to attempt.
        #[arg(long)]
        tryout: i64,
    },
    /// Verify a token against a route's tryout.
    Verify {
        /// Token to check.
        token: String,
        /// Tryout of the route being entered.
        #[arg(long)]
        tryout: i64,
        /// Treat the token as a submission token.
        #[arg(long)]
        submission: bool,
    },
    /// Print a session as JSON.
    Status {
        /// Session identifier.
        session: String,
    },
    /// Load a session and run its countdown until expiry or Ctrl-C.
    Run {
        /// Session identifier.
        session: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = config::runtime_paths()?;
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => config::load_default_config()?,
    };

    match cli.command {
        Command::Migrate => handle_migrate(&config, &paths).await,
        Command::Start { user, tryout } => handle_start(&config, &paths, user, tryout).await,
        Command::Verify {
            token,
            tryout,
            submission,
        } => handle_verify(&config, &paths, &token, tryout, submission),
        Command::Status { session } => handle_status(&config, &paths, &session).await,
        Command::Run { session } => handle_run(&config, &paths, session).await,
    }
}

/// Open the database, applying the schema.
async fn handle_migrate(config: &Config, paths: &RuntimePaths) -> anyhow::Result<()> {
    tryout::logging::init_cli();
    let db_path = config.database_path(paths);
    SqliteStore::open(&db_path).await?;
    println!("schema applied: {}", db_path.display());
    Ok(())
}

/// Run the gate for one user and print the granted token.
async fn handle_start(
    config: &Config,
    paths: &RuntimePaths,
    user_id: i64,
    tryout_id: i64,
) -> anyhow::Result<()> {
    tryout::logging::init_cli();
    let signer = Arc::new(load_signer(config, paths)?);
    let store = Arc::new(SqliteStore::open(&config.database_path(paths)).await?);
    let (audit, writer) = AuditLog::spawn(store.clone(), config.audit.channel_capacity);

    let gate = AccessGate::new(store.clone(), store.clone(), signer, audit);
    let outcome = gate.start_attempt(tryout_id, user_id).await;

    // Flush the access log before exiting.
    drop(gate);
    if let Err(e) = writer.await {
        warn!(error = %e, "audit writer did not shut down cleanly");
    }

    match outcome {
        Ok(grant) => {
            println!("attempt: {}", grant.attempt_number);
            if let Some(package) = grant.user_package_id {
                println!("charged package: {package}");
            }
            println!("token: {}", grant.token);
            info!(
                user_id,
                tryout_id,
                token = %tryout::token::fingerprint(&grant.token),
                "access token issued"
            );
            Ok(())
        }
        Err(AccessError::Denied(reason)) => anyhow::bail!("access denied: {reason}"),
        Err(e) => Err(e).context("failed to start attempt"),
    }
}

/// Verify a token offline and print its claims.
fn handle_verify(
    config: &Config,
    paths: &RuntimePaths,
    token: &str,
    tryout_id: i64,
    submission: bool,
) -> anyhow::Result<()> {
    tryout::logging::init_cli();
    let signer = load_signer(config, paths)?;
    let claims = if submission {
        serde_json::to_string_pretty(&signer.verify_submission_for_tryout(token, tryout_id)?)?
    } else {
        serde_json::to_string_pretty(&signer.verify_for_tryout(token, tryout_id)?)?
    };
    println!("{claims}");
    Ok(())
}

/// Print one session.
async fn handle_status(
    config: &Config,
    paths: &RuntimePaths,
    session_id: &str,
) -> anyhow::Result<()> {
    tryout::logging::init_cli();
    let store = SqliteStore::open(&config.database_path(paths)).await?;
    let session = tryout::storage::SessionStore::fetch_session(&store, session_id)
        .await?
        .with_context(|| format!("session {session_id} not found"))?;
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

/// Drive a session's countdown with production logging.
async fn handle_run(
    config: &Config,
    paths: &RuntimePaths,
    session_id: String,
) -> anyhow::Result<()> {
    let _logging_guard = tryout::logging::init_production(&paths.logs_dir)?;
    let signer = Arc::new(load_signer(config, paths)?);
    let store = Arc::new(SqliteStore::open(&config.database_path(paths)).await?);
    let (audit, writer) = AuditLog::spawn(store.clone(), config.audit.channel_capacity);

    let sessions = SessionService::new(store, signer, audit, config.runtime.submit_grace());
    let runtime = ExamRuntime::new(session_id, sessions, &config.runtime);
    runtime.load().await.context("failed to load session")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let exit = run_countdown(runtime.clone(), config.runtime.tick(), shutdown_rx).await;
    if exit == CountdownExit::Shutdown {
        runtime.leave().await;
    } else {
        runtime.settle().await;
    }
    info!(
        ?exit,
        phase = ?runtime.phase(),
        remaining = runtime.time_remaining(),
        "run finished"
    );
    if let Some(result) = runtime.result() {
        println!("submitted: {}", result.submission_token);
    }

    drop(runtime);
    if let Err(e) = writer.await {
        warn!(error = %e, "audit writer did not shut down cleanly");
    }
    Ok(())
}

/// Load the signing secret and build a signer.
fn load_signer(config: &Config, paths: &RuntimePaths) -> anyhow::Result<TokenSigner> {
    let credentials = if paths.env_file.exists() {
        credentials::load_default_credentials()?
    } else {
        Credentials::from_map(std::env::vars().collect())
    };
    TokenSigner::from_config(&config.tokens, &credentials)
        .with_context(|| format!("failed to load signing secret {}", config.tokens.secret_env))
}
