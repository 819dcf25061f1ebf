//! cdp-bootstrap CLI
//!
//! Inspect and repair the launch entries of a host application so it always
//! starts with its remote-debugging port, and run the start-up pass by hand.
//!
//! Usage:
//!   cdp-bootstrap probe                 # Is the debug port answering?
//!   cdp-bootstrap locate                # List launch entries
//!   cdp-bootstrap heal                  # Add the flag to every entry
//!   cdp-bootstrap relaunch --yes        # Relaunch the host with the flag
//!   cdp-bootstrap bootstrap             # Run the start-up pass
//!   cdp-bootstrap lock                  # Show the instance lock
//!   cdp-bootstrap reset                 # Ask about setup again next time

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cdp_bootstrap::{
    create_environment, FileStore, HostApp, KeyValueStore, LaunchEntry, OrchestratorConfig,
    PortProber, RelaunchAction, RelaunchOutcome, RepairReport, Session, SystemProcess,
};
use clap::{Parser, Subcommand};
use colored::*;
use serde::Serialize;
use tracing::info;

mod logging;
mod terminal;

use terminal::{EndpointDriver, TerminalShell};

#[derive(Parser)]
#[command(name = "cdp-bootstrap")]
#[command(about = "Keep a host application launching with its remote-debugging port")]
#[command(
    long_about = "Finds every shortcut, registry handler, desktop file or wrapper script that starts the host, makes sure each carries --remote-debugging-port=<port>, and relaunches the host when the port is closed."
)]
struct Cli {
    /// Host application name, e.g. "Cursor", "Windsurf", "Visual Studio Code"
    #[clap(long, global = true, default_value = "Cursor", env = "CDP_BOOTSTRAP_HOST")]
    host: String,

    /// YAML configuration file
    #[clap(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Override the remote-debugging port
    #[clap(long, short = 'p', global = true)]
    port: Option<u16>,

    /// State file shared by every instance (defaults to the user data dir)
    #[clap(long, global = true)]
    store: Option<PathBuf>,

    /// Host binary for the direct relaunch when the host is not running
    #[clap(long, global = true, env = "CDP_BOOTSTRAP_EXECUTABLE")]
    executable: Option<PathBuf>,

    /// Print results as JSON
    #[clap(long, global = true)]
    json: bool,

    /// Verbose logging
    #[clap(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
struct RelaunchArgs {
    /// Folders to reopen in the relaunched host
    #[clap(long = "folder")]
    folders: Vec<PathBuf>,

    /// Answer every prompt with its first choice
    #[clap(long, short = 'y')]
    yes: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether the debug port answers
    Probe {
        /// Scan the configured port window instead of a single port
        #[clap(long)]
        scan: bool,
    },
    /// List the host's launch entries and whether they carry the flag
    Locate,
    /// Add the flag to one launch entry
    Patch {
        /// Path of the entry as printed by `locate`
        path: PathBuf,
    },
    /// Add the flag to every launch entry without relaunching
    Heal,
    /// Relaunch the host with the flag applied
    Relaunch(RelaunchArgs),
    /// Run the start-up pass and keep polling while enabled
    Bootstrap {
        #[clap(flatten)]
        args: RelaunchArgs,

        /// Exit right after the pass instead of polling
        #[clap(long)]
        once: bool,
    },
    /// Show the instance lock for this host
    Lock,
    /// Forget "Not now" so the next start asks again
    Reset {
        /// Also clear the configured and auto-relaunch markers
        #[clap(long)]
        all: bool,
    },
}

struct CliContext {
    host: HostApp,
    config: OrchestratorConfig,
    store: Arc<dyn KeyValueStore>,
    executable: Option<PathBuf>,
    json: bool,
}

fn load_context(cli: &Cli) -> Result<CliContext> {
    let mut config =
        OrchestratorConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    let store = match &cli.store {
        Some(path) => FileStore::new(path),
        None => FileStore::default_location(),
    };
    info!(store = %store.path().display(), port = config.port, "using state file");
    Ok(CliContext {
        host: HostApp::detect(&cli.host),
        config,
        store: Arc::new(store),
        executable: cli.executable.clone(),
        json: cli.json,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_entries(entries: &[LaunchEntry]) {
    if entries.is_empty() {
        println!("{}", "No launch entries found.".yellow());
        return;
    }
    for entry in entries {
        let status = if entry.has_required_flag {
            "ok".green().bold()
        } else {
            "missing flag".red().bold()
        };
        println!("{} [{}] {}", status, entry.kind.as_str().cyan(), entry.path.display());
        if !entry.target_executable.is_empty() {
            println!("    target: {}", entry.target_executable);
        }
        if !entry.argument_string.is_empty() {
            println!("    args:   {}", entry.argument_string.dimmed());
        }
    }
}

fn print_repair(report: &RepairReport) {
    println!(
        "{} entries, {} modified, {} failed",
        report.entries.len(),
        report.modified.to_string().green(),
        report.failed.to_string().red()
    );
    for message in &report.messages {
        println!("  {message}");
    }
}

fn print_outcome(outcome: &RelaunchOutcome) {
    let label = match outcome.action {
        RelaunchAction::None => "not needed".green().bold(),
        RelaunchAction::Relaunched => "relaunching".yellow().bold(),
        RelaunchAction::Error => "failed".red().bold(),
    };
    println!("{}: {}", label, outcome.message);
}

/// The CLI is never the host, so its own binary is not a relaunch target.
fn host_process(host: &HostApp, executable: Option<&Path>) -> SystemProcess {
    let process = SystemProcess::new(host.clone());
    match executable {
        Some(path) => process.with_executable(path),
        None => process,
    }
}

fn build_session(ctx: &CliContext, args: &RelaunchArgs) -> Result<(Arc<Session>, Arc<TerminalShell>)> {
    let shell = Arc::new(TerminalShell::new(
        args.folders.clone(),
        args.yes,
        ctx.config.debug_flag(),
    ));
    let environment = create_environment(&ctx.host, &ctx.config)?;
    let session = Session::builder(ctx.host.clone())
        .config(ctx.config.clone())
        .shell(shell.clone())
        .driver(Arc::new(EndpointDriver::new(
            ctx.config.port,
            ctx.config.probe_timeout(),
        )))
        .store(ctx.store.clone())
        .environment(environment)
        .prober(Arc::new(PortProber::new()))
        .process(Arc::new(host_process(&ctx.host, ctx.executable.as_deref())))
        .build()?;
    Ok((session, shell))
}

/// Give the scheduled quit a chance to fire before the runtime goes away.
async fn wait_for_quit(shell: &TerminalShell, grace: Duration) {
    let quit = shell.quit_signal();
    let _ = tokio::time::timeout(grace, quit.notified()).await;
}

async fn run(cli: Cli) -> Result<()> {
    let ctx = load_context(&cli)?;
    let no_prompts = RelaunchArgs {
        folders: vec![],
        yes: true,
    };

    match cli.command {
        Commands::Probe { scan } => {
            let prober = PortProber::new();
            let timeout = ctx.config.probe_timeout();
            let open = if scan {
                prober
                    .find_open_port(ctx.config.port, ctx.config.port_window, timeout)
                    .await
            } else if prober.probe(ctx.config.port, timeout).await {
                Some(ctx.config.port)
            } else {
                None
            };

            match open {
                Some(port) => {
                    let targets = prober.list_targets(port, timeout).await.unwrap_or_default();
                    if ctx.json {
                        print_json(&serde_json::json!({
                            "reachable": true,
                            "port": port,
                            "targets": targets.len(),
                        }))?;
                    } else {
                        println!(
                            "{} port {} answers with {} targets",
                            "reachable:".green().bold(),
                            port,
                            targets.len()
                        );
                        for target in targets {
                            println!("  [{}] {} {}", target.target_type, target.title, target.url.dimmed());
                        }
                    }
                }
                None if ctx.json => print_json(&serde_json::json!({
                    "reachable": false,
                    "port": ctx.config.port,
                }))?,
                None => println!(
                    "{} nothing answers on port {}. Start the host with {}",
                    "unreachable:".red().bold(),
                    ctx.config.port,
                    ctx.config.debug_flag()
                ),
            }
        }
        Commands::Locate => {
            let (session, _) = build_session(&ctx, &no_prompts)?;
            let entries = session.conductor().locate().await;
            if ctx.json {
                print_json(&entries)?;
            } else {
                print_entries(&entries);
            }
        }
        Commands::Patch { path } => {
            let (session, _) = build_session(&ctx, &no_prompts)?;
            let entries = session.conductor().locate().await;
            let mut entry = entries
                .into_iter()
                .find(|e| e.path == path)
                .with_context(|| format!("{} is not a launch entry of {}", path.display(), ctx.host.display_name()))?;
            let outcome = session.conductor().patch(&mut entry).await;
            if ctx.json {
                print_json(&outcome)?;
            } else if outcome.success {
                println!("{} {}", "ok:".green().bold(), outcome.message);
            } else {
                println!("{} {}", "failed:".red().bold(), outcome.message);
            }
            if !outcome.success {
                anyhow::bail!("patching {} failed", path.display());
            }
        }
        Commands::Heal => {
            let (session, _) = build_session(&ctx, &no_prompts)?;
            let report = session.conductor().heal().await;
            if ctx.json {
                print_json(&report)?;
            } else {
                print_repair(&report);
            }
        }
        Commands::Relaunch(args) => {
            let (session, shell) = build_session(&ctx, &args)?;
            let outcome = session.relaunch_now().await;
            if ctx.json {
                print_json(&outcome)?;
            } else {
                print_outcome(&outcome);
            }
            if outcome.action == RelaunchAction::Relaunched {
                wait_for_quit(&shell, ctx.config.quit_delay() * 2).await;
            }
            if !outcome.success {
                anyhow::bail!("relaunch failed");
            }
        }
        Commands::Bootstrap { args, once } => {
            let (session, shell) = build_session(&ctx, &args)?;
            let quit = shell.quit_signal();
            let report = session.bootstrap().await;
            if ctx.json {
                print_json(&report)?;
            } else {
                println!("{} {:?}", "state:".bold(), report.state);
                if let Some(repair) = &report.repair {
                    print_repair(repair);
                }
                if let Some(outcome) = &report.relaunch {
                    print_outcome(outcome);
                }
            }

            if report.exiting {
                wait_for_quit(&shell, ctx.config.quit_delay() * 2).await;
            } else if !once && session.is_polling() {
                println!("Polling. Press Ctrl-C to stop.");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = quit.notified() => {}
                }
            }
            session.shutdown().await;
            if report
                .relaunch
                .as_ref()
                .is_some_and(|outcome| outcome.action == RelaunchAction::Error)
            {
                anyhow::bail!("relaunch failed");
            }
        }
        Commands::Lock => {
            let (session, _) = build_session(&ctx, &no_prompts)?;
            let arbiter = session.arbiter();
            let lock = arbiter.read().await;
            if ctx.json {
                print_json(&serde_json::json!({
                    "key": arbiter.lock_key(),
                    "lock": lock,
                }))?;
            } else {
                match lock {
                    Some(lock) => {
                        let age = now_ms().saturating_sub(lock.heartbeat_ms);
                        let fresh = age < ctx.config.lock_stale_ms;
                        println!(
                            "{} owned by {} (heartbeat {} ms ago, {})",
                            arbiter.lock_key().bold(),
                            lock.owner_id,
                            age,
                            if fresh { "fresh".green() } else { "stale".yellow() }
                        );
                    }
                    None => println!("{} is free", arbiter.lock_key().bold()),
                }
            }
        }
        Commands::Reset { all } => {
            let (session, _) = build_session(&ctx, &no_prompts)?;
            session.reset_prompt_preference().await?;
            if all {
                let markers = session.markers();
                markers.set_registry_configured(false).await?;
                markers.stamp_auto_relaunch(0).await?;
                markers.set_connection_established(false).await?;
            }
            println!("{}", "Markers reset.".green());
        }
    }
    Ok(())
}

fn now_ms() -> u64 {
    use cdp_bootstrap::{Clock, SystemClock};
    SystemClock.now_ms()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _guard = logging::init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}
