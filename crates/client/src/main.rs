mod output;

use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use portkeeper::{
    inspect, Allocator, Claim, CleanupOptions, Config, Metadata, Occupancy, PortRange,
    ReserveOptions,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Allocate and track local TCP ports", long_about = None)]
struct Cli {
    /// Registry file (default: $PORTKEEPER_REGISTRY or ~/.portkeeper/registry.json)
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Log more (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Default)]
struct MetaArgs {
    #[arg(long)]
    app: Option<String>,
    #[arg(long)]
    worktree: Option<String>,
    #[arg(long)]
    service: Option<String>,
    /// Environment name, stored as `environment`
    #[arg(long = "env")]
    environment: Option<String>,
    /// Extra metadata as KEY=VALUE (repeatable)
    #[arg(long = "meta", value_parser = parse_key_value)]
    extra: Vec<(String, String)>,
}

impl MetaArgs {
    fn into_metadata(self) -> Metadata {
        let mut metadata: Metadata = self.extra.into_iter().collect();
        for (key, value) in [
            ("app", self.app),
            ("worktree", self.worktree),
            ("service", self.service),
            ("environment", self.environment),
        ] {
            if let Some(value) = value {
                metadata.insert(key.to_string(), value);
            }
        }
        metadata
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Take a preferred port if free, otherwise the lowest free port in range
    Acquire {
        #[arg(long)]
        preferred: Option<u16>,
        #[arg(long)]
        range: Option<PortRange>,
        #[arg(long)]
        label: Option<String>,
        /// Process that owns the port; the entry goes stale when it exits
        #[arg(long)]
        pid: Option<u32>,
        #[command(flatten)]
        meta: MetaArgs,
    },
    /// Allocate the lowest free port in a range
    Allocate {
        #[arg(long)]
        range: Option<PortRange>,
        #[arg(long)]
        pid: Option<u32>,
        #[command(flatten)]
        meta: MetaArgs,
    },
    /// Allocate several ports at once under one group id
    AllocateGroup {
        #[arg(long, short = 'n')]
        count: usize,
        /// Role for each port in order (repeatable)
        #[arg(long = "role")]
        roles: Vec<String>,
        #[command(flatten)]
        meta: MetaArgs,
    },
    /// Release an allocated port
    Release { port: u16 },
    /// Release every port in a group
    ReleaseGroup { group_id: String },
    /// Claim an exact port
    Reserve {
        port: u16,
        /// Terminate whatever is listening on the port first
        #[arg(long)]
        kill: bool,
        /// Use SIGKILL instead of SIGTERM
        #[arg(long, requires = "kill")]
        force: bool,
        #[arg(long)]
        pid: Option<u32>,
        #[command(flatten)]
        meta: MetaArgs,
    },
    /// Check whether a port is bound
    Probe { port: u16 },
    /// Show which process is listening on a port
    Detect { port: u16 },
    /// Terminate the process listening on a port and release it
    Kill {
        port: u16,
        #[arg(long)]
        force: bool,
    },
    /// List allocations
    List {
        #[arg(long)]
        app: Option<String>,
        #[arg(long)]
        worktree: Option<String>,
    },
    /// List port groups
    Groups,
    /// Allocations by app and worktree with live status
    Dashboard,
    /// Remove allocations whose owning process is gone
    Cleanup {
        /// Also remove allocations nothing is listening on
        #[arg(long)]
        idle: bool,
    },
    /// Run a command with an allocated port
    Run {
        #[arg(long)]
        range: Option<PortRange>,

        /// Environment variable name for the port
        #[arg(long, default_value = "PORT")]
        env_name: String,

        #[command(flatten)]
        meta: MetaArgs,

        /// Command and arguments to execute
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text(value);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::from_env()
        .context("invalid PORTKEEPER_* environment")?
        .with_overrides(cli.registry.as_deref(), None);
    tracing::debug!(
        "Using registry {} with default range {}",
        config.registry_path.display(),
        config.default_range
    );
    let allocator = Allocator::from_config(&config, inspect::system());
    let json = cli.json;

    match cli.command {
        Commands::Acquire {
            preferred,
            range,
            label,
            pid,
            meta,
        } => {
            let range = range.unwrap_or(config.default_range);
            let claim = Claim {
                metadata: meta.into_metadata(),
                label,
                pid,
            };
            let port = allocator.acquire(preferred, range, claim)?;
            emit(json, &serde_json::json!({ "port": port }), |_| println!("{}", port))
        }
        Commands::Allocate { range, pid, meta } => {
            let range = range.unwrap_or(config.default_range);
            let claim = Claim {
                metadata: meta.into_metadata(),
                label: None,
                pid,
            };
            let port = allocator
                .allocate(range, claim)
                .with_context(|| format!("allocating from {}", range))?;
            emit(json, &serde_json::json!({ "port": port }), |_| println!("{}", port))
        }
        Commands::AllocateGroup { count, roles, meta } => {
            let group = allocator.allocate_group(count, meta.into_metadata(), &roles)?;
            emit(json, &group, output::print_group_allocation)
        }
        Commands::Release { port } => {
            let released = allocator.release(port)?;
            emit(
                json,
                &serde_json::json!({ "port": port, "released": released }),
                |_| {
                    if released {
                        println!("Released port: {}", port);
                    } else {
                        println!("Port {} was not allocated", port);
                    }
                },
            )
        }
        Commands::ReleaseGroup { group_id } => {
            let release = allocator.release_group(&group_id)?;
            emit(json, &release, |r| {
                println!("Released {} port(s) from group {}", r.released, group_id);
            })
        }
        Commands::Reserve {
            port,
            kill,
            force,
            pid,
            meta,
        } => {
            let claim = Claim {
                metadata: meta.into_metadata(),
                label: None,
                pid,
            };
            let options = ReserveOptions {
                kill_if_occupied: kill,
                force,
            };
            let reservation = allocator.reserve(port, options, claim)?;
            emit(json, &reservation, output::print_reservation)
        }
        Commands::Probe { port } => {
            let probe = allocator.probe(port);
            emit(json, &probe, |p| {
                println!(
                    "Port {} is {}",
                    p.port,
                    if p.in_use { "in use" } else { "free" }
                );
            })
        }
        Commands::Detect { port } => {
            let occupancy = allocator.detect_occupier(port);
            if let Occupancy::InspectionFailed { reason } = &occupancy {
                if json {
                    emit(true, &occupancy, |_| {})?;
                }
                bail!("could not inspect port {}: {}", port, reason);
            }
            emit(json, &occupancy, |o| output::print_occupancy(port, o))
        }
        Commands::Kill { port, force } => {
            let report = allocator.kill_occupier(port, force)?;
            emit(json, &report, |r| output::print_kill_report(port, r))
        }
        Commands::List { app, worktree } => {
            let mut allocations = match &app {
                Some(app) => allocator.ports_by_app(app)?,
                None => allocator.list_allocations()?,
            };
            if let Some(worktree) = &worktree {
                allocations.retain(|a| a.allocation.worktree() == Some(worktree.as_str()));
            }
            emit(json, &allocations, |a| output::print_allocations(a))
        }
        Commands::Groups => {
            let groups = allocator.groups()?;
            emit(json, &groups, |g| output::print_groups(g))
        }
        Commands::Dashboard => {
            let dashboard = allocator.all_grouped()?;
            emit(json, &dashboard, output::print_dashboard)
        }
        Commands::Cleanup { idle } => {
            let report = allocator.cleanup(CleanupOptions { idle })?;
            emit(json, &report, |r| {
                if r.removed.is_empty() {
                    println!("Nothing to clean up");
                } else {
                    println!("Removed {} allocation(s): {:?}", r.removed.len(), r.removed);
                }
            })
        }
        Commands::Run {
            range,
            env_name,
            meta,
            command,
        } => run(&allocator, range.unwrap_or(config.default_range), env_name, meta, command),
    }
}

/// Allocate a port, run `command` with it in the environment, release, and exit with the child's status.
fn run(
    allocator: &Allocator,
    range: PortRange,
    env_name: String,
    meta: MetaArgs,
    command: Vec<String>,
) -> Result<()> {
    let Some((cmd, args)) = command.split_first() else {
        bail!("No command specified");
    };

    let claim = Claim {
        metadata: meta.into_metadata(),
        label: Some(cmd.clone()),
        pid: Some(std::process::id()),
    };
    let port = allocator.allocate(range, claim)?;
    eprintln!("Allocated port {}; running: {} {:?} with {}={}", port, cmd, args, env_name, port);

    let status = Command::new(cmd)
        .args(args)
        .env(&env_name, port.to_string())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status();

    allocator.release(port)?;
    eprintln!("Released port {}", port);
    tracing::debug!("Child {} exited: {:?}", cmd, status);

    let status = status.with_context(|| format!("failed to run {}", cmd))?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}
