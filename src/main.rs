use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use warden::audit::{load_entries, verify_entries, GENESIS};
use warden::config::CoreConfig;
use warden::doctor::run_doctor;
use warden::policy::{evaluate_with, RuleSet};
use warden::rest;
use warden::schema::ToolCallRequest;
use warden::tools::ToolRegistry;
use warden::vault::SecretsVault;

#[derive(Parser)]
#[command(
    name = "wardend",
    about = "Warden Host — tool-execution security mediation daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to warden.toml (defaults to <data_dir>/warden.toml)
    #[arg(long, env = "WARDEND_CONFIG")]
    config: Option<PathBuf>,

    /// Read-only REST API port
    #[arg(long, env = "WARDEND_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "WARDEND_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "WARDEND_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the mediation core and its read-only REST surface
    Run,
    /// Operational health checks: config, backends, vault, audit chain
    Doctor,
    /// Audit log operations
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },
    /// Vault administration
    Vault {
        #[command(subcommand)]
        cmd: VaultCmd,
    },
    /// Policy utilities
    Policy {
        #[command(subcommand)]
        cmd: PolicyCmd,
    },
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Recompute every hash and verify the chain; non-zero exit on tamper
    Verify,
    /// Print the most recent entries as JSON lines
    Tail {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum VaultCmd {
    /// Create a new vault (reads the master password from stdin)
    Init,
    /// Store a secret (reads master password, then the value, from stdin)
    Set { name: String },
    /// List secret names — never values
    List,
    /// Remove a secret (reads the master password from stdin)
    Rm { name: String },
}

#[derive(Subcommand)]
enum PolicyCmd {
    /// Dry-run a policy decision without executing anything
    Test {
        #[arg(long)]
        tool: String,
        /// JSON arguments, e.g. '{"command":"ls"}'
        #[arg(long, default_value = "{}")]
        args: String,
        #[arg(long, default_value_t = 2)]
        autonomy: u8,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| CoreConfig::default().data_dir.join("warden.toml"));
    let config = CoreConfig::load(&config_path).context("loading config")?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config, args.port.unwrap_or(rest::DEFAULT_REST_PORT)).await,
        Command::Doctor => doctor(config),
        Command::Audit { cmd } => audit_cmd(config, cmd),
        Command::Vault { cmd } => vault_cmd(config, cmd),
        Command::Policy { cmd } => policy_cmd(config, cmd),
    }
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(args.log.as_deref().unwrap_or("info"))
        .context("invalid log filter")?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if let Some(path) = &args.log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file = path.file_name().map(PathBuf::from).unwrap_or_default();
        let appender = tracing_appender::rolling::daily(dir, file);
        builder.with_writer(appender).with_ansi(false).init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn run(config: CoreConfig, port: u16) -> Result<()> {
    // Fail-closed: bootstrap refuses weakened configs and malformed rules.
    let orchestrator = warden::bootstrap(config)?;
    info!(port, "warden core ready");

    rest::serve(Arc::clone(orchestrator.audit()), port).await
}

fn doctor(config: CoreConfig) -> Result<()> {
    let report = run_doctor(&config);
    for check in &report.checks {
        let mark = if check.ok { "ok " } else { "FAIL" };
        println!("[{mark}] {:<18} {}", check.name, check.detail);
    }
    if !report.all_ok() {
        std::process::exit(1);
    }
    Ok(())
}

fn audit_cmd(config: CoreConfig, cmd: AuditCmd) -> Result<()> {
    let entries = load_entries(&config.audit_dir())?;
    match cmd {
        AuditCmd::Verify => {
            let report = verify_entries(&entries, GENESIS);
            println!("{}", report.message);
            if !report.valid {
                std::process::exit(1);
            }
        }
        AuditCmd::Tail { limit } => {
            let start = entries.len().saturating_sub(limit);
            for entry in &entries[start..] {
                println!("{}", serde_json::to_string(entry)?);
            }
        }
    }
    Ok(())
}

fn vault_cmd(config: CoreConfig, cmd: VaultCmd) -> Result<()> {
    let vault = SecretsVault::new(config.vault_path());
    match cmd {
        VaultCmd::Init => {
            let password = read_stdin_line("master password: ")?;
            vault.initialize(&password)?;
            println!("vault initialized at {}", vault.path().display());
        }
        VaultCmd::Set { name } => {
            let password = read_stdin_line("master password: ")?;
            vault.unlock(&password)?;
            let value = read_stdin_line("secret value: ")?;
            vault.put(&name, value.as_bytes())?;
            vault.wipe();
            println!("stored '{name}'");
        }
        VaultCmd::List => {
            let password = read_stdin_line("master password: ")?;
            vault.unlock(&password)?;
            for name in vault.list()? {
                println!("{name}");
            }
            vault.wipe();
        }
        VaultCmd::Rm { name } => {
            let password = read_stdin_line("master password: ")?;
            vault.unlock(&password)?;
            let existed = vault.delete(&name)?;
            vault.wipe();
            if !existed {
                bail!("no secret named '{name}'");
            }
            println!("removed '{name}'");
        }
    }
    Ok(())
}

fn policy_cmd(config: CoreConfig, cmd: PolicyCmd) -> Result<()> {
    match cmd {
        PolicyCmd::Test {
            tool,
            args,
            autonomy,
        } => {
            let rules = RuleSet::load(&config.rules_path())?;
            let registry = ToolRegistry::with_builtin_tools();
            let Some(descriptor) = registry.get(&tool) else {
                bail!("unknown tool '{tool}'");
            };

            let parsed: serde_json::Value =
                serde_json::from_str(&args).context("parsing --args as JSON")?;
            let request = ToolCallRequest::new(&tool, parsed, "policy-test", autonomy);
            let decision = evaluate_with(&rules, &request, descriptor);
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
    }
    Ok(())
}

/// Read one line from stdin. Values never appear in argv or shell history.
fn read_stdin_line(prompt: &str) -> Result<String> {
    use std::io::IsTerminal as _;
    if std::io::stdin().is_terminal() {
        eprint!("{prompt}");
    }
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("reading from stdin")?;
    let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
    if trimmed.is_empty() {
        bail!("empty input");
    }
    Ok(trimmed)
}
