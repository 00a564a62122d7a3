use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secenum::{
    config::Config,
    matcher::{self, LoadedFeed},
    model::{Report, Severity},
    output::{format_report_to_string, print_report, OutputFormat},
    store::{SecureStore, StoreKey},
    verify::TrustStore,
    Orchestrator, PluginRegistry, RunOptions,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit codes for CI integration
mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const THRESHOLD_EXCEEDED: u8 = 2;
    pub const CANCELLED: u8 = 3;
}

const LOG_ENV: &str = "SECENUM_LOG";

#[derive(Parser)]
#[command(name = "secenum")]
#[command(
    author,
    version,
    about = "Inventory installed software, verify package authenticity and match known vulnerabilities"
)]
struct Cli {
    /// Verbose logging (overridden by SECENUM_LOG)
    #[arg(long, global = true)]
    debug: bool,

    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ReportArgs {
    /// Output format (table, json)
    #[arg(short, long)]
    format: Option<String>,

    /// Write the JSON report to a file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Exit nonzero if findings at or above this severity exist
    #[arg(long, value_enum)]
    fail_on: Option<FailLevel>,
}

#[derive(Subcommand)]
enum Commands {
    /// Inventory packages, services and security policy, and verify packages
    Scan {
        #[command(flatten)]
        report: ReportArgs,
    },

    /// Verify packages and match them against the vulnerability feed
    Assess {
        /// Also collect services and the security policy
        #[arg(long)]
        full: bool,

        #[command(flatten)]
        report: ReportArgs,
    },

    /// List registered plugins and whether they apply to this host
    ListPlugins,

    /// Show or create config file
    Config {
        /// Generate default config file
        #[arg(long)]
        init: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Print the decrypted audit trail
    Audit {
        /// Only the last N events
        #[arg(short = 'n', long)]
        last: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FailLevel {
    Critical,
    High,
    Medium,
    Low,
}

impl From<FailLevel> for Severity {
    fn from(level: FailLevel) -> Self {
        match level {
            FailLevel::Critical => Severity::Critical,
            FailLevel::High => Severity::High,
            FailLevel::Medium => Severity::Medium,
            FailLevel::Low => Severity::Low,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_codes::ERROR)
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "secenum=debug" } else { "secenum=info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<u8> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_else(|e| {
            warn!(error = %e, "config unreadable, using defaults");
            Config::default()
        }),
    };

    match cli.command {
        Commands::Scan { report } => run_pipeline(config, RunOptions::scan(), report).await,
        Commands::Assess { full, report } => {
            run_pipeline(config, RunOptions::assess(full), report).await
        }
        Commands::ListPlugins => {
            list_plugins(&config).await?;
            Ok(exit_codes::SUCCESS)
        }
        Commands::Config { init, path } => {
            handle_config(init, path)?;
            Ok(exit_codes::SUCCESS)
        }
        Commands::Audit { last } => {
            print_audit(&config, last)?;
            Ok(exit_codes::SUCCESS)
        }
    }
}

fn open_store(config: &Config) -> Result<SecureStore> {
    let dir = config.store_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create store directory {}", dir.display()))?;
    let key = StoreKey::resolve(&dir).context("Failed to obtain the store key")?;
    SecureStore::open(&dir, &key).context("Failed to open the secure store")
}

async fn load_feed(config: &Config, store: Option<&SecureStore>) -> Result<Option<LoadedFeed>> {
    if let Some(path) = &config.feed_path {
        let feed = matcher::load_file(path)
            .await
            .with_context(|| format!("Failed to load feed {}", path.display()))?;
        return Ok(Some(feed));
    }
    if let Some(url) = &config.feed_url {
        let client = reqwest::Client::builder()
            .user_agent(concat!("secenum/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()?;
        let feed = matcher::load_remote(&client, url, store, config.feed_ttl())
            .await
            .with_context(|| format!("Failed to load feed {}", url))?;
        return Ok(Some(feed));
    }
    Ok(None)
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message.to_string());
    pb
}

async fn run_pipeline(config: Config, options: RunOptions, args: ReportArgs) -> Result<u8> {
    let format_str = args.format.unwrap_or_else(|| config.default_format.clone());
    let format = OutputFormat::from_str(&format_str).map_err(|e| anyhow::anyhow!(e))?;
    let is_interactive = format == OutputFormat::Table && args.output.is_none();
    let threshold = args
        .fail_on
        .map(Severity::from)
        .unwrap_or(config.severity_threshold);

    let store = match open_store(&config) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!(error = %format!("{:#}", e), "secure store unavailable, run will not be persisted");
            None
        }
    };

    let trust = match &config.trust_store {
        Some(path) => TrustStore::load(path)
            .with_context(|| format!("Failed to load trust store {}", path.display()))?,
        None => {
            warn!("no trust store configured, every signature will be untrusted");
            TrustStore::default()
        }
    };

    let feed = if options.match_vulnerabilities {
        load_feed(&config, store.as_deref()).await?
    } else {
        None
    };

    let registry = PluginRegistry::builtin(&config)?;
    let mut orchestrator = Orchestrator::new(registry, config).with_trust_store(Arc::new(trust));
    if let Some(feed) = feed {
        orchestrator = orchestrator.with_feed(feed);
    }
    if let Some(store) = &store {
        orchestrator = orchestrator.with_store(Arc::clone(store));
    }

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            token.cancel();
        }
    });

    let progress = is_interactive.then(|| spinner("Enumerating installed software..."));
    let result = orchestrator.run(options).await;
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    let report = result?;

    if let Some(path) = &args.output {
        std::fs::write(path, format_report_to_string(&report)?)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        if format == OutputFormat::Table {
            println!("Report written to: {}", path.display());
        }
    } else {
        print_report(&report, format)?;
    }

    Ok(determine_exit_code(&report, threshold))
}

fn determine_exit_code(report: &Report, threshold: Severity) -> u8 {
    if report.run_cancelled() {
        exit_codes::CANCELLED
    } else if report.exceeds_threshold(threshold) {
        exit_codes::THRESHOLD_EXCEEDED
    } else {
        exit_codes::SUCCESS
    }
}

async fn list_plugins(config: &Config) -> Result<()> {
    let registry = PluginRegistry::builtin(config)?;
    let platform = secenum::Platform::current();
    let resolved = registry.resolve(platform).await;
    let applicable: Vec<String> = resolved.versions().into_iter().map(|v| v.name).collect();

    println!("Registered plugins:");
    println!();
    for entry in registry.entries() {
        let here = if entry.platform == platform {
            if applicable.contains(&entry.name) {
                "yes"
            } else {
                "no"
            }
        } else {
            "-"
        };
        println!(
            "  {:<10} {:<10} {:<10} [applicable: {}]",
            entry.name,
            entry.capability,
            format!("{:?}", entry.platform).to_lowercase(),
            here
        );
    }
    Ok(())
}

fn print_audit(config: &Config, last: Option<usize>) -> Result<()> {
    let store = open_store(config)?;
    let events = store.read_audit().context("Failed to read the audit trail")?;
    let skip = last.map(|n| events.len().saturating_sub(n)).unwrap_or(0);

    if events.is_empty() {
        println!("Audit trail is empty.");
        return Ok(());
    }

    for event in events.iter().skip(skip) {
        println!(
            "{}  {:<8} {:<12} {}{}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", event.outcome).to_lowercase(),
            event.actor,
            event.action,
            event
                .detail
                .as_deref()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn handle_config(init: bool, show_path: bool) -> Result<()> {
    let config_path = Config::config_path();

    if show_path {
        println!("{}", config_path.display());
        return Ok(());
    }

    if init {
        if config_path.exists() {
            println!("Config file already exists at: {}", config_path.display());
            return Ok(());
        }

        let config = Config::default();
        config.save()?;
        println!("Created config file at: {}", config_path.display());
        println!();
        println!("Default configuration:");
        println!("{}", Config::generate_default_config());
        return Ok(());
    }

    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)?;
        println!("Config file: {}", config_path.display());
        println!();
        println!("{}", content);
    } else {
        println!("No config file found.");
        println!("Run 'secenum config --init' to create one.");
        println!();
        println!("Config path: {}", config_path.display());
    }

    Ok(())
}
