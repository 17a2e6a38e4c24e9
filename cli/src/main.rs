//! lsprobe - drive a language server from recorded fixtures.
//!
//! ```text
//! lsprobe replay fixtures/hover.json -- pyright-langserver --stdio
//! lsprobe inspect --server-command "rust-analyzer"
//! ```
//!
//! The server comes from the trailing `--` arguments, then
//! `--server-command`, then `[server]` in `lsprobe.toml`.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use lsprobe_config::LsprobeConfig;
use lsprobe_harness::{Harness, Replayer, load_fixture_in};
use lsprobe_lsp::protocol::{initialize_params, path_to_file_uri};
use lsprobe_lsp::{LspClient, ServerCommand, ServerEndpoint};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "lsprobe", version)]
#[command(about = "Replay recorded LSP fixtures against a language server")]
struct Cli {
    /// Config file (default: ./lsprobe.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Write logs here instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    /// Server command line, split on whitespace
    #[arg(long, global = true)]
    server_command: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay fixtures; exit 1 if any step fails
    Replay {
        /// Fixture files
        #[arg(required = true)]
        fixtures: Vec<PathBuf>,
        /// Workspace root, overriding the fixtures' own
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Server command and arguments
        #[arg(last = true)]
        server: Vec<String>,
    },
    /// Initialize, print the server's capabilities as JSON, shut down
    Inspect {
        /// Workspace root sent as `rootUri`
        #[arg(long)]
        root: Option<PathBuf>,
        /// Server command and arguments
        #[arg(last = true)]
        server: Vec<String>,
    },
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log dir {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .with(env_filter)
                .init();
            tracing::info!(path = %path.display(), "Logging initialized");
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(env_filter)
                .init();
        }
    }
    Ok(())
}

/// Pick the server: trailing args, then `--server-command`, then config.
fn resolve_endpoint(
    trailing: &[String],
    server_command: Option<&str>,
    config: &LsprobeConfig,
) -> Result<ServerEndpoint> {
    if let Some((program, args)) = trailing.split_first() {
        return Ok(ServerEndpoint::Process(
            ServerCommand::new(program.clone()).args(args.iter().cloned()),
        ));
    }
    if let Some(command) = server_command {
        let mut words = command.split_whitespace();
        let Some(program) = words.next() else {
            bail!("--server-command is empty");
        };
        return Ok(ServerEndpoint::Process(ServerCommand::new(program).args(words)));
    }
    match &config.server {
        Some(server) => server
            .endpoint()
            .map_err(|reason| anyhow::anyhow!("invalid [server] config: {reason}")),
        None => bail!("no server given: pass `-- <command>`, --server-command or set [server]"),
    }
}

fn resolve_fixture(path: &Path, config: &LsprobeConfig) -> PathBuf {
    if path.exists() || path.is_absolute() {
        return path.to_path_buf();
    }
    match &config.harness.fixtures_dir {
        Some(dir) => dir.join(path),
        None => path.to_path_buf(),
    }
}

async fn replay(
    fixtures: &[PathBuf],
    workspace: Option<&Path>,
    endpoint: &ServerEndpoint,
    config: &LsprobeConfig,
) -> Result<bool> {
    let mut all_passed = true;
    for path in fixtures {
        let path = resolve_fixture(path, config);
        let fixture = load_fixture_in(&path, workspace)?;

        let client = LspClient::connect(endpoint, config.client_config())
            .await
            .with_context(|| format!("Failed to start {endpoint}"))?;
        let harness = Harness::new(client.clone());
        let report = Replayer::new(&harness)
            .default_wait(config.harness.default_wait())
            .run(&fixture)
            .await;
        print!("{report}");
        all_passed &= report.passed();

        if let Err(e) = client.shutdown().await {
            tracing::warn!(fixture = %fixture.name, "shutdown failed: {e}");
        }
    }
    Ok(all_passed)
}

async fn inspect(
    root: Option<&Path>,
    endpoint: &ServerEndpoint,
    config: &LsprobeConfig,
) -> Result<()> {
    let root_uri = match root {
        Some(root) => {
            let root = root
                .canonicalize()
                .with_context(|| format!("Failed to resolve {}", root.display()))?;
            Some(path_to_file_uri(&root)?.to_string())
        }
        None => None,
    };
    let client = LspClient::connect(endpoint, config.client_config())
        .await
        .with_context(|| format!("Failed to start {endpoint}"))?;
    let result = client
        .initialize(initialize_params(root_uri.as_deref()))
        .await
        .context("initialize failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    client.shutdown().await.context("shutdown failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    let config = LsprobeConfig::load(cli.config.as_deref()).context("Failed to load config")?;

    match &cli.command {
        Commands::Replay {
            fixtures,
            workspace,
            server,
        } => {
            let endpoint = resolve_endpoint(server, cli.server_command.as_deref(), &config)?;
            let passed = replay(fixtures, workspace.as_deref(), &endpoint, &config).await?;
            Ok(if passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Inspect { root, server } => {
            let endpoint = resolve_endpoint(server, cli.server_command.as_deref(), &config)?;
            inspect(root.as_deref(), &endpoint, &config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
