// Copyright 2026 UPM Embed Contributors
// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

use upm_embed_runtime::cli;
use upm_embed_runtime::config::RuntimeConfig;

#[derive(Parser)]
#[command(
    name = "upm-embed",
    about = "UPM embed runtime: caching proxy, offline analytics relay and cache tools",
    version,
    after_help = "Run 'upm-embed <command> --help' for details on each command."
)]
struct Cli {
    /// Output results as JSON (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// JSON config file; UPM_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the caching intermediary as a local proxy
    Serve {
        /// Port to listen on
        #[arg(long, default_value_t = cli::serve::DEFAULT_PORT)]
        port: u16,
    },
    /// Inspect or manage cache namespaces
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Remove aged entries from the runtime cache
    Sweep,
    /// Replay queued analytics batches
    Replay,
    /// Generate shell completions
    Completions {
        /// Shell to generate for
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry counts per namespace
    Status,
    /// Delete every namespace
    Clear,
    /// Fetch URLs into the runtime cache
    Warm {
        /// URLs to cache
        #[arg(required = true)]
        urls: Vec<String>,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let directive = if verbose {
        "upm_embed_runtime=debug"
    } else {
        "upm_embed_runtime=info"
    };
    let filter = EnvFilter::from_default_env().add_directive(
        directive
            .parse()
            .unwrap_or_else(|_| tracing::Level::INFO.into()),
    );
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set global flags via environment variables so all modules can check them
    if cli.json {
        std::env::set_var("UPM_JSON", "1");
    }
    if cli.quiet {
        std::env::set_var("UPM_QUIET", "1");
    }
    if cli.verbose {
        std::env::set_var("UPM_VERBOSE", "1");
    }
    if cli.no_color {
        std::env::set_var("UPM_NO_COLOR", "1");
    }
    init_tracing(cli.verbose, cli.json);

    let result = match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "upm-embed", &mut std::io::stdout());
            Ok(())
        }
        command => run(command, cli.config).await,
    };

    // Consistent exit codes: 0=success, 1=error
    if let Err(e) = &result {
        if !cli::output::is_quiet() && !cli::output::is_json() {
            eprintln!("  Error: {e:#}");
        }
        if cli::output::is_json() {
            cli::output::print_json(&serde_json::json!({
                "error": true,
                "message": format!("{e:#}"),
            }));
        }
        std::process::exit(1);
    }

    result
}

async fn run(command: Commands, config_path: Option<PathBuf>) -> Result<()> {
    let config = RuntimeConfig::load(config_path.as_deref())?;
    match command {
        Commands::Serve { port } => cli::serve::run(&config, port).await,
        Commands::Cache { action } => match action {
            CacheAction::Status => cli::cache_cmd::run_status(&config).await,
            CacheAction::Clear => cli::cache_cmd::run_clear(&config).await,
            CacheAction::Warm { urls } => cli::cache_cmd::run_warm(&config, &urls).await,
        },
        Commands::Sweep => cli::cache_cmd::run_sweep(&config).await,
        Commands::Replay => cli::replay_cmd::run(&config).await,
        Commands::Completions { .. } => Ok(()),
    }
}
