mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, template::TemplateSubcommand, Overrides};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "indispenso",
    about = "Run pre-approved shell commands on many hosts once enough people agree",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration directory holding indispenso.yaml and templates.json
    #[arg(long, global = true, env = "IND_HOME", default_value = indispenso_core::config::DEFAULT_HOME)]
    home: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every role the configuration enables (server and/or node)
    Run {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Run the coordinating server only
    Server {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Run a node that polls the server and executes commands
    Client {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Inspect and initialise the configuration file
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Manage command templates
    Template {
        #[command(subcommand)]
        subcommand: TemplateSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let debug = match &cli.command {
        Commands::Run { overrides }
        | Commands::Server { overrides }
        | Commands::Client { overrides } => Some(overrides.debug),
        _ => None,
    };
    let default_level = match debug {
        Some(true) => tracing::Level::DEBUG,
        Some(false) => tracing::Level::INFO,
        None => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let home = cli.home.as_path();

    let result = match cli.command {
        Commands::Run { overrides } => cmd::run::run(home, overrides, cmd::run::Role::Configured),
        Commands::Server { overrides } => cmd::run::run(home, overrides, cmd::run::Role::Server),
        Commands::Client { overrides } => cmd::run::run(home, overrides, cmd::run::Role::Client),
        Commands::Config { subcommand } => cmd::config::run(home, subcommand, cli.json),
        Commands::Template { subcommand } => cmd::template::run(home, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
