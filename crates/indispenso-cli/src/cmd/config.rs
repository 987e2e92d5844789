use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use indispenso_core::config::{config_path, Config, WarnLevel};
use indispenso_core::signing;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a default indispenso.yaml with a freshly generated secure token
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
        /// Enable the server role
        #[arg(long)]
        server: bool,
        /// Endpoint nodes should poll
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Print the effective configuration (token redacted)
    Show,

    /// Validate the config for common mistakes
    Validate,
}

pub fn run(home: &Path, subcommand: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcommand {
        ConfigSubcommand::Init {
            force,
            server,
            endpoint,
        } => init(home, force, server, endpoint),
        ConfigSubcommand::Show => show(home, json),
        ConfigSubcommand::Validate => validate(home, json),
    }
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

fn init(home: &Path, force: bool, server: bool, endpoint: Option<String>) -> anyhow::Result<()> {
    let path = config_path(home);
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let mut config = Config {
        token: signing::generate_token(),
        ..Config::default()
    };
    config.server.enabled = server;
    if let Some(endpoint) = endpoint {
        config.client.endpoint_uri = endpoint;
        config.auto_repair();
    }

    std::fs::create_dir_all(home)
        .with_context(|| format!("failed to create {}", home.display()))?;
    config.save(home).context("failed to write config")?;
    println!("Wrote {}", path.display());
    println!("Copy the same token to every node.");
    Ok(())
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(home: &Path, json: bool) -> anyhow::Result<()> {
    let mut config = Config::load(home).context("failed to load config")?;
    if !config.token.is_empty() {
        config.token = "<redacted>".into();
    }

    if json {
        print_json(&config)?;
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(home: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(home).context("failed to load config")?;
    let warnings = config.validate();

    if json {
        let value = serde_json::json!({
            "warnings": warnings,
        });
        print_json(&value)?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    let has_errors = warnings.iter().any(|w| w.level == WarnLevel::Error);
    if has_errors {
        anyhow::bail!("config validation found errors");
    }

    Ok(())
}
