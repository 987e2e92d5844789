use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use indispenso_core::config::Config;
use indispenso_core::strategy::ExecutionStrategy;
use indispenso_core::template::{JsonTemplateStore, Template, ValidationRule};
use indispenso_core::types::OutputStream;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum TemplateSubcommand {
    /// List templates
    List,

    /// Add a template
    Add {
        /// Short human-readable title
        #[arg(long)]
        title: String,
        /// Shell command run on each target node
        #[arg(long)]
        command: String,
        /// Seconds before the command is killed
        #[arg(long, default_value = "300")]
        timeout: u64,
        /// Votes needed before execution, the requester included
        #[arg(long)]
        min_auth: Option<u32>,
        /// simple, canary, rolling(N) or exponential_rolling
        #[arg(long, default_value = "simple")]
        strategy: ExecutionStrategy,
        /// Text stdout must contain for the run to count as successful
        #[arg(long = "expect")]
        expect: Vec<String>,
        /// Text stderr must not contain
        #[arg(long = "reject-stderr")]
        reject_stderr: Vec<String>,
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Remove a template
    Remove { id: String },
}

pub fn run(home: &Path, subcommand: TemplateSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(home).context("failed to load config")?;
    let path = config.templates_path(home);
    let store = JsonTemplateStore::load(&path)
        .with_context(|| format!("failed to load templates from {}", path.display()))?;

    match subcommand {
        TemplateSubcommand::List => list(&store, json),
        TemplateSubcommand::Add {
            title,
            command,
            timeout,
            min_auth,
            strategy,
            expect,
            reject_stderr,
            description,
        } => {
            let mut template = Template::new(title, command, timeout).with_strategy(strategy);
            template.description = description;
            if let Some(min_auth) = min_auth {
                template = template.with_min_auth(min_auth);
            }
            for text in expect {
                template = template.with_rule(ValidationRule::new(OutputStream::Stdout, text, true)?);
            }
            for text in reject_stderr {
                template = template.with_rule(ValidationRule::new(OutputStream::Stderr, text, false)?);
            }
            let id = template.id.clone();
            store.add(template);
            store.save().context("failed to save templates")?;
            if json {
                print_json(&serde_json::json!({ "id": id }))?;
            } else {
                println!("Added template {id}");
            }
            Ok(())
        }
        TemplateSubcommand::Remove { id } => {
            if store.remove(&id).is_none() {
                anyhow::bail!("template not found: {id}");
            }
            store.save().context("failed to save templates")?;
            if !json {
                println!("Removed template {id}");
            }
            Ok(())
        }
    }
}

fn list(store: &JsonTemplateStore, json: bool) -> anyhow::Result<()> {
    let templates = store.list();
    if json {
        return print_json(&templates);
    }
    if templates.is_empty() {
        println!("No templates.");
        return Ok(());
    }
    let rows = templates
        .iter()
        .map(|t| {
            vec![
                t.id.clone(),
                t.title.clone(),
                t.execution_strategy.to_string(),
                t.min_auth.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
                if t.enabled { "yes" } else { "no" }.to_string(),
                t.command.clone(),
            ]
        })
        .collect();
    print_table(
        &["ID", "TITLE", "STRATEGY", "MIN AUTH", "ENABLED", "COMMAND"],
        rows,
    );
    Ok(())
}
