use anyhow::Context;
use indispenso_agent::Node;
use indispenso_core::config::{Config, WarnLevel};
use indispenso_core::template::JsonTemplateStore;
use indispenso_server::Engine;
use std::path::Path;
use std::sync::Arc;

use super::{load_config, Overrides};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Whatever `server.enabled` and `client.endpoint_uri` ask for.
    Configured,
    Server,
    Client,
}

impl Role {
    /// `(server, node)` for this role under `config`.
    fn resolve(self, config: &Config) -> (bool, bool) {
        match self {
            Role::Server => (true, false),
            Role::Client => (false, true),
            Role::Configured => (
                config.server.enabled,
                !config.client.endpoint_uri.is_empty(),
            ),
        }
    }
}

pub fn run(home: &Path, overrides: Overrides, role: Role) -> anyhow::Result<()> {
    let config = load_config(home, overrides)?;
    let (serve, poll) = role.resolve(&config);
    if !serve && !poll {
        anyhow::bail!(
            "nothing to run: set server.enabled or client.endpoint_uri in {}",
            indispenso_core::config::config_path(home).display()
        );
    }
    for w in config.validate() {
        match w.level {
            WarnLevel::Warning => tracing::warn!("{}", w.message),
            WarnLevel::Error => tracing::error!("{}", w.message),
        }
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let server = async {
            if serve {
                start_server(home, &config).await
            } else {
                std::future::pending::<anyhow::Result<()>>().await
            }
        };
        let node = async {
            if poll {
                let node = Node::new(&config, config.hostname.clone())
                    .context("failed to start node")?;
                Arc::new(node).run().await;
                Ok(())
            } else {
                std::future::pending::<anyhow::Result<()>>().await
            }
        };

        tokio::select! {
            res = server => res,
            res = node => res,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                Ok(())
            }
        }
    })
}

async fn start_server(home: &Path, config: &Config) -> anyhow::Result<()> {
    let path = config.templates_path(home);
    let templates = JsonTemplateStore::load(&path)
        .with_context(|| format!("failed to load templates from {}", path.display()))?;
    tracing::info!(templates = templates.len(), path = %path.display(), "loaded templates");

    let engine = Arc::new(Engine::new(config.clone(), Arc::new(templates)));
    indispenso_server::serve(engine, config.server.port).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_role_follows_config() {
        let mut config = Config::default();
        assert_eq!(Role::Configured.resolve(&config), (false, false));
        config.server.enabled = true;
        config.client.endpoint_uri = "http://localhost:897/".into();
        assert_eq!(Role::Configured.resolve(&config), (true, true));
        assert_eq!(Role::Client.resolve(&config), (false, true));
        assert_eq!(Role::Server.resolve(&Config::default()), (true, false));
    }
}
