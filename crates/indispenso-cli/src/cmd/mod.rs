pub mod config;
pub mod run;
pub mod template;

use anyhow::Context;
use clap::Args;
use indispenso_core::config::Config;
use std::path::{Path, PathBuf};

/// Command-line and `IND_*` environment values that win over the file.
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Pre-shared secure token
    #[arg(long, env = "IND_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Name this host reports to the server
    #[arg(long, env = "IND_HOSTNAME")]
    pub hostname: Option<String>,

    /// Port the server listens on
    #[arg(long, env = "IND_SERVER_PORT")]
    pub port: Option<u16>,

    /// Server endpoint for nodes, e.g. http://server:897/
    #[arg(long, env = "IND_ENDPOINT_URI")]
    pub endpoint: Option<String>,

    /// Comma-separated tags this node advertises
    #[arg(long, env = "IND_TAGS", value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Directory for temporary command scripts
    #[arg(long, env = "IND_TMP_DIR")]
    pub tmp_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, env = "IND_DEBUG")]
    pub debug: bool,
}

impl Overrides {
    pub fn apply(self, config: &mut Config) {
        if let Some(token) = self.token {
            config.token = token;
        }
        if let Some(hostname) = self.hostname {
            config.hostname = hostname;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(endpoint) = self.endpoint {
            config.client.endpoint_uri = endpoint;
        }
        let tags: Vec<String> = self
            .tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if !tags.is_empty() {
            config.client.tags = tags;
        }
        if let Some(tmp_dir) = self.tmp_dir {
            config.client.tmp_dir = tmp_dir;
        }
        config.debug |= self.debug;
        config.auto_repair();
    }
}

/// Load `<home>/indispenso.yaml` and layer the overrides on top.
pub fn load_config(home: &Path, overrides: Overrides) -> anyhow::Result<Config> {
    let mut config = Config::load(home)
        .with_context(|| format!("failed to load config from {}", home.display()))?;
    overrides.apply(&mut config);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win_over_file_values() {
        let mut config = Config::default();
        config.token = "from-file".into();
        config.client.tags = vec!["db".into()];

        Overrides {
            token: Some("from-flag".into()),
            endpoint: Some("server:1234".into()),
            tags: vec![" web ".into(), "".into(), "eu".into()],
            ..Default::default()
        }
        .apply(&mut config);

        assert_eq!(config.token, "from-flag");
        assert_eq!(config.client.endpoint_uri, "http://server:1234/");
        assert_eq!(config.client.tags, vec!["web".to_string(), "eu".to_string()]);
    }

    #[test]
    fn empty_overrides_keep_file_values() {
        let mut config = Config::default();
        config.token = "from-file".into();
        config.client.tags = vec!["db".into()];
        Overrides::default().apply(&mut config);
        assert_eq!(config.token, "from-file");
        assert_eq!(config.client.tags, vec!["db".to_string()]);
    }
}
