use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{IndispensoError, Result};
use crate::strategy::ExecutionStrategy;
use crate::types::OutputStream;

// ---------------------------------------------------------------------------
// ValidationRule
// ---------------------------------------------------------------------------

/// Expectation about one output stream of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub output_stream: OutputStream,
    pub text: String,
    #[serde(default = "default_must_contain")]
    pub must_contain: bool,
}

fn default_must_contain() -> bool {
    true
}

impl ValidationRule {
    pub fn new(output_stream: OutputStream, text: impl Into<String>, must_contain: bool) -> Result<Self> {
        let text = text.into();
        if text.is_empty() {
            return Err(IndispensoError::InvalidRule(
                "validation text must not be empty".into(),
            ));
        }
        Ok(Self {
            output_stream,
            text,
            must_contain,
        })
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    /// Seconds of execution before the command is killed.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Votes needed before execution, the requester included.
    #[serde(default)]
    pub min_auth: Option<u32>,
    #[serde(default)]
    pub execution_strategy: ExecutionStrategy,
}

fn default_timeout() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

impl Template {
    pub fn new(title: impl Into<String>, command: impl Into<String>, timeout: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: String::new(),
            command: command.into(),
            timeout,
            validation_rules: Vec::new(),
            enabled: true,
            min_auth: None,
            execution_strategy: ExecutionStrategy::Simple,
        }
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.validation_rules.push(rule);
        self
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.execution_strategy = strategy;
        self
    }

    pub fn with_min_auth(mut self, min_auth: u32) -> Self {
        self.min_auth = Some(min_auth);
        self
    }
}

// ---------------------------------------------------------------------------
// TemplateStore
// ---------------------------------------------------------------------------

/// Read access to templates, as needed by the rollout engine.
pub trait TemplateStore: Send + Sync {
    fn get(&self, id: &str) -> Option<Template>;
}

/// Templates held in memory, optionally backed by a plain JSON file
/// (`{"<id>": {...template...}}`).
#[derive(Debug, Default)]
pub struct JsonTemplateStore {
    path: Option<PathBuf>,
    templates: RwLock<HashMap<String, Template>>,
}

impl JsonTemplateStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing file yields an empty store bound to that path.
    pub fn load(path: &Path) -> Result<Self> {
        let templates = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            templates: RwLock::new(templates),
        })
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = {
            let templates = self.templates.read().unwrap_or_else(|e| e.into_inner());
            serde_json::to_vec_pretty(&*templates)?
        };
        crate::io::atomic_write(path, &data)
    }

    pub fn add(&self, template: Template) {
        let mut templates = self.templates.write().unwrap_or_else(|e| e.into_inner());
        templates.insert(template.id.clone(), template);
    }

    pub fn remove(&self, id: &str) -> Option<Template> {
        let mut templates = self.templates.write().unwrap_or_else(|e| e.into_inner());
        templates.remove(id)
    }

    /// All templates, ordered by id.
    pub fn list(&self) -> Vec<Template> {
        let templates = self.templates.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<Template> = templates.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.templates.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TemplateStore for JsonTemplateStore {
    fn get(&self, id: &str) -> Option<Template> {
        self.templates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_rule_text_is_rejected() {
        assert!(ValidationRule::new(OutputStream::Stdout, "", true).is_err());
        assert!(ValidationRule::new(OutputStream::Stdout, "OK", true).is_ok());
    }

    #[test]
    fn template_defaults_from_json() {
        let json = r#"{"id":"t1","command":"uptime"}"#;
        let t: Template = serde_json::from_str(json).unwrap();
        assert!(t.enabled);
        assert_eq!(t.timeout, 300);
        assert_eq!(t.execution_strategy, ExecutionStrategy::Simple);
        assert!(t.min_auth.is_none());
    }

    #[test]
    fn store_saves_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("templates.json");

        let store = JsonTemplateStore::load(&path).unwrap();
        assert!(store.is_empty());
        let template = Template::new("reload nginx", "service nginx reload", 30)
            .with_rule(ValidationRule::new(OutputStream::Stdout, "OK", true).unwrap())
            .with_strategy(ExecutionStrategy::Canary);
        let id = template.id.clone();
        store.add(template.clone());
        store.save().unwrap();

        let reloaded = JsonTemplateStore::load(&path).unwrap();
        assert_eq!(reloaded.get(&id), Some(template));
    }

    #[test]
    fn remove_drops_template() {
        let store = JsonTemplateStore::in_memory();
        let t = Template::new("t", "true", 1);
        let id = t.id.clone();
        store.add(t);
        assert!(store.remove(&id).is_some());
        assert!(store.get(&id).is_none());
    }
}
