//! Agent discovery from a source directory.
//!
//! When an application keeps agent definitions in a directory, the
//! [`AgentManager`] scans it for files with source-code extensions and
//! extracts lightweight metadata without executing anything: an id (the
//! file stem), plus name and description pulled from `@name` /
//! `@description` comment markers or `name:` / `description:` string
//! literals.
//!
//! Actual agent instances are produced lazily: register a loader closure
//! per id and the first `load` call instantiates and caches the agent.

use crate::agent::BaseAgent;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use walkdir::WalkDir;

/// File extensions considered agent source files.
const SOURCE_EXTENSIONS: &[&str] = &["rs", "ts", "js", "py", "go", "java"];

/// Factory producing an agent instance on first use.
pub type AgentLoader = Arc<dyn Fn() -> Result<Arc<dyn BaseAgent>> + Send + Sync>;

/// Metadata extracted from one scanned file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCard {
    /// Stable id: the file stem.
    pub id: String,

    /// Display name, when the file declares one.
    pub name: Option<String>,

    /// Description, when the file declares one.
    pub description: Option<String>,

    /// Path of the file the card was extracted from.
    pub path: PathBuf,
}

/// Scans agent directories and lazily instantiates agents.
#[derive(Default)]
pub struct AgentManager {
    cards: HashMap<String, AgentCard>,
    loaders: HashMap<String, AgentLoader>,
    instances: RwLock<HashMap<String, Arc<dyn BaseAgent>>>,
}

impl AgentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans `dir` recursively for agent source files and records a card
    /// per file. Rescanning refreshes existing cards by id.
    pub fn scan(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(Error::validation(format!(
                "agents directory '{}' does not exist",
                dir.display()
            )));
        }

        let mut found = 0;
        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !SOURCE_EXTENSIONS.contains(&extension) {
                continue;
            }

            let Ok(source) = std::fs::read_to_string(path) else {
                log::warn!("skipping unreadable agent file '{}'", path.display());
                continue;
            };
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let card = AgentCard {
                id: id.to_string(),
                name: extract_marker(&source, "name"),
                description: extract_marker(&source, "description"),
                path: path.to_path_buf(),
            };
            log::debug!("discovered agent '{}' at {}", card.id, path.display());
            self.cards.insert(card.id.clone(), card);
            found += 1;
        }

        Ok(found)
    }

    /// All discovered cards.
    pub fn cards(&self) -> Vec<&AgentCard> {
        self.cards.values().collect()
    }

    /// Looks up a card by id.
    pub fn card(&self, id: &str) -> Option<&AgentCard> {
        self.cards.get(id)
    }

    /// Registers the factory that produces the agent for `id`.
    pub fn register_loader<F>(&mut self, id: impl Into<String>, loader: F)
    where
        F: Fn() -> Result<Arc<dyn BaseAgent>> + Send + Sync + 'static,
    {
        self.loaders.insert(id.into(), Arc::new(loader));
    }

    /// Returns the agent for `id`, instantiating it through its loader on
    /// first use and caching the instance.
    pub async fn load(&self, id: &str) -> Result<Arc<dyn BaseAgent>> {
        if let Some(instance) = self.instances.read().await.get(id) {
            return Ok(Arc::clone(instance));
        }

        let loader = self
            .loaders
            .get(id)
            .ok_or_else(|| Error::validation(format!("no loader registered for agent '{id}'")))?;
        let instance = loader()?;

        let mut instances = self.instances.write().await;
        // A racing load may have inserted already; keep the first
        let entry = instances
            .entry(id.to_string())
            .or_insert_with(|| Arc::clone(&instance));
        Ok(Arc::clone(entry))
    }
}

/// Extracts a `@key value` comment marker or a `key: "value"` literal.
fn extract_marker(source: &str, key: &str) -> Option<String> {
    let at_marker = format!("@{key}");
    for line in source.lines() {
        if let Some(position) = line.find(&at_marker) {
            let value = line[position + at_marker.len()..].trim();
            if !value.is_empty() {
                return Some(value.trim_matches(|c| c == '"' || c == '\'').to_string());
            }
        }
    }

    let literal_marker = format!("{key}:");
    for line in source.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(&literal_marker) {
            let rest = rest.trim().trim_end_matches(',').trim_end_matches(';');
            let unquoted = rest.trim_matches(|c| c == '"' || c == '\'');
            if !unquoted.is_empty() && unquoted.len() < rest.len() {
                // Only quoted literals count; bare identifiers are code
                return Some(unquoted.to_string());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_at_markers() {
        let source = "\
// @name Weather Agent
// @description Fetches weather forecasts
fn main() {}
";
        assert_eq!(extract_marker(source, "name").as_deref(), Some("Weather Agent"));
        assert_eq!(
            extract_marker(source, "description").as_deref(),
            Some("Fetches weather forecasts")
        );
    }

    #[test]
    fn test_extract_literal_markers() {
        let source = r#"
const agent = {
  name: "scheduler",
  description: "Plans meetings",
};
"#;
        assert_eq!(extract_marker(source, "name").as_deref(), Some("scheduler"));
        assert_eq!(
            extract_marker(source, "description").as_deref(),
            Some("Plans meetings")
        );
    }

    #[test]
    fn test_extract_missing_marker() {
        assert_eq!(extract_marker("fn main() {}", "name"), None);
    }

    #[test]
    fn test_scan_and_cards() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("weather.rs"),
            "// @name Weather\n// @description Forecasts\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not an agent").unwrap();

        let mut manager = AgentManager::new();
        let found = manager.scan(dir.path()).unwrap();
        assert_eq!(found, 1);

        let card = manager.card("weather").unwrap();
        assert_eq!(card.name.as_deref(), Some("Weather"));
        assert_eq!(card.description.as_deref(), Some("Forecasts"));
    }

    #[test]
    fn test_scan_missing_directory() {
        let mut manager = AgentManager::new();
        assert!(manager.scan("/definitely/not/a/dir").is_err());
    }

    #[tokio::test]
    async fn test_lazy_load_caches_instance() {
        use crate::agent::LlmAgent;
        use crate::model::{Llm, LlmRequest, LlmResponse};
        use async_trait::async_trait;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct StubLlm;
        #[async_trait]
        impl Llm for StubLlm {
            fn name(&self) -> &str {
                "stub"
            }
            async fn generate_content(&self, _: &LlmRequest) -> Result<LlmResponse> {
                Ok(LlmResponse::text("ok"))
            }
        }

        let constructions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&constructions);

        let mut manager = AgentManager::new();
        manager.register_loader("helper", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let agent = LlmAgent::builder("helper")
                .model(Arc::new(StubLlm))
                .build()?;
            Ok(Arc::new(agent) as Arc<dyn BaseAgent>)
        });

        let first = manager.load("helper").await.unwrap();
        let second = manager.load("helper").await.unwrap();
        assert_eq!(first.name(), "helper");
        assert_eq!(second.name(), "helper");
        assert_eq!(constructions.load(Ordering::SeqCst), 1);

        assert!(manager.load("unknown").await.is_err());
    }
}
