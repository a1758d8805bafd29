//! Command kind registry.
//!
//! Maps kind names to factories that build a default payload. Kinds are
//! registered from Rust types or loaded from a TOML file, which may also
//! name a hook executable for the kind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::command::{Command, CommandKind};
use crate::error::{Error, Result};

type Factory = Arc<dyn Fn() -> Command + Send + Sync>;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct KindsFile {
    #[serde(default, rename = "kind")]
    kinds: Vec<KindConfig>,
}

/// A kind declared in a kinds file.
#[derive(Debug, Clone, Deserialize)]
pub struct KindConfig {
    pub name: String,
    /// Default parameters for a payload built by name.
    #[serde(default)]
    pub params: toml::Table,
    /// Executable that runs commands of this kind.
    pub command: Option<PathBuf>,
}

/// A registered kind.
#[derive(Clone)]
pub struct KindEntry {
    name: String,
    hook: Option<PathBuf>,
    factory: Factory,
}

impl KindEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hook executable declared for this kind, if any.
    pub fn hook(&self) -> Option<&Path> {
        self.hook.as_deref()
    }

    /// A default-valued payload of this kind.
    pub fn create(&self) -> Command {
        (self.factory)()
    }
}

impl std::fmt::Debug for KindEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindEntry")
            .field("name", &self.name)
            .field("hook", &self.hook)
            .finish_non_exhaustive()
    }
}

/// Registry of known command kinds, indexed by exact name.
#[derive(Debug, Default, Clone)]
pub struct KindRegistry {
    kinds: HashMap<String, KindEntry>,
}

impl KindRegistry {
    /// Create an empty registry with no kinds.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register a typed kind. Its `Default` value is the by-name payload.
    pub fn register<K: CommandKind>(&mut self) -> &mut Self {
        self.insert(KindEntry {
            name: K::NAME.to_string(),
            hook: None,
            factory: Arc::new(|| {
                // A derived Serialize on a struct does not fail.
                Command::from_kind(&K::default()).unwrap_or_else(|_| Command::new(K::NAME))
            }),
        });
        self
    }

    /// Register a kind declared in configuration.
    pub fn register_config(&mut self, config: KindConfig) -> Result<&mut Self> {
        let params = serde_json::to_value(&config.params)
            .map_err(|e| Error::Config(format!("bad params for kind {}: {e}", config.name)))?;
        let name = config.name.clone();
        self.insert(KindEntry {
            name: config.name,
            hook: config.command,
            factory: Arc::new(move || Command::new(name.clone()).params(params.clone())),
        });
        Ok(self)
    }

    /// Load all kinds from a TOML file and build the registry.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read kinds file {}: {e}", path.display()))
        })?;
        let file: KindsFile = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad kinds file {}: {e}", path.display())))?;

        let mut registry = Self::empty();
        for kind in file.kinds {
            if kind.name.trim().is_empty() {
                return Err(Error::Config(format!(
                    "kind with empty name in {}",
                    path.display()
                )));
            }
            registry.register_config(kind)?;
        }
        Ok(registry)
    }

    /// Resolve a kind by name.
    ///
    /// Only the last `.`-separated segment of `name` is compared, ignoring
    /// ASCII case. Errors with `NotFound` on no match and `Ambiguous` when
    /// more than one kind matches.
    pub fn resolve(&self, name: &str) -> Result<&KindEntry> {
        let wanted = short_name(name);
        let mut matches: Vec<&KindEntry> = self
            .kinds
            .values()
            .filter(|entry| short_name(&entry.name).eq_ignore_ascii_case(wanted))
            .collect();

        match matches.len() {
            0 => Err(Error::NotFound(format!("command kind {name}"))),
            1 => Ok(matches.remove(0)),
            _ => {
                let mut candidates: Vec<String> =
                    matches.iter().map(|entry| entry.name.clone()).collect();
                candidates.sort();
                Err(Error::Ambiguous {
                    name: name.to_string(),
                    candidates,
                })
            }
        }
    }

    /// Look up a kind by exact name.
    pub fn get(&self, name: &str) -> Option<&KindEntry> {
        self.kinds.get(name)
    }

    /// All registered kinds, sorted by name.
    pub fn entries(&self) -> Vec<&KindEntry> {
        let mut entries: Vec<&KindEntry> = self.kinds.values().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    fn insert(&mut self, entry: KindEntry) {
        self.kinds.insert(entry.name.clone(), entry);
    }
}

fn short_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct RssSync {
        full: bool,
    }

    impl CommandKind for RssSync {
        const NAME: &'static str = "RssSync";
    }

    #[test]
    fn short_name_takes_last_segment() {
        assert_eq!(short_name("Core.Indexers.RssSync"), "RssSync");
        assert_eq!(short_name("RssSync"), "RssSync");
        assert_eq!(short_name(""), "");
    }

    #[test]
    fn resolve_ignores_case_and_namespace() {
        let mut registry = KindRegistry::empty();
        registry.register::<RssSync>();

        let entry = registry.resolve("core.indexers.rsssync").unwrap();
        assert_eq!(entry.name(), "RssSync");

        let cmd = entry.create();
        assert_eq!(cmd.name, "RssSync");
        assert_eq!(cmd.params, serde_json::json!({"full": false}));
    }
}
