//! Worker programs and their supervision.
//!
//! A worker is any executable that reads one JSON value on stdin and writes a
//! JSON object of field updates (or nothing) on stdout. Brokers only run
//! workers found in their [`WorkerRegistry`]; a job naming anything else fails
//! with "worker not found".
//!
//! # Components
//!
//! - [`WorkerSpec`]: how to launch a worker and what input it takes
//! - [`WorkerRegistry`]: static name → spec table, loadable from JSON
//! - [`WorkerExecutor`]: spawns a worker in its own process group and reaps it
//! - [`builtin`]: the workers shipped inside this binary

pub mod builtin;
pub mod executor;

pub use executor::{RunningWorker, WorkerExecutor};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PyplnError, Result};

/// What a worker receives on stdin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// An empty object; the document is never looked up.
    None,
    /// The document's fields plus `_id`.
    #[default]
    Document,
    /// The blob's info plus its contents as text.
    Blob,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub input: InputKind,
    /// Fields that must be present in the input. When non-empty, only these
    /// fields (plus `_id`) are handed to the worker.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Seconds before the worker is terminated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            input: InputKind::default(),
            requires: Vec::new(),
            timeout: None,
        }
    }

    /// A worker run as `sh -c <script>`.
    pub fn shell(name: impl Into<String>, script: &str) -> Self {
        Self::new(name, "sh").with_args(["-c", script])
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input(mut self, input: InputKind) -> Self {
        self.input = input;
        self
    }

    pub fn with_requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_secs_f64());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        // Out-of-range values (negative, NaN, too large) mean no timeout.
        self.timeout
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|timeout| !timeout.is_zero())
    }
}

/// Static table of the workers a broker may run.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, WorkerSpec>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in workers, launched as `<exe> worker <name>`.
    pub fn builtin(exe: &Path) -> Self {
        let mut registry = Self::new();
        for spec in builtin::specs(exe) {
            registry.register(spec);
        }
        registry
    }

    /// Load a JSON array of [`WorkerSpec`]s.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let specs: Vec<WorkerSpec> = serde_json::from_str(&contents)
            .map_err(|e| PyplnError::Config(format!("{}: {}", path.display(), e)))?;
        let mut registry = Self::new();
        for spec in specs {
            registry.register(spec);
        }
        Ok(registry)
    }

    /// Add a worker, replacing any previous one with the same name.
    pub fn register(&mut self, spec: WorkerSpec) {
        self.workers.insert(spec.name.clone(), spec);
    }

    /// Add every worker of `other`, replacing same-named entries.
    pub fn extend(&mut self, other: WorkerRegistry) {
        self.workers.extend(other.workers);
    }

    pub fn get(&self, name: &str) -> Option<&WorkerSpec> {
        self.workers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn spec_defaults_from_json() {
        let spec: WorkerSpec =
            serde_json::from_str(r#"{"name": "echo", "program": "/usr/bin/echo-worker"}"#)
                .unwrap();
        assert_eq!(spec.input, InputKind::Document);
        assert!(spec.args.is_empty());
        assert!(spec.requires.is_empty());
        assert!(spec.timeout().is_none());
    }

    #[test]
    fn timeout_must_be_positive() {
        let mut spec = WorkerSpec::shell("slow", "sleep 1");
        spec.timeout = Some(0.0);
        assert!(spec.timeout().is_none());
        spec.timeout = Some(1.5);
        assert_eq!(spec.timeout(), Some(Duration::from_millis(1500)));
        spec.timeout = Some(1e300);
        assert_eq!(spec.timeout(), None);
    }

    #[test]
    fn builtin_registry_launches_this_binary() {
        let registry = WorkerRegistry::builtin(Path::new("/opt/pypln-lite"));
        let tokenizer = registry.get("tokenizer").unwrap();
        assert_eq!(tokenizer.program, PathBuf::from("/opt/pypln-lite"));
        assert_eq!(tokenizer.args, vec!["worker", "tokenizer"]);
        assert_eq!(registry.get("extractor").unwrap().input, InputKind::Blob);
        assert_eq!(
            registry.get("pos").unwrap().args,
            vec!["worker", "pos", "--palavras", "/opt/palavras/por.pl"]
        );
        assert!(registry.get("palavras").is_none());
    }

    #[test]
    fn registry_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name": "snorlax", "program": "sh", "args": ["-c", "sleep 100"],
                 "requires": ["sleep-for"], "timeout": 2.5}}]"#
        )
        .unwrap();

        let registry = WorkerRegistry::from_json_file(file.path()).unwrap();
        assert_eq!(registry.len(), 1);
        let snorlax = registry.get("snorlax").unwrap();
        assert_eq!(snorlax.requires, vec!["sleep-for"]);
        assert_eq!(snorlax.timeout(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn malformed_registry_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(
            WorkerRegistry::from_json_file(file.path()),
            Err(PyplnError::Config(_))
        ));
    }
}
