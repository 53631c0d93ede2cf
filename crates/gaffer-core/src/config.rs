//! Worker table and kind-manifest parsing.
//!
//! The daemon consumes a pre-validated table of worker definitions; all
//! validation (name uniqueness, `after` references, acyclicity) happens here
//! at load time and is fatal to startup.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One declared worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDefinition {
    /// Unique worker name.
    pub name: String,
    /// Worker kind, resolved to a launch command through the kind registry.
    #[serde(rename = "type")]
    pub kind: String,
    /// Respawn automatically after abnormal exit.
    #[serde(default)]
    pub reload: bool,
    /// Arguments handed to the resolved command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Worker names that must reach done before this one may run.
    #[serde(default)]
    pub after: Vec<String>,
}

/// The declared worker table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default)]
    pub workers: Vec<WorkerDefinition>,
}

impl WorkersConfig {
    /// Load and validate a worker table from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate name uniqueness and the `after` graph.
    pub fn validate(&self) -> Result<()> {
        self.validate_names()?;
        self.validate_after_graph()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(|w| w.name.as_str())
    }

    fn validate_names(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for worker in &self.workers {
            if worker.name.is_empty() {
                return Err(Error::Config("worker name must not be empty".to_string()));
            }
            if !seen.insert(worker.name.as_str()) {
                return Err(Error::Config(format!(
                    "worker <{}> is declared twice",
                    worker.name
                )));
            }
        }
        Ok(())
    }

    /// Every `after` entry must name another declared worker, and the whole
    /// graph must be acyclic (Kahn's algorithm).
    fn validate_after_graph(&self) -> Result<()> {
        let names: HashSet<&str> = self.names().collect();

        for worker in &self.workers {
            for dep in &worker.after {
                if !names.contains(dep.as_str()) {
                    return Err(Error::Config(format!(
                        "the after list of worker <{}> references unknown worker <{dep}>",
                        worker.name
                    )));
                }
                if dep == &worker.name {
                    return Err(Error::Config(format!(
                        "worker <{}> depends on itself",
                        worker.name
                    )));
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for worker in &self.workers {
            in_degree.insert(worker.name.as_str(), worker.after.len());
            dependents.entry(worker.name.as_str()).or_default();
        }
        for worker in &self.workers {
            for dep in &worker.after {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(worker.name.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut processed = 0usize;
        while let Some(name) = queue.pop_front() {
            processed += 1;
            if let Some(downstream) = dependents.get(name) {
                for ds in downstream {
                    if let Some(deg) = in_degree.get_mut(ds) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 {
                            queue.push_back(ds);
                        }
                    }
                }
            }
        }

        if processed != self.workers.len() {
            return Err(Error::Config(
                "worker after graph contains a cycle".to_string(),
            ));
        }
        Ok(())
    }
}

/// One externally declared worker kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    /// Executable implementing this kind.
    pub program: PathBuf,
    #[serde(default)]
    pub info: String,
}

/// Optional manifest of external worker kinds, registered alongside builtins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KindManifest {
    #[serde(default)]
    pub kinds: Vec<KindDefinition>,
}

impl KindManifest {
    /// Load a kind manifest from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let manifest: Self = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        for kind in &manifest.kinds {
            if kind.kind.is_empty() {
                return Err(Error::Config(format!(
                    "kind with program {} has an empty type",
                    kind.program.display()
                )));
            }
        }
        Ok(manifest)
    }
}
