//! Worker-kind registry.
//!
//! A worker's declared `type` resolves to a [`WorkerKind`] through a
//! host-controlled registry assembled at startup: builtin kinds plus any
//! declared in the kind manifest. No code is loaded at runtime.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::RwLock;

use gaffer_core::config::{KindManifest, WorkerDefinition, WorkersConfig};
use gaffer_core::error::{Error, Result};

/// Capability interface backing a worker's runtime behavior.
pub trait WorkerKind: Send + Sync {
    /// Type name workers reference in their definition.
    fn type_name(&self) -> &str;

    /// Human-readable description.
    fn info(&self) -> &str;

    /// Build the launch command for one run with the declared arguments.
    fn launch(&self, args: &[String]) -> Result<Command>;
}

/// Builtin kind: the first declared argument is the program, the rest its
/// argv.
pub struct CmdKind;

impl WorkerKind for CmdKind {
    fn type_name(&self) -> &str {
        "cmd"
    }

    fn info(&self) -> &str {
        "runs the declared arguments as a command line"
    }

    fn launch(&self, args: &[String]) -> Result<Command> {
        let (program, rest) = args.split_first().ok_or_else(|| {
            Error::Config("cmd kind requires at least one argument (the program)".to_string())
        })?;
        let mut cmd = Command::new(program);
        cmd.args(rest);
        Ok(cmd)
    }
}

/// Manifest-backed kind: a fixed executable, declared arguments appended.
pub struct ExecKind {
    type_name: String,
    program: PathBuf,
    info: String,
}

impl WorkerKind for ExecKind {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn info(&self) -> &str {
        &self.info
    }

    fn launch(&self, args: &[String]) -> Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        Ok(cmd)
    }
}

/// Registry mapping type names to worker kinds.
pub struct KindRegistry {
    kinds: HashMap<String, Arc<dyn WorkerKind>>,
}

impl KindRegistry {
    /// Registry pre-populated with the builtin kinds.
    pub fn builtin() -> Self {
        let mut registry = Self {
            kinds: HashMap::new(),
        };
        // Builtins cannot collide in a fresh map.
        let _ = registry.register(Arc::new(CmdKind));
        registry
    }

    /// Register one kind; type collisions are a setup-time failure.
    pub fn register(&mut self, kind: Arc<dyn WorkerKind>) -> Result<()> {
        let name = kind.type_name().to_string();
        if self.kinds.contains_key(&name) {
            return Err(Error::DuplicateKind { kind: name });
        }
        self.kinds.insert(name, kind);
        Ok(())
    }

    /// Register every kind declared in a manifest.
    pub fn register_manifest(&mut self, manifest: &KindManifest) -> Result<()> {
        for decl in &manifest.kinds {
            self.register(Arc::new(ExecKind {
                type_name: decl.kind.clone(),
                program: decl.program.clone(),
                info: decl.info.clone(),
            }))?;
        }
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn WorkerKind>> {
        self.kinds.get(type_name).cloned()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}

/// One declared worker joined with its resolved kind.
#[derive(Clone)]
pub struct ResolvedWorker {
    pub definition: WorkerDefinition,
    pub kind: Arc<dyn WorkerKind>,
}

// The kind is a trait object; it debugs as its type name.
impl fmt::Debug for ResolvedWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedWorker")
            .field("definition", &self.definition)
            .field("kind", &self.kind.type_name())
            .finish()
    }
}

/// Live worker table shared across the dispatcher and supervisor.
pub type WorkerTable = Arc<RwLock<HashMap<String, ResolvedWorker>>>;

/// Join the declared worker table with the registry.
///
/// A worker naming an unregistered type is a setup-time failure.
pub fn resolve_workers(
    config: &WorkersConfig,
    registry: &KindRegistry,
) -> Result<HashMap<String, ResolvedWorker>> {
    let mut resolved = HashMap::with_capacity(config.workers.len());
    for definition in &config.workers {
        let kind = registry.get(&definition.kind).ok_or_else(|| {
            Error::Config(format!(
                "worker <{}> names unregistered kind <{}>",
                definition.name, definition.kind
            ))
        })?;
        resolved.insert(
            definition.name.clone(),
            ResolvedWorker {
                definition: definition.clone(),
                kind,
            },
        );
    }
    Ok(resolved)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn definition(name: &str, kind: &str, args: &[&str]) -> WorkerDefinition {
        WorkerDefinition {
            name: name.to_string(),
            kind: kind.to_string(),
            reload: false,
            args: args.iter().map(|a| (*a).to_string()).collect(),
            after: Vec::new(),
        }
    }

    #[test]
    fn builtin_registry_has_cmd() {
        let registry = KindRegistry::builtin();
        let kind = registry.get("cmd").unwrap();
        assert_eq!(kind.type_name(), "cmd");
    }

    #[test]
    fn duplicate_kind_registration_fails() {
        let mut registry = KindRegistry::builtin();
        let err = registry.register(Arc::new(CmdKind)).unwrap_err();
        assert!(matches!(err, Error::DuplicateKind { kind } if kind == "cmd"));
    }

    #[test]
    fn manifest_kinds_are_registered() {
        let mut registry = KindRegistry::builtin();
        let manifest = KindManifest {
            kinds: vec![gaffer_core::config::KindDefinition {
                kind: "deploy-script".to_string(),
                program: PathBuf::from("/usr/local/bin/deploy"),
                info: String::new(),
            }],
        };
        registry.register_manifest(&manifest).unwrap();
        assert!(registry.get("deploy-script").is_some());
    }

    #[test]
    fn cmd_kind_requires_a_program() {
        let err = CmdKind.launch(&[]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn resolve_joins_workers_with_kinds() {
        let config = WorkersConfig {
            workers: vec![definition("build", "cmd", &["true"])],
        };
        let resolved = resolve_workers(&config, &KindRegistry::builtin()).unwrap();
        assert_eq!(resolved["build"].definition.args, vec!["true"]);
        // Trait-object kinds render as their type name.
        assert!(format!("{:?}", resolved["build"]).contains("cmd"));
    }

    #[test]
    fn resolve_fails_for_unknown_kind() {
        let config = WorkersConfig {
            workers: vec![definition("build", "missing-kind", &[])],
        };
        let err = resolve_workers(&config, &KindRegistry::builtin()).unwrap_err();
        assert!(err.to_string().contains("missing-kind"), "{err}");
    }
}
