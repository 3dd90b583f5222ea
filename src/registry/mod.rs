//! Command registry - plugin discovery with generation-tagged catalogs
//!
//! Each registry watches one directory of plugin manifests for one
//! [`CommandKind`]. A discovery pass reads every `*.toml` file in file name
//! order, adapts it to the capability contract and keeps the successes:
//!
//! ```text
//! manifest ─► parse ─► CapabilityContract::check ─► PluginLibrary entry
//!                                                       │
//!                            CommandDescriptor ◄─ CommandBuilder::build
//! ```
//!
//! A candidate that fails any step is logged and skipped. The result is an
//! immutable [`CommandCatalog`] tagged with a generation id. Reloading
//! publishes a new catalog through a `watch` channel and never touches the
//! old one, so descriptors (and the instances they created) from an older
//! generation keep working.

pub mod library;
pub mod manifest;

pub use library::{CommandBuilder, PluginLibrary};
pub use manifest::{CapabilityContract, CommandManifest, MANIFEST_EXTENSION};

use crate::command::{Capability, Command, CommandEnv, CommandError, CommandFactory, CommandKind};
use chrono::{DateTime, Local};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Reasons a single candidate is left out of a catalog. Never fatal for a load.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("{path} has no `{field}`")]
    MissingField { path: PathBuf, field: &'static str },

    #[error("{name} declares kind {declared}, registry holds {expected} commands")]
    KindMismatch {
        name: String,
        declared: CommandKind,
        expected: CommandKind,
    },

    #[error("{name} refers to unknown entry `{entry}`")]
    UnknownEntry { name: String, entry: String },

    #[error("Entry `{entry}` of {name} cannot build {kind} commands")]
    UnsupportedKind {
        name: String,
        entry: String,
        kind: CommandKind,
    },

    #[error("{name} requires {capability}, which {kind} commands may not use")]
    Capability {
        name: String,
        kind: CommandKind,
        capability: Capability,
    },

    #[error("Failed to construct {name}: {source}")]
    Construction { name: String, source: CommandError },

    #[error("{name} is already registered by {first}")]
    Duplicate { name: String, first: PathBuf },
}

/// An immutable catalog entry. Holds its factory for as long as anyone holds it.
#[derive(Clone)]
pub struct CommandDescriptor {
    name: String,
    kind: CommandKind,
    generation: u64,
    source: Option<PathBuf>,
    requires: Vec<Capability>,
    factory: Arc<dyn CommandFactory>,
}

impl CommandDescriptor {
    /// Descriptor not backed by a manifest file.
    pub fn new(name: impl Into<String>, kind: CommandKind, factory: Arc<dyn CommandFactory>) -> Self {
        Self {
            name: name.into(),
            kind,
            generation: 0,
            source: None,
            requires: Vec::new(),
            factory,
        }
    }

    pub fn with_requires(mut self, requires: Vec<Capability>) -> Self {
        self.requires = requires;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn requires(&self) -> &[Capability] {
        &self.requires
    }

    /// Creates a new instance, failing if `env` lacks a required capability.
    pub fn instantiate(&self, env: &CommandEnv) -> Result<Box<dyn Command>, CommandError> {
        if let Some(missing) = self.requires.iter().find(|c| !env.provides(**c)) {
            return Err(CommandError::MissingCapability(*missing));
        }
        self.factory.create(env)
    }
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .field("source", &self.source)
            .field("requires", &self.requires)
            .finish()
    }
}

/// Result of one discovery pass.
#[derive(Debug)]
pub struct CommandCatalog {
    kind: CommandKind,
    generation: u64,
    loaded_at: DateTime<Local>,
    descriptors: Vec<Arc<CommandDescriptor>>,
}

impl CommandCatalog {
    pub fn empty(kind: CommandKind) -> Self {
        Self {
            kind,
            generation: 0,
            loaded_at: Local::now(),
            descriptors: Vec::new(),
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> DateTime<Local> {
        self.loaded_at
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<CommandDescriptor>> {
        self.descriptors.get(index)
    }

    pub fn find(&self, name: &str) -> Option<&Arc<CommandDescriptor>> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CommandDescriptor>> {
        self.descriptors.iter()
    }
}

/// Discovers the commands of one kind under one directory.
pub struct CommandRegistry {
    directory: PathBuf,
    contract: CapabilityContract,
    library: PluginLibrary,
    next_generation: AtomicU64,
    catalog: watch::Sender<Arc<CommandCatalog>>,
}

impl CommandRegistry {
    pub fn new(kind: CommandKind, directory: impl Into<PathBuf>, library: PluginLibrary) -> Self {
        let (catalog, _) = watch::channel(Arc::new(CommandCatalog::empty(kind)));
        Self {
            directory: directory.into(),
            contract: CapabilityContract::for_kind(kind),
            library,
            next_generation: AtomicU64::new(1),
            catalog,
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.contract.kind()
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Runs a discovery pass and publishes it as the current catalog.
    pub async fn load(&self) -> Arc<CommandCatalog> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let mut descriptors: Vec<Arc<CommandDescriptor>> = Vec::new();
        let mut seen = HashSet::new();

        for path in self.candidates().await {
            match self.adapt(&path, generation).await {
                Ok(descriptor) => {
                    if !seen.insert(descriptor.name.clone()) {
                        let first = descriptors
                            .iter()
                            .find(|d| d.name == descriptor.name)
                            .and_then(|d| d.source.clone())
                            .unwrap_or_default();
                        warn!(
                            "Skipping plugin {}: {}",
                            path.display(),
                            RegistryError::Duplicate {
                                name: descriptor.name.clone(),
                                first,
                            }
                        );
                        continue;
                    }
                    debug!("Loaded {} command {}", self.kind(), descriptor.name);
                    descriptors.push(Arc::new(descriptor));
                }
                Err(e) => warn!("Skipping plugin {}: {}", path.display(), e),
            }
        }

        let catalog = Arc::new(CommandCatalog {
            kind: self.kind(),
            generation,
            loaded_at: Local::now(),
            descriptors,
        });
        info!(
            "{} catalog generation {} has {} commands",
            catalog.kind,
            catalog.generation,
            catalog.len()
        );

        // A slower pass must not replace a newer generation.
        self.catalog.send_if_modified(|current| {
            if current.generation < generation {
                *current = catalog.clone();
                true
            } else {
                false
            }
        });
        catalog
    }

    /// Fresh discovery pass. Earlier catalogs stay valid.
    pub async fn reload(&self) -> Arc<CommandCatalog> {
        info!("Reloading {} commands from {}", self.kind(), self.directory.display());
        self.load().await
    }

    pub fn current(&self) -> Arc<CommandCatalog> {
        self.catalog.borrow().clone()
    }

    /// Notified whenever a new generation is published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<CommandCatalog>> {
        self.catalog.subscribe()
    }

    async fn candidates(&self) -> Vec<PathBuf> {
        let mut read_dir = match tokio::fs::read_dir(&self.directory).await {
            Ok(read_dir) => read_dir,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::NotFound {
                    debug!("Command directory {} does not exist", self.directory.display());
                } else {
                    warn!("Failed to read command directory {}: {}", self.directory.display(), e);
                }
                return Vec::new();
            }
        };

        let mut paths = Vec::new();
        loop {
            match read_dir.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    let is_manifest = path
                        .extension()
                        .is_some_and(|ext| ext == MANIFEST_EXTENSION);
                    let is_file = entry
                        .file_type()
                        .await
                        .map(|t| t.is_file())
                        .unwrap_or(false);
                    if is_manifest && is_file {
                        paths.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read entry in {}: {}", self.directory.display(), e);
                    break;
                }
            }
        }

        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        paths
    }

    async fn adapt(&self, path: &Path, generation: u64) -> Result<CommandDescriptor, RegistryError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RegistryError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;

        let manifest = CommandManifest::parse(path, &content)?;
        self.contract.check(&manifest)?;

        let kind = self.kind();
        let builder = self
            .library
            .get(&manifest.entry)
            .ok_or_else(|| RegistryError::UnknownEntry {
                name: manifest.name.clone(),
                entry: manifest.entry.clone(),
            })?;
        if !builder.kinds().contains(&kind) {
            return Err(RegistryError::UnsupportedKind {
                name: manifest.name.clone(),
                entry: manifest.entry.clone(),
                kind,
            });
        }

        let factory = builder
            .build(&manifest)
            .map_err(|e| RegistryError::Construction {
                name: manifest.name.clone(),
                source: e,
            })?;

        Ok(CommandDescriptor {
            name: manifest.name,
            kind,
            generation,
            source: Some(manifest.path),
            requires: manifest.requires,
            factory,
        })
    }
}

/// The scripted and hardware registries, loaded together.
pub struct CommandRegistries {
    pub scripted: CommandRegistry,
    pub hardware: CommandRegistry,
}

impl CommandRegistries {
    pub fn new(
        scripted_dir: impl Into<PathBuf>,
        hardware_dir: impl Into<PathBuf>,
        library: PluginLibrary,
    ) -> Self {
        Self {
            scripted: CommandRegistry::new(CommandKind::Scripted, scripted_dir, library.clone()),
            hardware: CommandRegistry::new(CommandKind::Hardware, hardware_dir, library),
        }
    }

    pub fn get(&self, kind: CommandKind) -> &CommandRegistry {
        match kind {
            CommandKind::Scripted => &self.scripted,
            CommandKind::Hardware => &self.hardware,
        }
    }

    pub async fn load_all(&self) -> (Arc<CommandCatalog>, Arc<CommandCatalog>) {
        tokio::join!(self.scripted.load(), self.hardware.load())
    }

    pub async fn reload_all(&self) -> (Arc<CommandCatalog>, Arc<CommandCatalog>) {
        tokio::join!(self.scripted.reload(), self.hardware.reload())
    }
}
