//! Entry points a manifest can refer to.

use super::CommandManifest;
use crate::command::mcu::McuSyncBuilder;
use crate::command::sequence::SequenceBuilder;
use crate::command::{CommandError, CommandFactory, CommandKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Turns a manifest into a factory for command instances.
pub trait CommandBuilder: Send + Sync {
    /// Kinds this entry can be registered under.
    fn kinds(&self) -> &'static [CommandKind];

    fn build(&self, manifest: &CommandManifest) -> Result<Arc<dyn CommandFactory>, CommandError>;
}

/// Name → builder table shared by all registries.
#[derive(Clone, Default)]
pub struct PluginLibrary {
    builders: BTreeMap<String, Arc<dyn CommandBuilder>>,
}

impl PluginLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut library = Self::new();
        library.register("sequence", SequenceBuilder);
        library.register("mcu_sync", McuSyncBuilder);
        library
    }

    /// Adds or replaces an entry.
    pub fn register(&mut self, entry: impl Into<String>, builder: impl CommandBuilder + 'static) {
        let entry = entry.into();
        debug!("Registered plugin entry {}", entry);
        self.builders.insert(entry, Arc::new(builder));
    }

    pub fn get(&self, entry: &str) -> Option<Arc<dyn CommandBuilder>> {
        self.builders.get(entry).cloned()
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for PluginLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.builders.keys()).finish()
    }
}
