//! Plugin manifest files and the per-kind capability contract.

use super::RegistryError;
use crate::command::{Capability, CommandKind};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Extension of candidate manifest files.
pub const MANIFEST_EXTENSION: &str = "toml";

#[derive(Debug, Deserialize)]
struct RawManifest {
    name: Option<String>,
    entry: Option<String>,
    kind: Option<CommandKind>,
    #[serde(default)]
    requires: Vec<Capability>,
    #[serde(default)]
    params: toml::Table,
}

/// A parsed plugin manifest that has not been checked against a contract yet.
#[derive(Debug, Clone)]
pub struct CommandManifest {
    pub name: String,
    pub entry: String,
    pub kind: Option<CommandKind>,
    pub requires: Vec<Capability>,
    pub params: toml::Table,
    pub path: PathBuf,
}

impl CommandManifest {
    pub fn parse(path: &Path, content: &str) -> Result<Self, RegistryError> {
        let raw: RawManifest = toml::from_str(content).map_err(|e| RegistryError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let name = required(path, "name", raw.name)?;
        let entry = required(path, "entry", raw.entry)?;

        Ok(Self {
            name,
            entry,
            kind: raw.kind,
            requires: raw.requires,
            params: raw.params,
            path: path.to_path_buf(),
        })
    }
}

fn required(path: &Path, field: &'static str, value: Option<String>) -> Result<String, RegistryError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(RegistryError::MissingField {
            path: path.to_path_buf(),
            field,
        }),
    }
}

/// What a manifest of one kind is allowed to declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityContract {
    kind: CommandKind,
    allowed: &'static [Capability],
}

impl CapabilityContract {
    pub fn for_kind(kind: CommandKind) -> Self {
        let allowed: &'static [Capability] = match kind {
            CommandKind::Scripted => &[Capability::Camera],
            // Firmware macros never see the camera.
            CommandKind::Hardware => &[],
        };
        Self { kind, allowed }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn permits(&self, capability: Capability) -> bool {
        self.allowed.contains(&capability)
    }

    /// Structural checks that do not need the plugin library.
    pub fn check(&self, manifest: &CommandManifest) -> Result<(), RegistryError> {
        if let Some(kind) = manifest.kind {
            if kind != self.kind {
                return Err(RegistryError::KindMismatch {
                    name: manifest.name.clone(),
                    declared: kind,
                    expected: self.kind,
                });
            }
        }

        if let Some(capability) = manifest.requires.iter().find(|c| !self.permits(**c)) {
            return Err(RegistryError::Capability {
                name: manifest.name.clone(),
                kind: self.kind,
                capability: *capability,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Result<CommandManifest, RegistryError> {
        CommandManifest::parse(Path::new("test.toml"), src)
    }

    #[test]
    fn parses_a_full_manifest() {
        let manifest = parse(
            r#"
            name = "Shiny Hunt"
            entry = "sequence"
            kind = "scripted"
            requires = ["camera"]

            [params]
            repeat = 0
            "#,
        )
        .unwrap();

        assert_eq!(manifest.name, "Shiny Hunt");
        assert_eq!(manifest.entry, "sequence");
        assert_eq!(manifest.kind, Some(CommandKind::Scripted));
        assert_eq!(manifest.requires, vec![Capability::Camera]);
        assert_eq!(manifest.params.get("repeat"), Some(&toml::Value::Integer(0)));
    }

    #[test]
    fn missing_or_blank_fields_are_reported() {
        assert!(matches!(
            parse("name = \"x\""),
            Err(RegistryError::MissingField { field: "entry", .. })
        ));
        assert!(matches!(
            parse("name = \"  \"\nentry = \"sequence\""),
            Err(RegistryError::MissingField { field: "name", .. })
        ));
        assert!(matches!(parse("name = ["), Err(RegistryError::Parse { .. })));
        assert!(matches!(
            parse("name = \"x\"\nentry = \"sequence\"\nrequires = [\"radar\"]"),
            Err(RegistryError::Parse { .. })
        ));
    }

    #[test]
    fn hardware_contract_rejects_camera() {
        let manifest = parse("name = \"x\"\nentry = \"mcu_sync\"\nrequires = [\"camera\"]").unwrap();

        assert!(CapabilityContract::for_kind(CommandKind::Scripted)
            .check(&manifest)
            .is_ok());
        assert!(matches!(
            CapabilityContract::for_kind(CommandKind::Hardware).check(&manifest),
            Err(RegistryError::Capability {
                capability: Capability::Camera,
                ..
            })
        ));
    }

    #[test]
    fn declared_kind_must_match() {
        let manifest = parse("name = \"x\"\nentry = \"mcu_sync\"\nkind = \"hardware\"").unwrap();
        assert!(matches!(
            CapabilityContract::for_kind(CommandKind::Scripted).check(&manifest),
            Err(RegistryError::KindMismatch { .. })
        ));
    }
}
