//! Capability kinds and the payload contracts extensions implement for them.
//!
//! Every kind is a zero-sized marker implementing [`CapabilityKind`]; the
//! payload traits are the interfaces the host calls at runtime once a
//! record has been selected from its table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::table::CapabilityKind;

// ---------------------------------------------------------------------------
// Games
// ---------------------------------------------------------------------------

/// Support for one game: where it lives and where its mods go.
pub trait GameDefinition: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    /// Locate an installation of the game, if any.
    fn query_path(&self) -> Result<Option<PathBuf>>;
    /// Directory mods are deployed into, relative to the game path.
    fn mod_path(&self, game_path: &Path) -> PathBuf;
    /// Executable to launch, relative to the game path.
    fn executable(&self, game_path: &Path) -> PathBuf;
}

pub struct GameKind;

impl CapabilityKind for GameKind {
    /// Game id.
    type Input = str;
    type Payload = dyn GameDefinition;
    const NAME: &'static str = "game";
    const UNIQUE: bool = true;
}

// ---------------------------------------------------------------------------
// Installers
// ---------------------------------------------------------------------------

/// Files extracted from a mod archive, offered to installers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallerInput {
    pub files: Vec<String>,
    pub game_id: String,
}

impl InstallerInput {
    pub fn new<I, S>(game_id: impl Into<String>, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            game_id: game_id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportResult {
    pub supported: bool,
    #[serde(default)]
    pub required_files: Vec<String>,
}

/// A single step of an installation plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InstallInstruction {
    Copy { source: String, destination: String },
    Mkdir { destination: String },
    GenerateFile { data: String, destination: String },
    Attribute { key: String, value: Value },
    SetModType { value: String },
}

pub trait Installer: Send + Sync {
    fn test_supported(&self, input: &InstallerInput) -> Result<SupportResult>;
    fn install(&self, input: &InstallerInput, destination: &Path) -> Result<Vec<InstallInstruction>>;
}

pub struct InstallerKind;

impl CapabilityKind for InstallerKind {
    type Input = InstallerInput;
    type Payload = dyn Installer;
    const NAME: &'static str = "installer";
    const UNIQUE: bool = true;
}

// ---------------------------------------------------------------------------
// Archive handlers
// ---------------------------------------------------------------------------

/// An opened archive.
pub trait Archive: Send {
    fn list(&self) -> Result<Vec<String>>;
    fn extract_all(&self, destination: &Path) -> Result<()>;
}

pub trait ArchiveHandler: Send + Sync {
    fn open(&self, archive: &Path) -> Result<Box<dyn Archive>>;
    /// Pack `files` (relative to `base`) into a new archive at `archive`.
    fn create(&self, archive: &Path, base: &Path, files: &[String]) -> Result<()>;
}

pub struct ArchiveHandlerKind;

impl CapabilityKind for ArchiveHandlerKind {
    /// Lowercase file extension without the leading dot.
    type Input = str;
    type Payload = dyn ArchiveHandler;
    const NAME: &'static str = "archive-handler";
    const UNIQUE: bool = false;
}

// ---------------------------------------------------------------------------
// Deployment methods
// ---------------------------------------------------------------------------

pub trait DeploymentMethod: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    /// `None` when usable for `game_id`, otherwise the reason it is not.
    fn unsupported_reason(&self, game_id: &str) -> Option<String>;
    fn prepare(&self, data_path: &Path, game_id: &str) -> Result<()>;
    fn activate(&self, source: &Path, source_name: &str, data_path: &Path) -> Result<()>;
    fn deactivate(&self, source: &Path, data_path: &Path) -> Result<()>;
    fn purge(&self, data_path: &Path) -> Result<()>;
}

pub struct DeploymentMethodKind;

impl CapabilityKind for DeploymentMethodKind {
    /// Game id.
    type Input = str;
    type Payload = dyn DeploymentMethod;
    const NAME: &'static str = "deployment-method";
    const UNIQUE: bool = true;
}

// ---------------------------------------------------------------------------
// Mod types
// ---------------------------------------------------------------------------

pub trait ModType: Send + Sync {
    fn id(&self) -> &str;
    fn is_supported(&self, game_id: &str) -> bool;
    /// Deployment target for this mod type, if it differs from the game's mod path.
    fn target_path(&self, game_id: &str) -> Option<PathBuf>;
    /// Whether an installation plan belongs to this mod type.
    fn classify(&self, instructions: &[InstallInstruction]) -> bool;
}

pub struct ModTypeKind;

impl CapabilityKind for ModTypeKind {
    /// Game id.
    type Input = str;
    type Payload = dyn ModType;
    const NAME: &'static str = "mod-type";
    const UNIQUE: bool = true;
}

// ---------------------------------------------------------------------------
// Interpreters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParameters {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Rewrites how a file with a given extension is launched (e.g. `.jar` through `java`).
pub trait Interpreter: Send + Sync {
    fn wrap(&self, input: RunParameters) -> Result<RunParameters>;
}

impl<F> Interpreter for F
where
    F: Fn(RunParameters) -> Result<RunParameters> + Send + Sync,
{
    fn wrap(&self, input: RunParameters) -> Result<RunParameters> {
        self(input)
    }
}

pub struct InterpreterKind;

impl CapabilityKind for InterpreterKind {
    /// File extension; matched case-insensitively.
    type Input = str;
    type Payload = dyn Interpreter;
    const NAME: &'static str = "interpreter";
    const UNIQUE: bool = true;
}

// ---------------------------------------------------------------------------
// UI hooks
// ---------------------------------------------------------------------------

/// Declarative contribution to a named UI surface; rendering is up to the front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiHook {
    pub surface: String,
    pub hook_id: String,
    #[serde(default)]
    pub props: Value,
}

pub struct UiHookKind;

impl CapabilityKind for UiHookKind {
    /// Surface id.
    type Input = str;
    type Payload = UiHook;
    const NAME: &'static str = "ui-hook";
    const UNIQUE: bool = false;
}

/// Names of every capability kind, as accepted by `extensions.hotTables`.
pub const KIND_NAMES: &[&str] = &[
    GameKind::NAME,
    InstallerKind::NAME,
    ArchiveHandlerKind::NAME,
    DeploymentMethodKind::NAME,
    ModTypeKind::NAME,
    InterpreterKind::NAME,
    UiHookKind::NAME,
];

/// Normalize a file extension for archive handler and interpreter keys.
pub fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_instruction_wire_shape() {
        let copy = InstallInstruction::Copy {
            source: "Data/a.esp".into(),
            destination: "a.esp".into(),
        };
        assert_eq!(
            serde_json::to_value(&copy).unwrap(),
            json!({"type": "copy", "source": "Data/a.esp", "destination": "a.esp"})
        );
        let mod_type: InstallInstruction =
            serde_json::from_value(json!({"type": "setModType", "value": "enb"})).unwrap();
        assert_eq!(mod_type, InstallInstruction::SetModType { value: "enb".into() });
    }

    #[test]
    fn test_closure_interpreter() {
        let java = |mut params: RunParameters| -> Result<RunParameters> {
            params.args.insert(0, "-jar".into());
            params.args.insert(1, params.executable.clone());
            params.executable = "java".into();
            Ok(params)
        };
        let wrapped = java
            .wrap(RunParameters {
                executable: "tool.jar".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(wrapped.executable, "java");
        assert_eq!(wrapped.args, vec!["-jar", "tool.jar"]);
    }

    #[test]
    fn test_normalize_extension() {
        assert_eq!(normalize_extension(".JAR"), "jar");
        assert_eq!(normalize_extension(" 7z "), "7z");
    }
}
