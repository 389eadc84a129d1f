//! The capability registry: every table plus the pending reducer set.
//!
//! One `Registry` is owned by each coordinator and shared with contexts and
//! activation callbacks through an `Arc`; there is no process-wide instance.
//! Runtime queries hand out [`Guarded`] records so that every call into
//! extension code is contained and attributed to its owner.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Result;
use modforge_core::CapabilityError;
use modforge_store::ReducerRegistration;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::capabilities::{
    normalize_extension, ArchiveHandlerKind, DeploymentMethodKind, GameKind, InstallInstruction,
    InstallerInput, InstallerKind, InterpreterKind, ModTypeKind, RunParameters, UiHook, UiHookKind,
};
use crate::fault::{FaultLog, Guarded};
use crate::table::{CapabilityKind, CapabilityRecord, CapabilityTable};

/// Capability kinds that keep accepting registrations after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotTables(BTreeSet<String>);

impl HotTables {
    pub fn new<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(kinds.into_iter().map(Into::into).collect())
    }

    pub fn none() -> Self {
        Self(BTreeSet::new())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.0.contains(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.0.iter().map(String::as_str).collect()
    }
}

impl Default for HotTables {
    fn default() -> Self {
        Self::new([InterpreterKind::NAME])
    }
}

/// A buffered registration, committed to the registry after a successful init.
pub enum Registration {
    Game(CapabilityRecord<GameKind>),
    Installer(CapabilityRecord<InstallerKind>),
    ArchiveHandler(CapabilityRecord<ArchiveHandlerKind>),
    DeploymentMethod(CapabilityRecord<DeploymentMethodKind>),
    ModType(CapabilityRecord<ModTypeKind>),
    Interpreter(CapabilityRecord<InterpreterKind>),
    UiHook(CapabilityRecord<UiHookKind>),
    Reducer(ReducerRegistration),
}

impl Registration {
    pub fn kind(&self) -> &'static str {
        match self {
            Registration::Game(_) => GameKind::NAME,
            Registration::Installer(_) => InstallerKind::NAME,
            Registration::ArchiveHandler(_) => ArchiveHandlerKind::NAME,
            Registration::DeploymentMethod(_) => DeploymentMethodKind::NAME,
            Registration::ModType(_) => ModTypeKind::NAME,
            Registration::Interpreter(_) => InterpreterKind::NAME,
            Registration::UiHook(_) => UiHookKind::NAME,
            Registration::Reducer(_) => REDUCER_KIND,
        }
    }
}

pub const REDUCER_KIND: &str = "reducer";

/// Maps a capability kind onto its table and its [`Registration`] variant.
pub trait RegistrableKind: CapabilityKind + Sized {
    fn wrap(record: CapabilityRecord<Self>) -> Registration;
    fn table(registry: &Registry) -> &CapabilityTable<Self>;
}

macro_rules! registrable {
    ($kind:ty, $variant:ident, $field:ident) => {
        impl RegistrableKind for $kind {
            fn wrap(record: CapabilityRecord<Self>) -> Registration {
                Registration::$variant(record)
            }

            fn table(registry: &Registry) -> &CapabilityTable<Self> {
                &registry.$field
            }
        }
    };
}

registrable!(GameKind, Game, games);
registrable!(InstallerKind, Installer, installers);
registrable!(ArchiveHandlerKind, ArchiveHandler, archive_handlers);
registrable!(DeploymentMethodKind, DeploymentMethod, deployment_methods);
registrable!(ModTypeKind, ModType, mod_types);
registrable!(InterpreterKind, Interpreter, interpreters);
registrable!(UiHookKind, UiHook, ui_hooks);

#[derive(Default)]
struct ReducerSlot {
    pending: Vec<ReducerRegistration>,
    frozen: bool,
}

pub struct Registry {
    games: CapabilityTable<GameKind>,
    installers: CapabilityTable<InstallerKind>,
    archive_handlers: CapabilityTable<ArchiveHandlerKind>,
    deployment_methods: CapabilityTable<DeploymentMethodKind>,
    mod_types: CapabilityTable<ModTypeKind>,
    interpreters: CapabilityTable<InterpreterKind>,
    ui_hooks: CapabilityTable<UiHookKind>,
    reducers: Mutex<ReducerSlot>,
    faults: FaultLog,
}

impl Registry {
    pub fn new(hot: &HotTables) -> Self {
        Self::with_faults(hot, FaultLog::new())
    }

    pub fn with_faults(hot: &HotTables, faults: FaultLog) -> Self {
        fn table<K: CapabilityKind>(hot: &HotTables, faults: &FaultLog) -> CapabilityTable<K> {
            CapabilityTable::with_faults(hot.contains(K::NAME), faults.clone())
        }
        Self {
            games: table(hot, &faults),
            installers: table(hot, &faults),
            archive_handlers: table(hot, &faults),
            deployment_methods: table(hot, &faults),
            mod_types: table(hot, &faults),
            interpreters: table(hot, &faults),
            ui_hooks: table(hot, &faults),
            reducers: Mutex::new(ReducerSlot::default()),
            faults,
        }
    }

    /// Runtime faults of every extension whose records live here.
    pub fn faults(&self) -> &FaultLog {
        &self.faults
    }

    pub fn table<K: RegistrableKind>(&self) -> &CapabilityTable<K> {
        K::table(self)
    }

    /// Register directly into a table. Used by trusted callers after startup (hot tables).
    pub fn register<K: RegistrableKind>(&self, record: CapabilityRecord<K>) -> Result<(), CapabilityError> {
        K::table(self).register(record)
    }

    pub fn apply(&self, registration: Registration) -> Result<(), CapabilityError> {
        match registration {
            Registration::Game(record) => self.games.register(record),
            Registration::Installer(record) => self.installers.register(record),
            Registration::ArchiveHandler(record) => self.archive_handlers.register(record),
            Registration::DeploymentMethod(record) => self.deployment_methods.register(record),
            Registration::ModType(record) => self.mod_types.register(record),
            Registration::Interpreter(record) => self.interpreters.register(record),
            Registration::UiHook(record) => self.ui_hooks.register(record),
            Registration::Reducer(reducer) => {
                let mut slot = self.reducers.lock();
                if slot.frozen {
                    return Err(CapabilityError::TableFrozen {
                        kind: REDUCER_KIND,
                        key: reducer.path.to_string(),
                        owner: reducer.owner,
                    });
                }
                slot.pending.push(reducer);
                Ok(())
            }
        }
    }

    /// Freeze every table; hot tables keep accepting registrations.
    pub fn freeze(&self) {
        self.games.freeze();
        self.installers.freeze();
        self.archive_handlers.freeze();
        self.deployment_methods.freeze();
        self.mod_types.freeze();
        self.interpreters.freeze();
        self.ui_hooks.freeze();
        self.reducers.lock().frozen = true;
        debug!("Capability tables frozen");
    }

    /// Discard all records and refuse further registration.
    pub fn close(&self) {
        self.games.close();
        self.installers.close();
        self.archive_handlers.close();
        self.deployment_methods.close();
        self.mod_types.close();
        self.interpreters.close();
        self.ui_hooks.close();
        let mut slot = self.reducers.lock();
        slot.frozen = true;
        slot.pending.clear();
        info!("Capability tables closed");
    }

    /// Hand the pending reducer specs to the merger, in registration order.
    pub fn take_reducers(&self) -> Vec<ReducerRegistration> {
        std::mem::take(&mut self.reducers.lock().pending)
    }

    /// Record counts per kind.
    pub fn summary(&self) -> BTreeMap<&'static str, usize> {
        BTreeMap::from([
            (GameKind::NAME, self.games.len()),
            (InstallerKind::NAME, self.installers.len()),
            (ArchiveHandlerKind::NAME, self.archive_handlers.len()),
            (DeploymentMethodKind::NAME, self.deployment_methods.len()),
            (ModTypeKind::NAME, self.mod_types.len()),
            (InterpreterKind::NAME, self.interpreters.len()),
            (UiHookKind::NAME, self.ui_hooks.len()),
        ])
    }

    // -----------------------------------------------------------------------
    // Runtime queries
    // -----------------------------------------------------------------------

    fn guarded<K: CapabilityKind>(&self, record: CapabilityRecord<K>) -> Guarded<K> {
        Guarded::new(record, self.faults.clone())
    }

    pub fn game(&self, game_id: &str) -> Option<Guarded<GameKind>> {
        self.games.find(game_id).map(|record| self.guarded(record))
    }

    /// Highest-priority installer that reports support for `input`.
    pub fn select_installer(&self, input: &InstallerInput) -> Option<Guarded<InstallerKind>> {
        let selected = self.installers.find(input)?;
        debug!(installer = %selected.key, extension = %selected.owner, game = %input.game_id, "Installer selected");
        Some(self.guarded(selected))
    }

    /// Plan an installation with the selected installer.
    ///
    /// `Ok(None)` when no installer supports `input`.
    pub fn install(&self, input: &InstallerInput, destination: &Path) -> Result<Option<Vec<InstallInstruction>>> {
        match self.select_installer(input) {
            Some(installer) => installer.call(|payload| payload.install(input, destination)).map(Some),
            None => Ok(None),
        }
    }

    pub fn archive_handler(&self, extension: &str) -> Option<Guarded<ArchiveHandlerKind>> {
        self.archive_handlers
            .find(&normalize_extension(extension))
            .map(|record| self.guarded(record))
    }

    pub fn deployment_methods(&self, game_id: &str) -> Vec<Guarded<DeploymentMethodKind>> {
        self.deployment_methods
            .find_all(game_id)
            .into_iter()
            .map(|record| self.guarded(record))
            .collect()
    }

    pub fn mod_types(&self, game_id: &str) -> Vec<Guarded<ModTypeKind>> {
        self.mod_types
            .find_all(game_id)
            .into_iter()
            .map(|record| self.guarded(record))
            .collect()
    }

    pub fn interpreter(&self, extension: &str) -> Option<Guarded<InterpreterKind>> {
        self.interpreters
            .find(&normalize_extension(extension))
            .map(|record| self.guarded(record))
    }

    /// Pass launch parameters through the interpreter registered for the executable's extension.
    pub fn run_parameters(&self, params: RunParameters) -> Result<RunParameters> {
        let extension = Path::new(&params.executable)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(normalize_extension);
        match extension.and_then(|ext| self.interpreter(&ext)) {
            Some(interpreter) => interpreter.call(|payload| payload.wrap(params)),
            None => Ok(params),
        }
    }

    pub fn ui_hooks(&self, surface: &str) -> Vec<UiHook> {
        self.ui_hooks
            .find_all(surface)
            .into_iter()
            .map(|record| (*record.payload).clone())
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(&HotTables::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::Arc;

    use modforge_core::{ExtensionError, ExtensionId, StatePath};
    use modforge_store::ReducerSpec;
    use serde_json::json;

    use crate::capabilities::{Installer, Interpreter, SupportResult};

    fn interpreter_record(owner: &str, extension: &str) -> CapabilityRecord<InterpreterKind> {
        let key = normalize_extension(extension);
        let matcher = key.clone();
        let payload: Arc<dyn Interpreter> = Arc::new(|mut params: RunParameters| -> Result<RunParameters> {
            params.args.insert(0, params.executable.clone());
            params.executable = "interp".into();
            Ok(params)
        });
        CapabilityRecord::new(
            owner,
            key,
            0,
            Arc::new(move |ext: &str| normalize_extension(ext) == matcher),
            payload,
        )
    }

    #[test]
    fn test_default_hot_tables() {
        let registry = Registry::default();
        assert!(registry.table::<InterpreterKind>().is_hot());
        assert!(!registry.table::<InstallerKind>().is_hot());
    }

    #[test]
    fn test_freeze_keeps_hot_tables_open() {
        let registry = Registry::default();
        registry.freeze();
        registry.register(interpreter_record("late", "jar")).unwrap();
        assert_eq!(registry.summary()[InterpreterKind::NAME], 1);

        let reducer = ReducerRegistration::new("late", StatePath::parse("late"), ReducerSpec::new(json!({})));
        assert!(matches!(
            registry.apply(Registration::Reducer(reducer)),
            Err(CapabilityError::TableFrozen { kind: REDUCER_KIND, .. })
        ));
    }

    #[test]
    fn test_run_parameters_through_interpreter() {
        let registry = Registry::default();
        registry.register(interpreter_record("java-support", ".JAR")).unwrap();

        let wrapped = registry
            .run_parameters(RunParameters {
                executable: "tools/Patcher.Jar".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(wrapped.executable, "interp");
        assert_eq!(wrapped.args, vec!["tools/Patcher.Jar"]);

        let untouched = registry
            .run_parameters(RunParameters {
                executable: "game.exe".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(untouched.executable, "game.exe");
    }

    fn crashing_interpreter(owner: &str, extension: &str) -> CapabilityRecord<InterpreterKind> {
        let payload: Arc<dyn Interpreter> =
            Arc::new(|_: RunParameters| -> Result<RunParameters> { panic!("launcher table corrupt") });
        let matcher = normalize_extension(extension);
        CapabilityRecord::new(
            owner,
            matcher.clone(),
            0,
            Arc::new(move |ext: &str| normalize_extension(ext) == matcher),
            payload,
        )
    }

    #[test]
    fn test_payload_panic_is_contained_and_disables_owner() {
        let registry = Registry::default();
        registry.register(crashing_interpreter("java-support", "jar")).unwrap();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            registry.run_parameters(RunParameters {
                executable: "tool.jar".into(),
                ..Default::default()
            })
        }));
        let err = outcome.expect("panic reached the caller").unwrap_err();
        assert!(err.to_string().contains("launcher table corrupt"));

        let owner = ExtensionId::from("java-support");
        assert!(matches!(
            registry.faults().disabled_by(&owner),
            Some(ExtensionError::Faulted { ref kind, .. }) if kind == InterpreterKind::NAME
        ));
        // disabled: the interpreter no longer applies
        assert!(registry.interpreter("jar").is_none());
        let untouched = registry
            .run_parameters(RunParameters {
                executable: "tool.jar".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(untouched.executable, "tool.jar");
    }

    struct ExplodingDetector;

    impl Installer for ExplodingDetector {
        fn test_supported(&self, _input: &InstallerInput) -> Result<SupportResult> {
            panic!("archive layout unexpected")
        }

        fn install(&self, _input: &InstallerInput, _destination: &Path) -> Result<Vec<InstallInstruction>> {
            Ok(Vec::new())
        }
    }

    struct Flat;

    impl Installer for Flat {
        fn test_supported(&self, _input: &InstallerInput) -> Result<SupportResult> {
            Ok(SupportResult {
                supported: true,
                required_files: Vec::new(),
            })
        }

        fn install(&self, input: &InstallerInput, _destination: &Path) -> Result<Vec<InstallInstruction>> {
            Ok(input
                .files
                .iter()
                .map(|file| InstallInstruction::Copy {
                    source: file.clone(),
                    destination: file.clone(),
                })
                .collect())
        }
    }

    fn installer_record(owner: &str, key: &str, priority: i32, installer: Arc<dyn Installer>) -> CapabilityRecord<InstallerKind> {
        let tester = installer.clone();
        CapabilityRecord::new(
            owner,
            key,
            priority,
            Arc::new(move |input: &InstallerInput| tester.test_supported(input).map(|r| r.supported).unwrap_or(false)),
            installer,
        )
    }

    #[test]
    fn test_predicate_panic_is_attributed_and_next_installer_used() {
        let registry = Registry::default();
        registry
            .register(installer_record("exploding", "exploding", 0, Arc::new(ExplodingDetector)))
            .unwrap();
        registry.register(installer_record("flat", "flat", 50, Arc::new(Flat))).unwrap();

        let input = InstallerInput::new("skyrim", ["Data/a.esp"]);
        let selected = registry.select_installer(&input).unwrap();
        assert_eq!(selected.owner().as_str(), "flat");
        let plan = registry.install(&input, Path::new("/mods/a")).unwrap().unwrap();
        assert_eq!(plan.len(), 1);

        let faults = registry.faults().for_extension(&ExtensionId::from("exploding"));
        assert_eq!(faults.len(), 1);
        assert!(faults[0].to_string().contains("archive layout unexpected"));
    }

    #[test]
    fn test_close_discards_everything() {
        let registry = Registry::default();
        registry.register(interpreter_record("a", "jar")).unwrap();
        registry.close();
        assert!(registry.interpreter("jar").is_none());
        assert!(matches!(
            registry.register(interpreter_record("b", "py")),
            Err(CapabilityError::TableClosed { .. })
        ));
        assert!(registry.take_reducers().is_empty());
    }
}
