pub mod broker;
pub mod capabilities;
pub mod context;
pub mod entry;
pub mod event_bus;
pub mod fault;
pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod table;

pub use broker::{ApiBroker, ApiCall, ApiCallError, ApiMethod, ExtensionApi, UnresolvedCall};
pub use capabilities::{
    normalize_extension, Archive, ArchiveHandler, ArchiveHandlerKind, DeploymentMethod, DeploymentMethodKind,
    GameDefinition, GameKind, InstallInstruction, Installer, InstallerInput, InstallerKind, Interpreter,
    InterpreterKind, ModType, ModTypeKind, RunParameters, SupportResult, UiHook, UiHookKind, KIND_NAMES,
};
pub use context::{
    ActivationContext, ExtensionContext, ACTION_CHECK_KIND, DEFAULT_PRIORITY, STATE_WATCH_KIND,
};
pub use entry::{normalize, EntryCatalog, EntryPoint, EntryResolver, Extension, InitFn};
pub use event_bus::{LifecycleEvent, LifecycleEventBus};
pub use fault::{FaultLog, Guarded};
pub use lifecycle::{
    resolve_load_order, Coordinator, CoordinatorOptions, ExtensionRecord, ExtensionStatus, LifecycleState,
    StartupReport,
};
pub use loader::{
    scan_root, BundleInfo, DiscoveryReport, ExtensionDescriptor, ExtensionLoader, SkipReason, SkippedBundle,
    SourceRoot,
};
pub use manifest::{BundleManifest, MANIFEST_FILE};
pub use registry::{HotTables, Registration, RegistrableKind, Registry};
pub use table::{CapabilityKind, CapabilityRecord, CapabilityTable, Predicate};
