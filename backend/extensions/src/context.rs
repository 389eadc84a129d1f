//! Per-extension registration façade.
//!
//! One [`ExtensionContext`] is built for each init call and never reused.
//! Registrations are buffered and only reach the registry if init returns
//! `Ok(true)`; argument validation failures are recorded against the
//! extension even when the returned error is swallowed.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use modforge_core::{Action, ExtensionError, ExtensionId, ProcessRole, StatePath};
use modforge_store::{ActionCheck, ReducerRegistration, ReducerSpec, StateStore, WatchId};
use semver::{Version, VersionReq};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::broker::{ApiMethod, ExtensionApi, API_KIND};
use crate::capabilities::{
    normalize_extension, ArchiveHandler, ArchiveHandlerKind, DeploymentMethod,
    DeploymentMethodKind, GameDefinition, GameKind, Installer, InstallerInput, InstallerKind,
    Interpreter, InterpreterKind, ModType, ModTypeKind, UiHook, UiHookKind,
};
use crate::registry::{Registration, RegistrableKind, Registry, REDUCER_KIND};
use crate::table::{CapabilityKind, CapabilityRecord};

/// Priority used by registration helpers that take none.
pub const DEFAULT_PRIORITY: i32 = 100;

pub const STATE_WATCH_KIND: &str = "state-watch";
pub const ACTION_CHECK_KIND: &str = "action-check";

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type ActivationFn = Box<dyn FnOnce(ActivationContext) -> BoxFuture<anyhow::Result<()>> + Send>;

/// A Phase 2 callback queued by `once` / `once_main`.
pub struct ActivationCallback {
    pub owner: ExtensionId,
    /// Only runs in the host process.
    pub main_only: bool,
    callback: ActivationFn,
}

impl ActivationCallback {
    pub(crate) fn run(self, ctx: ActivationContext) -> BoxFuture<anyhow::Result<()>> {
        (self.callback)(ctx)
    }
}

impl fmt::Debug for ActivationCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationCallback")
            .field("owner", &self.owner)
            .field("main_only", &self.main_only)
            .finish()
    }
}

/// What an activation callback can reach: the live store, the registry and the API broker.
#[derive(Clone)]
pub struct ActivationContext {
    extension: ExtensionId,
    store: Arc<StateStore>,
    registry: Arc<Registry>,
    api: ExtensionApi,
}

impl ActivationContext {
    pub(crate) fn new(
        extension: ExtensionId,
        store: Arc<StateStore>,
        registry: Arc<Registry>,
        api: ExtensionApi,
    ) -> Self {
        Self {
            extension,
            store,
            registry,
            api,
        }
    }

    pub fn id(&self) -> &ExtensionId {
        &self.extension
    }

    pub fn state(&self) -> Value {
        self.store.get_state()
    }

    pub fn dispatch(&self, action: Action) {
        self.store.dispatch(action);
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn api(&self) -> &ExtensionApi {
        &self.api
    }

    /// Call `callback(previous, current)` whenever the value at `path` changes.
    ///
    /// An `Err` is logged; a panic disables this extension like any other
    /// runtime fault, after which the callback is no longer called.
    pub fn on_state_change<F>(&self, path: StatePath, callback: F) -> WatchId
    where
        F: Fn(Option<&Value>, Option<&Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let faults = self.registry.faults().clone();
        let owner = self.extension.clone();
        let key = path.to_string();
        self.store.watch(owner.clone(), path, move |previous, current| {
            if faults.is_disabled(&owner) {
                return;
            }
            if let Err(e) = faults.guard(&owner, STATE_WATCH_KIND, &key, || callback(previous, current)) {
                warn!(extension = %owner, path = %key, error = %format!("{e:#}"), "State change handler failed");
            }
        })
    }
}

/// Everything an init call produced, handed back to the coordinator.
pub(crate) struct ContextParts {
    pub registrations: Vec<Registration>,
    pub api_methods: Vec<(String, ApiMethod)>,
    pub action_checks: Vec<(String, ActionCheck)>,
    pub activations: Vec<ActivationCallback>,
    pub violation: Option<ExtensionError>,
    pub missing_optional: Vec<ExtensionId>,
}

pub struct ExtensionContext {
    extension: ExtensionId,
    origin_path: PathBuf,
    host_version: Version,
    role: ProcessRole,
    loaded: BTreeMap<ExtensionId, Version>,
    api: ExtensionApi,
    registrations: Vec<Registration>,
    api_methods: Vec<(String, ApiMethod)>,
    action_checks: Vec<(String, ActionCheck)>,
    activations: Vec<ActivationCallback>,
    violation: Option<ExtensionError>,
    missing_optional: Vec<ExtensionId>,
}

impl ExtensionContext {
    pub(crate) fn new(
        extension: ExtensionId,
        origin_path: PathBuf,
        host_version: Version,
        role: ProcessRole,
        loaded: BTreeMap<ExtensionId, Version>,
        api: ExtensionApi,
    ) -> Self {
        Self {
            extension,
            origin_path,
            host_version,
            role,
            loaded,
            api,
            registrations: Vec::new(),
            api_methods: Vec::new(),
            action_checks: Vec::new(),
            activations: Vec::new(),
            violation: None,
            missing_optional: Vec::new(),
        }
    }

    pub(crate) fn into_parts(self) -> ContextParts {
        ContextParts {
            registrations: self.registrations,
            api_methods: self.api_methods,
            action_checks: self.action_checks,
            activations: self.activations,
            violation: self.violation,
            missing_optional: self.missing_optional,
        }
    }

    pub fn id(&self) -> &ExtensionId {
        &self.extension
    }

    pub fn origin_path(&self) -> &Path {
        &self.origin_path
    }

    pub fn host_version(&self) -> &Version {
        &self.host_version
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// `api.ext.<name>(...)`; usable during init, queued until the method exists.
    pub fn api(&self) -> &ExtensionApi {
        &self.api
    }

    /// Number of registrations buffered so far.
    pub fn pending_registrations(&self) -> usize {
        self.registrations.len() + self.api_methods.len() + self.action_checks.len()
    }

    // -----------------------------------------------------------------------
    // Capability registration
    // -----------------------------------------------------------------------

    /// Register a record of any capability kind.
    pub fn register<K, P>(
        &mut self,
        key: impl Into<String>,
        priority: i32,
        predicate: P,
        payload: Arc<K::Payload>,
    ) -> Result<(), ExtensionError>
    where
        K: RegistrableKind,
        P: Fn(&K::Input) -> bool + Send + Sync + 'static,
    {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(self.reject(K::NAME, "key must not be empty"));
        }
        let record = CapabilityRecord::<K>::new(
            self.extension.clone(),
            key,
            priority,
            Arc::new(predicate),
            payload,
        )
        .with_metadata(self.metadata());
        self.registrations.push(K::wrap(record));
        Ok(())
    }

    pub fn register_game(&mut self, game: Arc<dyn GameDefinition>) -> Result<(), ExtensionError> {
        let id = game.id().to_string();
        if id.is_empty() {
            return Err(self.reject(GameKind::NAME, "game id must not be empty"));
        }
        let matcher = id.clone();
        self.register::<GameKind, _>(id, DEFAULT_PRIORITY, move |input: &str| input == matcher, game)
    }

    pub fn register_installer(
        &mut self,
        id: &str,
        priority: i32,
        installer: Arc<dyn Installer>,
    ) -> Result<(), ExtensionError> {
        let owner = self.extension.clone();
        let tester = installer.clone();
        let installer_id = id.to_string();
        let supported = move |input: &InstallerInput| match tester.test_supported(input) {
            Ok(result) => result.supported,
            Err(e) => {
                warn!(extension = %owner, installer = %installer_id, error = %e, "Installer support test failed");
                false
            }
        };
        self.register::<InstallerKind, _>(id, priority, supported, installer)
    }

    pub fn register_archive_handler(
        &mut self,
        extension: &str,
        priority: i32,
        handler: Arc<dyn ArchiveHandler>,
    ) -> Result<(), ExtensionError> {
        let key = normalize_extension(extension);
        if key.is_empty() || key.contains(['/', '\\']) {
            return Err(self.reject(
                ArchiveHandlerKind::NAME,
                format!("'{extension}' is not a file extension"),
            ));
        }
        let matcher = key.clone();
        self.register::<ArchiveHandlerKind, _>(
            key,
            priority,
            move |input: &str| normalize_extension(input) == matcher,
            handler,
        )
    }

    pub fn register_deployment_method(
        &mut self,
        priority: i32,
        method: Arc<dyn DeploymentMethod>,
    ) -> Result<(), ExtensionError> {
        let id = method.id().to_string();
        let support = method.clone();
        self.register::<DeploymentMethodKind, _>(
            id,
            priority,
            move |game_id: &str| support.unsupported_reason(game_id).is_none(),
            method,
        )
    }

    pub fn register_mod_type(
        &mut self,
        priority: i32,
        mod_type: Arc<dyn ModType>,
    ) -> Result<(), ExtensionError> {
        let id = mod_type.id().to_string();
        let support = mod_type.clone();
        self.register::<ModTypeKind, _>(
            id,
            priority,
            move |game_id: &str| support.is_supported(game_id),
            mod_type,
        )
    }

    /// Run files with `extension` through `interpreter`. Matching ignores case.
    pub fn register_interpreter(
        &mut self,
        extension: &str,
        interpreter: Arc<dyn Interpreter>,
    ) -> Result<(), ExtensionError> {
        let key = normalize_extension(extension);
        if key.is_empty() {
            return Err(self.reject(InterpreterKind::NAME, "file extension must not be empty"));
        }
        let matcher = key.clone();
        self.register::<InterpreterKind, _>(
            key,
            DEFAULT_PRIORITY,
            move |input: &str| normalize_extension(input) == matcher,
            interpreter,
        )
    }

    pub fn register_ui_hook(&mut self, hook: UiHook, priority: i32) -> Result<(), ExtensionError> {
        if hook.surface.trim().is_empty() {
            return Err(self.reject(UiHookKind::NAME, "surface must not be empty"));
        }
        let surface = hook.surface.clone();
        self.register::<UiHookKind, _>(
            hook.hook_id.clone(),
            priority,
            move |input: &str| input == surface,
            Arc::new(hook),
        )
    }

    pub fn register_reducer(&mut self, path: StatePath, spec: ReducerSpec) -> Result<(), ExtensionError> {
        if path.is_empty() {
            return Err(self.reject(REDUCER_KIND, "state path must not be empty"));
        }
        if path.segments().iter().any(|segment| segment.is_empty()) {
            return Err(self.reject(REDUCER_KIND, format!("state path '{path}' has an empty segment")));
        }
        self.registrations.push(Registration::Reducer(ReducerRegistration::new(
            self.extension.clone(),
            path,
            spec,
        )));
        Ok(())
    }

    /// Publish `api.ext.<name>` once this extension is committed.
    pub fn register_api<F>(&mut self, name: &str, method: F) -> Result<(), ExtensionError>
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let valid = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(self.reject(API_KIND, format!("'{name}' is not a valid method name")));
        }
        if self.api_methods.iter().any(|(existing, _)| existing == name) {
            return Err(self.reject(API_KIND, format!("'{name}' registered twice")));
        }
        self.api_methods.push((name.to_string(), Arc::new(method)));
        Ok(())
    }

    /// Check every `action_type` action against the current state before it is reduced.
    /// Returning `Some(reason)` prevents the state change.
    pub fn register_action_check<F>(&mut self, action_type: &str, check: F) -> Result<(), ExtensionError>
    where
        F: Fn(&Value, &Action) -> Option<String> + Send + Sync + 'static,
    {
        if action_type.trim().is_empty() {
            return Err(self.reject(ACTION_CHECK_KIND, "action type must not be empty"));
        }
        self.action_checks.push((action_type.to_string(), Arc::new(check)));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phase 2
    // -----------------------------------------------------------------------

    /// Run `callback` after the store exists, in every process role.
    pub fn once<F, Fut>(&mut self, callback: F)
    where
        F: FnOnce(ActivationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.queue_activation(false, callback);
    }

    /// Like [`once`](Self::once), but only in the host process.
    pub fn once_main<F, Fut>(&mut self, callback: F)
    where
        F: FnOnce(ActivationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.queue_activation(true, callback);
    }

    fn queue_activation<F, Fut>(&mut self, main_only: bool, callback: F)
    where
        F: FnOnce(ActivationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: ActivationFn = Box::new(move |ctx: ActivationContext| -> BoxFuture<anyhow::Result<()>> {
            Box::pin(callback(ctx))
        });
        self.activations.push(ActivationCallback {
            owner: self.extension.clone(),
            main_only,
            callback,
        });
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    /// Hard dependency: `id` must already be loaded.
    pub fn require_extension(&mut self, id: &str) -> Result<(), ExtensionError> {
        if self.loaded.contains_key(id) {
            return Ok(());
        }
        Err(self.missing(id, "not loaded"))
    }

    /// Hard dependency on a loaded extension whose version satisfies `requirement`.
    pub fn require_extension_version(&mut self, id: &str, requirement: &str) -> Result<(), ExtensionError> {
        let req = match VersionReq::parse(requirement) {
            Ok(req) => req,
            Err(e) => {
                return Err(self.reject("dependency", format!("invalid version requirement '{requirement}': {e}")))
            }
        };
        match self.loaded.get(id) {
            None => Err(self.missing(id, "not loaded")),
            Some(version) if req.matches(version) => Ok(()),
            Some(version) => {
                let reason = format!("version {version} does not satisfy {requirement}");
                Err(self.missing(id, &reason))
            }
        }
    }

    /// Soft dependency: reports whether `id` is loaded, never fails.
    pub fn require_extension_optional(&mut self, id: &str) -> bool {
        if self.loaded.contains_key(id) {
            return true;
        }
        debug!(extension = %self.extension, dependency = id, "Optional dependency not loaded");
        self.missing_optional.push(ExtensionId::from(id));
        false
    }

    pub fn require_host_version(&mut self, requirement: &str) -> Result<(), ExtensionError> {
        let req = match VersionReq::parse(requirement) {
            Ok(req) => req,
            Err(e) => {
                return Err(self.reject("dependency", format!("invalid version requirement '{requirement}': {e}")))
            }
        };
        if req.matches(&self.host_version) {
            return Ok(());
        }
        let err = ExtensionError::UnsupportedHostVersion {
            extension: self.extension.clone(),
            requirement: requirement.to_string(),
            host_version: self.host_version.to_string(),
        };
        Err(self.record(err))
    }

    // -----------------------------------------------------------------------

    fn metadata(&self) -> Value {
        json!({ "originPath": self.origin_path.display().to_string() })
    }

    fn reject(&mut self, kind: &str, reason: impl Into<String>) -> ExtensionError {
        let err = ExtensionError::InvalidRegistration {
            extension: self.extension.clone(),
            kind: kind.to_string(),
            reason: reason.into(),
        };
        self.record(err)
    }

    fn missing(&mut self, dependency: &str, reason: &str) -> ExtensionError {
        let err = ExtensionError::MissingDependency {
            extension: self.extension.clone(),
            dependency: ExtensionId::from(dependency),
            reason: reason.to_string(),
        };
        self.record(err)
    }

    /// Keep the first violation; it disables the extension regardless of what init returns.
    fn record(&mut self, err: ExtensionError) -> ExtensionError {
        if self.violation.is_none() {
            self.violation = Some(err.clone());
        }
        err
    }
}

impl fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("extension", &self.extension)
            .field("origin_path", &self.origin_path)
            .field("registrations", &self.registrations.len())
            .field("api_methods", &self.api_methods.len())
            .field("activations", &self.activations.len())
            .finish()
    }
}
