//! Two-phase extension lifecycle.
//!
//! `Discovering -> Registering -> BuildingStore -> Activating -> Steady -> ShuttingDown`
//!
//! Phase 1 runs every init function sequentially in dependency order; a
//! failing extension is disabled and the next one runs. Phase 2 drains the
//! `once` queue against the live store. Only a dependency cycle or a state
//! path collision aborts startup. After startup, a panic in extension code
//! called by the host disables that extension through the shared fault log.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use modforge_config::RuntimeConfig;
use modforge_core::{CapabilityError, ExtensionError, ExtensionId, ProcessRole, StartupError};
use modforge_logging::{ExtensionEvent, ExtensionEventLogger};
use modforge_store::{merge, ActionCheck, StateStore};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::broker::{ApiBroker, ExtensionApi, UnresolvedCall, API_KIND};
use crate::context::{
    ActivationCallback, ActivationContext, ContextParts, ExtensionContext, ACTION_CHECK_KIND,
};
use crate::event_bus::{LifecycleEvent, LifecycleEventBus};
use crate::fault::{panic_message, FaultLog};
use crate::loader::ExtensionDescriptor;
use crate::registry::{HotTables, RegistrableKind, Registry};
use crate::table::CapabilityRecord;

/// Init and once callbacks slower than this are reported.
const SLOW_CALLBACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Discovering,
    Registering,
    BuildingStore,
    Activating,
    Steady,
    ShuttingDown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Discovering => "discovering",
            LifecycleState::Registering => "registering",
            LifecycleState::BuildingStore => "building_store",
            LifecycleState::Activating => "activating",
            LifecycleState::Steady => "steady",
            LifecycleState::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionStatus {
    Loaded,
    /// Init returned `false`.
    SelfDisabled,
    Failed(ExtensionError),
}

#[derive(Debug, Clone)]
pub struct ExtensionRecord {
    pub id: ExtensionId,
    pub version: Version,
    pub origin_path: PathBuf,
    pub is_dynamic: bool,
    pub status: ExtensionStatus,
    pub missing_optional: Vec<ExtensionId>,
    pub activation_errors: Vec<String>,
}

impl ExtensionRecord {
    fn new(descriptor: &ExtensionDescriptor, status: ExtensionStatus) -> Self {
        Self {
            id: descriptor.id.clone(),
            version: descriptor.version.clone(),
            origin_path: descriptor.origin_path.clone(),
            is_dynamic: descriptor.is_dynamic,
            status,
            missing_optional: Vec::new(),
            activation_errors: Vec::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.status == ExtensionStatus::Loaded
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub host_version: Version,
    pub role: ProcessRole,
    pub hot_tables: HotTables,
}

impl CoordinatorOptions {
    /// Options from the `host` and `extensions` config sections.
    ///
    /// Hot tables fall back to the defaults when `extensions.hotTables` is absent.
    pub fn from_config(config: &RuntimeConfig) -> anyhow::Result<Self> {
        let host_version = config.host_version().context("host.version is not a semver version")?;
        let configured = config.extensions.as_ref().and_then(|ext| ext.hot_tables.as_ref());
        let hot_tables = match configured {
            Some(kinds) => HotTables::new(kinds.iter().map(String::as_str)),
            None => HotTables::default(),
        };
        Ok(Self {
            host_version,
            role: config.role(),
            hot_tables,
        })
    }
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            host_version: Version::new(0, 1, 0),
            role: ProcessRole::Host,
            hot_tables: HotTables::default(),
        }
    }
}

/// Outcome of `start`, for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub loaded: Vec<ExtensionId>,
    pub self_disabled: Vec<ExtensionId>,
    pub disabled: BTreeMap<ExtensionId, ExtensionError>,
    pub missing_optional: BTreeMap<ExtensionId, Vec<ExtensionId>>,
    pub activation_failures: BTreeMap<ExtensionId, Vec<String>>,
    /// Panics in extension code called after init, per extension.
    pub runtime_faults: BTreeMap<ExtensionId, Vec<ExtensionError>>,
    pub unresolved_calls: Vec<UnresolvedCall>,
}

pub struct Coordinator {
    options: CoordinatorOptions,
    state: LifecycleState,
    registry: Arc<Registry>,
    broker: ApiBroker,
    records: Vec<ExtensionRecord>,
    activations: Vec<ActivationCallback>,
    action_checks: Vec<(ExtensionId, String, ActionCheck)>,
    store: Option<Arc<StateStore>>,
    events: LifecycleEventBus,
    faults: FaultLog,
}

impl Coordinator {
    pub fn new(options: CoordinatorOptions) -> Self {
        let faults = FaultLog::new();
        let registry = Arc::new(Registry::with_faults(&options.hot_tables, faults.clone()));
        Self {
            options,
            state: LifecycleState::Discovering,
            registry,
            broker: ApiBroker::with_faults(faults.clone()),
            records: Vec::new(),
            activations: Vec::new(),
            action_checks: Vec::new(),
            store: None,
            events: LifecycleEventBus::new(),
            faults,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// The live store; `None` until `BuildingStore` succeeds.
    pub fn store(&self) -> Option<Arc<StateStore>> {
        self.store.clone()
    }

    pub fn broker(&self) -> ApiBroker {
        self.broker.clone()
    }

    /// An `api` handle whose calls are attributed to `caller`.
    pub fn api_for(&self, caller: &str) -> ExtensionApi {
        ExtensionApi::new(self.broker.clone(), ExtensionId::from(caller))
    }

    pub fn events(&self) -> &LifecycleEventBus {
        &self.events
    }

    pub fn faults(&self) -> &FaultLog {
        &self.faults
    }

    /// Every extension seen by `start`, with runtime faults applied to its status.
    pub fn records(&self) -> Vec<ExtensionRecord> {
        self.records.iter().map(|record| self.effective(record)).collect()
    }

    pub fn record(&self, id: &str) -> Option<ExtensionRecord> {
        self.stored(id).map(|record| self.effective(record))
    }

    fn stored(&self, id: &str) -> Option<&ExtensionRecord> {
        self.records.iter().find(|record| record.id.as_str() == id)
    }

    /// A loaded extension disabled by a runtime fault reports as failed.
    fn effective(&self, record: &ExtensionRecord) -> ExtensionRecord {
        let mut record = record.clone();
        if record.is_loaded() {
            if let Some(err) = self.faults.disabled_by(&record.id) {
                record.status = ExtensionStatus::Failed(err);
            }
        }
        record
    }

    /// Run both phases over `descriptors` (in discovery order) and reach `Steady`.
    pub async fn start(
        &mut self,
        descriptors: Vec<ExtensionDescriptor>,
    ) -> Result<StartupReport, StartupError> {
        self.expect_state(LifecycleState::Discovering)?;
        let ordered = resolve_load_order(descriptors).inspect_err(|err| {
            error!(error = %err, "[Lifecycle] Startup aborted");
        })?;
        info!(extensions = ordered.len(), "[Lifecycle] Load order resolved");

        self.transition(LifecycleState::Registering);
        for descriptor in ordered {
            self.register_extension(descriptor).await;
        }

        self.transition(LifecycleState::BuildingStore);
        let store = self.build_store()?;

        self.transition(LifecycleState::Activating);
        self.activate(store).await;

        self.transition(LifecycleState::Steady);
        let report = self.report();
        for call in &report.unresolved_calls {
            warn!(
                caller = %call.caller,
                method = %call.method,
                "[Lifecycle] API call still unresolved after activation; method unavailable"
            );
        }
        info!(
            loaded = report.loaded.len(),
            disabled = report.disabled.len() + report.self_disabled.len(),
            "[Lifecycle] Startup complete"
        );
        Ok(report)
    }

    /// Late registration into a hot table.
    pub fn register_late<K: RegistrableKind>(&self, record: CapabilityRecord<K>) -> Result<(), CapabilityError> {
        if self.state == LifecycleState::ShuttingDown {
            return Err(CapabilityError::TableClosed { kind: K::NAME });
        }
        self.registry.register(record).inspect_err(|err| {
            warn!(error = %err, "[Lifecycle] Late registration rejected");
        })
    }

    /// Publish an API method after startup; queued calls for it resolve immediately.
    pub fn register_api(
        &self,
        owner: &str,
        name: &str,
        method: crate::broker::ApiMethod,
    ) -> Result<(), CapabilityError> {
        if self.state == LifecycleState::ShuttingDown {
            return Err(CapabilityError::TableClosed { kind: API_KIND });
        }
        self.broker.register(ExtensionId::from(owner), name, method)
    }

    /// Stop accepting registrations and discard every capability table.
    pub fn shutdown(&mut self) {
        if self.state == LifecycleState::ShuttingDown {
            return;
        }
        self.transition(LifecycleState::ShuttingDown);
        self.registry.close();
        self.broker.close();
    }

    pub fn report(&self) -> StartupReport {
        let mut report = StartupReport::default();
        for record in self.records() {
            match &record.status {
                ExtensionStatus::Loaded => report.loaded.push(record.id.clone()),
                ExtensionStatus::SelfDisabled => report.self_disabled.push(record.id.clone()),
                ExtensionStatus::Failed(err) => {
                    report.disabled.insert(record.id.clone(), err.clone());
                }
            }
            if !record.missing_optional.is_empty() {
                report
                    .missing_optional
                    .insert(record.id.clone(), record.missing_optional.clone());
            }
            if !record.activation_errors.is_empty() {
                report
                    .activation_failures
                    .insert(record.id.clone(), record.activation_errors.clone());
            }
        }
        for fault in self.faults.history() {
            report
                .runtime_faults
                .entry(fault.extension().clone())
                .or_default()
                .push(fault);
        }
        report.unresolved_calls = self.broker.unresolved();
        report
    }

    // -----------------------------------------------------------------------
    // Phase 1
    // -----------------------------------------------------------------------

    async fn register_extension(&mut self, descriptor: ExtensionDescriptor) {
        if let Some(err) = self.unmet_dependency(&descriptor) {
            self.disable(&descriptor, err);
            return;
        }

        let ctx = ExtensionContext::new(
            descriptor.id.clone(),
            descriptor.origin_path.clone(),
            self.options.host_version.clone(),
            self.options.role,
            self.loaded_versions(),
            ExtensionApi::new(self.broker.clone(), descriptor.id.clone()),
        );
        let init = descriptor.init.clone();
        let started = Instant::now();
        let joined = tokio::spawn(async move {
            let mut ctx = ctx;
            let result = init.init(&mut ctx).await;
            (ctx, result)
        })
        .await;
        report_if_slow(&descriptor.id, "init", started);

        match joined {
            Ok((ctx, result)) => {
                let mut parts = ctx.into_parts();
                if let Some(violation) = parts.violation.take() {
                    self.disable(&descriptor, violation);
                    return;
                }
                match result {
                    Ok(true) => self.commit(&descriptor, parts),
                    Ok(false) => self.self_disable(&descriptor),
                    Err(e) => {
                        let err = ExtensionError::InitFailed {
                            extension: descriptor.id.clone(),
                            message: format!("{e:#}"),
                        };
                        self.disable(&descriptor, err);
                    }
                }
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    "init task was cancelled".to_string()
                };
                let err = ExtensionError::Panicked {
                    extension: descriptor.id.clone(),
                    message,
                };
                self.disable(&descriptor, err);
            }
        }
    }

    /// First declared dependency that is absent or did not load.
    fn unmet_dependency(&self, descriptor: &ExtensionDescriptor) -> Option<ExtensionError> {
        descriptor.dependencies.iter().find_map(|dependency| {
            let reason = match self.stored(dependency.as_str()).map(|r| &r.status) {
                Some(ExtensionStatus::Loaded) => return None,
                Some(ExtensionStatus::SelfDisabled) => "disabled itself".to_string(),
                Some(ExtensionStatus::Failed(err)) => format!("failed: {err}"),
                None => "not installed".to_string(),
            };
            Some(ExtensionError::MissingDependency {
                extension: descriptor.id.clone(),
                dependency: dependency.clone(),
                reason,
            })
        })
    }

    fn loaded_versions(&self) -> BTreeMap<ExtensionId, Version> {
        self.records
            .iter()
            .filter(|record| record.is_loaded())
            .map(|record| (record.id.clone(), record.version.clone()))
            .collect()
    }

    fn commit(&mut self, descriptor: &ExtensionDescriptor, parts: ContextParts) {
        let id = &descriptor.id;
        let mut committed = 0usize;
        for registration in parts.registrations {
            let kind = registration.kind();
            match self.registry.apply(registration) {
                Ok(()) => committed += 1,
                Err(err) => reject(id, kind, &err),
            }
        }
        for (name, method) in parts.api_methods {
            match self.broker.register(id.clone(), &name, method) {
                Ok(()) => committed += 1,
                Err(err) => reject(id, API_KIND, &err),
            }
        }
        for (action_type, check) in parts.action_checks {
            self.action_checks.push((id.clone(), action_type, check));
            committed += 1;
        }
        self.activations.extend(parts.activations);

        let mut record = ExtensionRecord::new(descriptor, ExtensionStatus::Loaded);
        record.missing_optional = parts.missing_optional;
        self.records.push(record);

        info!(extension = %id, registrations = committed, "[Lifecycle] Extension loaded");
        ExtensionEventLogger::log_event(id.as_str(), ExtensionEvent::Loaded { registrations: committed });
        self.events.publish(LifecycleEvent::ExtensionLoaded(id.clone()));
    }

    fn self_disable(&mut self, descriptor: &ExtensionDescriptor) {
        info!(extension = %descriptor.id, "[Lifecycle] Extension disabled itself");
        self.records
            .push(ExtensionRecord::new(descriptor, ExtensionStatus::SelfDisabled));
        ExtensionEventLogger::log_event(descriptor.id.as_str(), ExtensionEvent::SelfDisabled);
        self.events.publish(LifecycleEvent::ExtensionDisabled {
            extension: descriptor.id.clone(),
            reason: "disabled itself".to_string(),
        });
    }

    fn disable(&mut self, descriptor: &ExtensionDescriptor, err: ExtensionError) {
        warn!(extension = %descriptor.id, error = %err, "[Lifecycle] Extension disabled");
        ExtensionEventLogger::log_event(
            descriptor.id.as_str(),
            ExtensionEvent::Failed {
                error: err.to_string(),
            },
        );
        self.events.publish(LifecycleEvent::ExtensionDisabled {
            extension: descriptor.id.clone(),
            reason: err.to_string(),
        });
        self.records
            .push(ExtensionRecord::new(descriptor, ExtensionStatus::Failed(err)));
    }

    // -----------------------------------------------------------------------
    // Store + Phase 2
    // -----------------------------------------------------------------------

    fn build_store(&mut self) -> Result<Arc<StateStore>, StartupError> {
        self.registry.freeze();
        let reducer = merge(self.registry.take_reducers()).inspect_err(|err| {
            error!(error = %err, "[Lifecycle] Cannot build state store; startup aborted");
        })?;
        let store = Arc::new(StateStore::new(reducer));
        for (owner, action_type, check) in std::mem::take(&mut self.action_checks) {
            let faults = self.faults.clone();
            let key = action_type.clone();
            store.add_action_check(action_type, owner.clone(), move |state, action| {
                if faults.is_disabled(&owner) {
                    return None;
                }
                faults
                    .guard(&owner, ACTION_CHECK_KIND, &key, || Ok(check(state, action)))
                    .unwrap_or(None)
            });
        }
        debug!(tables = ?self.registry.summary(), "[Lifecycle] State store built");
        self.store = Some(store.clone());
        Ok(store)
    }

    async fn activate(&mut self, store: Arc<StateStore>) {
        let callbacks = std::mem::take(&mut self.activations);
        for callback in callbacks {
            let owner = callback.owner.clone();
            if callback.main_only && self.options.role != ProcessRole::Host {
                debug!(extension = %owner, role = %self.options.role, "[Lifecycle] Skipping host-only activation");
                continue;
            }

            let ctx = ActivationContext::new(
                owner.clone(),
                store.clone(),
                self.registry.clone(),
                ExtensionApi::new(self.broker.clone(), owner.clone()),
            );
            let started = Instant::now();
            let outcome = tokio::spawn(callback.run(ctx)).await;
            report_if_slow(&owner, "once", started);

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(join_error) if join_error.is_panic() => {
                    Some(format!("panicked: {}", panic_message(join_error.into_panic())))
                }
                Err(_) => Some("activation task was cancelled".to_string()),
            };
            if let Some(error) = failure {
                self.activation_failed(&owner, error);
            }
        }
    }

    fn activation_failed(&mut self, owner: &ExtensionId, error: String) {
        warn!(extension = %owner, error = %error, "[Lifecycle] Activation callback failed");
        ExtensionEventLogger::log_event(
            owner.as_str(),
            ExtensionEvent::ActivationFailed {
                error: error.clone(),
            },
        );
        self.events.publish(LifecycleEvent::ActivationFailed {
            extension: owner.clone(),
            error: error.clone(),
        });
        if let Some(record) = self.records.iter_mut().find(|record| &record.id == owner) {
            record.activation_errors.push(error);
        }
    }

    // -----------------------------------------------------------------------

    fn expect_state(&self, expected: LifecycleState) -> Result<(), StartupError> {
        if self.state == expected {
            return Ok(());
        }
        Err(StartupError::InvalidState {
            current: self.state.to_string(),
            expected: expected.to_string(),
        })
    }

    fn transition(&mut self, to: LifecycleState) {
        let from = self.state;
        self.state = to;
        info!("[Lifecycle] {} -> {}", from, to);
        self.events.publish(LifecycleEvent::StateChanged { from, to });
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(CoordinatorOptions::default())
    }
}

/// Order descriptors so every declared dependency precedes its dependents.
///
/// Ties keep discovery order. Dependencies on ids that were never discovered
/// do not constrain the order; they fail later as missing dependencies.
pub fn resolve_load_order(
    descriptors: Vec<ExtensionDescriptor>,
) -> Result<Vec<ExtensionDescriptor>, StartupError> {
    let known: HashSet<ExtensionId> = descriptors.iter().map(|d| d.id.clone()).collect();
    let mut placed: HashSet<ExtensionId> = HashSet::with_capacity(descriptors.len());
    let mut ordered = Vec::with_capacity(descriptors.len());
    let mut remaining = descriptors;

    while !remaining.is_empty() {
        let ready = remaining.iter().position(|descriptor| {
            descriptor
                .dependencies
                .iter()
                .all(|dep| placed.contains(dep) || !known.contains(dep))
        });
        match ready {
            Some(index) => {
                let descriptor = remaining.remove(index);
                placed.insert(descriptor.id.clone());
                ordered.push(descriptor);
            }
            None => {
                return Err(StartupError::DependencyCycle {
                    cycle: find_cycle(&remaining),
                })
            }
        }
    }
    Ok(ordered)
}

/// Follow unplaced dependencies from the first stuck descriptor until an id repeats.
fn find_cycle(stuck: &[ExtensionDescriptor]) -> Vec<ExtensionId> {
    let by_id: HashMap<&ExtensionId, &ExtensionDescriptor> = stuck.iter().map(|d| (&d.id, d)).collect();
    let mut path: Vec<ExtensionId> = Vec::new();
    let Some(mut current) = stuck.first() else {
        return path;
    };
    loop {
        if let Some(start) = path.iter().position(|id| id == &current.id) {
            let mut cycle = path.split_off(start);
            cycle.push(current.id.clone());
            return cycle;
        }
        path.push(current.id.clone());
        match current.dependencies.iter().find_map(|dep| by_id.get(dep).copied()) {
            Some(next) => current = next,
            None => return path,
        }
    }
}

fn reject(owner: &ExtensionId, kind: &str, err: &CapabilityError) {
    warn!(extension = %owner, kind, error = %err, "[Lifecycle] Registration rejected");
    ExtensionEventLogger::log_event(
        owner.as_str(),
        ExtensionEvent::RegistrationRejected {
            kind: kind.to_string(),
            error: err.to_string(),
        },
    );
}

fn report_if_slow(extension: &ExtensionId, phase: &str, started: Instant) {
    let elapsed = started.elapsed();
    if elapsed > SLOW_CALLBACK {
        debug!(
            extension = %extension,
            phase,
            elapsed_ms = elapsed.as_millis() as u64,
            "[Lifecycle] Slow extension callback"
        );
    }
}
