//! Model lifecycle: discovery-driven and explicit load/unload, the
//! per-(name, version) state machine, and reference-counted handle
//! distribution.
//!
//! The manager exclusively owns every backend handle. Callers receive a
//! [`SharedBackend`]: a counted guard whose drop releases the reference.
//! Unloading marks a version `Unloading` (blocking new acquisitions) and
//! retires the handle on a background thread once the count drains to
//! zero. Reloading installs a new handle generation while callers holding
//! the old generation complete against it.

use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{BackendFactory, BackendHandle};
use crate::config::{ModelConfig, VersionPolicy};
use crate::error::{Error, Result};
use crate::repository::{ModelDirectory, ModificationKey, RepositoryStore};

/// Lifecycle policy for the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelControlMode {
    /// Load everything found at startup; never change afterwards.
    #[default]
    None,
    /// Rescan on demand; added, removed, and modified models are applied.
    Poll,
    /// Load and unload only by explicit calls.
    Explicit,
}

/// Per-(name, version) lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelReadyState {
    Unknown,
    Loading,
    Ready,
    Unloading,
    Unavailable,
}

/// Outstanding shared references to one handle generation.
#[derive(Default)]
struct RefCounter {
    count: Mutex<u64>,
    cv: Condvar,
}

impl RefCounter {
    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    fn count(&self) -> u64 {
        *self.count.lock()
    }

    fn wait_zero(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cv.wait(&mut count);
        }
    }
}

/// A counted reference to a loaded backend. While any clone is alive the
/// manager will not destroy the handle; dropping the last clone lets a
/// pending unload proceed.
pub struct SharedBackend {
    handle: Arc<BackendHandle>,
    refs: Arc<RefCounter>,
}

impl SharedBackend {
    fn acquire(handle: Arc<BackendHandle>, refs: Arc<RefCounter>) -> Self {
        refs.increment();
        Self { handle, refs }
    }
}

impl Clone for SharedBackend {
    fn clone(&self) -> Self {
        self.refs.increment();
        Self {
            handle: Arc::clone(&self.handle),
            refs: Arc::clone(&self.refs),
        }
    }
}

impl Drop for SharedBackend {
    fn drop(&mut self) {
        self.refs.decrement();
    }
}

impl Deref for SharedBackend {
    type Target = BackendHandle;

    fn deref(&self) -> &BackendHandle {
        &self.handle
    }
}

impl std::fmt::Debug for SharedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBackend")
            .field("name", &self.handle.name())
            .field("version", &self.handle.version())
            .finish()
    }
}

struct VersionSlot {
    state: ModelReadyState,
    reason: Option<String>,
    /// Bumped on every handle install so a retire can tell whether the
    /// slot it targeted is still the one it drained.
    generation: u64,
    key: ModificationKey,
    handle: Option<Arc<BackendHandle>>,
    refs: Arc<RefCounter>,
}

impl Default for VersionSlot {
    fn default() -> Self {
        Self {
            state: ModelReadyState::Unknown,
            reason: None,
            generation: 0,
            key: ModificationKey::default(),
            handle: None,
            refs: Arc::new(RefCounter::default()),
        }
    }
}

struct ModelState {
    config: Option<ModelConfig>,
    versions: BTreeMap<i64, VersionSlot>,
    /// Fingerprints from the scan that drove the last load, used by poll
    /// cycles to detect modification.
    version_keys: BTreeMap<i64, ModificationKey>,
    config_key: ModificationKey,
}

struct Model {
    name: String,
    state: Mutex<ModelState>,
    /// Serializes load/unload operations on this model only; operations on
    /// different models never contend here.
    op_lock: Mutex<()>,
}

impl Model {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(ModelState {
                config: None,
                versions: BTreeMap::new(),
                version_keys: BTreeMap::new(),
                config_key: ModificationKey::default(),
            }),
            op_lock: Mutex::new(()),
        }
    }
}

/// Reported state of one (name, version).
#[derive(Debug, Clone, Serialize)]
pub struct VersionStatus {
    pub state: ModelReadyState,
    pub reason: Option<String>,
    pub generation: u64,
}

/// Reported state of one model across its versions.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub name: String,
    pub versions: BTreeMap<i64, VersionStatus>,
}

/// One row of the repository index.
#[derive(Debug, Clone, Serialize)]
pub struct ModelIndexEntry {
    pub name: String,
    pub version: i64,
    pub state: ModelReadyState,
    pub reason: Option<String>,
}

/// Owns the handle table and drives the per-version state machine.
pub struct ModelRepositoryManager {
    store: RepositoryStore,
    factory: Arc<dyn BackendFactory>,
    models: RwLock<HashMap<String, Arc<Model>>>,
    /// Names loaded at startup; readiness aggregation keys off these.
    startup_models: Vec<String>,
    /// Poll cycles are serialized; no two scans overlap.
    poll_lock: Mutex<()>,
}

impl ModelRepositoryManager {
    /// Build the manager and load the startup set: every model found for
    /// `None`/`Poll` control, only `startup_models` for `Explicit`.
    pub fn new(
        store: RepositoryStore,
        factory: Arc<dyn BackendFactory>,
        mode: ModelControlMode,
        startup_models: &[String],
    ) -> Result<Self> {
        let manager = Self {
            store,
            factory,
            models: RwLock::new(HashMap::new()),
            startup_models: Vec::new(),
            poll_lock: Mutex::new(()),
        };

        let names: Vec<String> = match mode {
            ModelControlMode::None | ModelControlMode::Poll => {
                let scan = manager.store.scan()?;
                for name in startup_models {
                    if !scan.contains_key(name) {
                        return Err(Error::not_found(format!(
                            "startup model '{}' is not in any model repository",
                            name
                        )));
                    }
                }
                scan.into_keys().collect()
            }
            ModelControlMode::Explicit => startup_models.to_vec(),
        };

        let mut manager = manager;
        manager.startup_models = names.clone();

        // Startup failures are recorded against the model, not fatal;
        // strict readiness decides whether the server reports ready.
        manager.load_concurrently(&names);
        Ok(manager)
    }

    pub fn startup_models(&self) -> &[String] {
        &self.startup_models
    }

    fn load_concurrently(&self, names: &[String]) {
        std::thread::scope(|scope| {
            for name in names {
                scope.spawn(move || {
                    if let Err(e) = self.load_model(name) {
                        warn!(model = %name, error = %e, "model failed to load");
                    }
                });
            }
        });
    }

    fn model_entry(&self, name: &str) -> Arc<Model> {
        if let Some(model) = self.models.read().get(name) {
            return Arc::clone(model);
        }
        let mut models = self.models.write();
        Arc::clone(
            models
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Model::new(name))),
        )
    }

    fn get_model(&self, name: &str) -> Option<Arc<Model>> {
        self.models.read().get(name).map(Arc::clone)
    }

    /// Load (or reload) a model from the repository: versions eligible
    /// under its version policy load concurrently; versions no longer
    /// eligible start unloading. Returns an error when no eligible version
    /// ends up ready.
    pub fn load_model(&self, name: &str) -> Result<()> {
        let directory = self.store.find(name)?;
        let model = self.model_entry(name);
        let _op = model.op_lock.lock();

        let config = match self.store.read_config(&directory) {
            Ok(config) => config,
            Err(e) => {
                let mut state = model.state.lock();
                for (&version, &key) in &directory.versions {
                    let slot = state.versions.entry(version).or_default();
                    if slot.state != ModelReadyState::Ready {
                        slot.state = ModelReadyState::Unavailable;
                        slot.reason = Some(e.to_string());
                        slot.key = key;
                    }
                }
                return Err(e);
            }
        };

        let targets = resolve_policy(&config.version_policy, &directory.versions);
        if targets.is_empty() {
            warn!(model = %name, "no version is eligible under the version policy");
        }

        {
            let mut state = model.state.lock();
            state.config = Some(config.clone());
            state.version_keys = directory.versions.clone();
            state.config_key = directory.config_key;
        }

        std::thread::scope(|scope| {
            for &version in &targets {
                let key = directory.versions[&version];
                let model = &model;
                let directory = &directory;
                let config = &config;
                scope.spawn(move || {
                    self.load_version(model, directory, config, version, key);
                });
            }
        });

        // Versions loaded earlier but no longer eligible.
        let stale: Vec<i64> = {
            let state = model.state.lock();
            state
                .versions
                .iter()
                .filter(|&(version, slot)| {
                    !targets.contains(version) && slot.state == ModelReadyState::Ready
                })
                .map(|(&version, _)| version)
                .collect()
        };
        for version in stale {
            self.retire_version(&model, version);
        }

        let any_ready = {
            let state = model.state.lock();
            targets
                .iter()
                .any(|v| state.versions.get(v).map(|s| s.state) == Some(ModelReadyState::Ready))
        };
        if any_ready {
            Ok(())
        } else {
            Err(Error::unavailable(format!(
                "no version of model '{}' became ready",
                name
            )))
        }
    }

    fn load_version(
        &self,
        model: &Arc<Model>,
        directory: &ModelDirectory,
        config: &ModelConfig,
        version: i64,
        key: ModificationKey,
    ) {
        // A load while READY is a reload: the replacement is built off to
        // the side and the old handle keeps serving until the swap.
        let is_reload = {
            let mut state = model.state.lock();
            let slot = state.versions.entry(version).or_default();
            if slot.state == ModelReadyState::Ready {
                true
            } else {
                slot.state = ModelReadyState::Loading;
                slot.reason = None;
                false
            }
        };

        info!(model = %model.name, version, reload = is_reload, "loading model version");
        let created = self
            .factory
            .create(&model.name, version, config, &directory.path);

        let mut state = model.state.lock();
        let slot = state.versions.entry(version).or_default();
        match created {
            Ok(executor) => {
                let handle = Arc::new(BackendHandle::new(
                    model.name.clone(),
                    version,
                    config.clone(),
                    executor,
                ));
                let old_handle = std::mem::replace(&mut slot.handle, Some(handle));
                let old_refs =
                    std::mem::replace(&mut slot.refs, Arc::new(RefCounter::default()));
                slot.generation += 1;
                slot.state = ModelReadyState::Ready;
                slot.reason = None;
                slot.key = key;
                let generation = slot.generation;
                drop(state);

                if let Some(old_handle) = old_handle {
                    drain_retired(model.name.clone(), version, old_handle, old_refs);
                }
                info!(model = %model.name, version, generation, "model version ready");
            }
            Err(e) => {
                warn!(model = %model.name, version, error = %e, "model version failed to load");
                if is_reload && slot.state == ModelReadyState::Ready {
                    // Keep serving the old generation; record why the
                    // replacement never arrived.
                    slot.reason = Some(e.to_string());
                } else {
                    slot.state = ModelReadyState::Unavailable;
                    slot.reason = Some(e.to_string());
                }
            }
        }
    }

    /// Begin unloading one version: block new acquisitions, then destroy
    /// the handle on a background thread once its references drain.
    fn retire_version(&self, model: &Arc<Model>, version: i64) {
        let mut state = model.state.lock();
        let Some(slot) = state.versions.get_mut(&version) else {
            return;
        };
        if slot.state != ModelReadyState::Ready {
            return;
        }

        slot.state = ModelReadyState::Unloading;
        slot.reason = None;
        let handle = slot.handle.take();
        let refs = std::mem::replace(&mut slot.refs, Arc::new(RefCounter::default()));
        let generation = slot.generation;
        drop(state);

        let model = Arc::clone(model);
        std::thread::spawn(move || {
            refs.wait_zero();
            if let Some(handle) = handle {
                handle.stop();
            }
            let mut state = model.state.lock();
            if let Some(slot) = state.versions.get_mut(&version) {
                // A newer generation may have re-entered LOADING meanwhile.
                if slot.generation == generation && slot.state == ModelReadyState::Unloading {
                    slot.state = ModelReadyState::Unavailable;
                }
            }
            info!(model = %model.name, version, "model version unloaded");
        });
    }

    /// Unload every version of the model. Unloading cannot fail visibly; a
    /// stuck unload is caught by the shutdown deadline.
    pub fn unload_model(&self, name: &str) -> Result<()> {
        let model = self
            .get_model(name)
            .ok_or_else(|| Error::not_found(format!("unknown model '{}'", name)))?;
        let _op = model.op_lock.lock();

        let versions: Vec<i64> = model.state.lock().versions.keys().copied().collect();
        for version in versions {
            self.retire_version(&model, version);
        }
        Ok(())
    }

    /// Rescan the repository and apply the differences. Scans are
    /// serialized; within one cycle, added, removed, and modified models
    /// are processed concurrently and never block each other.
    pub fn poll(&self) -> Result<()> {
        let _poll = self.poll_lock.lock();
        let scan = self.store.scan()?;

        let known: HashMap<String, (BTreeMap<i64, ModificationKey>, ModificationKey)> = {
            let models = self.models.read();
            models
                .iter()
                .map(|(name, model)| {
                    let state = model.state.lock();
                    (
                        name.clone(),
                        (state.version_keys.clone(), state.config_key),
                    )
                })
                .collect()
        };

        let mut to_load = Vec::new();
        let mut to_remove = Vec::new();

        for (name, directory) in &scan {
            match known.get(name) {
                None => to_load.push(name.clone()),
                Some((version_keys, config_key)) => {
                    if *version_keys != directory.versions || *config_key != directory.config_key
                    {
                        to_load.push(name.clone());
                    }
                }
            }
        }
        for name in known.keys() {
            if !scan.contains_key(name) {
                to_remove.push(name.clone());
            }
        }

        debug!(
            added_or_modified = to_load.len(),
            removed = to_remove.len(),
            "repository poll"
        );

        std::thread::scope(|scope| {
            for name in &to_load {
                scope.spawn(move || {
                    if let Err(e) = self.load_model(name) {
                        warn!(model = %name, error = %e, "model failed to load during poll");
                    }
                });
            }
            for name in &to_remove {
                scope.spawn(move || {
                    if let Err(e) = self.unload_model(name) {
                        warn!(model = %name, error = %e, "model failed to unload during poll");
                    }
                });
            }
        });

        for name in &to_remove {
            self.models.write().remove(name);
        }

        Ok(())
    }

    /// Resolve a backend for the caller. A requested version below 1 picks
    /// the highest ready version under the model's policy.
    pub fn get_backend(&self, name: &str, requested_version: i64) -> Result<SharedBackend> {
        let model = self
            .get_model(name)
            .ok_or_else(|| Error::not_found(format!("unknown model '{}'", name)))?;
        let state = model.state.lock();

        let slot = if requested_version < 1 {
            state
                .versions
                .iter()
                .rev()
                .find(|(_, slot)| slot.state == ModelReadyState::Ready)
                .or_else(|| state.versions.iter().next_back())
                .map(|(version, slot)| (*version, slot))
        } else {
            state
                .versions
                .get(&requested_version)
                .map(|slot| (requested_version, slot))
        };

        match slot {
            Some((version, slot)) if slot.state == ModelReadyState::Ready => {
                match &slot.handle {
                    Some(handle) => Ok(SharedBackend::acquire(
                        Arc::clone(handle),
                        Arc::clone(&slot.refs),
                    )),
                    None => Err(Error::internal(format!(
                        "ready model '{}' version {} has no handle",
                        name, version
                    ))),
                }
            }
            Some((version, slot)) => Err(Error::unavailable(match &slot.reason {
                Some(reason) => format!(
                    "model '{}' version {} is not ready: {}",
                    name, version, reason
                ),
                None => format!(
                    "model '{}' version {} is not ready ({:?})",
                    name, version, slot.state
                ),
            })),
            None => Err(Error::unavailable(format!(
                "no ready version for model '{}'",
                name
            ))),
        }
    }

    pub fn ready_versions(&self, name: &str) -> Vec<i64> {
        let Some(model) = self.get_model(name) else {
            return Vec::new();
        };
        let state = model.state.lock();
        state
            .versions
            .iter()
            .filter(|(_, slot)| slot.state == ModelReadyState::Ready)
            .map(|(&version, _)| version)
            .collect()
    }

    /// A requested version below 1 asks whether any version is ready.
    pub fn model_is_ready(&self, name: &str, version: i64) -> bool {
        if version < 1 {
            return !self.ready_versions(name).is_empty();
        }
        self.ready_versions(name).contains(&version)
    }

    pub fn any_model_ready(&self) -> bool {
        let models = self.models.read();
        models.values().any(|model| {
            let state = model.state.lock();
            state
                .versions
                .values()
                .any(|slot| slot.state == ModelReadyState::Ready)
        })
    }

    pub fn model_status(&self, name: &str) -> Result<ModelStatus> {
        let model = self
            .get_model(name)
            .ok_or_else(|| Error::not_found(format!("unknown model '{}'", name)))?;
        let state = model.state.lock();
        Ok(ModelStatus {
            name: model.name.clone(),
            versions: state
                .versions
                .iter()
                .map(|(&version, slot)| {
                    (
                        version,
                        VersionStatus {
                            state: slot.state,
                            reason: slot.reason.clone(),
                            generation: slot.generation,
                        },
                    )
                })
                .collect(),
        })
    }

    pub fn status(&self) -> BTreeMap<String, ModelStatus> {
        let names: Vec<String> = self.models.read().keys().cloned().collect();
        names
            .into_iter()
            .filter_map(|name| self.model_status(&name).ok())
            .map(|status| (status.name.clone(), status))
            .collect()
    }

    /// Every known (name, version) with its state, ordered by name then
    /// version.
    pub fn index(&self) -> Vec<ModelIndexEntry> {
        self.status()
            .into_values()
            .flat_map(|status| {
                let name = status.name;
                status
                    .versions
                    .into_iter()
                    .map(move |(version, vs)| ModelIndexEntry {
                        name: name.clone(),
                        version,
                        state: vs.state,
                        reason: vs.reason,
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Unload everything and wait for the drains, forcing any version
    /// still alive at `deadline` to `Unavailable`.
    pub fn unload_all(&self, deadline: Instant) -> Result<()> {
        let names: Vec<String> = self.models.read().keys().cloned().collect();
        for name in &names {
            if let Err(e) = self.unload_model(name) {
                warn!(model = %name, error = %e, "unload at shutdown failed");
            }
        }

        loop {
            let pending = self.pending_unload_count();
            if pending == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.force_unavailable();
                return Err(Error::deadline_exceeded(format!(
                    "{} model versions still unloading at exit timeout",
                    pending
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn pending_unload_count(&self) -> usize {
        let models = self.models.read();
        models
            .values()
            .map(|model| {
                let state = model.state.lock();
                state
                    .versions
                    .values()
                    .filter(|slot| {
                        matches!(
                            slot.state,
                            ModelReadyState::Ready
                                | ModelReadyState::Loading
                                | ModelReadyState::Unloading
                        )
                    })
                    .count()
            })
            .sum()
    }

    fn force_unavailable(&self) {
        let models = self.models.read();
        for model in models.values() {
            let mut state = model.state.lock();
            for (version, slot) in state.versions.iter_mut() {
                if slot.state != ModelReadyState::Unavailable
                    && slot.state != ModelReadyState::Unknown
                {
                    warn!(
                        model = %model.name,
                        version,
                        refs = slot.refs.count(),
                        "forcing model version unavailable at shutdown"
                    );
                    slot.state = ModelReadyState::Unavailable;
                    slot.reason =
                        Some("forced unavailable: exit timeout expired".to_string());
                }
            }
        }
    }
}

/// Retire a superseded handle generation once its references drain.
fn drain_retired(
    name: String,
    version: i64,
    handle: Arc<BackendHandle>,
    refs: Arc<RefCounter>,
) {
    std::thread::spawn(move || {
        refs.wait_zero();
        handle.stop();
        debug!(model = %name, version, "retired handle generation drained");
    });
}

/// The versions on disk that the policy makes eligible.
fn resolve_policy(
    policy: &VersionPolicy,
    on_disk: &BTreeMap<i64, ModificationKey>,
) -> Vec<i64> {
    match policy {
        VersionPolicy::Latest { num_versions } => on_disk
            .keys()
            .rev()
            .take(*num_versions as usize)
            .copied()
            .collect(),
        VersionPolicy::All => on_disk.keys().copied().collect(),
        VersionPolicy::Specific { versions } => {
            let mut eligible = Vec::new();
            for version in versions {
                if on_disk.contains_key(version) {
                    eligible.push(*version);
                } else {
                    warn!(version, "specific version is not on disk, skipping");
                }
            }
            eligible
        }
    }
}
