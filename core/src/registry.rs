use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use url::Url;

use crate::context::MissionContext;
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::listener::Executor;
use crate::mission::{Mission, MissionId, MissionRecord};
use crate::probe::{matches_existing, ResourceProbe};

/// Observer of registry membership changes.
pub trait RegistryListener: Send + Sync {
    fn on_mission_added(&self, _index: usize, _id: MissionId) {}
    /// A freshly created mission turned out to duplicate an existing one and
    /// was dropped in its favour.
    fn on_mission_discarded(&self, _id: MissionId) {}
}

/// Addresses a mission either by its position in the registry or by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionKey {
    Index(usize),
    Id(MissionId),
}

impl From<usize> for MissionKey {
    fn from(index: usize) -> Self {
        MissionKey::Index(index)
    }
}

impl From<MissionId> for MissionKey {
    fn from(id: MissionId) -> Self {
        MissionKey::Id(id)
    }
}

impl FromStr for MissionKey {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if let Ok(id) = MissionId::parse_str(value) {
            return Ok(MissionKey::Id(id));
        }
        value
            .parse::<usize>()
            .map(MissionKey::Index)
            .map_err(|_| CoreError::NotFound(format!("not a mission id or index: {}", value)))
    }
}

impl fmt::Display for MissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissionKey::Index(index) => write!(f, "#{}", index),
            MissionKey::Id(id) => write!(f, "{}", id),
        }
    }
}

/// Parameters for [`MissionRegistry::create`]. Unset fields fall back to the
/// engine configuration.
#[derive(Debug, Clone, Default)]
pub struct MissionRequest {
    pub url: String,
    pub name: Option<String>,
    pub workers: Option<u32>,
    pub cookie: Option<String>,
    pub user_agent: Option<String>,
    pub location: Option<PathBuf>,
}

impl MissionRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_workers(mut self, workers: u32) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.location = Some(location.into());
        self
    }
}

struct ListenerSlot {
    listener: Weak<dyn RegistryListener>,
    executor: Arc<dyn Executor>,
}

/// Ordered collection of missions, newest first.
pub struct MissionRegistry {
    ctx: Arc<MissionContext>,
    missions: Mutex<Vec<Arc<Mission>>>,
    listener: Mutex<Option<ListenerSlot>>,
    probes: Mutex<Vec<JoinHandle<()>>>,
}

impl MissionRegistry {
    /// Build the registry and reload every unfinished mission snapshot.
    pub fn open(ctx: MissionContext) -> CoreResult<Arc<Self>> {
        let registry = Arc::new(Self {
            ctx: Arc::new(ctx),
            missions: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
            probes: Mutex::new(Vec::new()),
        });
        let loaded = registry.load_missions()?;
        if loaded > 0 {
            info!("restored {} missions", loaded);
        }
        Ok(registry)
    }

    pub fn context(&self) -> &MissionContext {
        &self.ctx
    }

    fn lock_missions(&self) -> CoreResult<MutexGuard<'_, Vec<Arc<Mission>>>> {
        self.missions
            .lock()
            .map_err(|_| CoreError::Storage("registry lock poisoned".to_string()))
    }

    /// Re-read snapshots from the store. Finished missions are deleted rather
    /// than loaded; missions already present are left untouched.
    pub fn load_missions(&self) -> CoreResult<usize> {
        let records = self.ctx.store.load_all()?;
        let mut loaded = 0usize;
        for mut record in records {
            if record.finished {
                debug!("dropping finished snapshot {}", record.id);
                if let Err(err) = self.ctx.store.delete(&record.id) {
                    warn!("failed to delete snapshot {}: {}", record.id, err);
                }
                continue;
            }
            if self.index_of(record.id).is_some() {
                continue;
            }
            record.running = false;
            record.recovered = true;
            let mission = Mission::new(record, Arc::clone(&self.ctx));
            self.insert(mission)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Install the single registry listener, replacing any previous one.
    pub fn set_listener(&self, listener: &Arc<dyn RegistryListener>, executor: Arc<dyn Executor>) {
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(ListenerSlot {
                listener: Arc::downgrade(listener),
                executor,
            });
        }
    }

    pub fn clear_listener(&self) {
        if let Ok(mut slot) = self.listener.lock() {
            *slot = None;
        }
    }

    fn notify(&self, deliver: impl FnOnce(&dyn RegistryListener) + Send + 'static) {
        let target = match self.listener.lock() {
            Ok(slot) => slot
                .as_ref()
                .map(|slot| (slot.listener.clone(), Arc::clone(&slot.executor))),
            Err(_) => None,
        };
        if let Some((listener, executor)) = target {
            executor.execute(Box::new(move || {
                if let Some(listener) = listener.upgrade() {
                    deliver(listener.as_ref());
                }
            }));
        }
    }

    /// Register a new mission and probe it in the background. The mission is
    /// visible in the registry, and its snapshot on disk, before this returns.
    pub fn create(self: &Arc<Self>, request: MissionRequest) -> CoreResult<MissionId> {
        let url = request.url.trim().to_string();
        Url::parse(&url)
            .map_err(|err| CoreError::InvalidState(format!("invalid url {}: {}", url, err)))?;

        let config = &self.ctx.config;
        let location = request
            .location
            .unwrap_or_else(|| config.download_dir.clone());
        if !self.ctx.volume.is_writable(&location) {
            return Err(CoreError::Storage(format!(
                "{} is not writable",
                location.display()
            )));
        }

        let mut record = MissionRecord::new(
            url,
            location.to_string_lossy().to_string(),
            config.block_size,
            request.workers.unwrap_or(config.default_worker_count),
            request
                .user_agent
                .filter(|agent| !agent.trim().is_empty())
                .unwrap_or_else(|| config.user_agent.clone()),
        );
        record.cookie = request.cookie.unwrap_or_default();
        record.name = request.name.map(|name| name.trim().to_string()).unwrap_or_default();

        let mission = Mission::new(record, Arc::clone(&self.ctx));
        mission.flush_snapshot()?;
        let id = mission.id();
        let index = self.insert(Arc::clone(&mission))?;
        debug!("mission {} created at #{}", id, index);
        self.notify(move |listener| listener.on_mission_added(index, id));

        self.spawn_probe(mission)?;
        Ok(id)
    }

    fn insert(&self, mission: Arc<Mission>) -> CoreResult<usize> {
        let timestamp = mission.timestamp();
        let mut missions = self.lock_missions()?;
        let index = missions
            .iter()
            .position(|existing| existing.timestamp() < timestamp)
            .unwrap_or(missions.len());
        missions.insert(index, mission);
        Ok(index)
    }

    fn spawn_probe(self: &Arc<Self>, mission: Arc<Mission>) -> CoreResult<bool> {
        if !mission.begin_probe() {
            return Ok(false);
        }
        let registry = Arc::clone(self);
        let target = Arc::clone(&mission);
        let spawned = thread::Builder::new()
            .name(format!("probe-{}", mission.id()))
            .spawn(move || registry.run_probe(&target));
        match spawned {
            Ok(handle) => {
                if let Ok(mut probes) = self.probes.lock() {
                    probes.retain(|handle| !handle.is_finished());
                    probes.push(handle);
                }
                Ok(true)
            }
            Err(err) => {
                mission.end_probe();
                Err(CoreError::Io(err.to_string()))
            }
        }
    }

    fn run_probe(&self, mission: &Arc<Mission>) {
        let ctx = &self.ctx;
        let probe = ResourceProbe::new(
            Arc::clone(&ctx.net),
            Arc::clone(&ctx.volume),
            ctx.config.clone(),
        );
        let input = mission.probe_input();
        let outcome = match probe.probe(&input) {
            Ok(outcome) => outcome,
            Err(code) => {
                mission.end_probe();
                mission.report_error(code);
                return;
            }
        };

        if self.index_of(mission.id()).is_none() {
            debug!("mission {} was removed while probing", mission.id());
            mission.end_probe();
            return;
        }

        let duplicate = match self.lock_missions() {
            Ok(missions) => missions
                .iter()
                .find(|other| {
                    if other.id() == mission.id() {
                        return false;
                    }
                    let record = other.record();
                    matches_existing(&record, &outcome.name, &outcome.url)
                        || matches_existing(&record, &outcome.name, &input.url)
                })
                .cloned(),
            Err(err) => {
                warn!("probe of {} could not check duplicates: {}", mission.id(), err);
                None
            }
        };

        if let Some(existing) = duplicate {
            info!(
                "mission {} duplicates {}, keeping the existing one",
                mission.id(),
                existing.id()
            );
            mission.end_probe();
            if !existing.is_finished() && !existing.is_running() {
                if let Err(err) = existing.start() {
                    warn!("failed to restart mission {}: {}", existing.id(), err);
                }
            }
            if let Ok(mut missions) = self.lock_missions() {
                missions.retain(|other| other.id() != mission.id());
            }
            if let Err(err) = mission.clear() {
                warn!("failed to clear duplicate mission {}: {}", mission.id(), err);
            }
            let id = mission.id();
            self.notify(move |listener| listener.on_mission_discarded(id));
            return;
        }

        if let Err(err) = mission.initialize(&outcome) {
            warn!("failed to prepare {}: {}", mission.id(), err);
            mission.end_probe();
            mission.report_error(ErrorCode::Unknown);
            return;
        }
        if let Err(err) = mission.start() {
            warn!("failed to start mission {}: {}", mission.id(), err);
        }
    }

    pub fn get(&self, key: impl Into<MissionKey>) -> CoreResult<Arc<Mission>> {
        let key = key.into();
        let missions = self.lock_missions()?;
        let found = match key {
            MissionKey::Index(index) => missions.get(index),
            MissionKey::Id(id) => missions.iter().find(|mission| mission.id() == id),
        };
        found
            .cloned()
            .ok_or_else(|| CoreError::NotFound(key.to_string()))
    }

    pub fn index_of(&self, id: MissionId) -> Option<usize> {
        let missions = self.missions.lock().ok()?;
        missions.iter().position(|mission| mission.id() == id)
    }

    pub fn list(&self) -> CoreResult<Vec<Arc<Mission>>> {
        Ok(self.lock_missions()?.clone())
    }

    pub fn records(&self) -> CoreResult<Vec<MissionRecord>> {
        Ok(self
            .lock_missions()?
            .iter()
            .map(|mission| mission.record())
            .collect())
    }

    pub fn count(&self) -> usize {
        self.missions
            .lock()
            .map(|missions| missions.len())
            .unwrap_or(0)
    }

    /// Start or resume a mission. A mission that was never probed successfully
    /// is probed again first.
    pub fn start(self: &Arc<Self>, key: impl Into<MissionKey>) -> CoreResult<bool> {
        let mission = self.get(key)?;
        if mission.has_init() {
            mission.start()
        } else {
            self.spawn_probe(mission)
        }
    }

    pub fn resume(self: &Arc<Self>, key: impl Into<MissionKey>) -> CoreResult<bool> {
        self.start(key)
    }

    pub fn pause(&self, key: impl Into<MissionKey>) -> CoreResult<bool> {
        Ok(self.get(key)?.pause())
    }

    /// Remove a mission together with its snapshot and downloaded file.
    pub fn delete(&self, key: impl Into<MissionKey>) -> CoreResult<()> {
        let mission = self.take(key.into())?;
        mission.delete()
    }

    /// Forget a mission but keep whatever was downloaded.
    pub fn clear(&self, key: impl Into<MissionKey>) -> CoreResult<()> {
        let mission = self.take(key.into())?;
        mission.clear()
    }

    fn take(&self, key: MissionKey) -> CoreResult<Arc<Mission>> {
        let mut missions = self.lock_missions()?;
        let index = match key {
            MissionKey::Index(index) if index < missions.len() => Some(index),
            MissionKey::Index(_) => None,
            MissionKey::Id(id) => missions.iter().position(|mission| mission.id() == id),
        };
        match index {
            Some(index) => Ok(missions.remove(index)),
            None => Err(CoreError::NotFound(key.to_string())),
        }
    }

    pub fn pause_all(&self) -> CoreResult<usize> {
        Ok(self
            .list()?
            .iter()
            .filter(|mission| mission.pause())
            .count())
    }

    /// Start every mission that is neither running nor finished.
    pub fn resume_all(self: &Arc<Self>) -> CoreResult<usize> {
        let mut started = 0usize;
        for mission in self.list()? {
            if mission.is_finished() || mission.is_running() {
                continue;
            }
            let result = if mission.has_init() {
                mission.start()
            } else {
                self.spawn_probe(Arc::clone(&mission))
            };
            match result {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(err) => warn!("failed to resume mission {}: {}", mission.id(), err),
            }
        }
        Ok(started)
    }

    pub fn delete_all(&self) -> CoreResult<()> {
        let missions: Vec<Arc<Mission>> = self.lock_missions()?.drain(..).collect();
        for mission in missions {
            mission.delete()?;
        }
        Ok(())
    }

    pub fn clear_all(&self) -> CoreResult<()> {
        let missions: Vec<Arc<Mission>> = self.lock_missions()?.drain(..).collect();
        for mission in missions {
            mission.clear()?;
        }
        Ok(())
    }

    /// Block until no probe is pending and every mission's workers have exited.
    pub fn wait_idle(&self) {
        loop {
            let probes: Vec<JoinHandle<()>> = match self.probes.lock() {
                Ok(mut probes) => probes.drain(..).collect(),
                Err(_) => Vec::new(),
            };
            let had_probes = !probes.is_empty();
            for handle in probes {
                let _ = handle.join();
            }
            for mission in self.list().unwrap_or_default() {
                mission.wait();
            }
            let pending = self
                .probes
                .lock()
                .map(|probes| !probes.is_empty())
                .unwrap_or(false);
            if !had_probes && !pending {
                return;
            }
        }
    }
}

/// Explicit process-wide registration point for a [`MissionRegistry`].
#[derive(Clone, Default)]
pub struct RegistryHandle {
    slot: Arc<OnceLock<Arc<MissionRegistry>>>,
}

impl RegistryHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the registry. Only the first call constructs anything.
    pub fn register(&self, ctx: MissionContext) -> CoreResult<Arc<MissionRegistry>> {
        if let Some(registry) = self.slot.get() {
            return Ok(Arc::clone(registry));
        }
        let registry = MissionRegistry::open(ctx)?;
        Ok(Arc::clone(self.slot.get_or_init(|| registry)))
    }

    pub fn get(&self) -> CoreResult<Arc<MissionRegistry>> {
        self.slot.get().cloned().ok_or(CoreError::NotRegistered)
    }

    pub fn is_registered(&self) -> bool {
        self.slot.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_parse_ids_and_indices() {
        let id = MissionId::new_v4();
        assert_eq!(id.to_string().parse::<MissionKey>().unwrap(), MissionKey::Id(id));
        assert_eq!("3".parse::<MissionKey>().unwrap(), MissionKey::Index(3));
        assert!(matches!(
            "third".parse::<MissionKey>(),
            Err(CoreError::NotFound(_))
        ));
        assert_eq!(MissionKey::from(2usize).to_string(), "#2");
    }

    #[test]
    fn request_builder_keeps_overrides() {
        let request = MissionRequest::new("http://example.com/a.bin")
            .with_name("b.bin")
            .with_workers(8)
            .with_cookie("k=v");
        assert_eq!(request.name.as_deref(), Some("b.bin"));
        assert_eq!(request.workers, Some(8));
        assert_eq!(request.cookie.as_deref(), Some("k=v"));
        assert!(request.user_agent.is_none());
    }
}
