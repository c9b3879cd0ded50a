use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::block::{block_count, clamp_workers};
use crate::context::MissionContext;
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::listener::{Executor, ListenerHandle, ListenerRegistry, MissionEvent, MissionListener};
use crate::probe::{ProbeInput, ProbeOutcome};
use crate::snapshot::WriteGate;
use crate::worker::{self, RunPlan};

pub type MissionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionStatus {
    Uninitialized,
    Probing,
    Ready,
    Running,
    Paused,
    Finished,
    Errored,
}

impl MissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionStatus::Uninitialized => "uninitialized",
            MissionStatus::Probing => "probing",
            MissionStatus::Ready => "ready",
            MissionStatus::Running => "running",
            MissionStatus::Paused => "paused",
            MissionStatus::Finished => "finished",
            MissionStatus::Errored => "errored",
        }
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every persisted field of a mission. This is what a snapshot file holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissionRecord {
    pub id: MissionId,
    pub create_time: u64,
    pub timestamp: u64,
    pub url: String,
    pub origin_url: String,
    #[serde(default)]
    pub redirect_url: String,
    #[serde(default)]
    pub cookie: String,
    pub user_agent: String,
    pub location: String,
    pub name: String,
    pub length: u64,
    pub block_size: u64,
    pub block_count: u64,
    pub worker_count: u32,
    pub fallback: bool,
    pub done: u64,
    pub finished_worker_count: u32,
    pub worker_cursors: Vec<u64>,
    pub completed_blocks: BTreeSet<u64>,
    pub running: bool,
    pub finished: bool,
    pub has_init: bool,
    #[serde(default)]
    pub recovered: bool,
    #[serde(default)]
    pub error: Option<ErrorCode>,
}

impl MissionRecord {
    pub fn new(
        url: String,
        location: String,
        block_size: u64,
        worker_count: u32,
        user_agent: String,
    ) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            create_time: now,
            timestamp: now,
            url: url.clone(),
            origin_url: url,
            redirect_url: String::new(),
            cookie: String::new(),
            user_agent,
            location,
            name: String::new(),
            length: 0,
            block_size,
            block_count: 0,
            worker_count: worker_count.max(1),
            fallback: false,
            done: 0,
            finished_worker_count: 0,
            worker_cursors: Vec::new(),
            completed_blocks: BTreeSet::new(),
            running: false,
            finished: false,
            has_init: false,
            recovered: false,
            error: None,
        }
    }

    pub fn destination(&self) -> PathBuf {
        Path::new(&self.location).join(&self.name)
    }

    pub fn status(&self) -> MissionStatus {
        if self.error.is_some() {
            MissionStatus::Errored
        } else if self.finished {
            MissionStatus::Finished
        } else if self.running {
            MissionStatus::Running
        } else if !self.has_init {
            MissionStatus::Uninitialized
        } else if self.done > 0 || self.recovered {
            MissionStatus::Paused
        } else {
            MissionStatus::Ready
        }
    }

    pub fn progress_percent(&self) -> f32 {
        if self.length == 0 {
            return 0.0;
        }
        (self.done as f64 / self.length as f64 * 100.0) as f32
    }

    fn reset_cursors(&mut self) {
        self.worker_cursors = (0..self.worker_count as u64).collect();
    }

    fn reset_progress(&mut self) {
        self.done = 0;
        self.completed_blocks.clear();
        self.reset_cursors();
    }
}

const STOP_NONE: u8 = 0;
const STOP_PAUSED: u8 = 1;
const STOP_FAILED: u8 = 2;

/// Token shared by the workers of one `start()` call. Workers hold it until
/// released, and wind down once it is stopped.
pub(crate) struct RunControl {
    stop: AtomicU8,
    released: Mutex<bool>,
    cond: Condvar,
}

impl RunControl {
    pub(crate) fn new() -> Self {
        Self {
            stop: AtomicU8::new(STOP_NONE),
            released: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst) != STOP_NONE
    }

    fn stop(&self, reason: u8) {
        let _ = self
            .stop
            .compare_exchange(STOP_NONE, reason, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Stop and release at once, for runs that never got going.
    pub(crate) fn abort(&self) {
        self.stop(STOP_FAILED);
        self.release();
    }

    pub(crate) fn release(&self) {
        let mut released = self.released.lock().unwrap_or_else(|e| e.into_inner());
        *released = true;
        self.cond.notify_all();
    }

    pub(crate) fn wait_released(&self) {
        let mut released = self.released.lock().unwrap_or_else(|e| e.into_inner());
        while !*released {
            released = self
                .cond
                .wait(released)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

struct MissionInner {
    record: MissionRecord,
    run: Option<Arc<RunControl>>,
    probing: bool,
}

impl MissionInner {
    fn is_current(&self, run: Option<&RunControl>) -> bool {
        match run {
            None => true,
            Some(run) => self
                .run
                .as_deref()
                .map(|current| std::ptr::eq(current, run))
                .unwrap_or(false),
        }
    }
}

/// One download from a single URL to a single destination file.
///
/// All counters live behind one mutex scoped to this mission; the `report_*`
/// entry points are the only places they change once workers are running.
pub struct Mission {
    id: MissionId,
    ctx: Arc<MissionContext>,
    inner: Mutex<MissionInner>,
    listeners: ListenerRegistry,
    workers: Mutex<Vec<JoinHandle<()>>>,
    gate: WriteGate,
    write_lock: Mutex<()>,
    discarded: AtomicBool,
}

impl Mission {
    pub fn new(record: MissionRecord, ctx: Arc<MissionContext>) -> Arc<Mission> {
        Arc::new(Mission {
            id: record.id,
            ctx,
            inner: Mutex::new(MissionInner {
                record,
                run: None,
                probing: false,
            }),
            listeners: ListenerRegistry::default(),
            workers: Mutex::new(Vec::new()),
            gate: WriteGate::default(),
            write_lock: Mutex::new(()),
            discarded: AtomicBool::new(false),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, MissionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> MissionId {
        self.id
    }

    pub(crate) fn context(&self) -> &MissionContext {
        &self.ctx
    }

    pub fn record(&self) -> MissionRecord {
        self.lock_inner().record.clone()
    }

    pub fn status(&self) -> MissionStatus {
        let inner = self.lock_inner();
        let status = inner.record.status();
        if status == MissionStatus::Uninitialized && inner.probing {
            MissionStatus::Probing
        } else {
            status
        }
    }

    pub fn name(&self) -> String {
        self.lock_inner().record.name.clone()
    }

    pub fn destination(&self) -> PathBuf {
        self.lock_inner().record.destination()
    }

    pub fn done(&self) -> u64 {
        self.lock_inner().record.done
    }

    pub fn length(&self) -> u64 {
        self.lock_inner().record.length
    }

    pub fn timestamp(&self) -> u64 {
        self.lock_inner().record.timestamp
    }

    pub fn progress_percent(&self) -> f32 {
        self.lock_inner().record.progress_percent()
    }

    pub fn is_running(&self) -> bool {
        self.lock_inner().record.running
    }

    pub fn is_finished(&self) -> bool {
        self.lock_inner().record.finished
    }

    pub fn has_init(&self) -> bool {
        self.lock_inner().record.has_init
    }

    pub fn is_probing(&self) -> bool {
        self.lock_inner().probing
    }

    pub fn error(&self) -> Option<ErrorCode> {
        self.lock_inner().record.error
    }

    pub fn add_listener(
        &self,
        listener: &Arc<dyn MissionListener>,
        executor: Arc<dyn Executor>,
    ) -> ListenerHandle {
        self.listeners.add(listener, executor)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.remove(handle)
    }

    /// Dispatch workers for this mission. Returns `Ok(false)` when the mission
    /// is already running or finished.
    pub fn start(self: &Arc<Self>) -> CoreResult<bool> {
        let (run, plan) = {
            let mut inner = self.lock_inner();
            let record = &mut inner.record;
            if record.running || record.finished {
                return Ok(false);
            }
            if !record.has_init {
                return Err(CoreError::InvalidState(format!(
                    "mission {} has not been probed",
                    self.id
                )));
            }

            let destination = record.destination();
            if !destination.exists() {
                warn!(
                    "destination {} vanished, re-allocating mission {}",
                    destination.display(),
                    self.id
                );
                allocate_destination(&destination, record.length)?;
                record.reset_progress();
            }

            record.error = None;
            record.finished_worker_count = 0;
            record.running = true;
            record.timestamp = now_millis();
            if record.fallback {
                // Single stream cannot resume; restart from zero.
                record.worker_count = 1;
                record.block_count = 0;
                record.reset_progress();
            } else {
                for worker in record.worker_cursors.len() as u64..record.worker_count as u64 {
                    record.worker_cursors.push(worker);
                }
                record.worker_cursors.truncate(record.worker_count as usize);
            }

            let plan = RunPlan::from_record(record);
            let run = Arc::new(RunControl::new());
            inner.run = Some(Arc::clone(&run));
            (run, plan)
        };

        let handles = match worker::spawn_workers(self, &run, plan) {
            Ok(handles) => handles,
            Err(err) => {
                error!("failed to spawn workers for mission {}: {}", self.id, err);
                self.report_error_for(Some(run.as_ref()), ErrorCode::Unknown);
                return Err(err);
            }
        };
        if let Ok(mut workers) = self.workers.lock() {
            workers.retain(|handle| !handle.is_finished());
            workers.extend(handles);
        }

        self.write_snapshot_logged();
        debug!("mission {} started", self.id);
        self.listeners.dispatch(MissionEvent::Start);
        run.release();
        Ok(true)
    }

    /// Stop a running mission. Workers observe the stop cooperatively.
    pub fn pause(&self) -> bool {
        {
            let mut inner = self.lock_inner();
            if !inner.record.running {
                return false;
            }
            inner.record.running = false;
            inner.record.recovered = true;
            if let Some(run) = inner.run.take() {
                run.stop(STOP_PAUSED);
            }
        }
        self.write_snapshot_logged();
        debug!("mission {} paused", self.id);
        self.listeners.dispatch(MissionEvent::Pause);
        true
    }

    /// Pause, then remove both the snapshot and the destination file.
    pub fn delete(&self) -> CoreResult<()> {
        self.pause();
        self.discard()?;
        let destination = self.destination();
        if self.name().is_empty() {
            return Ok(());
        }
        match fs::remove_file(&destination) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CoreError::Io(err.to_string())),
        }
    }

    /// Pause, then remove the snapshot only. The destination file stays.
    pub fn clear(&self) -> CoreResult<()> {
        self.pause();
        self.discard()
    }

    fn discard(&self) -> CoreResult<()> {
        self.discarded.store(true, Ordering::SeqCst);
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.ctx.store.delete(&self.id)
    }

    /// Join every worker spawned so far, including workers of later runs.
    pub fn wait(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
                Ok(mut workers) => workers.drain(..).collect(),
                Err(_) => return,
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.join();
            }
        }
    }

    pub fn report_progress(self: &Arc<Self>, delta: u64) {
        self.apply_progress(None, delta, None);
    }

    /// Mark `block` complete for `worker` and count its bytes once.
    pub fn report_block_completed(self: &Arc<Self>, worker: u32, block: u64, bytes: u64) -> bool {
        self.apply_progress(None, bytes, Some((worker, block)))
    }

    pub fn report_worker_finished(&self) {
        self.report_worker_finished_for(None);
    }

    pub fn report_error(&self, code: ErrorCode) {
        self.report_error_for(None, code);
    }

    pub(crate) fn report_progress_for(self: &Arc<Self>, run: &RunControl, delta: u64) -> bool {
        self.apply_progress(Some(run), delta, None)
    }

    pub(crate) fn report_block_completed_for(
        self: &Arc<Self>,
        run: &RunControl,
        worker: u32,
        block: u64,
        bytes: u64,
    ) -> bool {
        self.apply_progress(Some(run), bytes, Some((worker, block)))
    }

    fn apply_progress(
        self: &Arc<Self>,
        run: Option<&RunControl>,
        delta: u64,
        block: Option<(u32, u64)>,
    ) -> bool {
        let event = {
            let mut inner = self.lock_inner();
            if !inner.is_current(run) || !inner.record.running {
                return false;
            }
            let record = &mut inner.record;
            let mut delta = delta;
            if let Some((worker, index)) = block {
                let next = index + record.worker_count as u64;
                if let Some(cursor) = record.worker_cursors.get_mut(worker as usize) {
                    if *cursor < next {
                        *cursor = next;
                    }
                }
                if index >= record.block_count || !record.completed_blocks.insert(index) {
                    delta = 0;
                }
            }
            if delta == 0 && block.is_none() {
                return true;
            }
            record.recovered = false;
            record.done = record.done.saturating_add(delta);
            if record.length > 0 && record.done > record.length {
                record.done = record.length;
            }
            if record.done < record.length {
                Some(MissionEvent::Progress {
                    done: record.done,
                    total: record.length,
                })
            } else {
                None
            }
        };
        if let Some(event) = event {
            self.listeners.dispatch(event);
        }
        self.request_snapshot();
        true
    }

    pub(crate) fn report_worker_finished_for(&self, run: Option<&RunControl>) {
        {
            let mut inner = self.lock_inner();
            if !inner.is_current(run) {
                return;
            }
            let record = &mut inner.record;
            if record.error.is_some() || record.finished || !record.running {
                return;
            }
            record.finished_worker_count += 1;
            if record.finished_worker_count < record.worker_count {
                return;
            }
            record.running = false;
            record.finished = true;
            record.recovered = false;
            inner.run = None;
        }
        self.write_snapshot_logged();
        info!("mission {} finished", self.id);
        self.listeners.dispatch(MissionEvent::Finish);
    }

    /// Record a terminal error. The current run is stopped so every worker
    /// winds down; the error persists until the mission is started again.
    pub(crate) fn report_error_for(&self, run: Option<&RunControl>, code: ErrorCode) {
        {
            let mut inner = self.lock_inner();
            if !inner.is_current(run) {
                return;
            }
            if inner.record.finished || inner.record.error.is_some() {
                return;
            }
            inner.record.error = Some(code);
            inner.record.running = false;
            if let Some(run) = inner.run.take() {
                run.stop(STOP_FAILED);
            }
        }
        self.write_snapshot_logged();
        error!("mission {} failed: {} ({})", self.id, code, code.code());
        self.listeners.dispatch(MissionEvent::Error(code));
    }

    pub(crate) fn report_waiting_for(&self, run: &RunControl) {
        if self.lock_inner().is_current(Some(run)) {
            self.listeners.dispatch(MissionEvent::Waiting);
        }
    }

    pub(crate) fn cursor(&self, worker: u32) -> Option<u64> {
        self.lock_inner()
            .record
            .worker_cursors
            .get(worker as usize)
            .copied()
    }

    pub(crate) fn is_block_completed(&self, block: u64) -> bool {
        self.lock_inner().record.completed_blocks.contains(&block)
    }

    /// Move a worker's cursor past a block that is already complete.
    pub(crate) fn skip_block_for(&self, run: &RunControl, worker: u32, next: u64) -> bool {
        let mut inner = self.lock_inner();
        if !inner.is_current(Some(run)) || !inner.record.running {
            return false;
        }
        match inner.record.worker_cursors.get_mut(worker as usize) {
            Some(cursor) => {
                if *cursor < next {
                    *cursor = next;
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn begin_probe(&self) -> bool {
        let mut inner = self.lock_inner();
        if inner.probing || inner.record.has_init || inner.record.finished {
            return false;
        }
        inner.probing = true;
        inner.record.error = None;
        true
    }

    pub(crate) fn end_probe(&self) {
        self.lock_inner().probing = false;
    }

    pub(crate) fn probe_input(&self) -> ProbeInput {
        let inner = self.lock_inner();
        ProbeInput {
            url: inner.record.url.clone(),
            cookie: inner.record.cookie.clone(),
            user_agent: inner.record.user_agent.clone(),
            name: inner.record.name.clone(),
            location: PathBuf::from(&inner.record.location),
        }
    }

    /// Apply a successful probe: plan blocks and workers, pre-allocate the
    /// destination file, and mark the mission initialised.
    pub(crate) fn initialize(&self, outcome: &ProbeOutcome) -> CoreResult<()> {
        let (location, block_size, requested_workers) = {
            let inner = self.lock_inner();
            (
                PathBuf::from(&inner.record.location),
                inner.record.block_size,
                inner.record.worker_count,
            )
        };
        let blocks = block_count(outcome.length, block_size);
        let workers = if outcome.fallback {
            1
        } else {
            clamp_workers(requested_workers, blocks)
        };

        fs::create_dir_all(&location).map_err(|err| CoreError::Io(err.to_string()))?;
        allocate_destination(&location.join(&outcome.name), outcome.length)?;

        {
            let mut inner = self.lock_inner();
            inner.probing = false;
            let record = &mut inner.record;
            record.url = outcome.url.clone();
            if let Some(redirect) = &outcome.redirect_url {
                record.redirect_url = redirect.clone();
            }
            record.name = outcome.name.clone();
            record.length = outcome.length;
            record.fallback = outcome.fallback;
            record.block_count = blocks;
            record.worker_count = workers;
            record.reset_progress();
            record.has_init = true;
        }
        self.write_snapshot_logged();
        info!(
            "mission {} initialised: {} ({} bytes, {} blocks, {} workers{})",
            self.id,
            outcome.name,
            outcome.length,
            blocks,
            workers,
            if outcome.fallback { ", single stream" } else { "" }
        );
        self.listeners.dispatch(MissionEvent::Init);
        Ok(())
    }

    /// Write the current state now, serialised with any debounced write.
    pub fn flush_snapshot(&self) -> CoreResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.discarded.load(Ordering::SeqCst) {
            return Ok(());
        }
        let record = self.record();
        self.ctx.store.save(&record)
    }

    fn write_snapshot_logged(&self) {
        if let Err(err) = self.flush_snapshot() {
            warn!("failed to write snapshot for mission {}: {}", self.id, err);
        }
    }

    fn request_snapshot(self: &Arc<Self>) {
        if !self.gate.request() {
            return;
        }
        let mission = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("snapshot-{}", self.id))
            .spawn(move || mission.drain_snapshot_requests());
        if let Err(err) = spawned {
            warn!("snapshot writer unavailable ({}), writing inline", err);
            self.drain_snapshot_requests();
        }
    }

    fn drain_snapshot_requests(&self) {
        loop {
            self.write_snapshot_logged();
            if !self.gate.complete() {
                break;
            }
        }
    }
}

pub(crate) fn allocate_destination(path: &Path, length: u64) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| CoreError::Io(err.to_string()))?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|err| CoreError::Io(err.to_string()))?;
    file.set_len(length)
        .map_err(|err| CoreError::Io(err.to_string()))?;
    Ok(())
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
