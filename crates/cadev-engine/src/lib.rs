#![forbid(unsafe_code)]
//! Cache-engine management and I/O model.
//!
//! This crate models the external caching engine the shim coordinates:
//! caches with asynchronous exclusive/shared management locks, reference
//! counts, attach/load against per-device persisted metadata, cores
//! (including inactive shells recovered from loaded metadata), policy
//! parameters, statistics, and a pass-through I/O front end.
//!
//! Two rules shape every public entry point:
//!
//! * Management completions are never invoked inline. They are pushed onto
//!   the cache's management [`Queue`] when one is set, or dispatched through
//!   the reactor otherwise, so callers always see completion from their own
//!   poller context.
//! * Engine failures are reported as [`EngineError`] codes in a range
//!   disjoint from POSIX errnos, and propagate verbatim through the shim.

mod queue;
mod stats;

pub use queue::Queue;
pub use stats::{CoreCounters, IoCounters, StatsSnapshot, UsageCounters};

use cadev_bdev::{IoCompletion, IoRequest, IoStatus, IoType, Reactor};
use cadev_error::{CadevError, EngineError, Result};
use cadev_types::{
    CacheConfig, CacheLineSize, CacheMode, CleaningParams, CleaningPolicy, CoreConfig,
    PromotionParams, PromotionPolicy, SeqCutoffParams, SeqCutoffPolicy, KIB,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub type MngtDone = Box<dyn FnOnce(Result<()>)>;

// ── Volume seam ───────────────────────────────────────────────────────────

/// A backing volume as the engine sees it. The shim implements this over
/// its base-device bindings.
pub trait Volume: 'static {
    fn uuid(&self) -> String;
    fn length(&self) -> u64;
    fn block_size(&self) -> u32;
    /// Completion must arrive through the reactor, never inline.
    fn submit(&self, io: IoRequest, complete: IoCompletion);
    fn close(&self);
}

/// Opens volumes by uuid. Registered once by the shim at module init.
pub trait VolumeFactory: 'static {
    fn open(&self, uuid: &str) -> Result<Arc<dyn Volume>>;
}

// ── Persisted metadata ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredCore {
    name: String,
    uuid: String,
}

/// Cache metadata as persisted on the cache device. Keyed by volume uuid;
/// survives cache stop, which is what makes load-after-restart work.
#[derive(Debug, Clone)]
struct StoredMetadata {
    cache_name: String,
    mode: CacheMode,
    line_size: CacheLineSize,
    cleaning: CleaningPolicy,
    promotion: PromotionPolicy,
    cores: Vec<StoredCore>,
    clean_shutdown: bool,
}

/// Result of probing a device for cache metadata.
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    pub cache_name: String,
    pub clean_shutdown: bool,
    pub core_count: usize,
}

// ── Core ──────────────────────────────────────────────────────────────────

struct CoreState {
    uuid: String,
    volume: Option<Arc<dyn Volume>>,
    /// Set by the shim once it has registered an exposed device for this
    /// core. Cores without a binding are inactive shells from loaded
    /// metadata and are skipped by visitors.
    bound: bool,
    seqcutoff_policy: SeqCutoffPolicy,
    seqcutoff_threshold: u64,
    seqcutoff_promotion_count: u32,
    dirty_lines: u64,
    clean_lines: u64,
    stats: CoreCounters,
}

pub struct Core {
    name: String,
    state: Mutex<CoreState>,
}

impl Core {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> String {
        self.state.lock().uuid.clone()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().volume.is_some()
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().bound
    }

    pub fn set_bound(&self, bound: bool) {
        self.state.lock().bound = bound;
    }

    pub fn seqcutoff(&self) -> SeqCutoffParams {
        let st = self.state.lock();
        SeqCutoffParams {
            policy: Some(st.seqcutoff_policy),
            threshold_kib: u32::try_from(st.seqcutoff_threshold / KIB).ok(),
            promotion_count: Some(st.seqcutoff_promotion_count),
        }
    }

    pub fn set_seqcutoff(&self, params: &SeqCutoffParams) {
        let mut st = self.state.lock();
        if let Some(policy) = params.policy {
            st.seqcutoff_policy = policy;
        }
        if let Some(kib) = params.threshold_kib {
            st.seqcutoff_threshold = u64::from(kib) * KIB;
        }
        if let Some(count) = params.promotion_count {
            st.seqcutoff_promotion_count = count;
        }
    }

    pub fn dirty_lines(&self) -> u64 {
        self.state.lock().dirty_lines
    }

    fn volume(&self) -> Option<Arc<dyn Volume>> {
        self.state.lock().volume.clone()
    }
}

// ── Cache lock ────────────────────────────────────────────────────────────

enum Waiter {
    Exclusive(MngtDone),
    Shared(MngtDone),
}

#[derive(Default)]
struct LockState {
    exclusive_held: bool,
    readers: u32,
    waiters: VecDeque<Waiter>,
}

// ── Cache ─────────────────────────────────────────────────────────────────

struct AttachedDevice {
    uuid: String,
    volume: Arc<dyn Volume>,
    block_size: u32,
    total_lines: u64,
}

struct CacheState {
    mode: CacheMode,
    line_size: CacheLineSize,
    cleaning: CleaningPolicy,
    cleaning_params: CleaningParams,
    promotion: PromotionPolicy,
    promotion_params: PromotionParams,
    device: Option<AttachedDevice>,
    cores: Vec<Arc<Core>>,
    lock: LockState,
    refcount: u32,
    stopping: bool,
    mngt_queue: Option<Arc<Queue>>,
}

pub struct Cache {
    name: String,
    reactor: Reactor,
    store: Arc<Mutex<HashMap<String, StoredMetadata>>>,
    engine: Weak<EngineShared>,
    state: Mutex<CacheState>,
}

impl Cache {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> CacheMode {
        self.state.lock().mode
    }

    pub fn line_size(&self) -> CacheLineSize {
        self.state.lock().line_size
    }

    pub fn cleaning_policy(&self) -> CleaningPolicy {
        self.state.lock().cleaning
    }

    pub fn promotion_policy(&self) -> PromotionPolicy {
        self.state.lock().promotion
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().device.is_some()
    }

    pub fn is_stopping(&self) -> bool {
        self.state.lock().stopping
    }

    pub fn device_uuid(&self) -> Option<String> {
        self.state.lock().device.as_ref().map(|d| d.uuid.clone())
    }

    pub fn cache_block_size(&self) -> Option<u32> {
        self.state.lock().device.as_ref().map(|d| d.block_size)
    }

    pub fn cores(&self) -> Vec<Arc<Core>> {
        self.state.lock().cores.clone()
    }

    pub fn core_count(&self) -> usize {
        self.state.lock().cores.len()
    }

    pub fn inactive_core_count(&self) -> usize {
        self.state
            .lock()
            .cores
            .iter()
            .filter(|c| !c.is_active())
            .count()
    }

    pub fn find_core(&self, name: &str) -> Option<Arc<Core>> {
        self.state
            .lock()
            .cores
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub fn set_mngt_queue(&self, queue: Arc<Queue>) {
        self.state.lock().mngt_queue = Some(queue);
    }

    pub fn take_mngt_queue(&self) -> Option<Arc<Queue>> {
        self.state.lock().mngt_queue.take()
    }

    // ── completion dispatch ──────────────────────────────────────────

    /// Deliver a completion through the management queue when set, or the
    /// reactor otherwise. Never inline.
    fn complete(&self, f: impl FnOnce() + 'static) {
        let queue = self.state.lock().mngt_queue.clone();
        match queue {
            Some(q) => q.push(f),
            None => self.reactor.send(f),
        }
    }

    // ── reference counting ───────────────────────────────────────────

    /// Take a reference preventing teardown. Fails once stop has begun.
    pub fn get(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.stopping {
            return Err(EngineError::Stopping.into());
        }
        st.refcount += 1;
        Ok(())
    }

    pub fn put(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.refcount > 0, "refcount underflow");
        st.refcount = st.refcount.saturating_sub(1);
    }

    pub fn refcount(&self) -> u32 {
        self.state.lock().refcount
    }

    // ── management lock ──────────────────────────────────────────────

    /// Acquire the exclusive management lock. Granted asynchronously when
    /// no other holder remains.
    pub fn lock(&self, cb: impl FnOnce(Result<()>) + 'static) {
        let cb: MngtDone = Box::new(cb);
        let grant = {
            let mut st = self.state.lock();
            if st.stopping {
                drop(st);
                self.complete(move || cb(Err(EngineError::Stopping.into())));
                return;
            }
            if !st.lock.exclusive_held && st.lock.readers == 0 && st.lock.waiters.is_empty() {
                st.lock.exclusive_held = true;
                Some(cb)
            } else {
                st.lock.waiters.push_back(Waiter::Exclusive(cb));
                None
            }
        };
        if let Some(cb) = grant {
            self.complete(move || cb(Ok(())));
        }
    }

    /// Acquire the shared management lock (stats, flush).
    pub fn read_lock(&self, cb: impl FnOnce(Result<()>) + 'static) {
        let cb: MngtDone = Box::new(cb);
        let grant = {
            let mut st = self.state.lock();
            if st.stopping {
                drop(st);
                self.complete(move || cb(Err(EngineError::Stopping.into())));
                return;
            }
            if !st.lock.exclusive_held && st.lock.waiters.is_empty() {
                st.lock.readers += 1;
                Some(cb)
            } else {
                st.lock.waiters.push_back(Waiter::Shared(cb));
                None
            }
        };
        if let Some(cb) = grant {
            self.complete(move || cb(Ok(())));
        }
    }

    /// Release one hold (exclusive or shared) and grant waiters.
    pub fn unlock(&self) {
        let grants: Vec<MngtDone> = {
            let mut st = self.state.lock();
            if st.lock.exclusive_held {
                st.lock.exclusive_held = false;
            } else if st.lock.readers > 0 {
                st.lock.readers -= 1;
            } else {
                debug_assert!(false, "unlock without holder");
            }
            let mut grants = Vec::new();
            while let Some(front) = st.lock.waiters.front() {
                match front {
                    Waiter::Exclusive(_) => {
                        if st.lock.exclusive_held || st.lock.readers > 0 {
                            break;
                        }
                        st.lock.exclusive_held = true;
                        if let Some(Waiter::Exclusive(cb)) = st.lock.waiters.pop_front() {
                            grants.push(cb);
                        }
                        break;
                    }
                    Waiter::Shared(_) => {
                        if st.lock.exclusive_held {
                            break;
                        }
                        st.lock.readers += 1;
                        if let Some(Waiter::Shared(cb)) = st.lock.waiters.pop_front() {
                            grants.push(cb);
                        }
                    }
                }
            }
            grants
        };
        for cb in grants {
            self.complete(move || cb(Ok(())));
        }
    }

    /// Whether the exclusive lock is currently held, for tests.
    pub fn is_locked(&self) -> bool {
        let st = self.state.lock();
        st.lock.exclusive_held || st.lock.readers > 0
    }

    // ── device attach / load / detach ────────────────────────────────

    fn open_volume(&self, uuid: &str) -> Result<Arc<dyn Volume>> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| CadevError::Engine(EngineError::Stopping))?;
        engine.volume_open(uuid)
    }

    fn total_lines(volume: &Arc<dyn Volume>, line_size: CacheLineSize) -> u64 {
        volume.length() / line_size.bytes().max(1)
    }

    /// Attach a fresh cache device, overwriting whatever metadata the
    /// device held before.
    pub fn attach_device(&self, uuid: &str, cb: impl FnOnce(Result<()>) + 'static) {
        let result = self.attach_device_inner(uuid);
        self.complete(move || cb(result));
    }

    fn attach_device_inner(&self, uuid: &str) -> Result<()> {
        let volume = self.open_volume(uuid)?;
        let mut st = self.state.lock();
        if st.device.is_some() {
            volume.close();
            return Err(CadevError::Already);
        }
        let total_lines = Self::total_lines(&volume, st.line_size);
        st.device = Some(AttachedDevice {
            uuid: uuid.to_string(),
            block_size: volume.block_size(),
            volume,
            total_lines,
        });
        let meta = StoredMetadata {
            cache_name: self.name.clone(),
            mode: st.mode,
            line_size: st.line_size,
            cleaning: st.cleaning,
            promotion: st.promotion,
            cores: st
                .cores
                .iter()
                .map(|c| StoredCore {
                    name: c.name().to_string(),
                    uuid: c.uuid(),
                })
                .collect(),
            clean_shutdown: false,
        };
        drop(st);
        self.store.lock().insert(uuid.to_string(), meta);
        info!(cache = %self.name, device = uuid, "cache device attached");
        Ok(())
    }

    /// Load an existing cache from device metadata. Cores recorded there
    /// come back as inactive shells; the shim reattaches them itself.
    pub fn load_device(&self, uuid: &str, cb: impl FnOnce(Result<()>) + 'static) {
        let result = self.load_device_inner(uuid);
        self.complete(move || cb(result));
    }

    fn load_device_inner(&self, uuid: &str) -> Result<()> {
        let volume = self.open_volume(uuid)?;
        let meta = match self.store.lock().get(uuid) {
            Some(m) => m.clone(),
            None => {
                volume.close();
                return Err(EngineError::NoMetadata.into());
            }
        };
        let mut st = self.state.lock();
        if st.device.is_some() {
            drop(st);
            volume.close();
            return Err(CadevError::Already);
        }
        st.mode = meta.mode;
        st.line_size = meta.line_size;
        st.cleaning = meta.cleaning;
        st.promotion = meta.promotion;
        // Cores still live from before a detach keep their identity; only
        // unknown metadata entries come back as inactive shells.
        let live = std::mem::take(&mut st.cores);
        st.cores = meta
            .cores
            .iter()
            .map(|c| {
                live.iter()
                    .find(|e| e.name() == c.name)
                    .cloned()
                    .unwrap_or_else(|| {
                        Arc::new(Core {
                            name: c.name.clone(),
                            state: Mutex::new(CoreState {
                                uuid: c.uuid.clone(),
                                volume: None,
                                bound: false,
                                seqcutoff_policy: SeqCutoffPolicy::Full,
                                seqcutoff_threshold: u64::from(
                                    cadev_types::DEFAULT_SEQCUTOFF_THRESHOLD_KIB,
                                ) * KIB,
                                seqcutoff_promotion_count: 8,
                                dirty_lines: 0,
                                clean_lines: 0,
                                stats: CoreCounters::default(),
                            }),
                        })
                    })
            })
            .collect();
        let total_lines = Self::total_lines(&volume, st.line_size);
        st.device = Some(AttachedDevice {
            uuid: uuid.to_string(),
            block_size: volume.block_size(),
            volume,
            total_lines,
        });
        let cores = st.cores.len();
        drop(st);
        // Loaded but not yet cleanly shut down again.
        if let Some(m) = self.store.lock().get_mut(uuid) {
            m.clean_shutdown = false;
        }
        info!(cache = %self.name, device = uuid, cores, "cache metadata loaded");
        Ok(())
    }

    /// Detach the cache device. Cores stay in metadata; the cache keeps
    /// running device-less in pass-through.
    pub fn detach_device(&self, cb: impl FnOnce(Result<()>) + 'static) {
        let result = {
            let mut st = self.state.lock();
            match st.device.take() {
                Some(dev) => {
                    drop(st);
                    self.persist_metadata(&dev.uuid, false);
                    dev.volume.close();
                    info!(cache = %self.name, device = %dev.uuid, "cache device detached");
                    Ok(())
                }
                None => Err(CadevError::Already),
            }
        };
        self.complete(move || cb(result));
    }

    fn persist_metadata(&self, uuid: &str, clean_shutdown: bool) {
        let st = self.state.lock();
        let meta = StoredMetadata {
            cache_name: self.name.clone(),
            mode: st.mode,
            line_size: st.line_size,
            cleaning: st.cleaning,
            promotion: st.promotion,
            cores: st
                .cores
                .iter()
                .map(|c| StoredCore {
                    name: c.name().to_string(),
                    uuid: c.uuid(),
                })
                .collect(),
            clean_shutdown,
        };
        drop(st);
        self.store.lock().insert(uuid.to_string(), meta);
    }

    /// Persist current configuration to the attached device.
    pub fn save(&self, cb: impl FnOnce(Result<()>) + 'static) {
        let uuid = self.device_uuid();
        let result = match uuid {
            Some(uuid) => {
                self.persist_metadata(&uuid, false);
                Ok(())
            }
            None => Err(EngineError::CacheDetached.into()),
        };
        self.complete(move || cb(result));
    }

    /// Stop the cache: close core volumes, persist a clean shutdown if a
    /// device is attached, and remove the cache from the engine.
    pub fn stop(self: &Arc<Self>, cb: impl FnOnce(Result<()>) + 'static) {
        let (device, waiters) = {
            let mut st = self.state.lock();
            st.stopping = true;
            for core in &st.cores {
                let vol = core.state.lock().volume.take();
                if let Some(vol) = vol {
                    vol.close();
                }
            }
            let waiters: Vec<Waiter> = st.lock.waiters.drain(..).collect();
            (st.device.take(), waiters)
        };
        // A continuation queued behind the lock still belongs to someone
        // holding a reference; teardown answers for the grant it will never
        // make instead of dropping it.
        for waiter in waiters {
            let (Waiter::Exclusive(pending) | Waiter::Shared(pending)) = waiter;
            self.complete(move || pending(Err(EngineError::Stopping.into())));
        }
        if let Some(dev) = device {
            // Cores were just deactivated, but their metadata entries are
            // written from the core list, which is intact.
            self.persist_metadata(&dev.uuid, true);
            dev.volume.close();
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.remove_cache(&self.name);
        }
        info!(cache = %self.name, "cache stopped");
        self.complete(move || cb(Ok(())));
    }

    // ── cores ────────────────────────────────────────────────────────

    /// Add a core. With `try_add`, joins an inactive shell recorded in
    /// loaded metadata instead of creating a new entry.
    pub fn add_core(&self, cfg: &CoreConfig, cb: impl FnOnce(Result<Arc<Core>>) + 'static) {
        let result = self.add_core_inner(cfg);
        self.complete(move || cb(result));
    }

    fn add_core_inner(&self, cfg: &CoreConfig) -> Result<Arc<Core>> {
        {
            let st = self.state.lock();
            if st.stopping {
                return Err(EngineError::Stopping.into());
            }
            if st.device.is_none() {
                return Err(EngineError::CacheDetached.into());
            }
        }
        if cfg.try_add {
            let core = self
                .find_core(&cfg.name)
                .ok_or(CadevError::Engine(EngineError::CoreNotFound))?;
            let cst = core.state.lock();
            if cst.volume.is_some() {
                return Err(EngineError::CoreExists.into());
            }
            if cst.uuid != cfg.device_name {
                return Err(EngineError::MetadataMismatch.into());
            }
            drop(cst);
            let volume = self.open_volume(&cfg.device_name)?;
            core.state.lock().volume = Some(volume);
            debug!(cache = %self.name, core = %cfg.name, "core rejoined from metadata");
            return Ok(core);
        }
        if self.find_core(&cfg.name).is_some() {
            return Err(EngineError::CoreExists.into());
        }
        let volume = self.open_volume(&cfg.device_name)?;
        let core = Arc::new(Core {
            name: cfg.name.clone(),
            state: Mutex::new(CoreState {
                uuid: cfg.device_name.clone(),
                volume: Some(volume),
                bound: false,
                seqcutoff_policy: SeqCutoffPolicy::Full,
                seqcutoff_threshold: u64::from(cadev_types::DEFAULT_SEQCUTOFF_THRESHOLD_KIB)
                    * KIB,
                seqcutoff_promotion_count: 8,
                dirty_lines: 0,
                clean_lines: 0,
                stats: CoreCounters::default(),
            }),
        });
        self.state.lock().cores.push(Arc::clone(&core));
        if let Some(uuid) = self.device_uuid() {
            self.persist_metadata(&uuid, false);
        }
        debug!(cache = %self.name, core = %cfg.name, "core added");
        Ok(core)
    }

    /// Remove a core from the cache and its metadata entry.
    pub fn remove_core(&self, core: &Arc<Core>, cb: impl FnOnce(Result<()>) + 'static) {
        let vol = core.state.lock().volume.take();
        if let Some(vol) = vol {
            vol.close();
        }
        let name = core.name().to_string();
        self.state.lock().cores.retain(|c| c.name() != name);
        if let Some(uuid) = self.device_uuid() {
            self.persist_metadata(&uuid, false);
        }
        debug!(cache = %self.name, core = %name, "core removed");
        self.complete(move || cb(Ok(())));
    }

    /// Detach a core but keep it in metadata as an inactive shell, so it
    /// can rejoin after its device comes back.
    pub fn detach_core(&self, core: &Arc<Core>, cb: impl FnOnce(Result<()>) + 'static) {
        {
            let mut cst = core.state.lock();
            if let Some(vol) = cst.volume.take() {
                vol.close();
            }
            cst.bound = false;
        }
        if let Some(uuid) = self.device_uuid() {
            self.persist_metadata(&uuid, false);
        }
        debug!(cache = %self.name, core = %core.name(), "core detached, metadata kept");
        self.complete(move || cb(Ok(())));
    }

    // ── flush ────────────────────────────────────────────────────────

    /// Flush all dirty data to the cores.
    pub fn flush(&self, cb: impl FnOnce(Result<()>) + 'static) {
        let result = {
            let st = self.state.lock();
            if st.stopping {
                Err(EngineError::Stopping.into())
            } else if st.device.is_none() {
                Err(EngineError::CacheDetached.into())
            } else {
                for core in &st.cores {
                    let mut cst = core.state.lock();
                    cst.clean_lines += cst.dirty_lines;
                    cst.dirty_lines = 0;
                    cst.stats.flush_requests += 1;
                }
                Ok(())
            }
        };
        self.complete(move || cb(result));
    }

    /// Flush one core's dirty data.
    pub fn flush_core(&self, core: &Arc<Core>, cb: impl FnOnce(Result<()>) + 'static) {
        let result = {
            let st = self.state.lock();
            if st.device.is_none() {
                Err(EngineError::CacheDetached.into())
            } else {
                drop(st);
                let mut cst = core.state.lock();
                cst.clean_lines += cst.dirty_lines;
                cst.dirty_lines = 0;
                cst.stats.flush_requests += 1;
                Ok(())
            }
        };
        self.complete(move || cb(result));
    }

    pub fn dirty_lines(&self) -> u64 {
        self.state
            .lock()
            .cores
            .iter()
            .map(|c| c.state.lock().dirty_lines)
            .sum()
    }

    // ── parameter setters (called under the exclusive lock) ──────────

    pub fn set_mode(&self, mode: CacheMode) -> Result<()> {
        self.state.lock().mode = mode;
        info!(cache = %self.name, mode = %mode, "cache mode changed");
        Ok(())
    }

    pub fn set_cleaning_policy(&self, policy: CleaningPolicy) -> Result<()> {
        self.state.lock().cleaning = policy;
        Ok(())
    }

    pub fn set_cleaning_params(&self, params: &CleaningParams) -> Result<()> {
        let mut st = self.state.lock();
        let p = &mut st.cleaning_params;
        if let Some(v) = params.wake_up_ms {
            p.wake_up_ms = Some(v);
        }
        if let Some(v) = params.staleness_time_s {
            p.staleness_time_s = Some(v);
        }
        if let Some(v) = params.flush_max_buffers {
            p.flush_max_buffers = Some(v);
        }
        if let Some(v) = params.activity_threshold_ms {
            p.activity_threshold_ms = Some(v);
        }
        if let Some(v) = params.max_buffers {
            p.max_buffers = Some(v);
        }
        Ok(())
    }

    pub fn set_promotion_policy(&self, policy: PromotionPolicy) -> Result<()> {
        self.state.lock().promotion = policy;
        Ok(())
    }

    pub fn set_promotion_params(&self, params: &PromotionParams) -> Result<()> {
        let mut st = self.state.lock();
        let p = &mut st.promotion_params;
        if let Some(v) = params.insertion_threshold {
            p.insertion_threshold = Some(v);
        }
        if let Some(v) = params.trigger_threshold {
            p.trigger_threshold = Some(v);
        }
        Ok(())
    }

    // ── statistics ───────────────────────────────────────────────────

    pub fn core_stats(&self, core: &Arc<Core>) -> StatsSnapshot {
        let cst = core.state.lock();
        StatsSnapshot {
            usage: UsageCounters {
                occupancy: cst.clean_lines + cst.dirty_lines,
                free: 0,
                clean: cst.clean_lines,
                dirty: cst.dirty_lines,
            },
            counters: cst.stats,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        let st = self.state.lock();
        let total_lines = st.device.as_ref().map_or(0, |d| d.total_lines);
        let cores = st.cores.clone();
        drop(st);
        let mut snap = StatsSnapshot::default();
        for core in &cores {
            snap.absorb(&self.core_stats(core));
        }
        snap.usage.free = total_lines.saturating_sub(snap.usage.occupancy);
        snap
    }

    pub fn reset_core_stats(&self, core: &Arc<Core>) {
        let mut cst = core.state.lock();
        cst.stats = CoreCounters::default();
    }

    pub fn reset_stats(&self) {
        for core in self.cores() {
            self.reset_core_stats(&core);
        }
    }

    // ── I/O front end ────────────────────────────────────────────────

    /// Submit an I/O against a core. Data always moves against the core
    /// volume; accounting depends on the effective mode (pass-through when
    /// the mode is `pt` or the cache device is gone). The completion is
    /// pushed onto `io_queue`, to be drained by the submitter's poller.
    pub fn submit_io(
        &self,
        core: &Arc<Core>,
        io_queue: &Arc<Queue>,
        io: IoRequest,
        complete: IoCompletion,
    ) {
        let Some(volume) = core.volume() else {
            let q = Arc::clone(io_queue);
            q.push(move || complete(IoStatus::Failed, None));
            return;
        };
        let (mode, line_size, attached) = {
            let st = self.state.lock();
            (st.mode, st.line_size, st.device.is_some())
        };
        let pass_through = !attached || mode == CacheMode::Pt;
        let blocks = match io.ty {
            IoType::Write => io
                .payload
                .as_ref()
                .map_or(0, |p| (p.len() as u64).div_ceil(u64::from(volume.block_size()))),
            _ => io.num_blocks,
        };
        let lines = (blocks * u64::from(volume.block_size())).div_ceil(line_size.bytes().max(1));
        let ty = io.ty;
        let core = Arc::clone(core);
        let io_queue = Arc::clone(io_queue);
        volume.submit(
            io,
            Box::new(move |status, data| {
                {
                    let mut cst = core.state.lock();
                    let target = if pass_through {
                        &mut cst.stats.pass_through
                    } else {
                        &mut cst.stats.cached
                    };
                    match ty {
                        IoType::Read => {
                            target.read_requests += 1;
                            if status == IoStatus::Success {
                                target.read_blocks += blocks;
                            } else {
                                target.read_errors += 1;
                            }
                        }
                        IoType::Write => {
                            target.write_requests += 1;
                            if status == IoStatus::Success {
                                target.write_blocks += blocks;
                            } else {
                                target.write_errors += 1;
                            }
                        }
                        IoType::Flush => cst.stats.flush_requests += 1,
                        IoType::Discard => cst.stats.discard_requests += 1,
                    }
                    if status == IoStatus::Success {
                        cst.stats.core_volume.read_blocks +=
                            if ty == IoType::Read { blocks } else { 0 };
                        cst.stats.core_volume.write_blocks +=
                            if ty == IoType::Write { blocks } else { 0 };
                        if !pass_through {
                            match ty {
                                IoType::Read => cst.stats.cache_volume.read_blocks += blocks,
                                IoType::Write => cst.stats.cache_volume.write_blocks += blocks,
                                _ => {}
                            }
                            match ty {
                                IoType::Write if mode.is_dirty_capable() => {
                                    cst.dirty_lines += lines;
                                }
                                IoType::Read | IoType::Write => {
                                    cst.clean_lines += lines;
                                }
                                _ => {}
                            }
                        }
                    }
                }
                io_queue.push(move || complete(status, data));
            }),
        );
    }
}

// ── Engine ────────────────────────────────────────────────────────────────

struct EngineShared {
    reactor: Reactor,
    caches: Mutex<Vec<Arc<Cache>>>,
    store: Arc<Mutex<HashMap<String, StoredMetadata>>>,
    factory: Mutex<Option<Arc<dyn VolumeFactory>>>,
}

impl EngineShared {
    fn volume_open(&self, uuid: &str) -> Result<Arc<dyn Volume>> {
        let factory = self
            .factory
            .lock()
            .clone()
            .ok_or_else(|| CadevError::Invalid("no volume type registered".to_string()))?;
        factory.open(uuid)
    }

    fn remove_cache(&self, name: &str) {
        self.caches.lock().retain(|c| c.name() != name);
    }
}

/// Engine context. Clones share state; one per module instance.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    pub fn new(reactor: Reactor) -> Self {
        Engine {
            shared: Arc::new(EngineShared {
                reactor,
                caches: Mutex::new(Vec::new()),
                store: Arc::new(Mutex::new(HashMap::new())),
                factory: Mutex::new(None),
            }),
        }
    }

    /// Register the volume type the shim implements. One type per engine.
    pub fn register_volume_factory(&self, factory: Arc<dyn VolumeFactory>) {
        *self.shared.factory.lock() = Some(factory);
    }

    pub fn unregister_volume_factory(&self) {
        *self.shared.factory.lock() = None;
    }

    /// Allocate and register a new cache. Started with the exclusive lock
    /// held when `cfg.locked` is set; the starter releases it when the
    /// whole start flow is done.
    pub fn start_cache(&self, cfg: &CacheConfig) -> Result<Arc<Cache>> {
        let mut caches = self.shared.caches.lock();
        if caches.iter().any(|c| c.name() == cfg.name) {
            return Err(CadevError::Exists(cfg.name.clone()));
        }
        let cache = Arc::new(Cache {
            name: cfg.name.clone(),
            reactor: self.shared.reactor.clone(),
            store: Arc::clone(&self.shared.store),
            engine: Arc::downgrade(&self.shared),
            state: Mutex::new(CacheState {
                mode: cfg.mode,
                line_size: cfg.line_size,
                cleaning: CleaningPolicy::Alru,
                cleaning_params: CleaningParams::default(),
                promotion: PromotionPolicy::Always,
                promotion_params: PromotionParams::default(),
                device: None,
                cores: Vec::new(),
                lock: LockState {
                    exclusive_held: cfg.locked,
                    ..LockState::default()
                },
                refcount: 0,
                stopping: false,
                mngt_queue: None,
            }),
        });
        caches.push(Arc::clone(&cache));
        info!(cache = %cfg.name, mode = %cfg.mode, "cache started");
        Ok(cache)
    }

    /// Open a volume through the registered volume type. Used by consumers
    /// that need a volume handle outside a cache (attach-config volumes).
    pub fn volume_open(&self, uuid: &str) -> Result<Arc<dyn Volume>> {
        self.shared.volume_open(uuid)
    }

    /// Probe a device for cache metadata.
    pub fn probe(&self, uuid: &str, cb: impl FnOnce(Result<ProbeInfo>) + 'static) {
        let result = match self.shared.store.lock().get(uuid) {
            Some(meta) => Ok(ProbeInfo {
                cache_name: meta.cache_name.clone(),
                clean_shutdown: meta.clean_shutdown,
                core_count: meta.cores.len(),
            }),
            None => Err(EngineError::NoMetadata.into()),
        };
        if result.is_err() {
            warn!(device = uuid, "metadata probe found nothing");
        }
        self.shared.reactor.send(move || cb(result));
    }

    pub fn find_cache(&self, name: &str) -> Option<Arc<Cache>> {
        self.shared
            .caches
            .lock()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub fn caches(&self) -> Vec<Arc<Cache>> {
        self.shared.caches.lock().clone()
    }

    pub fn cache_count(&self) -> usize {
        self.shared.caches.lock().len()
    }

    /// Whether a device currently holds cache metadata, for tests.
    pub fn has_metadata(&self, uuid: &str) -> bool {
        self.shared.store.lock().contains_key(uuid)
    }
}
