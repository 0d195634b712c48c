//! Cache entities.
//!
//! A [`CacheCtx`] is the shim's record of one cache instance: its engine
//! cache handle, the base-device binding for the cache device, the attach
//! configuration it was asked to run with (kept even while the device is
//! absent, so examine can complete a deferred attach later), and the
//! management queue whose poller drains engine completions.

use crate::base::Binding;
use cadev_bdev::{PollerId, Reactor, ThreadId};
use cadev_engine::{Cache, Queue};
use cadev_types::{AttachConfig, CacheConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Where the cache device stands. Transitions are serialized by the engine
/// cache's exclusive lock; a flow that loses the race observes the state
/// another flow left behind and fails with `Already` instead of running
/// the same unwind twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Detached,
    Attaching,
    Attached,
    Detaching,
}

struct MngtQueueCtx {
    queue: Arc<Queue>,
    poller: PollerId,
    thread: ThreadId,
}

pub struct CacheCtx {
    name: String,
    cfg: Mutex<CacheConfig>,
    attach_cfg: Mutex<Option<AttachConfig>>,
    base: Arc<Binding>,
    engine_cache: Mutex<Option<Arc<Cache>>>,
    device_state: Mutex<DeviceState>,
    mngt: Mutex<Option<MngtQueueCtx>>,
    stopping: Mutex<bool>,
}

impl CacheCtx {
    pub fn new(cfg: CacheConfig) -> Arc<Self> {
        let name = cfg.name.clone();
        Arc::new(CacheCtx {
            name,
            cfg: Mutex::new(cfg),
            attach_cfg: Mutex::new(None),
            base: Binding::new("", true),
            engine_cache: Mutex::new(None),
            device_state: Mutex::new(DeviceState::Detached),
            mngt: Mutex::new(None),
            stopping: Mutex::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cfg(&self) -> CacheConfig {
        self.cfg.lock().clone()
    }

    pub fn base(&self) -> &Arc<Binding> {
        &self.base
    }

    pub fn attach_cfg(&self) -> Option<AttachConfig> {
        self.attach_cfg.lock().clone()
    }

    pub fn set_attach_cfg(&self, cfg: Option<AttachConfig>) {
        if let Some(cfg) = &cfg {
            self.base.set_device_name(&cfg.device_name);
        }
        *self.attach_cfg.lock() = cfg;
    }

    pub fn engine_cache(&self) -> Option<Arc<Cache>> {
        self.engine_cache.lock().clone()
    }

    pub fn set_engine_cache(&self, cache: Option<Arc<Cache>>) {
        *self.engine_cache.lock() = cache;
    }

    pub fn device_state(&self) -> DeviceState {
        *self.device_state.lock()
    }

    pub fn set_device_state(&self, state: DeviceState) {
        debug!(cache = %self.name, ?state, "cache device state");
        *self.device_state.lock() = state;
    }

    /// Transition only if the current state matches. Returns whether the
    /// transition happened; the loser of a detach race sees `false`.
    pub fn transition(&self, from: DeviceState, to: DeviceState) -> bool {
        let mut st = self.device_state.lock();
        if *st == from {
            *st = to;
            debug!(cache = %self.name, ?from, ?to, "cache device state");
            true
        } else {
            false
        }
    }

    /// Claim the right to run the stop chain. The second caller gets
    /// `false` and must report `Already` instead of stopping twice.
    pub fn begin_stop(&self) -> bool {
        let mut s = self.stopping.lock();
        if *s {
            false
        } else {
            *s = true;
            true
        }
    }

    pub fn is_stopping(&self) -> bool {
        *self.stopping.lock()
    }

    // ── management queue ─────────────────────────────────────────────

    /// Create the management queue for the engine cache and start its
    /// poller on the calling thread. Engine completions for this cache are
    /// delivered only when that poller runs.
    pub fn mngt_queue_create(&self, reactor: &Reactor) {
        let engine_cache = match self.engine_cache() {
            Some(c) => c,
            None => return,
        };
        let queue = Queue::new(&format!("{}-mngt", self.name));
        engine_cache.set_mngt_queue(Arc::clone(&queue));
        let thread = reactor.current_thread();
        let poll_queue = Arc::clone(&queue);
        let poller = reactor.register_poller(thread, &format!("{}-mngt", self.name), move || {
            poll_queue.poll()
        });
        *self.mngt.lock() = Some(MngtQueueCtx {
            queue,
            poller,
            thread,
        });
    }

    /// Tear the management queue down. The poller is unregistered from the
    /// thread that created it; any completion still queued runs during
    /// `Queue::stop` so nothing is lost.
    pub fn mngt_queue_destroy(&self, reactor: &Reactor) {
        let Some(ctx) = self.mngt.lock().take() else {
            return;
        };
        if let Some(cache) = self.engine_cache() {
            cache.take_mngt_queue();
        }
        let r = reactor.clone();
        reactor.send_msg(ctx.thread, move || {
            r.unregister_poller(ctx.poller);
            ctx.queue.stop();
        });
    }

    pub fn has_mngt_queue(&self) -> bool {
        self.mngt.lock().is_some()
    }
}
