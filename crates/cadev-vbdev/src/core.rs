//! Core entities: the exposed devices.
//!
//! A [`Vbdev`] is one exposed block device, pairing a core base device with
//! a cache. Before its cache and base device are both available it lives on
//! the module's waitlist; once added to the cache it registers an exposed
//! device whose geometry mirrors the core base.

use crate::base::Binding;
use crate::cache::CacheCtx;
use cadev_engine::Core;
use cadev_types::{CoreConfig, FlushStatus};
use parking_lot::Mutex;
use std::sync::Arc;

struct VbdevState {
    cache: Option<Arc<CacheCtx>>,
    core: Option<Arc<Core>>,
    registered: bool,
    /// Set while an unregister (explicit remove, hot-remove, shutdown) is
    /// in flight, so a second teardown path backs off.
    finishing: bool,
    flush: FlushStatus,
}

pub struct Vbdev {
    name: String,
    cache_name: String,
    cfg: Mutex<CoreConfig>,
    base: Arc<Binding>,
    state: Mutex<VbdevState>,
}

impl Vbdev {
    pub fn new(name: &str, cache_name: &str, device_name: &str) -> Arc<Self> {
        Arc::new(Vbdev {
            name: name.to_string(),
            cache_name: cache_name.to_string(),
            cfg: Mutex::new(CoreConfig::new(name, device_name)),
            base: Binding::new(device_name, false),
            state: Mutex::new(VbdevState {
                cache: None,
                core: None,
                registered: false,
                finishing: false,
                flush: FlushStatus::default(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn cfg(&self) -> CoreConfig {
        self.cfg.lock().clone()
    }

    pub fn set_try_add(&self, try_add: bool) {
        self.cfg.lock().try_add = try_add;
    }

    pub fn base(&self) -> &Arc<Binding> {
        &self.base
    }

    pub fn cache(&self) -> Option<Arc<CacheCtx>> {
        self.state.lock().cache.clone()
    }

    pub fn core(&self) -> Option<Arc<Core>> {
        self.state.lock().core.clone()
    }

    pub fn attach_to_cache(&self, cache: Arc<CacheCtx>, core: Arc<Core>) {
        let mut st = self.state.lock();
        st.cache = Some(cache);
        st.core = Some(core);
    }

    pub fn detach_from_cache(&self) {
        let mut st = self.state.lock();
        st.cache = None;
        st.core = None;
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    pub fn set_registered(&self, registered: bool) {
        self.state.lock().registered = registered;
    }

    /// Mark teardown in flight. Returns `false` if another path got there
    /// first; the caller must back off instead of double-running teardown.
    pub fn begin_finish(&self) -> bool {
        let mut st = self.state.lock();
        if st.finishing {
            false
        } else {
            st.finishing = true;
            true
        }
    }

    pub fn is_finishing(&self) -> bool {
        self.state.lock().finishing
    }

    pub fn flush_status(&self) -> FlushStatus {
        self.state.lock().flush
    }

    pub fn set_flush_in_progress(&self, in_progress: bool) {
        self.state.lock().flush.in_progress = in_progress;
    }

    pub fn set_flush_result(&self, status: i32) {
        let mut st = self.state.lock();
        st.flush.in_progress = false;
        st.flush.last_status = Some(status);
    }
}
