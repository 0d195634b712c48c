//! Module instance: the registry of cache entities, exposed devices and
//! the deferred-work waitlist, plus init/shutdown and examine dispatch.
//!
//! The waitlist is owned by the module instance, not a process global, so
//! independent instances can coexist in tests.

use crate::base::Binding;
use crate::cache::CacheCtx;
use crate::core::Vbdev;
use crate::volume::AdapterFactory;
use cadev_bdev::{BdevModule, Reactor, Registry};
use cadev_engine::Engine;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Product name carried by every exposed device. Also how the stacking
/// check recognizes one of our own devices.
pub const PRODUCT_NAME: &str = "cadev cache device";

struct ModuleState {
    running: bool,
    caches: Vec<Arc<CacheCtx>>,
    vbdevs: Vec<Arc<Vbdev>>,
    waitlist: Vec<Arc<Vbdev>>,
}

pub(crate) struct ModuleInner {
    pub(crate) reactor: Reactor,
    pub(crate) registry: Registry,
    pub(crate) engine: Engine,
    state: Mutex<ModuleState>,
}

/// Handle to one module instance. Clones share state.
#[derive(Clone)]
pub struct Module {
    pub(crate) inner: Arc<ModuleInner>,
}

struct ExamineHook {
    module: Module,
}

impl BdevModule for ExamineHook {
    fn name(&self) -> &str {
        "cadev"
    }

    fn examine_config(&self, bdev_name: &str) {
        self.module.examine_config(bdev_name);
    }

    fn examine_disk(&self, bdev_name: &str) {
        self.module.examine_disk(bdev_name);
    }
}

impl Module {
    /// Initialize the module: create the engine context, register the
    /// volume adapter type, and hook examine dispatch.
    pub fn new(registry: &Registry) -> Module {
        let reactor = registry.reactor().clone();
        let engine = Engine::new(reactor.clone());
        let module = Module {
            inner: Arc::new(ModuleInner {
                reactor,
                registry: registry.clone(),
                engine: engine.clone(),
                state: Mutex::new(ModuleState {
                    running: true,
                    caches: Vec::new(),
                    vbdevs: Vec::new(),
                    waitlist: Vec::new(),
                }),
            }),
        };
        engine.register_volume_factory(AdapterFactory::new(module.clone()));
        registry.register_module(Arc::new(ExamineHook {
            module: module.clone(),
        }));
        info!("cadev module initialized");
        module
    }

    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.inner.state.lock().running = running;
    }

    // ── entity lists ─────────────────────────────────────────────────

    pub fn find_cache_ctx(&self, name: &str) -> Option<Arc<CacheCtx>> {
        self.inner
            .state
            .lock()
            .caches
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub fn find_vbdev(&self, name: &str) -> Option<Arc<Vbdev>> {
        self.inner
            .state
            .lock()
            .vbdevs
            .iter()
            .find(|v| v.name() == name)
            .cloned()
    }

    pub fn find_waitlisted(&self, name: &str) -> Option<Arc<Vbdev>> {
        self.inner
            .state
            .lock()
            .waitlist
            .iter()
            .find(|v| v.name() == name)
            .cloned()
    }

    pub fn cache_ctxs(&self) -> Vec<Arc<CacheCtx>> {
        self.inner.state.lock().caches.clone()
    }

    pub fn vbdevs(&self) -> Vec<Arc<Vbdev>> {
        self.inner.state.lock().vbdevs.clone()
    }

    pub fn waitlist(&self) -> Vec<Arc<Vbdev>> {
        self.inner.state.lock().waitlist.clone()
    }

    pub(crate) fn push_cache_ctx(&self, ctx: Arc<CacheCtx>) {
        self.inner.state.lock().caches.push(ctx);
    }

    pub(crate) fn remove_cache_ctx(&self, name: &str) {
        self.inner.state.lock().caches.retain(|c| c.name() != name);
    }

    pub(crate) fn push_vbdev(&self, vbdev: Arc<Vbdev>) {
        self.inner.state.lock().vbdevs.push(vbdev);
    }

    pub(crate) fn remove_vbdev(&self, name: &str) {
        self.inner.state.lock().vbdevs.retain(|v| v.name() != name);
    }

    pub(crate) fn push_waitlist(&self, vbdev: Arc<Vbdev>) {
        self.inner.state.lock().waitlist.push(vbdev);
    }

    pub(crate) fn remove_waitlisted(&self, name: &str) {
        self.inner.state.lock().waitlist.retain(|v| v.name() != name);
    }

    /// All names an incoming entity name must not collide with: waitlisted
    /// cores, cache entities, exposed devices, and host block devices.
    pub fn name_in_use(&self, name: &str) -> bool {
        {
            let st = self.inner.state.lock();
            if st.waitlist.iter().any(|v| v.name() == name)
                || st.caches.iter().any(|c| c.name() == name)
                || st.vbdevs.iter().any(|v| v.name() == name)
            {
                return true;
            }
        }
        self.inner.registry.lookup(name).is_some()
    }

    /// Resolve a volume uuid (host device name) to the binding holding it.
    pub(crate) fn find_binding(&self, uuid: &str) -> Option<Arc<Binding>> {
        let st = self.inner.state.lock();
        for ctx in &st.caches {
            if ctx.base().device_name() == uuid {
                return Some(Arc::clone(ctx.base()));
            }
        }
        for v in st.vbdevs.iter().chain(st.waitlist.iter()) {
            if v.base().device_name() == uuid {
                return Some(Arc::clone(v.base()));
            }
        }
        None
    }

    /// Whether a registered device is one of our own exposed devices.
    pub(crate) fn is_own_bdev(&self, name: &str) -> bool {
        self.inner
            .registry
            .lookup(name)
            .is_some_and(|p| p.product_name == PRODUCT_NAME)
    }

    // ── shutdown ─────────────────────────────────────────────────────

    /// Begin module shutdown. Waitlisted bases are released immediately;
    /// every cache is stopped after its cores unregister; `cb` fires once
    /// the last cache-stop completes. Management is rejected with `EPERM`
    /// from the moment this is called.
    pub fn fini_start(&self, cb: impl FnOnce() + 'static) {
        self.set_running(false);
        info!("cadev module shutdown started");
        for v in self.waitlist() {
            v.base().detach();
        }
        let caches = self.cache_ctxs();
        if caches.is_empty() {
            self.inner.reactor.send(cb);
            return;
        }
        let remaining = Arc::new(Mutex::new((
            caches.len(),
            Some(Box::new(cb) as Box<dyn FnOnce()>),
        )));
        for ctx in caches {
            let remaining = Arc::clone(&remaining);
            let reactor = self.inner.reactor.clone();
            self.cache_stop_chain(ctx, move |result| {
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "cache stop during shutdown reported an error");
                }
                let cb = {
                    let mut r = remaining.lock();
                    r.0 -= 1;
                    if r.0 == 0 {
                        r.1.take()
                    } else {
                        None
                    }
                };
                if let Some(cb) = cb {
                    reactor.send(cb);
                }
            });
        }
    }

    /// Final synchronous cleanup after `fini_start` completed.
    pub fn fini(&self) {
        let mut st = self.inner.state.lock();
        st.waitlist.clear();
        st.vbdevs.clear();
        st.caches.clear();
        drop(st);
        self.inner.engine.unregister_volume_factory();
        info!("cadev module finished");
    }

    /// Pending deferred entities, for dumps and tests.
    pub fn waitlist_len(&self) -> usize {
        self.inner.state.lock().waitlist.len()
    }

    // ── examine ──────────────────────────────────────────────────────

    fn examine_config(&self, bdev_name: &str) {
        if !self.is_running() {
            self.inner.registry.examine_done();
            return;
        }
        // Claim the base early for waitlisted cores so nobody else takes
        // the device while the disk phase runs.
        for v in self.waitlist() {
            if v.cfg().device_name == bdev_name && !v.base().is_attached() {
                let module = self.clone();
                let hr = Arc::clone(&v);
                if let Err(e) = v.base().attach(&self.inner.registry, move || {
                    module.core_hot_remove(hr);
                }) {
                    tracing::debug!(bdev = bdev_name, error = %e, "examine claim failed");
                }
            }
        }
        self.inner.registry.examine_done();
    }

    fn examine_disk(&self, bdev_name: &str) {
        if !self.is_running() {
            self.inner.registry.examine_done();
            return;
        }
        // Waitlisted cores for this base device.
        let pending: Vec<Arc<Vbdev>> = self
            .waitlist()
            .into_iter()
            .filter(|v| v.cfg().device_name == bdev_name)
            .collect();
        if !pending.is_empty() {
            self.finish_examine_after(pending.len(), |module, v, done| {
                module.add_core_chain(v, move |_| done());
            }, pending);
            return;
        }
        // A started cache waiting for this device to attach.
        let waiting_cache = self.cache_ctxs().into_iter().find(|c| {
            c.attach_cfg().is_some_and(|a| a.device_name == bdev_name)
                && c.device_state() == crate::cache::DeviceState::Detached
        });
        if let Some(ctx) = waiting_cache {
            let registry = self.inner.registry.clone();
            self.cache_attach_chain(ctx, move |result| {
                if let Err(e) = &result {
                    tracing::debug!(error = %e, "examine attach deferred or failed");
                }
                registry.examine_done();
            });
            return;
        }
        // A core recorded in an attached cache's metadata whose device
        // came back after a hot removal.
        let mut revived = Vec::new();
        for ctx in self.cache_ctxs() {
            if ctx.device_state() != crate::cache::DeviceState::Attached {
                continue;
            }
            let Some(engine_cache) = ctx.engine_cache() else {
                continue;
            };
            for core in engine_cache.cores() {
                if core.uuid() == bdev_name && !core.is_active() && !core.is_bound() {
                    let v = Vbdev::new(core.name(), ctx.name(), bdev_name);
                    self.push_waitlist(Arc::clone(&v));
                    revived.push(v);
                }
            }
        }
        if !revived.is_empty() {
            self.finish_examine_after(revived.len(), |module, v, done| {
                module.add_core_chain(v, move |_| done());
            }, revived);
            return;
        }
        self.inner.registry.examine_done();
    }

    fn finish_examine_after(
        &self,
        count: usize,
        spawn: impl Fn(&Module, Arc<Vbdev>, Box<dyn FnOnce()>),
        items: Vec<Arc<Vbdev>>,
    ) {
        let registry = self.inner.registry.clone();
        let remaining = Arc::new(Mutex::new(count));
        for v in items {
            let registry = registry.clone();
            let remaining = Arc::clone(&remaining);
            let done: Box<dyn FnOnce()> = Box::new(move || {
                let mut r = remaining.lock();
                *r -= 1;
                if *r == 0 {
                    registry.examine_done();
                }
            });
            spawn(self, v, done);
        }
    }
}
