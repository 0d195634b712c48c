//! Lifecycle coordination.
//!
//! Every management operation is a chain of continuations driven by the
//! reactor: acquire the cache's management lock, do the engine work, undo
//! in reverse order on failure, and report exactly one completion per
//! request. Nothing here blocks; a flow that cannot make progress parks
//! its entity (the waitlist for cores, a device-less cache entity for
//! caches) and reports the deferred status.

use crate::cache::{CacheCtx, DeviceState};
use crate::core::Vbdev;
use crate::module::Module;
use crate::volume::ConfigVolume;
use cadev_bdev::DestructDone;
use cadev_error::{status_of, CadevError, EngineError, Result};
use cadev_types::{
    AttachConfig, CacheConfig, CacheLineSize, CacheMode, CleaningParams, CleaningPolicy,
    FlushStatus, PromotionParams, PromotionPolicy, SeqCutoffParams, SeqCutoffPolicy,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

type Done = Box<dyn FnOnce(Result<()>)>;

/// Parameters of a cache start request.
#[derive(Debug, Clone)]
pub struct CacheStartRequest {
    pub name: String,
    /// Cache mode name; defaults to write-through.
    pub mode: Option<String>,
    /// Cache line size in KiB or bytes; 0 selects the default.
    pub line_size: u64,
    /// Cache device to attach. `None` starts the cache device-less.
    pub device: Option<String>,
    /// Never load existing metadata, attach fresh.
    pub force_no_load: bool,
}

/// Parameters of a core add request.
#[derive(Debug, Clone)]
pub struct CoreAddRequest {
    pub name: String,
    pub cache_name: String,
    pub device: String,
}

/// A management target: a cache entity or one exposed device.
enum Target {
    Cache(Arc<CacheCtx>),
    Core(Arc<Vbdev>),
}

fn countdown(remaining: &Arc<Mutex<(usize, Option<Done>)>>) -> Option<Done> {
    let mut r = remaining.lock();
    r.0 -= 1;
    if r.0 == 0 {
        r.1.take()
    } else {
        None
    }
}

/// The save that follows a parameter change must not fail just because the
/// cache device is away; the new value still applies to the running cache.
fn ignore_detached(r: Result<()>) -> Result<()> {
    match r {
        Err(CadevError::Engine(EngineError::CacheDetached)) => Ok(()),
        other => other,
    }
}

impl Module {
    /// Schedule the one completion of a management request.
    fn finish(&self, cb: Done, result: Result<()>) {
        match &result {
            Ok(()) => {}
            Err(e) if e.is_deferred() => debug!(error = %e, "operation deferred"),
            Err(e) => debug!(error = %e, "operation failed"),
        }
        self.reactor().send(move || cb(result));
    }

    fn resolve(&self, name: &str) -> Option<Target> {
        if let Some(ctx) = self.find_cache_ctx(name) {
            return Some(Target::Cache(ctx));
        }
        self.find_vbdev(name).map(Target::Core)
    }

    // ── cache start ──────────────────────────────────────────────────

    /// Start a cache entity and, when a device is named, attach it. A
    /// named device that is not present parks the cache device-less and
    /// reports the deferred status; examine completes the attach later.
    pub fn cache_start(&self, req: CacheStartRequest, cb: impl FnOnce(Result<()>) + 'static) {
        let cb: Done = Box::new(cb);
        if !self.is_running() {
            return self.finish(cb, Err(CadevError::ShuttingDown));
        }
        if self.name_in_use(&req.name) {
            return self.finish(cb, Err(CadevError::Exists(req.name)));
        }
        let mode = match req.mode.as_deref() {
            None => CacheMode::Wt,
            Some(m) => match CacheMode::from_name(m) {
                Some(m) => m,
                None => {
                    return self.finish(cb, Err(CadevError::Invalid(format!("cache mode {m:?}"))))
                }
            },
        };
        let Some(line_size) = CacheLineSize::from_param(req.line_size) else {
            return self.finish(
                cb,
                Err(CadevError::Invalid(format!("line size {}", req.line_size))),
            );
        };
        let cfg = CacheConfig::new(&req.name, mode, line_size);
        let engine_cache = match self.engine().start_cache(&cfg) {
            Ok(c) => c,
            Err(e) => return self.finish(cb, Err(e)),
        };
        let ctx = CacheCtx::new(cfg);
        ctx.set_engine_cache(Some(Arc::clone(&engine_cache)));
        self.push_cache_ctx(Arc::clone(&ctx));
        ctx.mngt_queue_create(self.reactor());
        info!(cache = %req.name, mode = %mode, "cache entity started");
        match req.device {
            None => {
                engine_cache.unlock();
                self.finish(cb, Ok(()));
            }
            Some(device) => {
                ctx.set_attach_cfg(Some(AttachConfig::new(&device, req.force_no_load)));
                ctx.set_device_state(DeviceState::Attaching);
                self.attach_chain_locked(ctx, true, cb);
            }
        }
    }

    // ── cache attach / detach ────────────────────────────────────────

    /// Attach a cache device to a started, device-less cache.
    pub fn cache_attach(
        &self,
        name: &str,
        device: &str,
        force_no_load: bool,
        cb: impl FnOnce(Result<()>) + 'static,
    ) {
        let cb: Done = Box::new(cb);
        if !self.is_running() {
            return self.finish(cb, Err(CadevError::ShuttingDown));
        }
        let Some(ctx) = self.find_cache_ctx(name) else {
            return self.finish(cb, Err(CadevError::NotFound(name.to_string())));
        };
        if ctx.device_state() != DeviceState::Detached {
            return self.finish(cb, Err(CadevError::Already));
        }
        ctx.set_attach_cfg(Some(AttachConfig::new(device, force_no_load)));
        self.cache_attach_chain(ctx, cb);
    }

    /// Shared attach entry: takes a cache reference and the exclusive
    /// lock, then runs the attach chain. Also used by examine when a
    /// parked cache's device appears.
    pub(crate) fn cache_attach_chain(
        &self,
        ctx: Arc<CacheCtx>,
        cb: impl FnOnce(Result<()>) + 'static,
    ) {
        let cb: Done = Box::new(cb);
        let Some(engine_cache) = ctx.engine_cache() else {
            return self.finish(cb, Err(CadevError::NotFound(ctx.name().to_string())));
        };
        if let Err(e) = engine_cache.get() {
            return self.finish(cb, Err(e));
        }
        if !ctx.transition(DeviceState::Detached, DeviceState::Attaching) {
            engine_cache.put();
            return self.finish(cb, Err(CadevError::Already));
        }
        let module = self.clone();
        let ec = Arc::clone(&engine_cache);
        engine_cache.lock(move |r| {
            if let Err(e) = r {
                ctx.set_device_state(DeviceState::Detached);
                ec.put();
                return module.finish(cb, Err(e));
            }
            let ec2 = Arc::clone(&ec);
            let wrapped: Done = Box::new(move |r| {
                ec2.put();
                cb(r);
            });
            module.attach_chain_locked(ctx, false, wrapped);
        });
    }

    /// The attach chain proper. Runs with the exclusive lock held and the
    /// device state at `Attaching`: bind the base, create the
    /// configuration volume, probe for metadata, then load or attach. The
    /// first callback observing the outcome destroys the configuration
    /// volume, on success and on failure alike.
    fn attach_chain_locked(&self, ctx: Arc<CacheCtx>, from_start: bool, cb: Done) {
        let Some(engine_cache) = ctx.engine_cache() else {
            return self.finish(cb, Err(CadevError::NotFound(ctx.name().to_string())));
        };
        let Some(attach_cfg) = ctx.attach_cfg() else {
            engine_cache.unlock();
            return self.finish(cb, Err(CadevError::Invalid("no attach configuration".into())));
        };
        if !ctx.base().is_attached() {
            let module = self.clone();
            let hr = Arc::clone(&ctx);
            match ctx.base().attach(self.registry(), move || module.cache_hot_remove(hr)) {
                Ok(()) => {}
                Err(e) if e.is_deferred() => {
                    // Park the entity device-less; examine finishes this
                    // attach when the device shows up.
                    ctx.set_device_state(DeviceState::Detached);
                    engine_cache.unlock();
                    return self.finish(cb, Err(e));
                }
                Err(e) => return self.attach_unwind(ctx, from_start, e, cb),
            }
        }
        let cfgvol = match ConfigVolume::create(self, &attach_cfg.device_name) {
            Ok(v) => v,
            Err(e) => {
                ctx.base().detach();
                return self.attach_unwind(ctx, from_start, e, cb);
            }
        };
        let module = self.clone();
        let device = attach_cfg.device_name.clone();
        let no_load = attach_cfg.force_no_load;
        self.engine().probe(&attach_cfg.device_name, move |probe| {
            let load = probe.is_ok() && !no_load;
            if load {
                info!(cache = %ctx.name(), device = %device, "existing metadata found, loading");
            }
            let ec = Arc::clone(&engine_cache);
            let finish = move |r: Result<()>| {
                cfgvol.destroy();
                match r {
                    Ok(()) => {
                        ctx.set_device_state(DeviceState::Attached);
                        ec.unlock();
                        info!(cache = %ctx.name(), "cache device ready");
                        module.finish(cb, Ok(()));
                        module.add_from_waitlist(&ctx);
                    }
                    Err(e) => {
                        ctx.base().detach();
                        module.attach_unwind(ctx, from_start, e, cb);
                    }
                }
            };
            if load {
                engine_cache.load_device(&device, finish);
            } else {
                engine_cache.attach_device(&device, finish);
            }
        });
    }

    /// Reverse-order unwind of a failed attach. During a start the whole
    /// cache entity is torn down; a plain attach leaves the started cache
    /// device-less.
    fn attach_unwind(&self, ctx: Arc<CacheCtx>, from_start: bool, err: CadevError, cb: Done) {
        warn!(cache = %ctx.name(), error = %err, "attach failed, unwinding");
        ctx.set_device_state(DeviceState::Detached);
        let Some(engine_cache) = ctx.engine_cache() else {
            return self.finish(cb, Err(err));
        };
        if !from_start {
            engine_cache.unlock();
            return self.finish(cb, Err(err));
        }
        let module = self.clone();
        engine_cache.stop(move |_| {
            ctx.mngt_queue_destroy(module.reactor());
            ctx.base().detach();
            module.remove_cache_ctx(ctx.name());
            module.finish(cb, Err(err));
        });
    }

    /// Detach the cache device, flushing dirty data first. The cache
    /// entity stays, serving pass-through, and can be re-attached.
    pub fn cache_detach(&self, name: &str, cb: impl FnOnce(Result<()>) + 'static) {
        let cb: Done = Box::new(cb);
        if !self.is_running() {
            return self.finish(cb, Err(CadevError::ShuttingDown));
        }
        let Some(ctx) = self.find_cache_ctx(name) else {
            return self.finish(cb, Err(CadevError::NotFound(name.to_string())));
        };
        let Some(engine_cache) = ctx.engine_cache() else {
            return self.finish(cb, Err(CadevError::NotFound(name.to_string())));
        };
        if let Err(e) = engine_cache.get() {
            return self.finish(cb, Err(e));
        }
        if !ctx.transition(DeviceState::Attached, DeviceState::Detaching) {
            engine_cache.put();
            return self.finish(cb, Err(CadevError::Already));
        }
        let module = self.clone();
        let ec = Arc::clone(&engine_cache);
        engine_cache.lock(move |r| {
            if let Err(e) = r {
                ctx.set_device_state(DeviceState::Attached);
                ec.put();
                return module.finish(cb, Err(e));
            }
            let m2 = module.clone();
            let ec2 = Arc::clone(&ec);
            let ctx2 = Arc::clone(&ctx);
            let next = move || {
                let ec3 = Arc::clone(&ec2);
                ec2.detach_device(move |r| {
                    ec3.unlock();
                    ctx2.base().detach();
                    ctx2.set_device_state(DeviceState::Detached);
                    ec3.put();
                    m2.finish(cb, r);
                });
            };
            if ec.dirty_lines() > 0 {
                ec.flush(move |fr| {
                    if let Err(e) = fr {
                        warn!(error = %e, "flush before detach failed");
                    }
                    next();
                });
            } else {
                next();
            }
        });
    }

    // ── cache stop ───────────────────────────────────────────────────

    /// Stop a cache entity: unregister its exposed devices, flush dirty
    /// data, stop the engine cache, release the base device.
    pub fn cache_stop(&self, name: &str, cb: impl FnOnce(Result<()>) + 'static) {
        let cb: Done = Box::new(cb);
        if !self.is_running() {
            return self.finish(cb, Err(CadevError::ShuttingDown));
        }
        let Some(ctx) = self.find_cache_ctx(name) else {
            return self.finish(cb, Err(CadevError::NotFound(name.to_string())));
        };
        self.cache_stop_chain(ctx, cb);
    }

    /// Stop chain shared by the RPC and module shutdown. Proceeds to the
    /// engine stop only after every member device unregistered.
    pub(crate) fn cache_stop_chain(
        &self,
        ctx: Arc<CacheCtx>,
        cb: impl FnOnce(Result<()>) + 'static,
    ) {
        let cb: Done = Box::new(cb);
        if !ctx.begin_stop() {
            return self.finish(cb, Err(CadevError::Already));
        }
        let members: Vec<Arc<Vbdev>> = self
            .vbdevs()
            .into_iter()
            .filter(|v| v.cache_name() == ctx.name() && v.is_registered())
            .collect();
        if members.is_empty() {
            return self.cache_stop_tail(ctx, cb);
        }
        debug!(cache = %ctx.name(), cores = members.len(), "unregistering member devices");
        let remaining = Arc::new(Mutex::new((members.len(), Some(cb))));
        for v in members {
            let module = self.clone();
            let ctx2 = Arc::clone(&ctx);
            let remaining = Arc::clone(&remaining);
            if !v.begin_finish() {
                // Another teardown path owns this device; count it done.
                if let Some(cb) = countdown(&remaining) {
                    self.cache_stop_tail(ctx2, cb);
                }
                continue;
            }
            self.registry().unregister(v.name(), move |_| {
                if let Some(cb) = countdown(&remaining) {
                    module.cache_stop_tail(ctx2, cb);
                }
            });
        }
    }

    fn cache_stop_tail(&self, ctx: Arc<CacheCtx>, cb: Done) {
        let Some(engine_cache) = ctx.engine_cache() else {
            ctx.base().detach();
            self.remove_cache_ctx(ctx.name());
            return self.finish(cb, Ok(()));
        };
        let module = self.clone();
        let ec = Arc::clone(&engine_cache);
        engine_cache.lock(move |r| {
            let m2 = module.clone();
            let ec2 = Arc::clone(&ec);
            let ctx2 = Arc::clone(&ctx);
            let proceed = move || {
                let m3 = m2.clone();
                let ctx3 = Arc::clone(&ctx2);
                ec2.stop(move |sr| {
                    ctx3.mngt_queue_destroy(m3.reactor());
                    ctx3.base().detach();
                    m3.remove_cache_ctx(ctx3.name());
                    info!(cache = %ctx3.name(), "cache entity stopped");
                    m3.finish(cb, sr);
                });
            };
            match r {
                // The engine already refuses the lock once teardown is
                // under way; stop regardless, teardown wins.
                Err(_) => proceed(),
                Ok(()) => {
                    if ec.is_attached() && ec.dirty_lines() > 0 {
                        ec.flush(move |fr| {
                            if let Err(e) = fr {
                                warn!(error = %e, "flush before stop failed");
                            }
                            proceed();
                        });
                    } else {
                        proceed();
                    }
                }
            }
        });
    }

    // ── core add ─────────────────────────────────────────────────────

    /// Create a core entity and try to attach it to its cache. Whatever is
    /// missing (core device, cache, cache device) parks the entity on the
    /// waitlist with the deferred status.
    pub fn core_add(&self, req: CoreAddRequest, cb: impl FnOnce(Result<()>) + 'static) {
        let cb: Done = Box::new(cb);
        if !self.is_running() {
            return self.finish(cb, Err(CadevError::ShuttingDown));
        }
        if self.name_in_use(&req.name) {
            return self.finish(cb, Err(CadevError::Exists(req.name)));
        }
        let vbdev = Vbdev::new(&req.name, &req.cache_name, &req.device);
        self.push_waitlist(Arc::clone(&vbdev));
        self.add_core_chain(vbdev, cb);
    }

    /// Try to move one waitlisted core all the way to a registered exposed
    /// device. Re-run by examine and by waitlist reconciliation; each run
    /// re-checks everything because the world may have changed.
    pub(crate) fn add_core_chain(&self, vbdev: Arc<Vbdev>, cb: impl FnOnce(Result<()>) + 'static) {
        let cb: Done = Box::new(cb);
        if !self.is_running() {
            return self.finish(cb, Err(CadevError::Interrupted));
        }
        if !vbdev.base().is_attached() {
            let module = self.clone();
            let hr = Arc::clone(&vbdev);
            match vbdev
                .base()
                .attach(self.registry(), move || module.core_hot_remove(hr))
            {
                Ok(()) => {}
                Err(e) if e.is_deferred() => return self.finish(cb, Err(e)),
                Err(e) => {
                    self.remove_waitlisted(vbdev.name());
                    return self.finish(cb, Err(e));
                }
            }
        }
        if self.is_own_bdev(&vbdev.cfg().device_name) {
            self.remove_waitlisted(vbdev.name());
            vbdev.base().detach();
            return self.finish(
                cb,
                Err(CadevError::Unsupported(
                    "cannot use an exposed cache device as a core".into(),
                )),
            );
        }
        let Some(ctx) = self.find_cache_ctx(vbdev.cache_name()) else {
            return self.finish(cb, Err(CadevError::Deferred(vbdev.cache_name().to_string())));
        };
        if ctx.device_state() != DeviceState::Attached {
            return self.finish(cb, Err(CadevError::Deferred(ctx.base().device_name())));
        }
        let Some(engine_cache) = ctx.engine_cache() else {
            return self.finish(cb, Err(CadevError::Deferred(vbdev.cache_name().to_string())));
        };
        let cache_block = engine_cache.cache_block_size().unwrap_or(0);
        if vbdev.base().block_size() < cache_block {
            self.remove_waitlisted(vbdev.name());
            vbdev.base().detach();
            return self.finish(
                cb,
                Err(CadevError::Unsupported(format!(
                    "core block size {} below cache block size {}",
                    vbdev.base().block_size(),
                    cache_block
                ))),
            );
        }
        // A matching inactive entry in loaded metadata means this is a
        // rejoin, not a fresh add.
        let try_add = engine_cache
            .find_core(vbdev.name())
            .is_some_and(|c| !c.is_active());
        vbdev.set_try_add(try_add);
        if let Err(e) = engine_cache.get() {
            self.remove_waitlisted(vbdev.name());
            vbdev.base().detach();
            return self.finish(cb, Err(e));
        }
        let module = self.clone();
        let ec = Arc::clone(&engine_cache);
        let v = Arc::clone(&vbdev);
        engine_cache.lock(move |r| {
            if let Err(e) = r {
                ec.put();
                module.remove_waitlisted(v.name());
                v.base().detach();
                return module.finish(cb, Err(e));
            }
            let m2 = module.clone();
            let ec2 = Arc::clone(&ec);
            let v2 = Arc::clone(&v);
            ec.add_core(&v.cfg(), move |r| {
                let core = match r {
                    Ok(core) => core,
                    Err(e) => {
                        ec2.unlock();
                        ec2.put();
                        m2.remove_waitlisted(v2.name());
                        v2.base().detach();
                        return m2.finish(cb, Err(e));
                    }
                };
                match crate::io::register_vbdev(&m2, &v2) {
                    Ok(()) => {
                        core.set_bound(true);
                        v2.attach_to_cache(ctx, core);
                        v2.set_registered(true);
                        ec2.unlock();
                        ec2.put();
                        m2.remove_waitlisted(v2.name());
                        m2.push_vbdev(Arc::clone(&v2));
                        info!(vbdev = %v2.name(), "exposed device registered");
                        m2.finish(cb, Ok(()));
                    }
                    Err(e) => {
                        let m3 = m2.clone();
                        let ec3 = Arc::clone(&ec2);
                        let v3 = Arc::clone(&v2);
                        ec2.remove_core(&core, move |_| {
                            ec3.unlock();
                            ec3.put();
                            m3.remove_waitlisted(v3.name());
                            v3.base().detach();
                            m3.finish(cb, Err(e));
                        });
                    }
                }
            });
        });
    }

    /// Reconcile the waitlist against a cache whose device just attached.
    pub(crate) fn add_from_waitlist(&self, ctx: &Arc<CacheCtx>) {
        for v in self.waitlist() {
            if v.cache_name() == ctx.name() {
                self.add_core_chain(v, |r| {
                    if let Err(e) = r {
                        if !e.is_deferred() {
                            warn!(error = %e, "waitlist reconciliation failed");
                        }
                    }
                });
            }
        }
    }

    // ── core remove / destruct ───────────────────────────────────────

    /// Remove an exposed device. A waitlisted entity is simply dropped; a
    /// registered one unregisters first, then its metadata entry goes.
    pub fn core_remove(&self, name: &str, cb: impl FnOnce(Result<()>) + 'static) {
        let cb: Done = Box::new(cb);
        if !self.is_running() {
            return self.finish(cb, Err(CadevError::ShuttingDown));
        }
        if let Some(v) = self.find_waitlisted(name) {
            self.remove_waitlisted(name);
            v.base().detach();
            return self.finish(cb, Ok(()));
        }
        let Some(vbdev) = self.find_vbdev(name) else {
            return self.finish(cb, Err(CadevError::NotFound(name.to_string())));
        };
        if !vbdev.begin_finish() {
            return self.finish(cb, Err(CadevError::Already));
        }
        if vbdev.is_registered() {
            let module = self.clone();
            self.registry().unregister(name, move |_| {
                module.core_remove_tail(vbdev, cb);
            });
        } else {
            self.core_remove_tail(vbdev, cb);
        }
    }

    /// After the destruct chain detached the core (keeping its metadata
    /// entry), an explicit remove drops the entry too.
    fn core_remove_tail(&self, vbdev: Arc<Vbdev>, cb: Done) {
        let engine_cache = self
            .find_cache_ctx(vbdev.cache_name())
            .and_then(|c| c.engine_cache());
        let Some(engine_cache) = engine_cache else {
            return self.finish(cb, Ok(()));
        };
        let Some(core) = engine_cache.find_core(vbdev.name()) else {
            return self.finish(cb, Ok(()));
        };
        if let Err(e) = engine_cache.get() {
            debug!(error = %e, "cache already stopping, metadata goes with it");
            return self.finish(cb, Ok(()));
        }
        let module = self.clone();
        let ec = Arc::clone(&engine_cache);
        engine_cache.lock(move |r| {
            if r.is_err() {
                ec.put();
                return module.finish(cb, Ok(()));
            }
            let m2 = module.clone();
            let ec2 = Arc::clone(&ec);
            ec.remove_core(&core, move |rr| {
                ec2.unlock();
                ec2.put();
                m2.finish(cb, rr);
            });
        });
    }

    /// Teardown hook of an exposed device, run by the host stack when the
    /// device unregisters: flush dirty data, detach the core from its
    /// cache (the metadata entry stays), release the base device. Errors
    /// do not stop the chain; the device is going away regardless.
    pub(crate) fn core_destruct(&self, vbdev: Arc<Vbdev>, done: DestructDone) {
        vbdev.begin_finish();
        let cache = vbdev.cache().and_then(|c| c.engine_cache());
        let core = vbdev.core();
        let (Some(engine_cache), Some(core)) = (cache, core) else {
            return self.core_destruct_tail(vbdev, done);
        };
        let module = self.clone();
        let ec = Arc::clone(&engine_cache);
        engine_cache.lock(move |r| {
            if r.is_err() {
                return module.core_destruct_tail(vbdev, done);
            }
            let m2 = module.clone();
            let ec2 = Arc::clone(&ec);
            let v2 = Arc::clone(&vbdev);
            let c2 = Arc::clone(&core);
            let next = move || {
                let m3 = m2.clone();
                let ec3 = Arc::clone(&ec2);
                ec2.detach_core(&c2, move |_| {
                    ec3.unlock();
                    m3.core_destruct_tail(v2, done);
                });
            };
            if core.dirty_lines() > 0 && ec.is_attached() {
                ec.flush_core(&core, move |fr| {
                    if let Err(e) = fr {
                        warn!(error = %e, "flush during destruct failed");
                    }
                    next();
                });
            } else {
                next();
            }
        });
    }

    fn core_destruct_tail(&self, vbdev: Arc<Vbdev>, done: DestructDone) {
        vbdev.base().detach();
        vbdev.set_registered(false);
        vbdev.detach_from_cache();
        self.remove_vbdev(vbdev.name());
        debug!(vbdev = %vbdev.name(), "exposed device destructed");
        done(0);
    }

    // ── hot removal ──────────────────────────────────────────────────

    /// A core base device disappeared. A waitlisted entity just lets go of
    /// the device and keeps waiting; a live one unregisters its exposed
    /// device, which runs the destruct chain.
    pub(crate) fn core_hot_remove(&self, vbdev: Arc<Vbdev>) {
        warn!(vbdev = %vbdev.name(), "core base device removed");
        if self.find_waitlisted(vbdev.name()).is_some() {
            vbdev.base().detach();
            return;
        }
        if vbdev.begin_finish() {
            self.registry().unregister(vbdev.name(), |_| {});
        }
    }

    /// The cache base device disappeared. Runs the detach flow; the cache
    /// entity survives device-less and examine re-attaches it if the
    /// device returns. A concurrent explicit detach wins the state
    /// transition and owns the unwind.
    pub(crate) fn cache_hot_remove(&self, ctx: Arc<CacheCtx>) {
        warn!(cache = %ctx.name(), "cache device removed");
        if !ctx.transition(DeviceState::Attached, DeviceState::Detaching) {
            return;
        }
        let Some(engine_cache) = ctx.engine_cache() else {
            ctx.base().detach();
            ctx.set_device_state(DeviceState::Detached);
            return;
        };
        if engine_cache.get().is_err() {
            ctx.base().detach();
            ctx.set_device_state(DeviceState::Detached);
            return;
        }
        let ec = Arc::clone(&engine_cache);
        engine_cache.lock(move |r| {
            if r.is_err() {
                ctx.base().detach();
                ctx.set_device_state(DeviceState::Detached);
                ec.put();
                return;
            }
            let ec2 = Arc::clone(&ec);
            let ctx2 = Arc::clone(&ctx);
            let next = move || {
                let ec3 = Arc::clone(&ec2);
                ec2.detach_device(move |dr| {
                    if let Err(e) = dr {
                        warn!(error = %e, "engine detach after hot removal failed");
                    }
                    ec3.unlock();
                    ctx2.base().detach();
                    ctx2.set_device_state(DeviceState::Detached);
                    ec3.put();
                });
            };
            if ec.dirty_lines() > 0 {
                ec.flush(move |fr| {
                    if let Err(e) = fr {
                        warn!(error = %e, "flush after hot removal failed");
                    }
                    next();
                });
            } else {
                next();
            }
        });
    }

    // ── parameter changes ────────────────────────────────────────────

    /// Switch the cache mode, persisting the change to the device.
    pub fn set_cache_mode(&self, name: &str, mode: &str, cb: impl FnOnce(Result<()>) + 'static) {
        let cb: Done = Box::new(cb);
        let Some(mode) = CacheMode::from_name(mode) else {
            return self.finish(cb, Err(CadevError::Invalid(format!("cache mode {mode:?}"))));
        };
        self.with_locked_cache(name, cb, move |ec| ec.set_mode(mode));
    }

    /// Change the cleaning policy and/or its parameters.
    pub fn set_cleaning(
        &self,
        name: &str,
        policy: Option<&str>,
        params: CleaningParams,
        cb: impl FnOnce(Result<()>) + 'static,
    ) {
        let cb: Done = Box::new(cb);
        let policy = match policy {
            None => None,
            Some(p) => match CleaningPolicy::from_name(p) {
                Some(p) => Some(p),
                None => {
                    return self
                        .finish(cb, Err(CadevError::Invalid(format!("cleaning policy {p:?}"))))
                }
            },
        };
        self.with_locked_cache(name, cb, move |ec| {
            if let Some(policy) = policy {
                ec.set_cleaning_policy(policy)?;
            }
            ec.set_cleaning_params(&params)
        });
    }

    /// Change the promotion policy and/or its parameters.
    pub fn set_promotion(
        &self,
        name: &str,
        policy: Option<&str>,
        params: PromotionParams,
        cb: impl FnOnce(Result<()>) + 'static,
    ) {
        let cb: Done = Box::new(cb);
        let policy = match policy {
            None => None,
            Some(p) => match PromotionPolicy::from_name(p) {
                Some(p) => Some(p),
                None => {
                    return self.finish(
                        cb,
                        Err(CadevError::Invalid(format!("promotion policy {p:?}"))),
                    )
                }
            },
        };
        self.with_locked_cache(name, cb, move |ec| {
            if let Some(policy) = policy {
                ec.set_promotion_policy(policy)?;
            }
            ec.set_promotion_params(&params)
        });
    }

    /// Change sequential cutoff parameters on one exposed device, or on
    /// every core of a cache when given a cache name.
    pub fn set_seqcutoff(
        &self,
        name: &str,
        policy: Option<&str>,
        threshold_kib: Option<u32>,
        promotion_count: Option<u32>,
        cb: impl FnOnce(Result<()>) + 'static,
    ) {
        let cb: Done = Box::new(cb);
        if !self.is_running() {
            return self.finish(cb, Err(CadevError::ShuttingDown));
        }
        let policy = match policy {
            None => None,
            Some(p) => match SeqCutoffPolicy::from_name(p) {
                Some(p) => Some(p),
                None => {
                    return self
                        .finish(cb, Err(CadevError::Invalid(format!("seqcutoff policy {p:?}"))))
                }
            },
        };
        let params = SeqCutoffParams {
            policy,
            threshold_kib,
            promotion_count,
        };
        let Some(target) = self.resolve(name) else {
            return self.finish(cb, Err(CadevError::NotFound(name.to_string())));
        };
        let (cache_name, only_core) = match &target {
            Target::Cache(ctx) => (ctx.name().to_string(), None),
            Target::Core(v) => (v.cache_name().to_string(), v.core()),
        };
        self.with_locked_cache(&cache_name, cb, move |ec| {
            match &only_core {
                Some(core) => core.set_seqcutoff(&params),
                None => {
                    for core in ec.cores() {
                        core.set_seqcutoff(&params);
                    }
                }
            }
            Ok(())
        });
    }

    /// Lock, apply, save (tolerating a detached device), unlock. The shape
    /// every parameter change shares.
    fn with_locked_cache(
        &self,
        name: &str,
        cb: Done,
        apply: impl FnOnce(&Arc<cadev_engine::Cache>) -> Result<()> + 'static,
    ) {
        if !self.is_running() {
            return self.finish(cb, Err(CadevError::ShuttingDown));
        }
        let Some(ctx) = self.find_cache_ctx(name) else {
            return self.finish(cb, Err(CadevError::NotFound(name.to_string())));
        };
        let Some(engine_cache) = ctx.engine_cache() else {
            return self.finish(cb, Err(CadevError::NotFound(name.to_string())));
        };
        if let Err(e) = engine_cache.get() {
            return self.finish(cb, Err(e));
        }
        let module = self.clone();
        let ec = Arc::clone(&engine_cache);
        engine_cache.lock(move |r| {
            if let Err(e) = r {
                ec.put();
                return module.finish(cb, Err(e));
            }
            if let Err(e) = apply(&ec) {
                ec.unlock();
                ec.put();
                return module.finish(cb, Err(e));
            }
            let m2 = module.clone();
            let ec2 = Arc::clone(&ec);
            ec.save(move |sr| {
                ec2.unlock();
                ec2.put();
                m2.finish(cb, ignore_detached(sr));
            });
        });
    }

    // ── flush ────────────────────────────────────────────────────────

    /// Start a background flush of one exposed device or a whole cache.
    /// The request completes as soon as the flush is initiated; progress
    /// and outcome are visible through [`Module::flush_status`].
    pub fn flush_start(&self, name: &str, cb: impl FnOnce(Result<()>) + 'static) {
        let cb: Done = Box::new(cb);
        if !self.is_running() {
            return self.finish(cb, Err(CadevError::ShuttingDown));
        }
        let Some(target) = self.resolve(name) else {
            return self.finish(cb, Err(CadevError::NotFound(name.to_string())));
        };
        let (ctx, only) = match target {
            Target::Cache(ctx) => (ctx, None),
            Target::Core(v) => {
                let Some(ctx) = v.cache() else {
                    return self.finish(cb, Err(CadevError::NotFound(name.to_string())));
                };
                (ctx, Some(v))
            }
        };
        let Some(engine_cache) = ctx.engine_cache() else {
            return self.finish(cb, Err(CadevError::NotFound(name.to_string())));
        };
        let marks: Vec<Arc<Vbdev>> = match &only {
            Some(v) => vec![Arc::clone(v)],
            None => self
                .vbdevs()
                .into_iter()
                .filter(|v| v.cache_name() == ctx.name())
                .collect(),
        };
        if let Err(e) = engine_cache.get() {
            return self.finish(cb, Err(e));
        }
        let module = self.clone();
        let ec = Arc::clone(&engine_cache);
        engine_cache.read_lock(move |r| {
            if let Err(e) = r {
                ec.put();
                return module.finish(cb, Err(e));
            }
            for v in &marks {
                v.set_flush_in_progress(true);
            }
            // Fire and forget: the caller polls flush_status.
            module.finish(cb, Ok(()));
            let ec2 = Arc::clone(&ec);
            let done = move |fr: Result<()>| {
                let status = status_of(&fr);
                for v in &marks {
                    v.set_flush_result(status);
                }
                ec2.unlock();
                ec2.put();
            };
            match only.as_ref().and_then(|v| v.core()) {
                Some(core) => ec.flush_core(&core, done),
                None => ec.flush(done),
            }
        });
    }

    /// Current flush progress of a device, or the aggregate over a cache.
    pub fn flush_status(&self, name: &str) -> Result<FlushStatus> {
        match self.resolve(name) {
            Some(Target::Core(v)) => Ok(v.flush_status()),
            Some(Target::Cache(ctx)) => {
                let mut agg = FlushStatus::default();
                for v in self.vbdevs() {
                    if v.cache_name() == ctx.name() {
                        let fs = v.flush_status();
                        agg.in_progress |= fs.in_progress;
                        match (agg.last_status, fs.last_status) {
                            (None, s) => agg.last_status = s,
                            (Some(0), Some(s)) => agg.last_status = Some(s),
                            _ => {}
                        }
                    }
                }
                Ok(agg)
            }
            None => Err(CadevError::NotFound(name.to_string())),
        }
    }

    // ── statistics ───────────────────────────────────────────────────

    /// Collect statistics under the shared lock.
    pub fn get_stats(&self, name: &str, cb: impl FnOnce(Result<serde_json::Value>) + 'static) {
        let reactor = self.reactor().clone();
        let Some(target) = self.resolve(name) else {
            let name = name.to_string();
            return reactor.send(move || cb(Err(CadevError::NotFound(name))));
        };
        let (ctx, core) = match &target {
            Target::Cache(ctx) => (Arc::clone(ctx), None),
            Target::Core(v) => {
                let Some(ctx) = v.cache() else {
                    let name = name.to_string();
                    return reactor.send(move || cb(Err(CadevError::NotFound(name))));
                };
                (ctx, v.core())
            }
        };
        let Some(engine_cache) = ctx.engine_cache() else {
            let name = name.to_string();
            return reactor.send(move || cb(Err(CadevError::NotFound(name))));
        };
        if let Err(e) = engine_cache.get() {
            return reactor.send(move || cb(Err(e)));
        }
        let ec = Arc::clone(&engine_cache);
        engine_cache.read_lock(move |r| {
            if let Err(e) = r {
                ec.put();
                return reactor.send(move || cb(Err(e)));
            }
            let snap = match &core {
                Some(core) => ec.core_stats(core),
                None => ec.stats(),
            };
            let json = crate::stats::stats_json(&snap);
            ec.unlock();
            ec.put();
            reactor.send(move || cb(Ok(json)));
        });
    }

    /// Zero the counters of one device or a whole cache, under the
    /// exclusive lock.
    pub fn reset_stats(&self, name: &str, cb: impl FnOnce(Result<()>) + 'static) {
        let cb: Done = Box::new(cb);
        let Some(target) = self.resolve(name) else {
            return self.finish(cb, Err(CadevError::NotFound(name.to_string())));
        };
        let (ctx, core) = match &target {
            Target::Cache(ctx) => (Arc::clone(ctx), None),
            Target::Core(v) => {
                let Some(ctx) = v.cache() else {
                    return self.finish(cb, Err(CadevError::NotFound(name.to_string())));
                };
                (ctx, v.core())
            }
        };
        let Some(engine_cache) = ctx.engine_cache() else {
            return self.finish(cb, Err(CadevError::NotFound(name.to_string())));
        };
        if let Err(e) = engine_cache.get() {
            return self.finish(cb, Err(e));
        }
        let module = self.clone();
        let ec = Arc::clone(&engine_cache);
        engine_cache.lock(move |r| {
            if let Err(e) = r {
                ec.put();
                return module.finish(cb, Err(e));
            }
            match &core {
                Some(core) => ec.reset_core_stats(core),
                None => ec.reset_stats(),
            }
            ec.unlock();
            ec.put();
            module.finish(cb, Ok(()));
        });
    }
}
