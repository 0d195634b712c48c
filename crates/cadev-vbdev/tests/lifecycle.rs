#![forbid(unsafe_code)]

use cadev_bdev::{IoRequest, IoStatus, MemBdev, Reactor, Registry};
use cadev_error::{CadevError, Result};
use cadev_vbdev::{CacheStartRequest, CoreAddRequest, DeviceState, Module, PRODUCT_NAME};
use std::cell::RefCell;
use std::rc::Rc;

type Outcome = Rc<RefCell<Option<Result<()>>>>;

fn slot() -> (Outcome, impl FnOnce(Result<()>) + 'static) {
    let out: Outcome = Rc::new(RefCell::new(None));
    let o = Rc::clone(&out);
    (out, move |r| *o.borrow_mut() = Some(r))
}

fn rig() -> (Reactor, Registry, Module) {
    let reactor = Reactor::new();
    let registry = Registry::new(reactor.clone());
    let module = Module::new(&registry);
    (reactor, registry, module)
}

fn mem(registry: &Registry, name: &str, block_size: u32, blocks: u64) {
    MemBdev::create(registry, name, block_size, blocks).expect("mem bdev");
}

fn start_cache(
    module: &Module,
    reactor: &Reactor,
    name: &str,
    device: Option<&str>,
    mode: Option<&str>,
) -> Result<()> {
    let (out, cb) = slot();
    module.cache_start(
        CacheStartRequest {
            name: name.to_string(),
            mode: mode.map(str::to_string),
            line_size: 0,
            device: device.map(str::to_string),
            force_no_load: false,
        },
        cb,
    );
    reactor.run_until_idle();
    let result = out.borrow_mut().take();
    result.expect("cache start completed")
}

fn add_core(
    module: &Module,
    reactor: &Reactor,
    name: &str,
    cache_name: &str,
    device: &str,
) -> Result<()> {
    let (out, cb) = slot();
    module.core_add(
        CoreAddRequest {
            name: name.to_string(),
            cache_name: cache_name.to_string(),
            device: device.to_string(),
        },
        cb,
    );
    reactor.run_until_idle();
    let result = out.borrow_mut().take();
    result.expect("core add completed")
}

fn stop_cache(module: &Module, reactor: &Reactor, name: &str) -> Result<()> {
    let (out, cb) = slot();
    module.cache_stop(name, cb);
    reactor.run_until_idle();
    let result = out.borrow_mut().take();
    result.expect("cache stop completed")
}

/// The usual two-device setup: a cache on `cdev`, one core on `core-dev`.
fn cached_pair(mode: Option<&str>) -> (Reactor, Registry, Module) {
    let (reactor, registry, module) = rig();
    mem(&registry, "cdev", 512, 4096);
    mem(&registry, "core-dev", 512, 4096);
    reactor.run_until_idle();
    start_cache(&module, &reactor, "cache1", Some("cdev"), mode).expect("start");
    add_core(&module, &reactor, "core1", "cache1", "core-dev").expect("add core");
    (reactor, registry, module)
}

#[test]
fn start_with_device_attaches_and_exposes_core() {
    let (reactor, registry, module) = cached_pair(None);
    let ctx = module.find_cache_ctx("cache1").expect("cache ctx");
    assert_eq!(ctx.device_state(), DeviceState::Attached);

    let props = registry.lookup("core1").expect("exposed device");
    assert_eq!(props.product_name, PRODUCT_NAME);
    assert_eq!(props.block_size, 512);
    assert_eq!(module.waitlist_len(), 0);

    stop_cache(&module, &reactor, "cache1").expect("stop");
    assert!(module.find_cache_ctx("cache1").is_none());
    assert!(registry.lookup("core1").is_none());
    let _ = reactor;
}

#[test]
fn start_without_device_runs_detached() {
    let (reactor, _registry, module) = rig();
    start_cache(&module, &reactor, "cache1", None, None).expect("start");
    let ctx = module.find_cache_ctx("cache1").expect("cache ctx");
    assert_eq!(ctx.device_state(), DeviceState::Detached);
    let engine_cache = ctx.engine_cache().expect("engine cache");
    assert!(!engine_cache.is_locked(), "start released the lock");
}

#[test]
fn missing_cache_device_defers_until_examine() {
    let (reactor, registry, module) = rig();
    let err = start_cache(&module, &reactor, "cache1", Some("cdev"), None)
        .expect_err("device absent");
    assert!(err.is_deferred());
    assert_eq!(err.to_errno(), libc::ENODEV);

    // The entity stayed, parked device-less.
    let ctx = module.find_cache_ctx("cache1").expect("cache ctx");
    assert_eq!(ctx.device_state(), DeviceState::Detached);

    // The device shows up; examine finishes the attach.
    mem(&registry, "cdev", 512, 4096);
    reactor.run_until_idle();
    assert_eq!(ctx.device_state(), DeviceState::Attached);
    assert_eq!(registry.examines_in_progress(), 0);
}

#[test]
fn core_waits_for_cache_then_registers() {
    let (reactor, registry, module) = rig();
    mem(&registry, "core-dev", 512, 4096);
    reactor.run_until_idle();

    let err = add_core(&module, &reactor, "core1", "cache1", "core-dev")
        .expect_err("cache absent");
    assert!(err.is_deferred());
    assert_eq!(module.waitlist_len(), 1);

    mem(&registry, "cdev", 512, 4096);
    reactor.run_until_idle();
    start_cache(&module, &reactor, "cache1", Some("cdev"), None).expect("start");

    // The attach reconciled the waitlist.
    assert_eq!(module.waitlist_len(), 0);
    assert!(registry.lookup("core1").is_some());
}

#[test]
fn names_are_unique_across_namespaces() {
    let (reactor, registry, module) = cached_pair(None);

    // A cache name collides with an existing cache.
    let err = start_cache(&module, &reactor, "cache1", None, None).expect_err("dup cache");
    assert_eq!(err.to_errno(), libc::EEXIST);

    // A cache name collides with an exposed device and with a host bdev.
    let err = start_cache(&module, &reactor, "core1", None, None).expect_err("dup core");
    assert_eq!(err.to_errno(), libc::EEXIST);
    let err = start_cache(&module, &reactor, "cdev", None, None).expect_err("dup bdev");
    assert_eq!(err.to_errno(), libc::EEXIST);

    // A core name collides with a waitlisted core.
    let err = add_core(&module, &reactor, "late", "cache1", "ghost").expect_err("deferred");
    assert!(err.is_deferred());
    let err = add_core(&module, &reactor, "late", "cache1", "ghost2").expect_err("dup wait");
    assert_eq!(err.to_errno(), libc::EEXIST);
    let _ = registry;
}

#[test]
fn stacking_on_own_device_is_rejected() {
    let (reactor, _registry, module) = cached_pair(None);
    let err = add_core(&module, &reactor, "core2", "cache1", "core1").expect_err("stacking");
    assert_eq!(err.to_errno(), libc::ENOTSUP);
    assert_eq!(module.waitlist_len(), 0);
}

#[test]
fn core_block_size_below_cache_is_rejected() {
    let (reactor, registry, module) = rig();
    mem(&registry, "cdev", 4096, 1024);
    mem(&registry, "core-dev", 512, 4096);
    reactor.run_until_idle();
    start_cache(&module, &reactor, "cache1", Some("cdev"), None).expect("start");

    let err = add_core(&module, &reactor, "core1", "cache1", "core-dev").expect_err("geometry");
    assert_eq!(err.to_errno(), libc::ENOTSUP);
    // Hard failure: not parked for retry, base released.
    assert_eq!(module.waitlist_len(), 0);
}

#[test]
fn core_add_after_engine_teardown_fails_clean() {
    let (reactor, registry, module) = cached_pair(None);
    mem(&registry, "core-dev2", 512, 4096);
    reactor.run_until_idle();

    // The engine cache goes away underneath the module, as it would
    // during a concurrent stop.
    let engine_cache = module
        .find_cache_ctx("cache1")
        .and_then(|c| c.engine_cache())
        .expect("engine cache");
    engine_cache.stop(|r| r.expect("stop"));
    reactor.run_until_idle();

    let err = add_core(&module, &reactor, "core2", "cache1", "core-dev2")
        .expect_err("cache tearing down");
    assert!(!err.is_deferred(), "hard failure, not parked");
    assert_eq!(err.to_errno(), cadev_error::EngineError::Stopping.code());
    assert_eq!(module.waitlist_len(), 0);

    // The base was released, not left claimed by the dead add.
    let desc = registry.open("core-dev2", || {}).expect("open released device");
    desc.claim().expect("claim released device");
    desc.close();
}

#[test]
fn invalid_mode_and_line_size_are_rejected() {
    let (reactor, _registry, module) = rig();
    let err = start_cache(&module, &reactor, "cache1", None, Some("writeback"))
        .expect_err("bad mode");
    assert_eq!(err.to_errno(), libc::EINVAL);

    let (out, cb) = slot();
    module.cache_start(
        CacheStartRequest {
            name: "cache1".to_string(),
            mode: None,
            line_size: 7,
            device: None,
            force_no_load: false,
        },
        cb,
    );
    reactor.run_until_idle();
    let err = out
        .borrow_mut()
        .take()
        .expect("completed")
        .expect_err("bad line size");
    assert_eq!(err.to_errno(), libc::EINVAL);
}

#[test]
fn restart_loads_metadata_and_core_rejoins() {
    let (reactor, registry, module) = cached_pair(None);
    stop_cache(&module, &reactor, "cache1").expect("stop");

    // Same cache device again: metadata is found and loaded, the core
    // comes back as a shell until its own add re-runs.
    start_cache(&module, &reactor, "cache1", Some("cdev"), None).expect("restart");
    let ctx = module.find_cache_ctx("cache1").expect("cache ctx");
    let engine_cache = ctx.engine_cache().expect("engine cache");
    assert_eq!(engine_cache.core_count(), 1);
    assert_eq!(engine_cache.inactive_core_count(), 1);

    let shells: Vec<_> = module
        .get_bdevs(None)
        .into_iter()
        .filter(|v| v["loading"] == true)
        .collect();
    assert_eq!(shells.len(), 1);
    assert_eq!(shells[0]["name"], "core1");

    add_core(&module, &reactor, "core1", "cache1", "core-dev").expect("rejoin");
    assert_eq!(engine_cache.inactive_core_count(), 0);
    assert!(registry.lookup("core1").is_some());
}

#[test]
fn force_no_load_attaches_fresh_over_metadata() {
    let (reactor, _registry, module) = cached_pair(None);
    stop_cache(&module, &reactor, "cache1").expect("stop");

    // Same device, but the caller asked for a fresh cache: the old
    // metadata is overwritten instead of loaded.
    let (out, cb) = slot();
    module.cache_start(
        CacheStartRequest {
            name: "cache1".to_string(),
            mode: None,
            line_size: 0,
            device: Some("cdev".to_string()),
            force_no_load: true,
        },
        cb,
    );
    reactor.run_until_idle();
    let result = out.borrow_mut().take();
    result.expect("cache start completed").expect("fresh start");

    let engine_cache = module
        .find_cache_ctx("cache1")
        .and_then(|c| c.engine_cache())
        .expect("engine cache");
    assert_eq!(engine_cache.core_count(), 0, "no shell survived");
    assert!(
        module.get_bdevs(None).iter().all(|v| v["loading"] != true),
        "nothing left loading"
    );

    // The overwrite stuck: a plain restart finds the empty metadata.
    stop_cache(&module, &reactor, "cache1").expect("stop again");
    start_cache(&module, &reactor, "cache1", Some("cdev"), None).expect("restart");
    let engine_cache = module
        .find_cache_ctx("cache1")
        .and_then(|c| c.engine_cache())
        .expect("engine cache");
    assert_eq!(engine_cache.core_count(), 0);
}

#[test]
fn try_add_rejects_mismatched_device() {
    let (reactor, registry, module) = cached_pair(None);
    stop_cache(&module, &reactor, "cache1").expect("stop");
    start_cache(&module, &reactor, "cache1", Some("cdev"), None).expect("restart");

    mem(&registry, "other-dev", 512, 4096);
    reactor.run_until_idle();
    let err = add_core(&module, &reactor, "core1", "cache1", "other-dev")
        .expect_err("uuid mismatch");
    assert_eq!(err.to_errno(), cadev_error::EngineError::MetadataMismatch.code());
}

#[test]
fn stop_releases_devices_and_balances_refs() {
    let (reactor, registry, module) = cached_pair(None);
    let ctx = module.find_cache_ctx("cache1").expect("cache ctx");
    let cache_base = std::sync::Arc::clone(ctx.base());
    let core_base = std::sync::Arc::clone(module.find_vbdev("core1").expect("vbdev").base());

    stop_cache(&module, &reactor, "cache1").expect("stop");
    assert!(!cache_base.is_attached());
    assert!(!core_base.is_attached());
    assert_eq!(cache_base.volume_refs(), 0);
    assert_eq!(core_base.volume_refs(), 0);

    // The devices are free for someone else to claim.
    let desc = registry.open("cdev", || {}).expect("open released device");
    desc.claim().expect("claim released device");
    desc.close();
}

#[test]
fn second_stop_reports_already() {
    let (reactor, _registry, module) = cached_pair(None);
    let (first, cb1) = slot();
    let (second, cb2) = slot();
    module.cache_stop("cache1", cb1);
    module.cache_stop("cache1", cb2);
    reactor.run_until_idle();
    first.borrow_mut().take().expect("first completed").expect("first wins");
    let err = second
        .borrow_mut()
        .take()
        .expect("second completed")
        .expect_err("second loses");
    assert_eq!(err.to_errno(), libc::EALREADY);
}

#[test]
fn mode_change_racing_stop_still_completes() {
    let (reactor, _registry, module) = cached_pair(None);
    let (stopped, cb1) = slot();
    let (changed, cb2) = slot();
    module.cache_stop("cache1", cb1);
    module.set_cache_mode("cache1", "wb", cb2);
    reactor.run_until_idle();

    let result = stopped.borrow_mut().take();
    result.expect("stop completed").expect("stop");
    // Whichever side wins the lock, the loser is answered, never dropped.
    let result = changed.borrow_mut().take();
    let _ = result.expect("mode change completed while the cache was stopping");
}

#[test]
fn detach_keeps_cache_and_reattach_restores_it() {
    let (reactor, registry, module) = cached_pair(None);
    let ctx = module.find_cache_ctx("cache1").expect("cache ctx");

    let (out, cb) = slot();
    module.cache_detach("cache1", cb);
    reactor.run_until_idle();
    out.borrow_mut().take().expect("completed").expect("detach");
    assert_eq!(ctx.device_state(), DeviceState::Detached);
    // Exposed device keeps serving (pass-through).
    assert!(registry.lookup("core1").is_some());

    let (out, cb) = slot();
    module.cache_attach("cache1", "cdev", false, cb);
    reactor.run_until_idle();
    out.borrow_mut().take().expect("completed").expect("attach");
    assert_eq!(ctx.device_state(), DeviceState::Attached);

    // Second detach after the first is already done.
    let (out, cb) = slot();
    module.cache_detach("cache1", cb);
    reactor.run_until_idle();
    out.borrow_mut().take().expect("completed").expect("detach again");
    let (out, cb) = slot();
    module.cache_detach("cache1", cb);
    reactor.run_until_idle();
    let err = out
        .borrow_mut()
        .take()
        .expect("completed")
        .expect_err("nothing to detach");
    assert_eq!(err.to_errno(), libc::EALREADY);
}

#[test]
fn set_mode_applies_even_while_detached() {
    let (reactor, _registry, module) = rig();
    start_cache(&module, &reactor, "cache1", None, Some("wt")).expect("start");
    let engine_cache = module
        .find_cache_ctx("cache1")
        .and_then(|c| c.engine_cache())
        .expect("engine cache");

    let (out, cb) = slot();
    module.set_cache_mode("cache1", "wb", cb);
    reactor.run_until_idle();
    // The save cannot reach a device, but the mode change sticks.
    out.borrow_mut().take().expect("completed").expect("set mode");
    assert_eq!(engine_cache.mode(), cadev_types::CacheMode::Wb);
    assert!(!engine_cache.is_locked(), "lock released after the change");
}

#[test]
fn seqcutoff_applies_to_core_or_whole_cache() {
    let (reactor, _registry, module) = cached_pair(None);
    let core = module
        .find_vbdev("core1")
        .and_then(|v| v.core())
        .expect("core");

    let (out, cb) = slot();
    module.set_seqcutoff("core1", Some("never"), Some(2048), None, cb);
    reactor.run_until_idle();
    out.borrow_mut().take().expect("completed").expect("per core");
    let params = core.seqcutoff();
    assert_eq!(params.policy, Some(cadev_types::SeqCutoffPolicy::Never));
    assert_eq!(params.threshold_kib, Some(2048));

    let (out, cb) = slot();
    module.set_seqcutoff("cache1", Some("always"), None, Some(16), cb);
    reactor.run_until_idle();
    out.borrow_mut().take().expect("completed").expect("per cache");
    let params = core.seqcutoff();
    assert_eq!(params.policy, Some(cadev_types::SeqCutoffPolicy::Always));
    assert_eq!(params.threshold_kib, Some(2048), "threshold untouched");
    assert_eq!(params.promotion_count, Some(16));
}

#[test]
fn unknown_policy_name_is_invalid() {
    let (reactor, _registry, module) = cached_pair(None);
    let (out, cb) = slot();
    module.set_cleaning("cache1", Some("lru"), cadev_types::CleaningParams::default(), cb);
    reactor.run_until_idle();
    let err = out
        .borrow_mut()
        .take()
        .expect("completed")
        .expect_err("bad policy");
    assert_eq!(err.to_errno(), libc::EINVAL);
}

fn write_through_core(reactor: &Reactor, registry: &Registry, bytes: usize) {
    let desc = registry.open("core1", || {}).expect("open exposed device");
    let channel = desc.get_io_channel().expect("channel");
    let done = Rc::new(RefCell::new(None));
    let d = Rc::clone(&done);
    desc.submit(
        &channel,
        IoRequest::write(0, vec![0xA5; bytes]),
        Box::new(move |status, _| *d.borrow_mut() = Some(status)),
    );
    reactor.run_until_idle();
    assert_eq!(done.borrow_mut().take(), Some(IoStatus::Success));
    channel.put();
    desc.close();
    reactor.run_until_idle();
}

#[test]
fn writeback_io_flush_status_round_trip() {
    let (reactor, registry, module) = cached_pair(Some("wb"));
    write_through_core(&reactor, &registry, 8192);

    let engine_cache = module
        .find_cache_ctx("cache1")
        .and_then(|c| c.engine_cache())
        .expect("engine cache");
    assert!(engine_cache.dirty_lines() > 0);

    let (out, cb) = slot();
    module.flush_start("core1", cb);
    reactor.run_until_idle();
    out.borrow_mut().take().expect("completed").expect("flush start");

    let status = module.flush_status("core1").expect("status");
    assert!(!status.in_progress);
    assert_eq!(status.last_status, Some(0));
    assert_eq!(engine_cache.dirty_lines(), 0);

    // Aggregate over the cache reflects the core.
    let status = module.flush_status("cache1").expect("cache status");
    assert_eq!(status.last_status, Some(0));
}

#[test]
fn stats_report_and_reset() {
    let (reactor, registry, module) = cached_pair(Some("wb"));
    write_through_core(&reactor, &registry, 4096);

    let out: Rc<RefCell<Option<Result<serde_json::Value>>>> = Rc::new(RefCell::new(None));
    let o = Rc::clone(&out);
    module.get_stats("core1", move |r| *o.borrow_mut() = Some(r));
    reactor.run_until_idle();
    let stats = out.borrow_mut().take().expect("completed").expect("stats");
    assert_eq!(stats["requests"]["cached"]["wr"]["count"], 1);
    assert!(stats["usage"]["dirty"]["count"].as_u64().expect("dirty") > 0);

    let (done, cb) = slot();
    module.reset_stats("cache1", cb);
    reactor.run_until_idle();
    done.borrow_mut().take().expect("completed").expect("reset");

    let o = Rc::clone(&out);
    module.get_stats("cache1", move |r| *o.borrow_mut() = Some(r));
    reactor.run_until_idle();
    let stats = out.borrow_mut().take().expect("completed").expect("stats");
    assert_eq!(stats["requests"]["total"]["count"], 0);
}

#[test]
fn core_remove_drops_metadata_entry() {
    let (reactor, registry, module) = cached_pair(None);
    let engine_cache = module
        .find_cache_ctx("cache1")
        .and_then(|c| c.engine_cache())
        .expect("engine cache");

    let (out, cb) = slot();
    module.core_remove("core1", cb);
    reactor.run_until_idle();
    out.borrow_mut().take().expect("completed").expect("remove");

    assert!(registry.lookup("core1").is_none());
    assert!(module.find_vbdev("core1").is_none());
    assert!(engine_cache.find_core("core1").is_none(), "metadata entry gone");
}

#[test]
fn waitlisted_core_remove_is_immediate() {
    let (reactor, _registry, module) = rig();
    let err = add_core(&module, &reactor, "core1", "cache1", "ghost").expect_err("deferred");
    assert!(err.is_deferred());

    let (out, cb) = slot();
    module.core_remove("core1", cb);
    reactor.run_until_idle();
    out.borrow_mut().take().expect("completed").expect("remove from waitlist");
    assert_eq!(module.waitlist_len(), 0);
}

#[test]
fn fini_stops_every_cache_and_releases_waitlist() {
    let (reactor, registry, module) = cached_pair(None);
    let err = add_core(&module, &reactor, "core2", "cache1", "ghost").expect_err("deferred");
    assert!(err.is_deferred());

    let finished = Rc::new(RefCell::new(false));
    let f = Rc::clone(&finished);
    module.fini_start(move || *f.borrow_mut() = true);
    reactor.run_until_idle();
    assert!(*finished.borrow());
    assert!(registry.lookup("core1").is_none());
    assert_eq!(module.cache_ctxs().len(), 0);

    module.fini();
    assert_eq!(module.waitlist_len(), 0);

    // Management is rejected once shutdown began.
    let err = start_cache(&module, &reactor, "cache2", None, None).expect_err("shut down");
    assert_eq!(err.to_errno(), libc::EPERM);
}

#[test]
fn config_dump_rebuilds_the_setup() {
    let (_reactor, _registry, module) = cached_pair(Some("wb"));
    let dump = module.config_dump();
    assert_eq!(dump.len(), 2);
    assert_eq!(dump[0]["method"], "cadev_cache_start");
    assert_eq!(dump[0]["params"]["name"], "cache1");
    assert_eq!(dump[0]["params"]["mode"], "wb");
    assert_eq!(dump[0]["params"]["device"], "cdev");
    assert_eq!(dump[1]["method"], "cadev_core_add");
    assert_eq!(dump[1]["params"]["cache_name"], "cache1");
    assert_eq!(dump[1]["params"]["device"], "core-dev");
}

#[test]
fn get_bdevs_filters_by_name_and_counts_cores() {
    let (reactor, _registry, module) = cached_pair(None);
    assert_eq!(module.get_bdevs(None).len(), 2);

    let dump = module.get_bdevs(Some("cache1"));
    assert_eq!(dump.len(), 1);
    assert_eq!(dump[0]["name"], "cache1");
    assert_eq!(dump[0]["cache"]["cores_count"], 1);

    let dump = module.get_bdevs(Some("core1"));
    assert_eq!(dump.len(), 1);
    assert_eq!(dump[0]["name"], "core1");

    let (out, cb) = slot();
    module.core_remove("core1", cb);
    reactor.run_until_idle();
    out.borrow_mut().take().expect("completed").expect("remove");
    let dump = module.get_bdevs(Some("cache1"));
    assert_eq!(dump[0]["cache"]["cores_count"], 0);
}

#[test]
fn get_bdevs_shows_waitlisted_entries_unstarted() {
    let (reactor, _registry, module) = rig();
    let err = add_core(&module, &reactor, "core1", "cache1", "ghost").expect_err("deferred");
    assert!(err.is_deferred());
    let dump = module.get_bdevs(None);
    assert_eq!(dump.len(), 1);
    assert_eq!(dump[0]["name"], "core1");
    assert_eq!(dump[0]["started"], false);
}

#[test]
fn deferred_error_is_not_a_failure_classification() {
    let err = CadevError::Deferred("dev".to_string());
    assert!(err.is_deferred());
    assert!(!CadevError::Invalid("x".to_string()).is_deferred());
}
