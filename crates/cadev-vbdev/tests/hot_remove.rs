#![forbid(unsafe_code)]

use cadev_bdev::{MemBdev, Reactor, Registry};
use cadev_error::Result;
use cadev_vbdev::{CacheStartRequest, CoreAddRequest, DeviceState, Module};
use std::cell::RefCell;
use std::rc::Rc;

type Outcome = Rc<RefCell<Option<Result<()>>>>;

fn slot() -> (Outcome, impl FnOnce(Result<()>) + 'static) {
    let out: Outcome = Rc::new(RefCell::new(None));
    let o = Rc::clone(&out);
    (out, move |r| *o.borrow_mut() = Some(r))
}

fn cached_pair() -> (Reactor, Registry, Module) {
    let reactor = Reactor::new();
    let registry = Registry::new(reactor.clone());
    let module = Module::new(&registry);
    MemBdev::create(&registry, "cdev", 512, 4096).expect("cdev");
    MemBdev::create(&registry, "core-dev", 512, 4096).expect("core-dev");
    reactor.run_until_idle();

    let (out, cb) = slot();
    module.cache_start(
        CacheStartRequest {
            name: "cache1".to_string(),
            mode: Some("wb".to_string()),
            line_size: 0,
            device: Some("cdev".to_string()),
            force_no_load: false,
        },
        cb,
    );
    reactor.run_until_idle();
    out.borrow_mut().take().expect("completed").expect("start");

    let (out, cb) = slot();
    module.core_add(
        CoreAddRequest {
            name: "core1".to_string(),
            cache_name: "cache1".to_string(),
            device: "core-dev".to_string(),
        },
        cb,
    );
    reactor.run_until_idle();
    out.borrow_mut().take().expect("completed").expect("add core");
    (reactor, registry, module)
}

#[test]
fn core_device_removal_keeps_shell_and_revives() {
    let (reactor, registry, module) = cached_pair();
    let engine_cache = module
        .find_cache_ctx("cache1")
        .and_then(|c| c.engine_cache())
        .expect("engine cache");

    registry.hot_remove("core-dev");
    reactor.run_until_idle();

    // The exposed device is gone but the cache keeps the core as an
    // inactive shell, waiting for the device to come back.
    assert!(registry.lookup("core1").is_none());
    assert!(module.find_vbdev("core1").is_none());
    let shell = engine_cache.find_core("core1").expect("shell");
    assert!(!shell.is_active());
    assert!(!shell.is_bound());

    // The device returns: examine rejoins it without any RPC.
    MemBdev::create(&registry, "core-dev", 512, 4096).expect("core-dev again");
    reactor.run_until_idle();
    assert!(registry.lookup("core1").is_some());
    assert_eq!(module.waitlist_len(), 0);
    let core = engine_cache.find_core("core1").expect("core");
    assert!(core.is_active());
    assert_eq!(registry.examines_in_progress(), 0);
}

#[test]
fn cache_device_removal_degrades_then_reattaches() {
    let (reactor, registry, module) = cached_pair();
    let ctx = module.find_cache_ctx("cache1").expect("cache ctx");

    registry.hot_remove("cdev");
    reactor.run_until_idle();

    // The cache entity survives device-less; the exposed device keeps
    // serving in pass-through.
    assert_eq!(ctx.device_state(), DeviceState::Detached);
    assert!(registry.lookup("core1").is_some());
    assert_eq!(ctx.base().volume_refs(), 0);

    MemBdev::create(&registry, "cdev", 512, 4096).expect("cdev again");
    reactor.run_until_idle();
    assert_eq!(ctx.device_state(), DeviceState::Attached);
    // The live core survived the load of the persisted metadata.
    let core = ctx
        .engine_cache()
        .and_then(|c| c.find_core("core1"))
        .expect("core");
    assert!(core.is_active());
    assert_eq!(registry.examines_in_progress(), 0);
}

#[test]
fn explicit_detach_wins_over_concurrent_removal() {
    let (reactor, registry, module) = cached_pair();
    let ctx = module.find_cache_ctx("cache1").expect("cache ctx");

    // The detach claims the state transition before the removal event
    // runs; the removal handler backs off instead of unwinding twice.
    let (out, cb) = slot();
    module.cache_detach("cache1", cb);
    registry.hot_remove("cdev");
    reactor.run_until_idle();

    out.borrow_mut().take().expect("completed").expect("detach");
    assert_eq!(ctx.device_state(), DeviceState::Detached);
    assert!(!ctx.base().is_attached());
}

#[test]
fn waitlisted_entity_survives_device_removal() {
    let reactor = Reactor::new();
    let registry = Registry::new(reactor.clone());
    let module = Module::new(&registry);
    MemBdev::create(&registry, "core-dev", 512, 4096).expect("core-dev");
    reactor.run_until_idle();

    let (out, cb) = slot();
    module.core_add(
        CoreAddRequest {
            name: "core1".to_string(),
            cache_name: "nocache".to_string(),
            device: "core-dev".to_string(),
        },
        cb,
    );
    reactor.run_until_idle();
    let err = out
        .borrow_mut()
        .take()
        .expect("completed")
        .expect_err("cache absent");
    assert!(err.is_deferred());

    // The claimed base goes away; the entity stays parked and the base
    // is released so the device can unregister cleanly.
    registry.hot_remove("core-dev");
    reactor.run_until_idle();
    assert_eq!(module.waitlist_len(), 1);
    let v = module.find_waitlisted("core1").expect("waitlisted");
    assert!(!v.base().is_attached());
    assert!(registry.lookup("core-dev").is_none());
}
