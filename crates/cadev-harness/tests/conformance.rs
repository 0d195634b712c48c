#![forbid(unsafe_code)]

use cadev_error::{CadevError, EngineError, ENGINE_ERROR_BASE};
use cadev_harness::Rig;
use proptest::prelude::*;
use std::cell::Cell;
use std::rc::Rc;

#[test]
fn engine_error_codes_stay_disjoint_from_errnos() {
    let codes = [
        EngineError::NoMetadata,
        EngineError::CacheDetached,
        EngineError::NoMem,
        EngineError::CoreNotFound,
        EngineError::CoreExists,
        EngineError::MetadataMismatch,
        EngineError::Stopping,
    ];
    for (i, a) in codes.iter().enumerate() {
        assert!(a.code() > ENGINE_ERROR_BASE, "{a:?} below the engine base");
        for b in &codes[i + 1..] {
            assert_ne!(a.code(), b.code(), "{a:?} and {b:?} collide");
        }
    }
    // An engine failure propagates its code verbatim as the errno.
    let err = CadevError::from(EngineError::NoMetadata);
    assert_eq!(err.to_errno(), EngineError::NoMetadata.code());
}

#[test]
fn every_operation_completes_exactly_once() {
    let rig = Rig::new();
    rig.mem_bdev("cache-dev", 512, 4096).expect("cache device");

    let count = Rc::new(Cell::new(0u32));
    let c = Rc::clone(&count);
    rig.module.cache_start(
        cadev_vbdev::CacheStartRequest {
            name: "cache1".to_string(),
            mode: None,
            line_size: 0,
            device: Some("cache-dev".to_string()),
            force_no_load: false,
        },
        move |_| c.set(c.get() + 1),
    );
    rig.settle();
    rig.settle();
    assert_eq!(count.get(), 1);

    // A failing operation also reports exactly once.
    let count = Rc::new(Cell::new(0u32));
    let c = Rc::clone(&count);
    rig.module.cache_stop("no-such-cache", move |_| c.set(c.get() + 1));
    rig.settle();
    rig.settle();
    assert_eq!(count.get(), 1);
}

#[test]
fn volume_references_balance_over_a_full_lifecycle() {
    let rig = Rig::new();
    rig.mem_bdev("cache-dev", 512, 8192).expect("cache device");
    rig.mem_bdev("core-dev", 512, 8192).expect("core device");
    rig.start_cache("cache1", Some("cache-dev"), Some("wb"))
        .expect("start");
    rig.add_core("core1", "cache1", "core-dev").expect("add core");

    let cache_base = std::sync::Arc::clone(
        rig.module.find_cache_ctx("cache1").expect("cache ctx").base(),
    );
    let core_base =
        std::sync::Arc::clone(rig.module.find_vbdev("core1").expect("vbdev").base());
    // Attached: the engine holds one volume per device, the config volume
    // is already gone.
    assert_eq!(cache_base.volume_refs(), 1);
    assert_eq!(core_base.volume_refs(), 1);

    assert_eq!(rig.write("core1", 0, vec![0xEE; 4096]), cadev_bdev::IoStatus::Success);
    rig.flush("cache1").expect("flush");
    rig.detach_cache("cache1").expect("detach");
    assert_eq!(cache_base.volume_refs(), 0);

    rig.attach_cache("cache1", "cache-dev").expect("reattach");
    assert_eq!(cache_base.volume_refs(), 1);

    rig.stop_cache("cache1").expect("stop");
    assert_eq!(cache_base.volume_refs(), 0);
    assert_eq!(core_base.volume_refs(), 0);
}

#[test]
fn deferred_add_reports_enodev_but_parks_the_entity() {
    let rig = Rig::new();
    let err = rig
        .add_core("core1", "cache1", "missing-dev")
        .expect_err("nothing exists yet");
    assert!(err.is_deferred());
    assert_eq!(err.to_errno(), libc::ENODEV);
    assert_eq!(rig.module.waitlist_len(), 1);

    // The same name cannot be parked twice.
    let err = rig
        .add_core("core1", "cache1", "missing-dev")
        .expect_err("duplicate");
    assert_eq!(err.to_errno(), libc::EEXIST);
    assert_eq!(rig.module.waitlist_len(), 1);
}

#[test]
fn cleaning_params_merge_field_by_field() {
    let rig = Rig::new();
    rig.mem_bdev("cache-dev", 512, 4096).expect("cache device");
    rig.start_cache("cache1", Some("cache-dev"), None).expect("start");

    let params = cadev_types::CleaningParams {
        wake_up_ms: Some(50),
        ..Default::default()
    };
    rig.set_cleaning("cache1", Some("acp"), params).expect("policy");
    let engine_cache = rig
        .module
        .find_cache_ctx("cache1")
        .and_then(|c| c.engine_cache())
        .expect("engine cache");
    assert_eq!(
        engine_cache.cleaning_policy(),
        cadev_types::CleaningPolicy::Acp
    );
    assert!(!engine_cache.is_locked(), "parameter change released the lock");
}

#[derive(Debug, Clone)]
enum WaitlistOp {
    Add(u8),
    Remove(u8),
}

fn waitlist_ops() -> impl Strategy<Value = Vec<WaitlistOp>> {
    proptest::collection::vec(
        prop_oneof![
            (0..8u8).prop_map(WaitlistOp::Add),
            (0..8u8).prop_map(WaitlistOp::Remove),
        ],
        0..24,
    )
}

proptest! {
    // Entities park in submission order and removals never disturb the
    // relative order of the rest; reconciliation depends on that.
    #[test]
    fn waitlist_preserves_submission_order(ops in waitlist_ops()) {
        let rig = Rig::new();
        let mut model: Vec<String> = Vec::new();
        for op in ops {
            match op {
                WaitlistOp::Add(n) => {
                    let name = format!("core{n}");
                    if model.contains(&name) {
                        continue;
                    }
                    let err = rig
                        .add_core(&name, "nocache", &format!("missing{n}"))
                        .expect_err("device absent");
                    prop_assert!(err.is_deferred());
                    model.push(name);
                }
                WaitlistOp::Remove(n) => {
                    let name = format!("core{n}");
                    if !model.contains(&name) {
                        continue;
                    }
                    rig.remove_core(&name).expect("remove parked entity");
                    model.retain(|m| m != &name);
                }
            }
        }
        let names: Vec<String> = rig
            .module
            .waitlist()
            .iter()
            .map(|v| v.name().to_string())
            .collect();
        prop_assert_eq!(names, model);
    }
}
