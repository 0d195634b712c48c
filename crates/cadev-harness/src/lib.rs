#![forbid(unsafe_code)]
//! In-process rig for driving the whole cadev stack.
//!
//! A [`Rig`] wires a reactor, a device registry and a module instance
//! together, backs them with RAM block devices, and turns the asynchronous
//! management surface into synchronous calls by running the reactor until
//! each operation reports its completion. The scenario functions at the
//! bottom exercise representative end-to-end flows and return serializable
//! reports; the CLI prints them and the conformance tests assert on them.

use anyhow::{ensure, Context, Result};
use cadev_bdev::{IoRequest, IoStatus, MemBdev, Reactor, Registry};
use cadev_engine::ProbeInfo;
use cadev_types::CleaningParams;
use cadev_vbdev::{CacheStartRequest, CoreAddRequest, Module};
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// One reactor, one registry, one module instance.
pub struct Rig {
    pub reactor: Reactor,
    pub registry: Registry,
    pub module: Module,
}

impl Default for Rig {
    fn default() -> Self {
        Self::new()
    }
}

impl Rig {
    pub fn new() -> Rig {
        let reactor = Reactor::new();
        let registry = Registry::new(reactor.clone());
        let module = Module::new(&registry);
        Rig {
            reactor,
            registry,
            module,
        }
    }

    /// Create a RAM block device and let examine settle.
    pub fn mem_bdev(&self, name: &str, block_size: u32, blocks: u64) -> cadev_error::Result<()> {
        MemBdev::create(&self.registry, name, block_size, blocks)?;
        self.settle();
        Ok(())
    }

    /// Run the reactor until no event or poller has work left.
    pub fn settle(&self) {
        self.reactor.run_until_idle();
    }

    /// Submit one management operation and run the reactor until its
    /// completion arrives.
    pub fn run_mngt(
        &self,
        submit: impl FnOnce(&Module, Box<dyn FnOnce(cadev_error::Result<()>)>),
    ) -> cadev_error::Result<()> {
        let out: Rc<RefCell<Option<cadev_error::Result<()>>>> = Rc::new(RefCell::new(None));
        let o = Rc::clone(&out);
        submit(&self.module, Box::new(move |r| *o.borrow_mut() = Some(r)));
        self.settle();
        let result = out.borrow_mut().take();
        match result {
            Some(r) => r,
            None => Err(cadev_error::CadevError::Interrupted),
        }
    }

    pub fn start_cache(
        &self,
        name: &str,
        device: Option<&str>,
        mode: Option<&str>,
    ) -> cadev_error::Result<()> {
        self.run_mngt(|m, cb| {
            m.cache_start(
                CacheStartRequest {
                    name: name.to_string(),
                    mode: mode.map(str::to_string),
                    line_size: 0,
                    device: device.map(str::to_string),
                    force_no_load: false,
                },
                cb,
            );
        })
    }

    pub fn add_core(&self, name: &str, cache_name: &str, device: &str) -> cadev_error::Result<()> {
        self.run_mngt(|m, cb| {
            m.core_add(
                CoreAddRequest {
                    name: name.to_string(),
                    cache_name: cache_name.to_string(),
                    device: device.to_string(),
                },
                cb,
            );
        })
    }

    pub fn stop_cache(&self, name: &str) -> cadev_error::Result<()> {
        self.run_mngt(|m, cb| m.cache_stop(name, cb))
    }

    pub fn detach_cache(&self, name: &str) -> cadev_error::Result<()> {
        self.run_mngt(|m, cb| m.cache_detach(name, cb))
    }

    pub fn attach_cache(&self, name: &str, device: &str) -> cadev_error::Result<()> {
        self.run_mngt(|m, cb| m.cache_attach(name, device, false, cb))
    }

    pub fn remove_core(&self, name: &str) -> cadev_error::Result<()> {
        self.run_mngt(|m, cb| m.core_remove(name, cb))
    }

    pub fn flush(&self, name: &str) -> cadev_error::Result<()> {
        self.run_mngt(|m, cb| m.flush_start(name, cb))
    }

    pub fn set_mode(&self, name: &str, mode: &str) -> cadev_error::Result<()> {
        self.run_mngt(|m, cb| m.set_cache_mode(name, mode, cb))
    }

    pub fn set_cleaning(
        &self,
        name: &str,
        policy: Option<&str>,
        params: CleaningParams,
    ) -> cadev_error::Result<()> {
        self.run_mngt(|m, cb| m.set_cleaning(name, policy, params, cb))
    }

    /// Probe a device for cache metadata and wait for the answer.
    pub fn probe(&self, device: &str) -> cadev_error::Result<ProbeInfo> {
        let out: Rc<RefCell<Option<cadev_error::Result<ProbeInfo>>>> = Rc::new(RefCell::new(None));
        let o = Rc::clone(&out);
        self.module
            .engine()
            .probe(device, move |r| *o.borrow_mut() = Some(r));
        self.settle();
        let result = out.borrow_mut().take();
        match result {
            Some(r) => r,
            None => Err(cadev_error::CadevError::Interrupted),
        }
    }

    /// Collect statistics for a cache or core as JSON.
    pub fn stats(&self, name: &str) -> cadev_error::Result<serde_json::Value> {
        let out: Rc<RefCell<Option<cadev_error::Result<serde_json::Value>>>> =
            Rc::new(RefCell::new(None));
        let o = Rc::clone(&out);
        self.module.get_stats(name, move |r| *o.borrow_mut() = Some(r));
        self.settle();
        let result = out.borrow_mut().take();
        match result {
            Some(r) => r,
            None => Err(cadev_error::CadevError::Interrupted),
        }
    }

    /// Write through an exposed device and report the I/O status.
    pub fn write(&self, bdev: &str, offset_blocks: u64, payload: Vec<u8>) -> IoStatus {
        self.io(bdev, IoRequest::write(offset_blocks, payload))
    }

    pub fn read(&self, bdev: &str, offset_blocks: u64, num_blocks: u64) -> IoStatus {
        self.io(bdev, IoRequest::read(offset_blocks, num_blocks))
    }

    fn io(&self, bdev: &str, request: IoRequest) -> IoStatus {
        let desc = match self.registry.open(bdev, || {}) {
            Ok(d) => d,
            Err(_) => return IoStatus::Failed,
        };
        let channel = match desc.get_io_channel() {
            Ok(ch) => ch,
            Err(_) => {
                desc.close();
                return IoStatus::Failed;
            }
        };
        let out = Rc::new(RefCell::new(None));
        let o = Rc::clone(&out);
        desc.submit(
            &channel,
            request,
            Box::new(move |status, _| *o.borrow_mut() = Some(status)),
        );
        self.settle();
        channel.put();
        desc.close();
        self.settle();
        let status = out.borrow_mut().take().unwrap_or(IoStatus::Failed);
        debug!(bdev, ?status, "harness I/O completed");
        status
    }

    /// Dirty cache lines currently held for a cache.
    pub fn dirty_lines(&self, cache: &str) -> u64 {
        self.module
            .find_cache_ctx(cache)
            .and_then(|c| c.engine_cache())
            .map_or(0, |c| c.dirty_lines())
    }
}

// ── Scenarios ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct WritebackReport {
    pub scenario: String,
    pub dirty_after_io: u64,
    pub dirty_after_flush: u64,
    pub stats: serde_json::Value,
    pub bdevs: Vec<serde_json::Value>,
}

/// Start a write-back cache over RAM devices, push I/O through two cores,
/// flush, and collect the reported state.
pub fn writeback_scenario() -> Result<WritebackReport> {
    let rig = Rig::new();
    rig.mem_bdev("cache-dev", 512, 8192).context("cache device")?;
    rig.mem_bdev("core-dev0", 512, 8192).context("core device 0")?;
    rig.mem_bdev("core-dev1", 512, 8192).context("core device 1")?;

    rig.start_cache("cache1", Some("cache-dev"), Some("wb"))
        .context("cache start")?;
    rig.add_core("core0", "cache1", "core-dev0").context("core0")?;
    rig.add_core("core1", "cache1", "core-dev1").context("core1")?;

    for core in ["core0", "core1"] {
        ensure!(
            rig.write(core, 0, vec![0xC4; 16384]) == IoStatus::Success,
            "write through {core} failed"
        );
        ensure!(
            rig.read(core, 0, 8) == IoStatus::Success,
            "read through {core} failed"
        );
    }
    let dirty_after_io = rig.dirty_lines("cache1");
    ensure!(dirty_after_io > 0, "write-back I/O left nothing dirty");

    rig.flush("cache1").context("flush")?;
    let dirty_after_flush = rig.dirty_lines("cache1");
    ensure!(dirty_after_flush == 0, "flush left dirty lines behind");

    let stats = rig.stats("cache1").context("stats")?;
    let bdevs = rig.module.get_bdevs(None);
    rig.stop_cache("cache1").context("stop")?;

    Ok(WritebackReport {
        scenario: "writeback".to_string(),
        dirty_after_io,
        dirty_after_flush,
        stats,
        bdevs,
    })
}

#[derive(Debug, Serialize)]
pub struct RecoveryReport {
    pub scenario: String,
    pub clean_shutdown: bool,
    pub cores_after_load: usize,
    pub inactive_after_load: usize,
    pub inactive_after_rejoin: usize,
}

/// Stop a cache with a core, restart it from the persisted metadata, and
/// rejoin the core into its shell.
pub fn recovery_scenario() -> Result<RecoveryReport> {
    let rig = Rig::new();
    rig.mem_bdev("cache-dev", 512, 8192).context("cache device")?;
    rig.mem_bdev("core-dev", 512, 8192).context("core device")?;
    rig.start_cache("cache1", Some("cache-dev"), Some("wt"))
        .context("first start")?;
    rig.add_core("core1", "cache1", "core-dev").context("add core")?;
    rig.stop_cache("cache1").context("stop")?;

    let probe = rig.probe("cache-dev").context("probe")?;
    ensure!(probe.cache_name == "cache1", "metadata names the wrong cache");

    rig.start_cache("cache1", Some("cache-dev"), None)
        .context("restart")?;
    let engine_cache = rig
        .module
        .find_cache_ctx("cache1")
        .and_then(|c| c.engine_cache())
        .context("engine cache after restart")?;
    let cores_after_load = engine_cache.core_count();
    let inactive_after_load = engine_cache.inactive_core_count();

    rig.add_core("core1", "cache1", "core-dev").context("rejoin")?;
    let inactive_after_rejoin = engine_cache.inactive_core_count();
    ensure!(inactive_after_rejoin == 0, "core failed to rejoin its shell");

    Ok(RecoveryReport {
        scenario: "recovery".to_string(),
        clean_shutdown: probe.clean_shutdown,
        cores_after_load,
        inactive_after_load,
        inactive_after_rejoin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writeback_scenario_passes() {
        let report = writeback_scenario().expect("scenario");
        assert!(report.dirty_after_io > 0);
        assert_eq!(report.dirty_after_flush, 0);
        assert_eq!(report.stats["requests"]["cached"]["wr"]["count"], 2);
    }

    #[test]
    fn recovery_scenario_passes() {
        let report = recovery_scenario().expect("scenario");
        assert!(report.clean_shutdown);
        assert_eq!(report.cores_after_load, 1);
        assert_eq!(report.inactive_after_load, 1);
        assert_eq!(report.inactive_after_rejoin, 0);
    }
}
