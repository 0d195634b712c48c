//! Device and configuration dumps.
//!
//! `get_bdevs` renders every entity the module knows about, including the
//! ones that are not exposed devices yet: waitlisted cores show up with
//! `started: false`, and inactive shells from loaded metadata with
//! `loading: true` until their device arrives.

use crate::cache::DeviceState;
use crate::module::Module;
use serde_json::{json, Value};

impl Module {
    /// Dump cache entities and cores. `name` narrows the dump to one
    /// entity (and, for a cache, its metadata shells); `None` dumps
    /// everything the module tracks.
    pub fn get_bdevs(&self, name: Option<&str>) -> Vec<Value> {
        let wants = |n: &str| name.is_none() || name == Some(n);
        let mut out = Vec::new();
        for ctx in self.cache_ctxs() {
            if !wants(ctx.name()) {
                continue;
            }
            let attached = ctx.device_state() == DeviceState::Attached;
            let mode = ctx
                .engine_cache()
                .map(|c| c.mode().as_str().to_string())
                .unwrap_or_default();
            let cores_count = ctx.engine_cache().map_or(0, |c| c.core_count());
            out.push(json!({
                "name": ctx.name(),
                "started": true,
                "cache": {
                    "attached": attached,
                    "device": ctx.attach_cfg().map(|a| a.device_name),
                    "mode": mode,
                    "cores_count": cores_count,
                },
            }));
            // Cores recorded in metadata but not yet rejoined.
            if let Some(engine_cache) = ctx.engine_cache() {
                for core in engine_cache.cores() {
                    if !core.is_active() && !core.is_bound() {
                        out.push(json!({
                            "name": core.name(),
                            "cache_name": ctx.name(),
                            "started": false,
                            "loading": true,
                            "core": { "device": core.uuid() },
                        }));
                    }
                }
            }
        }
        for v in self.vbdevs() {
            if !wants(v.name()) {
                continue;
            }
            let flush = v.flush_status();
            out.push(json!({
                "name": v.name(),
                "cache_name": v.cache_name(),
                "started": v.is_registered(),
                "core": {
                    "device": v.cfg().device_name,
                    "flush_in_progress": flush.in_progress,
                    "flush_status": flush.last_status,
                },
            }));
        }
        for v in self.waitlist() {
            if !wants(v.name()) {
                continue;
            }
            out.push(json!({
                "name": v.name(),
                "cache_name": v.cache_name(),
                "started": false,
                "core": { "device": v.cfg().device_name },
            }));
        }
        out
    }

    /// Dump the configuration as the RPC calls that would recreate it.
    pub fn config_dump(&self) -> Vec<Value> {
        let mut out = Vec::new();
        for ctx in self.cache_ctxs() {
            let cfg = ctx.cfg();
            let mode = ctx
                .engine_cache()
                .map_or(cfg.mode, |c| c.mode());
            out.push(json!({
                "method": "cadev_cache_start",
                "params": {
                    "name": ctx.name(),
                    "mode": mode.as_str(),
                    "line_size": cfg.line_size.bytes(),
                    "device": ctx.attach_cfg().map(|a| a.device_name),
                },
            }));
        }
        for v in self.vbdevs().into_iter().chain(self.waitlist()) {
            out.push(json!({
                "method": "cadev_core_add",
                "params": {
                    "name": v.name(),
                    "cache_name": v.cache_name(),
                    "device": v.cfg().device_name,
                },
            }));
        }
        out
    }
}
