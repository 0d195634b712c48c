//! Statistics presentation.
//!
//! Shapes an engine [`StatsSnapshot`] into the JSON reported over RPC.
//! Every entry carries the raw count, its share of the relevant total as a
//! percentage with one decimal place, and the unit it is counted in.

use cadev_engine::{IoCounters, StatsSnapshot};
use serde_json::{json, Value};

/// Integer-only fixed-point percentage, one decimal place, no float drift.
fn percentage(part: u64, total: u64) -> String {
    if total == 0 {
        return "0.0".to_string();
    }
    let scaled = part * 1000 / total;
    format!("{}.{}", scaled / 10, scaled % 10)
}

fn entry(count: u64, total: u64, units: &str) -> Value {
    json!({
        "count": count,
        "percentage": percentage(count, total),
        "units": units,
    })
}

fn io_group(io: &IoCounters, total_requests: u64, total_blocks: u64) -> (Value, Value, Value) {
    let requests = json!({
        "rd": entry(io.read_requests, total_requests, "Requests"),
        "wr": entry(io.write_requests, total_requests, "Requests"),
        "total": entry(io.total_requests(), total_requests, "Requests"),
    });
    let blocks = json!({
        "rd": entry(io.read_blocks, total_blocks, "4KiB blocks"),
        "wr": entry(io.write_blocks, total_blocks, "4KiB blocks"),
        "total": entry(io.total_blocks(), total_blocks, "4KiB blocks"),
    });
    let errors = json!({
        "rd": entry(io.read_errors, io.total_errors(), "Requests"),
        "wr": entry(io.write_errors, io.total_errors(), "Requests"),
        "total": entry(io.total_errors(), io.total_errors(), "Requests"),
    });
    (requests, blocks, errors)
}

/// Render a snapshot as the four reported groups: usage, requests, blocks
/// and errors.
pub fn stats_json(snap: &StatsSnapshot) -> Value {
    let total_lines = snap.usage.occupancy + snap.usage.free;
    let usage = json!({
        "occupancy": entry(snap.usage.occupancy, total_lines, "4KiB blocks"),
        "free": entry(snap.usage.free, total_lines, "4KiB blocks"),
        "clean": entry(snap.usage.clean, snap.usage.occupancy, "4KiB blocks"),
        "dirty": entry(snap.usage.dirty, snap.usage.occupancy, "4KiB blocks"),
    });

    let total_requests =
        snap.counters.cached.total_requests() + snap.counters.pass_through.total_requests();
    let total_blocks =
        snap.counters.core_volume.total_blocks() + snap.counters.cache_volume.total_blocks();

    let (cached_req, _, cached_err) = io_group(&snap.counters.cached, total_requests, total_blocks);
    let (pt_req, _, _) = io_group(&snap.counters.pass_through, total_requests, total_blocks);
    let (_, core_blk, core_err) = io_group(&snap.counters.core_volume, total_requests, total_blocks);
    let (_, cache_blk, cache_err) =
        io_group(&snap.counters.cache_volume, total_requests, total_blocks);

    let requests = json!({
        "cached": cached_req,
        "pass_through": pt_req,
        "flush": entry(snap.counters.flush_requests, total_requests, "Requests"),
        "discard": entry(snap.counters.discard_requests, total_requests, "Requests"),
        "total": entry(total_requests, total_requests, "Requests"),
    });
    let blocks = json!({
        "core_volume": core_blk,
        "cache_volume": cache_blk,
        "total": entry(total_blocks, total_blocks, "4KiB blocks"),
    });
    let total_errors = snap.counters.core_volume.total_errors()
        + snap.counters.cache_volume.total_errors()
        + snap.counters.cached.total_errors();
    let errors = json!({
        "cached": cached_err,
        "core_volume": core_err,
        "cache_volume": cache_err,
        "total": entry(total_errors, total_errors, "Requests"),
    });

    json!({
        "usage": usage,
        "requests": requests,
        "blocks": blocks,
        "errors": errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_has_one_decimal_place() {
        assert_eq!(percentage(0, 0), "0.0");
        assert_eq!(percentage(1, 3), "33.3");
        assert_eq!(percentage(1, 2), "50.0");
        assert_eq!(percentage(7, 7), "100.0");
    }

    #[test]
    fn groups_are_present_and_percentages_sum() {
        let mut snap = StatsSnapshot::default();
        snap.usage.occupancy = 10;
        snap.usage.free = 30;
        snap.usage.clean = 6;
        snap.usage.dirty = 4;
        snap.counters.cached.read_requests = 3;
        snap.counters.pass_through.write_requests = 1;
        let v = stats_json(&snap);
        assert_eq!(v["usage"]["occupancy"]["count"], 10);
        assert_eq!(v["usage"]["occupancy"]["percentage"], "25.0");
        assert_eq!(v["usage"]["dirty"]["percentage"], "40.0");
        assert_eq!(v["requests"]["cached"]["rd"]["percentage"], "75.0");
        assert_eq!(v["requests"]["total"]["count"], 4);
        assert_eq!(v["blocks"]["total"]["count"], 0);
        assert_eq!(v["errors"]["total"]["count"], 0);
    }
}
