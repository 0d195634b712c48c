#![forbid(unsafe_code)]

//! Shared plain types for the cadev stack: cache/policy enums with their
//! canonical string tables, validated cache line sizes, configuration
//! snapshots, and the parameter-change structs used by the management
//! surface.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

/// Default sequential cutoff threshold, in KiB.
pub const DEFAULT_SEQCUTOFF_THRESHOLD_KIB: u32 = 1024;

// ── Cache mode ────────────────────────────────────────────────────────────

/// Operating mode of a cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Write-through: writes go to both cache and core.
    Wt,
    /// Write-back: writes hit the cache and are cleaned later.
    Wb,
    /// Write-around: only reads are cached.
    Wa,
    /// Pass-through: caching suspended.
    Pt,
    /// Write-invalidate.
    Wi,
    /// Write-only.
    Wo,
}

impl CacheMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheMode::Wt => "wt",
            CacheMode::Wb => "wb",
            CacheMode::Wa => "wa",
            CacheMode::Pt => "pt",
            CacheMode::Wi => "wi",
            CacheMode::Wo => "wo",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "wt" => Some(CacheMode::Wt),
            "wb" => Some(CacheMode::Wb),
            "wa" => Some(CacheMode::Wa),
            "pt" => Some(CacheMode::Pt),
            "wi" => Some(CacheMode::Wi),
            "wo" => Some(CacheMode::Wo),
            _ => None,
        }
    }

    /// Modes that can hold dirty data and therefore require a flush before
    /// the cache (or a core) is torn down.
    pub fn is_dirty_capable(self) -> bool {
        matches!(self, CacheMode::Wb | CacheMode::Wo)
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Cleaning policy ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleaningPolicy {
    Nop,
    Alru,
    Acp,
}

impl CleaningPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            CleaningPolicy::Nop => "nop",
            CleaningPolicy::Alru => "alru",
            CleaningPolicy::Acp => "acp",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "nop" => Some(CleaningPolicy::Nop),
            "alru" => Some(CleaningPolicy::Alru),
            "acp" => Some(CleaningPolicy::Acp),
            _ => None,
        }
    }
}

impl fmt::Display for CleaningPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Promotion policy ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromotionPolicy {
    Always,
    Nhit,
}

impl PromotionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            PromotionPolicy::Always => "always",
            PromotionPolicy::Nhit => "nhit",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "always" => Some(PromotionPolicy::Always),
            "nhit" => Some(PromotionPolicy::Nhit),
            _ => None,
        }
    }
}

// ── Sequential cutoff policy ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeqCutoffPolicy {
    Always,
    Full,
    Never,
}

impl SeqCutoffPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            SeqCutoffPolicy::Always => "always",
            SeqCutoffPolicy::Full => "full",
            SeqCutoffPolicy::Never => "never",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "always" => Some(SeqCutoffPolicy::Always),
            "full" => Some(SeqCutoffPolicy::Full),
            "never" => Some(SeqCutoffPolicy::Never),
            _ => None,
        }
    }
}

// ── Cache line size ───────────────────────────────────────────────────────

/// Validated cache line size. Only 4, 8, 16, 32 and 64 KiB lines exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheLineSize(u64);

impl CacheLineSize {
    pub const DEFAULT: CacheLineSize = CacheLineSize(4 * KIB);

    pub fn new(bytes: u64) -> Option<Self> {
        match bytes / KIB {
            4 | 8 | 16 | 32 | 64 if bytes % KIB == 0 => Some(CacheLineSize(bytes)),
            _ => None,
        }
    }

    /// Interpret a raw management-input value: 0 means "default", other
    /// values are validated line sizes in KiB or bytes.
    pub fn from_param(value: u64) -> Option<Self> {
        if value == 0 {
            return Some(Self::DEFAULT);
        }
        // Accept either KiB units (4..64) or byte units (4096..65536).
        Self::new(value * KIB).or_else(|| Self::new(value))
    }

    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl Default for CacheLineSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ── Configuration snapshots ───────────────────────────────────────────────

/// Logical cache configuration captured at start time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub name: String,
    pub mode: CacheMode,
    pub line_size: CacheLineSize,
    /// Started under the exclusive management lock; released only when the
    /// start flow finishes.
    pub locked: bool,
}

impl CacheConfig {
    pub fn new(name: &str, mode: CacheMode, line_size: CacheLineSize) -> Self {
        CacheConfig {
            name: name.to_string(),
            mode,
            line_size,
            locked: true,
        }
    }
}

/// Device attach configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachConfig {
    /// Name of the host block device backing the cache.
    pub device_name: String,
    /// When true, never load existing metadata; attach fresh.
    pub force_no_load: bool,
    /// Cores present in loaded metadata are not opened by the engine; the
    /// shim reconciles them itself through the waitlist.
    pub open_cores: bool,
    /// Discard the cache device before attach.
    pub discard_on_start: bool,
}

impl AttachConfig {
    pub fn new(device_name: &str, force_no_load: bool) -> Self {
        AttachConfig {
            device_name: device_name.to_string(),
            force_no_load,
            open_cores: false,
            discard_on_start: false,
        }
    }
}

/// Core (backing volume) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub name: String,
    pub device_name: String,
    /// Join an existing metadata entry instead of a fresh add.
    pub try_add: bool,
}

impl CoreConfig {
    pub fn new(name: &str, device_name: &str) -> Self {
        CoreConfig {
            name: name.to_string(),
            device_name: device_name.to_string(),
            try_add: false,
        }
    }
}

// ── Parameter-change structs ──────────────────────────────────────────────

/// Cleaning policy parameters. `None` fields are left unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningParams {
    pub wake_up_ms: Option<u32>,
    pub staleness_time_s: Option<u32>,
    pub flush_max_buffers: Option<u32>,
    pub activity_threshold_ms: Option<u32>,
    pub max_buffers: Option<u32>,
}

/// Promotion policy parameters. `None` fields are left unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionParams {
    pub insertion_threshold: Option<u32>,
    pub trigger_threshold: Option<u32>,
}

/// Sequential cutoff parameters. Threshold is given in KiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqCutoffParams {
    pub policy: Option<SeqCutoffPolicy>,
    pub threshold_kib: Option<u32>,
    pub promotion_count: Option<u32>,
}

// ── Flush status ──────────────────────────────────────────────────────────

/// Background flush progress, surfaced in device dumps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushStatus {
    pub in_progress: bool,
    /// Engine status of the last completed flush, if any.
    pub last_status: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_mode_names_round_trip() {
        for mode in [
            CacheMode::Wt,
            CacheMode::Wb,
            CacheMode::Wa,
            CacheMode::Pt,
            CacheMode::Wi,
            CacheMode::Wo,
        ] {
            assert_eq!(CacheMode::from_name(mode.as_str()), Some(mode));
        }
        assert_eq!(CacheMode::from_name("writeback"), None);
    }

    #[test]
    fn dirty_capable_modes() {
        assert!(CacheMode::Wb.is_dirty_capable());
        assert!(CacheMode::Wo.is_dirty_capable());
        assert!(!CacheMode::Wt.is_dirty_capable());
        assert!(!CacheMode::Pt.is_dirty_capable());
    }

    #[test]
    fn line_size_validation() {
        assert_eq!(CacheLineSize::new(4 * KIB), Some(CacheLineSize::DEFAULT));
        assert!(CacheLineSize::new(64 * KIB).is_some());
        assert!(CacheLineSize::new(3 * KIB).is_none());
        assert!(CacheLineSize::new(128 * KIB).is_none());
    }

    #[test]
    fn line_size_param_units() {
        // 0 selects the default.
        assert_eq!(CacheLineSize::from_param(0), Some(CacheLineSize::DEFAULT));
        // KiB units.
        assert_eq!(
            CacheLineSize::from_param(16).map(CacheLineSize::bytes),
            Some(16 * KIB)
        );
        // Byte units.
        assert_eq!(
            CacheLineSize::from_param(65536).map(CacheLineSize::bytes),
            Some(64 * KIB)
        );
        assert_eq!(CacheLineSize::from_param(7), None);
    }

    #[test]
    fn policy_name_lookup() {
        assert_eq!(CleaningPolicy::from_name("alru"), Some(CleaningPolicy::Alru));
        assert_eq!(PromotionPolicy::from_name("nhit"), Some(PromotionPolicy::Nhit));
        assert_eq!(SeqCutoffPolicy::from_name("never"), Some(SeqCutoffPolicy::Never));
        assert_eq!(SeqCutoffPolicy::from_name(""), None);
    }
}
