#![forbid(unsafe_code)]
//! Error taxonomy for cadev.
//!
//! # Error Model
//!
//! cadev uses a two-layer error model:
//!
//! | Layer | Type | Purpose |
//! |-------|------|---------|
//! | Shim | `CadevError` (this crate) | User-facing errors for management calls, mapped to POSIX errnos |
//! | Engine | `EngineError` (this crate) | Cache-engine failures, reported in a code range disjoint from errnos |
//!
//! Management completions carry a single `libc::c_int` status: `0` for
//! success, a positive POSIX errno for shim-level failures, or a value in the
//! reserved engine range (`2_000_000..`) for engine failures propagated
//! verbatim. Callers can therefore always distinguish "the host stack
//! rejected this" from "the cache engine rejected this".
//!
//! ## errno Mapping
//!
//! Every `CadevError` variant maps to exactly one status via
//! [`CadevError::to_errno`]. The mapping is exhaustive (no wildcard arms) so
//! adding a new variant is a compile error until its status is assigned.
//!
//! | Variant | status | Meaning |
//! |---------|--------|---------|
//! | `OutOfMemory` | `ENOMEM` | Allocation failure; the whole flow unwinds |
//! | `Deferred` | `ENODEV` | A required base device is absent; state is parked, not failed |
//! | `NotFound` | `ENXIO` | The named cache or core does not exist |
//! | `Exists` | `EEXIST` | The name collides with a waitlisted core, cache, core, or host device |
//! | `Already` | `EALREADY` | The operation is a no-op in the current state (e.g. detach when detached) |
//! | `ShuttingDown` | `EPERM` | The module is past `fini_start`; management is closed |
//! | `Unsupported` | `ENOTSUP` | Incompatible geometry or stacking (core block size below cache's, cache-on-cache) |
//! | `Interrupted` | `EINTR` | A pending waitlist entry was abandoned at shutdown |
//! | `Invalid` | `EINVAL` | Malformed management input (bad mode name, bad line size) |
//! | `Engine(e)` | `e.code()` | Engine failure, reserved range |
//!
//! `Deferred` deserves emphasis: it is a *status*, not a failure. The entity
//! it accompanies remains registered (on the waitlist, or as a device-less
//! cache) and is completed later by examine reconciliation.

use thiserror::Error;

/// Base of the reserved cache-engine status range. Chosen well above any
/// POSIX errno so the two domains never collide.
pub const ENGINE_ERROR_BASE: libc::c_int = 2_000_000;

/// Cache-engine failure codes, disjoint from POSIX errnos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The device holds no recognizable cache metadata.
    #[error("no cache metadata found on device")]
    NoMetadata,
    /// The cache exists but has no device attached.
    #[error("cache device is detached")]
    CacheDetached,
    /// The engine could not allocate internal structures.
    #[error("cache engine out of memory")]
    NoMem,
    /// The named core is not part of this cache.
    #[error("core not found in cache")]
    CoreNotFound,
    /// The cache already contains a core with this name.
    #[error("core already exists in cache")]
    CoreExists,
    /// Metadata on the device does not match the requested configuration.
    #[error("cache metadata mismatch")]
    MetadataMismatch,
    /// The cache is stopping and cannot accept the operation.
    #[error("cache is stopping")]
    Stopping,
}

impl EngineError {
    /// Status code in the reserved engine range.
    #[must_use]
    pub fn code(self) -> libc::c_int {
        ENGINE_ERROR_BASE
            + match self {
                EngineError::NoMetadata => 1,
                EngineError::CacheDetached => 2,
                EngineError::NoMem => 3,
                EngineError::CoreNotFound => 4,
                EngineError::CoreExists => 5,
                EngineError::MetadataMismatch => 6,
                EngineError::Stopping => 7,
            }
    }
}

/// Unified error type for all cadev management operations.
///
/// This is the canonical error type crossing the management API boundary.
/// Engine-internal failures are wrapped in [`CadevError::Engine`] and keep
/// their reserved-range code through [`CadevError::to_errno`].
#[derive(Debug, Error)]
pub enum CadevError {
    /// Allocation failure. The flow that hit it unwinds completely.
    #[error("out of memory")]
    OutOfMemory,

    /// A required base device is not present. The operation is parked, not
    /// failed: the entity stays registered and examine reconciliation
    /// completes it when the device appears.
    #[error("base device {0:?} not present, operation deferred")]
    Deferred(String),

    /// The named cache or core does not exist.
    #[error("no such cache or core: {0}")]
    NotFound(String),

    /// The requested name is already taken by a waitlisted core, a cache, a
    /// registered core, or a host block device.
    #[error("name already in use: {0}")]
    Exists(String),

    /// The operation is a no-op in the current state.
    #[error("operation already done or in progress")]
    Already,

    /// Module shutdown has begun; no further management is accepted.
    #[error("module is shutting down")]
    ShuttingDown,

    /// Incompatible device geometry or stacking.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// A deferred operation was abandoned because the module shut down
    /// before its base device appeared.
    #[error("pending operation interrupted by shutdown")]
    Interrupted,

    /// Malformed management input.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Cache-engine failure, propagated verbatim.
    #[error("cache engine error: {0}")]
    Engine(#[from] EngineError),
}

impl CadevError {
    /// Convert this error into the status integer carried by management
    /// completions.
    ///
    /// The mapping is exhaustive. Engine errors keep their reserved-range
    /// code so callers can tell the two domains apart.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::OutOfMemory => libc::ENOMEM,
            Self::Deferred(_) => libc::ENODEV,
            Self::NotFound(_) => libc::ENXIO,
            Self::Exists(_) => libc::EEXIST,
            Self::Already => libc::EALREADY,
            Self::ShuttingDown => libc::EPERM,
            Self::Unsupported(_) => libc::ENOTSUP,
            Self::Interrupted => libc::EINTR,
            Self::Invalid(_) => libc::EINVAL,
            Self::Engine(e) => e.code(),
        }
    }

    /// True when the status reports a parked (deferred) operation rather
    /// than a hard failure.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}

/// Result alias using `CadevError`.
pub type Result<T> = std::result::Result<T, CadevError>;

/// Render a completion status for logging: `0` is "OK", errnos and engine
/// codes print numerically.
#[must_use]
pub fn status_of(result: &Result<()>) -> libc::c_int {
    match result {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(CadevError, libc::c_int)> = vec![
            (CadevError::OutOfMemory, libc::ENOMEM),
            (CadevError::Deferred("base0".into()), libc::ENODEV),
            (CadevError::NotFound("cache1".into()), libc::ENXIO),
            (CadevError::Exists("core1".into()), libc::EEXIST),
            (CadevError::Already, libc::EALREADY),
            (CadevError::ShuttingDown, libc::EPERM),
            (CadevError::Unsupported("block size".into()), libc::ENOTSUP),
            (CadevError::Interrupted, libc::EINTR),
            (CadevError::Invalid("mode".into()), libc::EINVAL),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.to_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn engine_codes_disjoint_from_errnos() {
        for e in [
            EngineError::NoMetadata,
            EngineError::CacheDetached,
            EngineError::NoMem,
            EngineError::CoreNotFound,
            EngineError::CoreExists,
            EngineError::MetadataMismatch,
            EngineError::Stopping,
        ] {
            assert!(e.code() >= ENGINE_ERROR_BASE, "engine code in errno range");
            assert_eq!(CadevError::Engine(e).to_errno(), e.code());
        }
    }

    #[test]
    fn engine_codes_unique() {
        let codes = [
            EngineError::NoMetadata.code(),
            EngineError::CacheDetached.code(),
            EngineError::NoMem.code(),
            EngineError::CoreNotFound.code(),
            EngineError::CoreExists.code(),
            EngineError::MetadataMismatch.code(),
            EngineError::Stopping.code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn deferred_is_a_status_not_a_failure() {
        let e = CadevError::Deferred("base0".into());
        assert!(e.is_deferred());
        assert!(!CadevError::NotFound("x".into()).is_deferred());
    }

    #[test]
    fn display_formatting() {
        assert_eq!(
            CadevError::Exists("cache1".into()).to_string(),
            "name already in use: cache1"
        );
        assert_eq!(
            CadevError::Engine(EngineError::NoMetadata).to_string(),
            "cache engine error: no cache metadata found on device"
        );
        assert!(CadevError::Deferred("base0".into())
            .to_string()
            .contains("deferred"));
    }
}
