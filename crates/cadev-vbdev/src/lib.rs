#![forbid(unsafe_code)]
//! Cache shim: exposes cached block devices over the caching engine.
//!
//! The shim coordinates three worlds that complete asynchronously and in
//! any order: the host block-device layer (devices registering, being
//! examined, disappearing), the caching engine (caches, cores, locks,
//! metadata), and management RPCs. A [`Module`] instance owns the record
//! of every cache entity and exposed device, plus the waitlist of entities
//! whose dependencies have not shown up yet.
//!
//! Management flows live in [`mngt`]; each one reports exactly one
//! completion, distinguishes a dependency that is merely absent (deferred,
//! `ENODEV`, the entity stays parked) from a real failure (the flow
//! unwinds what it did), and never completes inline with submission.

mod base;
mod cache;
mod core;
mod dump;
mod io;
mod mngt;
mod module;
mod stats;
mod volume;

pub use base::Binding;
pub use cache::{CacheCtx, DeviceState};
pub use core::Vbdev;
pub use mngt::{CacheStartRequest, CoreAddRequest};
pub use module::{Module, PRODUCT_NAME};
pub use stats::stats_json;
