//! Volume adapter: presents base-device bindings to the engine.
//!
//! The engine only knows volumes. [`AdapterFactory`] is registered as the
//! engine's volume type at module init and resolves a uuid (a host device
//! name) to the binding currently holding that device. Each open volume
//! takes a reference on its binding; references must balance by teardown.

use crate::module::Module;
use cadev_bdev::{IoCompletion, IoRequest};
use cadev_engine::{Volume, VolumeFactory};
use cadev_error::{CadevError, Result};
use crate::base::Binding;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct AdapterVolume {
    binding: Arc<Binding>,
    closed: Mutex<bool>,
}

impl AdapterVolume {
    fn new(binding: Arc<Binding>) -> Arc<Self> {
        binding.volume_ref_get();
        Arc::new(AdapterVolume {
            binding,
            closed: Mutex::new(false),
        })
    }
}

impl Volume for AdapterVolume {
    fn uuid(&self) -> String {
        self.binding.device_name()
    }

    fn length(&self) -> u64 {
        self.binding.size_bytes()
    }

    fn block_size(&self) -> u32 {
        self.binding.block_size()
    }

    fn submit(&self, io: IoRequest, complete: IoCompletion) {
        self.binding.submit(io, complete);
    }

    fn close(&self) {
        let mut closed = self.closed.lock();
        if !*closed {
            *closed = true;
            self.binding.volume_ref_put();
        }
    }
}

/// Resolves volume uuids against the module's bindings.
pub struct AdapterFactory {
    module: Module,
}

impl AdapterFactory {
    pub fn new(module: Module) -> Arc<Self> {
        Arc::new(AdapterFactory { module })
    }
}

impl VolumeFactory for AdapterFactory {
    fn open(&self, uuid: &str) -> Result<Arc<dyn Volume>> {
        let binding = self
            .module
            .find_binding(uuid)
            .ok_or_else(|| CadevError::Deferred(uuid.to_string()))?;
        if !binding.is_attached() {
            return Err(CadevError::Deferred(uuid.to_string()));
        }
        Ok(AdapterVolume::new(binding))
    }
}

/// The attach-time configuration volume: created before a device attach or
/// load, destroyed exactly once by the first callback that observes the
/// attach outcome. Dropping it undestroyed is a bug.
pub struct ConfigVolume {
    volume: Arc<dyn Volume>,
}

impl ConfigVolume {
    pub fn create(module: &Module, uuid: &str) -> Result<Self> {
        let volume = module.engine().volume_open(uuid)?;
        Ok(ConfigVolume { volume })
    }

    pub fn destroy(self) {
        self.volume.close();
    }
}
