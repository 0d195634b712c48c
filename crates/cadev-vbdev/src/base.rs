//! Base-device bindings.
//!
//! A [`Binding`] ties one host block device to its role in the shim, as
//! either a cache device or a core device. It owns the open descriptor and
//! the claim, tracks adapter-volume references handed out over it, and
//! routes hot-removal notification to the handler installed at attach time.

use cadev_bdev::{IoChannel, IoCompletion, IoRequest, Registry};
use cadev_error::{CadevError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

struct BindingState {
    desc: Option<cadev_bdev::Descriptor>,
    channel: Option<IoChannel>,
    block_size: u32,
    block_count: u64,
    write_cache: bool,
    /// Adapter volumes currently open over this binding. Must be zero by
    /// the time the binding detaches for the last time at teardown.
    volume_refs: u32,
}

pub struct Binding {
    device_name: Mutex<String>,
    is_cache: bool,
    state: Mutex<BindingState>,
}

impl Binding {
    pub fn new(device_name: &str, is_cache: bool) -> Arc<Self> {
        Arc::new(Binding {
            device_name: Mutex::new(device_name.to_string()),
            is_cache,
            state: Mutex::new(BindingState {
                desc: None,
                channel: None,
                block_size: 0,
                block_count: 0,
                write_cache: false,
                volume_refs: 0,
            }),
        })
    }

    pub fn device_name(&self) -> String {
        self.device_name.lock().clone()
    }

    pub fn set_device_name(&self, name: &str) {
        *self.device_name.lock() = name.to_string();
    }

    pub fn is_cache(&self) -> bool {
        self.is_cache
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().desc.is_some()
    }

    pub fn block_size(&self) -> u32 {
        self.state.lock().block_size
    }

    pub fn block_count(&self) -> u64 {
        self.state.lock().block_count
    }

    pub fn write_cache(&self) -> bool {
        self.state.lock().write_cache
    }

    pub fn size_bytes(&self) -> u64 {
        let st = self.state.lock();
        u64::from(st.block_size) * st.block_count
    }

    pub fn volume_refs(&self) -> u32 {
        self.state.lock().volume_refs
    }

    pub fn volume_ref_get(&self) {
        self.state.lock().volume_refs += 1;
    }

    pub fn volume_ref_put(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.volume_refs > 0, "volume ref underflow");
        st.volume_refs = st.volume_refs.saturating_sub(1);
    }

    /// Open and claim the device. `remove_cb` fires through the reactor
    /// when the device starts disappearing underneath us.
    pub fn attach(
        self: &Arc<Self>,
        registry: &Registry,
        remove_cb: impl FnOnce() + 'static,
    ) -> Result<()> {
        let name = self.device_name();
        if self.is_attached() {
            return Err(CadevError::Already);
        }
        let desc = registry.open(&name, remove_cb)?;
        if let Err(e) = desc.claim() {
            desc.close();
            return Err(e);
        }
        let channel = match desc.get_io_channel() {
            Ok(ch) => ch,
            Err(e) => {
                desc.close();
                return Err(e);
            }
        };
        let mut st = self.state.lock();
        st.block_size = desc.block_size();
        st.block_count = desc.block_count();
        st.write_cache = desc.props().write_cache;
        st.desc = Some(desc);
        st.channel = Some(channel);
        debug!(device = %name, cache = self.is_cache, "base device attached");
        Ok(())
    }

    /// Release the channel, claim and descriptor. Idempotent.
    pub fn detach(&self) {
        let (desc, channel) = {
            let mut st = self.state.lock();
            (st.desc.take(), st.channel.take())
        };
        if let Some(ch) = channel {
            ch.put();
        }
        if let Some(desc) = desc {
            debug!(device = %self.device_name(), "base device detached");
            desc.close();
        }
    }

    /// Forward an I/O to the underlying device.
    pub fn submit(&self, io: IoRequest, complete: IoCompletion) {
        let st = self.state.lock();
        match (&st.desc, &st.channel) {
            (Some(desc), Some(ch)) => desc.submit(ch, io, complete),
            _ => {
                drop(st);
                complete(cadev_bdev::IoStatus::Failed, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadev_bdev::{MemBdev, Reactor};

    fn setup() -> Registry {
        let reactor = Reactor::new();
        let registry = Registry::new(reactor.clone());
        MemBdev::create(&registry, "mem0", 512, 64).expect("mem0");
        registry
    }

    #[test]
    fn attach_claims_and_reads_geometry() {
        let registry = setup();
        let binding = Binding::new("mem0", true);
        binding.attach(&registry, || {}).expect("attach");
        assert!(binding.is_attached());
        assert_eq!(binding.block_size(), 512);
        assert_eq!(binding.block_count(), 64);

        // Claimed: a second binding cannot take the same device.
        let other = Binding::new("mem0", false);
        assert!(other.attach(&registry, || {}).is_err());

        binding.detach();
        assert!(!binding.is_attached());
        other.attach(&registry, || {}).expect("attach after release");
        other.detach();
    }

    #[test]
    fn missing_device_defers() {
        let registry = setup();
        let binding = Binding::new("ghost", false);
        let err = binding.attach(&registry, || {}).expect_err("missing");
        assert!(err.is_deferred());
    }

    #[test]
    fn detach_is_idempotent() {
        let registry = setup();
        let binding = Binding::new("mem0", true);
        binding.attach(&registry, || {}).expect("attach");
        binding.detach();
        binding.detach();
    }
}
