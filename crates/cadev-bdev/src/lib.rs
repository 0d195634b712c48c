#![forbid(unsafe_code)]
//! Host block-device framework.
//!
//! This crate models the environment the cache shim plugs into: a table of
//! named block devices with open/claim/close descriptors, asynchronous
//! unregistration with per-device destruct hooks, hot-removal notification,
//! module registration with examine dispatch, and the single-threaded
//! [`Reactor`] everything completes through.
//!
//! Devices are backed by a [`BdevBackend`] implementation. [`MemBdev`]
//! provides the RAM-backed device used as a base device in tests and demos.

mod reactor;

pub use reactor::{PollerId, Reactor, ThreadId};

use cadev_error::{CadevError, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── I/O request model ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    Read,
    Write,
    Flush,
    Discard,
}

/// Completion status of a submitted I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    Failed,
    /// Transient allocation failure; the submitter may retry.
    NoMem,
}

/// A block I/O request. Writes carry their payload; reads get a buffer
/// back through the completion.
pub struct IoRequest {
    pub ty: IoType,
    pub offset_blocks: u64,
    pub num_blocks: u64,
    pub payload: Option<Vec<u8>>,
}

impl IoRequest {
    pub fn read(offset_blocks: u64, num_blocks: u64) -> Self {
        IoRequest {
            ty: IoType::Read,
            offset_blocks,
            num_blocks,
            payload: None,
        }
    }

    pub fn write(offset_blocks: u64, payload: Vec<u8>) -> Self {
        IoRequest {
            ty: IoType::Write,
            offset_blocks,
            num_blocks: 0, // filled by the registry from payload and block size
            payload: Some(payload),
        }
    }

    pub fn flush() -> Self {
        IoRequest {
            ty: IoType::Flush,
            offset_blocks: 0,
            num_blocks: 0,
            payload: None,
        }
    }

    pub fn discard(offset_blocks: u64, num_blocks: u64) -> Self {
        IoRequest {
            ty: IoType::Discard,
            offset_blocks,
            num_blocks,
            payload: None,
        }
    }
}

pub type IoCompletion = Box<dyn FnOnce(IoStatus, Option<Vec<u8>>)>;
pub type DestructDone = Box<dyn FnOnce(libc::c_int)>;

// ── Backend trait ─────────────────────────────────────────────────────────

/// Behavior of a registered block device. The registry owns registration
/// state; the backend owns data and teardown.
pub trait BdevBackend: 'static {
    /// Submit an I/O on the given channel. The completion must be invoked
    /// exactly once, through the reactor (never inline).
    fn submit(&self, channel: &IoChannel, io: IoRequest, complete: IoCompletion);

    /// Per-channel context, created on `get_io_channel`.
    fn create_channel(&self) -> Result<Box<dyn Any>> {
        Ok(Box::new(()))
    }

    fn destroy_channel(&self, _ctx: Box<dyn Any>) {}

    /// Final teardown after the last descriptor closes during unregister.
    /// `done` must be invoked exactly once, possibly asynchronously.
    fn destruct(&self, done: DestructDone) {
        done(0);
    }

    /// Saved-configuration object for dump output, if this device was
    /// created through a replayable method.
    fn dump_config(&self, _bdev_name: &str) -> Option<serde_json::Value> {
        None
    }
}

// ── Device table entries ──────────────────────────────────────────────────

/// Static properties of a registered block device.
#[derive(Debug, Clone)]
pub struct BdevProps {
    pub name: String,
    pub product_name: String,
    pub block_size: u32,
    pub block_count: u64,
    pub write_cache: bool,
}

struct DescState {
    remove_cb: Option<Box<dyn FnOnce()>>,
    closed: bool,
    claimed: bool,
}

struct BdevEntry {
    props: BdevProps,
    backend: Box<dyn BdevBackend>,
    inner: Mutex<BdevEntryState>,
}

struct BdevEntryState {
    claimed: bool,
    open_descs: Vec<Arc<Mutex<DescState>>>,
    removing: bool,
    destruct_started: bool,
    unregister_cbs: Vec<Box<dyn FnOnce(libc::c_int)>>,
    channels: Vec<Arc<ChannelSlot>>,
    next_channel: u64,
}

struct ChannelSlot {
    id: u64,
    ctx: Mutex<Option<Box<dyn Any>>>,
}

/// Open handle on a registered device.
pub struct Descriptor {
    registry: Registry,
    entry: Arc<BdevEntry>,
    state: Arc<Mutex<DescState>>,
}

/// Per-consumer channel on a device, carrying backend-defined context.
pub struct IoChannel {
    registry: Registry,
    entry: Arc<BdevEntry>,
    slot: Arc<ChannelSlot>,
}

impl IoChannel {
    /// Run `f` over the backend's channel context, downcast to `T`.
    pub fn with_ctx<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.slot.ctx.lock();
        guard.as_mut().and_then(|b| b.downcast_mut::<T>()).map(f)
    }

    pub fn bdev_name(&self) -> &str {
        &self.entry.props.name
    }

    /// Release the channel and destroy its backend context.
    pub fn put(self) {
        let ctx = self.slot.ctx.lock().take();
        if let Some(ctx) = ctx {
            self.entry.backend.destroy_channel(ctx);
        }
        let mut st = self.entry.inner.lock();
        st.channels.retain(|c| c.id != self.slot.id);
        drop(st);
        let _ = &self.registry;
    }
}

// ── Module registration and examine dispatch ──────────────────────────────

/// A virtual-device module wanting to inspect newly registered devices.
pub trait BdevModule: 'static {
    fn name(&self) -> &str;

    /// First examine phase: claim-or-defer decisions based on the name
    /// alone. Must end with [`Registry::examine_done`] on every path.
    fn examine_config(&self, bdev_name: &str);

    /// Second phase: decisions that need the device open.
    /// Must end with [`Registry::examine_done`] on every path.
    fn examine_disk(&self, bdev_name: &str);
}

// ── Registry ──────────────────────────────────────────────────────────────

struct RegistryState {
    devices: HashMap<String, Arc<BdevEntry>>,
    modules: Vec<Arc<dyn BdevModule>>,
    examine_in_progress: u32,
}

/// The device table. Clones share state.
#[derive(Clone)]
pub struct Registry {
    reactor: Reactor,
    state: Arc<Mutex<RegistryState>>,
}

impl Registry {
    pub fn new(reactor: Reactor) -> Self {
        Registry {
            reactor,
            state: Arc::new(Mutex::new(RegistryState {
                devices: HashMap::new(),
                modules: Vec::new(),
                examine_in_progress: 0,
            })),
        }
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn register_module(&self, module: Arc<dyn BdevModule>) {
        self.state.lock().modules.push(module);
    }

    /// Register a device and dispatch examine to every module.
    pub fn register(&self, props: BdevProps, backend: Box<dyn BdevBackend>) -> Result<()> {
        let name = props.name.clone();
        let entry = Arc::new(BdevEntry {
            props,
            backend,
            inner: Mutex::new(BdevEntryState {
                claimed: false,
                open_descs: Vec::new(),
                removing: false,
                destruct_started: false,
                unregister_cbs: Vec::new(),
                channels: Vec::new(),
                next_channel: 0,
            }),
        });
        let modules: Vec<Arc<dyn BdevModule>> = {
            let mut st = self.state.lock();
            if st.devices.contains_key(&name) {
                return Err(CadevError::Exists(name));
            }
            st.devices.insert(name.clone(), entry);
            st.examine_in_progress += st.modules.len() as u32 * 2;
            st.modules.clone()
        };
        info!(bdev = %name, "registered block device");
        for module in modules {
            let n = name.clone();
            let m = Arc::clone(&module);
            self.reactor.send(move || m.examine_config(&n));
            let n = name.clone();
            self.reactor.send(move || module.examine_disk(&n));
        }
        Ok(())
    }

    /// Called by modules when one examine phase finishes, success or not.
    pub fn examine_done(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.examine_in_progress > 0);
        st.examine_in_progress = st.examine_in_progress.saturating_sub(1);
    }

    /// Outstanding examine phases, for tests asserting balance.
    pub fn examines_in_progress(&self) -> u32 {
        self.state.lock().examine_in_progress
    }

    pub fn lookup(&self, name: &str) -> Option<BdevProps> {
        self.state
            .lock()
            .devices
            .get(name)
            .map(|e| e.props.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().devices.keys().cloned().collect()
    }

    fn entry(&self, name: &str) -> Option<Arc<BdevEntry>> {
        self.state.lock().devices.get(name).cloned()
    }

    /// Open a descriptor. `remove_cb` fires once, through the reactor, when
    /// the device starts unregistering while this descriptor is open.
    pub fn open(
        &self,
        name: &str,
        remove_cb: impl FnOnce() + 'static,
    ) -> Result<Descriptor> {
        let entry = self
            .entry(name)
            .ok_or_else(|| CadevError::Deferred(name.to_string()))?;
        let mut st = entry.inner.lock();
        if st.removing {
            return Err(CadevError::Deferred(name.to_string()));
        }
        let state = Arc::new(Mutex::new(DescState {
            remove_cb: Some(Box::new(remove_cb)),
            closed: false,
            claimed: false,
        }));
        st.open_descs.push(Arc::clone(&state));
        drop(st);
        Ok(Descriptor {
            registry: self.clone(),
            entry,
            state,
        })
    }

    /// Unregister a device. Open descriptors are notified and the destruct
    /// hook runs after the last one closes; `cb` fires last of all.
    pub fn unregister(&self, name: &str, cb: impl FnOnce(libc::c_int) + 'static) {
        let Some(entry) = self.entry(name) else {
            let cb: Box<dyn FnOnce(libc::c_int)> = Box::new(cb);
            self.reactor.send(move || cb(libc::ENODEV));
            return;
        };
        let notify: Vec<Box<dyn FnOnce()>> = {
            let mut st = entry.inner.lock();
            st.unregister_cbs.push(Box::new(cb));
            if st.removing {
                // Already underway; this caller just joins the waiters.
                Vec::new()
            } else {
                st.removing = true;
                st.open_descs
                    .iter()
                    .filter_map(|d| d.lock().remove_cb.take())
                    .collect()
            }
        };
        debug!(bdev = %name, waiters = notify.len(), "unregistering block device");
        for cb in notify {
            self.reactor.send(cb);
        }
        self.maybe_destruct(&entry);
    }

    fn maybe_destruct(&self, entry: &Arc<BdevEntry>) {
        let ready = {
            let mut st = entry.inner.lock();
            let ready = st.removing
                && !st.destruct_started
                && st.open_descs.iter().all(|d| d.lock().closed);
            if ready {
                st.destruct_started = true;
            }
            ready
        };
        if !ready {
            return;
        }
        let registry = self.clone();
        let entry = Arc::clone(entry);
        self.reactor.send(move || {
            let name = entry.props.name.clone();
            let registry2 = registry.clone();
            let entry2 = Arc::clone(&entry);
            entry.backend.destruct(Box::new(move |status| {
                registry2.state.lock().devices.remove(&name);
                let cbs = {
                    let mut st = entry2.inner.lock();
                    std::mem::take(&mut st.unregister_cbs)
                };
                info!(bdev = %entry2.props.name, status, "block device destructed");
                for cb in cbs {
                    registry2.reactor.send(move || cb(status));
                }
            }));
        });
    }

    /// Simulate surprise removal of a device (pulled hardware). Same path
    /// as unregister; consumers see their removal callbacks.
    pub fn hot_remove(&self, name: &str) {
        warn!(bdev = %name, "hot-removing block device");
        self.unregister(name, |_| {});
    }

    /// Total registered devices.
    pub fn device_count(&self) -> usize {
        self.state.lock().devices.len()
    }

    /// Saved-configuration objects from every device backend that has one.
    pub fn dump_config(&self) -> Vec<serde_json::Value> {
        let entries: Vec<Arc<BdevEntry>> = self.state.lock().devices.values().cloned().collect();
        entries
            .iter()
            .filter_map(|e| e.backend.dump_config(&e.props.name))
            .collect()
    }
}

impl Descriptor {
    pub fn props(&self) -> &BdevProps {
        &self.entry.props
    }

    pub fn block_size(&self) -> u32 {
        self.entry.props.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.entry.props.block_count
    }

    pub fn size_bytes(&self) -> u64 {
        u64::from(self.entry.props.block_size) * self.entry.props.block_count
    }

    /// Take exclusive ownership of the device. Fails if another consumer
    /// already claimed it.
    pub fn claim(&self) -> Result<()> {
        let mut st = self.entry.inner.lock();
        if st.claimed {
            return Err(CadevError::Exists(self.entry.props.name.clone()));
        }
        st.claimed = true;
        self.state.lock().claimed = true;
        Ok(())
    }

    pub fn get_io_channel(&self) -> Result<IoChannel> {
        let ctx = self.entry.backend.create_channel()?;
        let slot = {
            let mut st = self.entry.inner.lock();
            let slot = Arc::new(ChannelSlot {
                id: st.next_channel,
                ctx: Mutex::new(Some(ctx)),
            });
            st.next_channel += 1;
            st.channels.push(Arc::clone(&slot));
            slot
        };
        Ok(IoChannel {
            registry: self.registry.clone(),
            entry: Arc::clone(&self.entry),
            slot,
        })
    }

    /// Submit an I/O through an open channel on this descriptor's device.
    pub fn submit(&self, channel: &IoChannel, mut io: IoRequest, complete: IoCompletion) {
        if io.ty == IoType::Write {
            if let Some(p) = &io.payload {
                io.num_blocks = (p.len() as u64).div_ceil(u64::from(self.entry.props.block_size));
            }
        }
        self.entry.backend.submit(channel, io, complete);
    }

    /// Close the descriptor, releasing any claim. If the device is
    /// unregistering, the destruct hook may run as a consequence.
    pub fn close(self) {
        {
            let mut desc = self.state.lock();
            desc.closed = true;
            desc.remove_cb = None;
            if desc.claimed {
                self.entry.inner.lock().claimed = false;
            }
        }
        {
            let mut st = self.entry.inner.lock();
            st.open_descs.retain(|d| !d.lock().closed);
        }
        self.registry.maybe_destruct(&self.entry);
    }
}

// ── In-memory device ──────────────────────────────────────────────────────

/// RAM-backed block device used as a base device in tests and demos.
/// Completions are dispatched through the reactor, never inline.
pub struct MemBdev {
    reactor: Reactor,
    block_size: u32,
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemBdev {
    /// Register a new RAM device in `registry`.
    pub fn create(
        registry: &Registry,
        name: &str,
        block_size: u32,
        block_count: u64,
    ) -> Result<()> {
        let len = usize::try_from(u64::from(block_size) * block_count)
            .map_err(|_| CadevError::OutOfMemory)?;
        let backend = MemBdev {
            reactor: registry.reactor().clone(),
            block_size,
            data: Arc::new(Mutex::new(vec![0u8; len])),
        };
        registry.register(
            BdevProps {
                name: name.to_string(),
                product_name: "Memory disk".to_string(),
                block_size,
                block_count,
                write_cache: false,
            },
            Box::new(backend),
        )
    }

    fn range(&self, offset_blocks: u64, num_blocks: u64) -> Option<std::ops::Range<usize>> {
        let bs = u64::from(self.block_size);
        let start = usize::try_from(offset_blocks.checked_mul(bs)?).ok()?;
        let len = usize::try_from(num_blocks.checked_mul(bs)?).ok()?;
        let end = start.checked_add(len)?;
        if end > self.data.lock().len() {
            return None;
        }
        Some(start..end)
    }
}

impl BdevBackend for MemBdev {
    fn submit(&self, _channel: &IoChannel, io: IoRequest, complete: IoCompletion) {
        let result: (IoStatus, Option<Vec<u8>>) = match io.ty {
            IoType::Read => match self.range(io.offset_blocks, io.num_blocks) {
                Some(r) => (IoStatus::Success, Some(self.data.lock()[r].to_vec())),
                None => (IoStatus::Failed, None),
            },
            IoType::Write => {
                let payload = io.payload.unwrap_or_default();
                match self.range(io.offset_blocks, io.num_blocks) {
                    Some(r) => {
                        let mut data = self.data.lock();
                        let dst = &mut data[r];
                        dst[..payload.len()].copy_from_slice(&payload);
                        (IoStatus::Success, None)
                    }
                    None => (IoStatus::Failed, None),
                }
            }
            IoType::Flush => (IoStatus::Success, None),
            IoType::Discard => match self.range(io.offset_blocks, io.num_blocks) {
                Some(r) => {
                    self.data.lock()[r].fill(0);
                    (IoStatus::Success, None)
                }
                None => (IoStatus::Failed, None),
            },
        };
        self.reactor
            .send(move || complete(result.0, result.1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn setup() -> (Reactor, Registry) {
        let reactor = Reactor::new();
        let registry = Registry::new(reactor.clone());
        (reactor, registry)
    }

    #[test]
    fn register_rejects_duplicate_names() {
        let (_reactor, registry) = setup();
        MemBdev::create(&registry, "mem0", 512, 128).expect("first register");
        let err = MemBdev::create(&registry, "mem0", 512, 128).expect_err("duplicate");
        assert_eq!(err.to_errno(), libc::EEXIST);
    }

    #[test]
    fn claim_is_exclusive() {
        let (_reactor, registry) = setup();
        MemBdev::create(&registry, "mem0", 512, 128).expect("register");
        let d1 = registry.open("mem0", || {}).expect("open 1");
        let d2 = registry.open("mem0", || {}).expect("open 2");
        d1.claim().expect("first claim");
        assert!(d2.claim().is_err());
        d1.close();
        d2.claim().expect("claim after release");
        d2.close();
    }

    #[test]
    fn mem_device_round_trips_data() {
        let (reactor, registry) = setup();
        MemBdev::create(&registry, "mem0", 512, 128).expect("register");
        let desc = registry.open("mem0", || {}).expect("open");
        let ch = desc.get_io_channel().expect("channel");

        let pattern = vec![0xA5u8; 1024];
        let done = Rc::new(Cell::new(false));
        let done2 = Rc::clone(&done);
        desc.submit(
            &ch,
            IoRequest::write(4, pattern.clone()),
            Box::new(move |status, _| {
                assert_eq!(status, IoStatus::Success);
                done2.set(true);
            }),
        );
        reactor.run_until_idle();
        assert!(done.get());

        let got = Rc::new(Mutex::new(None));
        let got2 = Rc::clone(&got);
        desc.submit(
            &ch,
            IoRequest::read(4, 2),
            Box::new(move |status, data| {
                assert_eq!(status, IoStatus::Success);
                *got2.lock() = data;
            }),
        );
        reactor.run_until_idle();
        assert_eq!(got.lock().as_deref(), Some(pattern.as_slice()));
        ch.put();
        desc.close();
    }

    #[test]
    fn out_of_range_io_fails() {
        let (reactor, registry) = setup();
        MemBdev::create(&registry, "mem0", 512, 8).expect("register");
        let desc = registry.open("mem0", || {}).expect("open");
        let ch = desc.get_io_channel().expect("channel");
        let status = Rc::new(Cell::new(IoStatus::Success));
        let status2 = Rc::clone(&status);
        desc.submit(
            &ch,
            IoRequest::read(7, 4),
            Box::new(move |s, _| status2.set(s)),
        );
        reactor.run_until_idle();
        assert_eq!(status.get(), IoStatus::Failed);
        ch.put();
        desc.close();
    }

    #[test]
    fn unregister_waits_for_open_descriptors() {
        let (reactor, registry) = setup();
        MemBdev::create(&registry, "mem0", 512, 8).expect("register");

        let removed = Rc::new(Cell::new(false));
        let removed2 = Rc::clone(&removed);
        let desc = registry
            .open("mem0", move || removed2.set(true))
            .expect("open");

        let finished = Rc::new(Cell::new(false));
        let finished2 = Rc::clone(&finished);
        registry.unregister("mem0", move |status| {
            assert_eq!(status, 0);
            finished2.set(true);
        });
        reactor.run_until_idle();
        // Removal notified, but destruct blocked on the open descriptor.
        assert!(removed.get());
        assert!(!finished.get());
        assert!(registry.lookup("mem0").is_some());

        desc.close();
        reactor.run_until_idle();
        assert!(finished.get());
        assert!(registry.lookup("mem0").is_none());
    }

    #[test]
    fn unregister_unknown_device_reports_enodev() {
        let (reactor, registry) = setup();
        let status = Rc::new(Cell::new(0));
        let status2 = Rc::clone(&status);
        registry.unregister("ghost", move |s| status2.set(s));
        reactor.run_until_idle();
        assert_eq!(status.get(), libc::ENODEV);
    }

    struct CountingModule {
        registry: Registry,
        seen: Rc<Mutex<Vec<String>>>,
    }

    impl BdevModule for CountingModule {
        fn name(&self) -> &str {
            "counting"
        }
        fn examine_config(&self, bdev_name: &str) {
            self.seen.lock().push(format!("config:{bdev_name}"));
            self.registry.examine_done();
        }
        fn examine_disk(&self, bdev_name: &str) {
            self.seen.lock().push(format!("disk:{bdev_name}"));
            self.registry.examine_done();
        }
    }

    #[test]
    fn examine_dispatch_balances() {
        let (reactor, registry) = setup();
        let seen = Rc::new(Mutex::new(Vec::new()));
        registry.register_module(Arc::new(CountingModule {
            registry: registry.clone(),
            seen: Rc::clone(&seen),
        }));
        MemBdev::create(&registry, "mem0", 512, 8).expect("register");
        assert_eq!(registry.examines_in_progress(), 2);
        reactor.run_until_idle();
        assert_eq!(registry.examines_in_progress(), 0);
        assert_eq!(
            *seen.lock(),
            vec!["config:mem0".to_string(), "disk:mem0".to_string()]
        );
    }
}
