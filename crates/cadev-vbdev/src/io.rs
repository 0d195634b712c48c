//! I/O path of the exposed devices.
//!
//! Each exposed device registers a [`VbdevBackend`]. Channels carry a
//! completion queue drained by a poller on the channel's thread; the engine
//! pushes I/O completions there, so submitters always complete from their
//! own poller context.

use crate::core::Vbdev;
use crate::module::{Module, PRODUCT_NAME};
use cadev_bdev::{
    BdevBackend, BdevProps, DestructDone, IoChannel, IoCompletion, IoRequest, IoStatus, PollerId,
};
use cadev_engine::Queue;
use cadev_error::Result;
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use tracing::warn;

pub(crate) struct VbdevChannel {
    queue: Arc<Queue>,
    poller: PollerId,
}

pub(crate) struct VbdevBackend {
    module: Module,
    vbdev: Arc<Vbdev>,
}

impl VbdevBackend {
    fn channel_queue(&self, channel: &IoChannel) -> Option<Arc<Queue>> {
        channel.with_ctx::<VbdevChannel, _>(|ch| Arc::clone(&ch.queue))
    }
}

impl BdevBackend for VbdevBackend {
    fn submit(&self, channel: &IoChannel, io: IoRequest, complete: IoCompletion) {
        let cache = self.vbdev.cache().and_then(|c| c.engine_cache());
        let core = self.vbdev.core();
        let queue = self.channel_queue(channel);
        match (cache, core, queue) {
            (Some(cache), Some(core), Some(queue)) => {
                cache.submit_io(&core, &queue, io, complete);
            }
            _ => {
                warn!(vbdev = %self.vbdev.name(), "I/O on a device without a cache");
                self.module
                    .reactor()
                    .send(move || complete(IoStatus::Failed, None));
            }
        }
    }

    fn create_channel(&self) -> Result<Box<dyn Any>> {
        let reactor = self.module.reactor();
        let queue = Queue::new(&format!("{}-io", self.vbdev.name()));
        let poll_queue = Arc::clone(&queue);
        let poller = reactor.register_poller(
            reactor.current_thread(),
            &format!("{}-io", self.vbdev.name()),
            move || poll_queue.poll(),
        );
        Ok(Box::new(VbdevChannel { queue, poller }))
    }

    fn destroy_channel(&self, ctx: Box<dyn Any>) {
        if let Ok(ch) = ctx.downcast::<VbdevChannel>() {
            self.module.reactor().unregister_poller(ch.poller);
            ch.queue.stop();
        }
    }

    fn destruct(&self, done: DestructDone) {
        self.module.core_destruct(Arc::clone(&self.vbdev), done);
    }

    fn dump_config(&self, bdev_name: &str) -> Option<serde_json::Value> {
        let cfg = self.vbdev.cfg();
        Some(json!({
            "method": "cadev_core_add",
            "params": {
                "name": bdev_name,
                "cache_name": self.vbdev.cache_name(),
                "device": cfg.device_name,
            },
        }))
    }
}

/// Register the exposed block device for an added core. Geometry mirrors
/// the core base device.
pub(crate) fn register_vbdev(module: &Module, vbdev: &Arc<Vbdev>) -> Result<()> {
    let base = vbdev.base();
    let props = BdevProps {
        name: vbdev.name().to_string(),
        product_name: PRODUCT_NAME.to_string(),
        block_size: base.block_size(),
        block_count: base.block_count(),
        write_cache: base.write_cache(),
    };
    let backend = VbdevBackend {
        module: module.clone(),
        vbdev: Arc::clone(vbdev),
    };
    module.registry().register(props, Box::new(backend))
}
