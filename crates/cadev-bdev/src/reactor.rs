//! Single-threaded cooperative reactor.
//!
//! All asynchronous behavior in cadev is expressed as events on this queue:
//! management completions, lock grants, deferred unregisters, removal
//! notifications, examine dispatch. Nothing runs inline from the call that
//! requested it, which keeps re-entrancy out of the lifecycle state machines.
//!
//! Logical threads are retained even though execution is single-threaded:
//! objects record the [`ThreadId`] that created them and teardown work is
//! marshalled back with [`Reactor::send_msg`], preserving the "destroy on
//! the owning thread" discipline the management queues depend on.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// Identifier of a logical reactor thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(u64);

/// Handle to a registered poller. Unregistration is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerId(u64);

type Event = Box<dyn FnOnce()>;

struct PollerEntry {
    id: PollerId,
    thread: ThreadId,
    name: String,
    // Taken out of the slot while running so a poller can unregister
    // itself (or others) without deadlocking the registry lock.
    cb: Option<Box<dyn FnMut() -> bool>>,
    alive: bool,
}

struct ReactorState {
    queue: VecDeque<(ThreadId, Event)>,
    pollers: Vec<PollerEntry>,
    threads: Vec<(ThreadId, String)>,
    current: ThreadId,
    next_thread: u64,
    next_poller: u64,
}

/// Shared handle to the event loop. Clones refer to the same loop.
#[derive(Clone)]
pub struct Reactor {
    state: Arc<Mutex<ReactorState>>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        let app = ThreadId(0);
        Reactor {
            state: Arc::new(Mutex::new(ReactorState {
                queue: VecDeque::new(),
                pollers: Vec::new(),
                threads: vec![(app, "app".to_string())],
                current: app,
                next_thread: 1,
                next_poller: 0,
            })),
        }
    }

    /// The initial thread, on which management entry points run.
    pub fn app_thread(&self) -> ThreadId {
        ThreadId(0)
    }

    pub fn create_thread(&self, name: &str) -> ThreadId {
        let mut st = self.state.lock();
        let id = ThreadId(st.next_thread);
        st.next_thread += 1;
        st.threads.push((id, name.to_string()));
        trace!(thread = id.0, name, "created reactor thread");
        id
    }

    /// Thread the currently-executing event belongs to. Outside the loop
    /// this is the app thread.
    pub fn current_thread(&self) -> ThreadId {
        self.state.lock().current
    }

    /// Enqueue an event on the current thread.
    pub fn send(&self, event: impl FnOnce() + 'static) {
        let thread = self.current_thread();
        self.send_msg(thread, event);
    }

    /// Enqueue an event on a specific thread. FIFO order is preserved
    /// across all threads (there is one underlying queue).
    pub fn send_msg(&self, thread: ThreadId, event: impl FnOnce() + 'static) {
        self.state.lock().queue.push_back((thread, Box::new(event)));
    }

    /// Register a recurring poller on `thread`. The callback returns whether
    /// it performed any work; the loop goes idle only when no poller did.
    pub fn register_poller(
        &self,
        thread: ThreadId,
        name: &str,
        cb: impl FnMut() -> bool + 'static,
    ) -> PollerId {
        let mut st = self.state.lock();
        let id = PollerId(st.next_poller);
        st.next_poller += 1;
        st.pollers.push(PollerEntry {
            id,
            thread,
            name: name.to_string(),
            cb: Some(Box::new(cb)),
            alive: true,
        });
        trace!(poller = id.0, name, "registered poller");
        id
    }

    pub fn unregister_poller(&self, id: PollerId) {
        let mut st = self.state.lock();
        if let Some(p) = st.pollers.iter_mut().find(|p| p.id == id) {
            p.alive = false;
            trace!(poller = id.0, name = %p.name, "unregistered poller");
        }
    }

    fn run_one_event(&self) -> bool {
        let (thread, event) = {
            let mut st = self.state.lock();
            match st.queue.pop_front() {
                Some(e) => e,
                None => return false,
            }
        };
        let prev = {
            let mut st = self.state.lock();
            let prev = st.current;
            st.current = thread;
            prev
        };
        event();
        self.state.lock().current = prev;
        true
    }

    fn run_pollers_once(&self) -> bool {
        let mut made_progress = false;
        let mut idx = 0;
        loop {
            // Take the callback out so the poller body can touch the
            // reactor freely.
            let taken = {
                let mut st = self.state.lock();
                loop {
                    match st.pollers.get_mut(idx) {
                        None => break None,
                        Some(p) if !p.alive || p.cb.is_none() => idx += 1,
                        Some(p) => break Some((p.id, p.thread, p.cb.take())),
                    }
                }
            };
            let Some((id, thread, Some(mut cb))) = taken else {
                break;
            };
            let prev = {
                let mut st = self.state.lock();
                let prev = st.current;
                st.current = thread;
                prev
            };
            made_progress |= cb();
            let mut st = self.state.lock();
            st.current = prev;
            if let Some(p) = st.pollers.iter_mut().find(|p| p.id == id) {
                if p.alive {
                    p.cb = Some(cb);
                }
            }
            idx += 1;
        }
        self.state.lock().pollers.retain(|p| p.alive);
        made_progress
    }

    /// Drive the loop until the queue is empty and every poller reports
    /// no work. Tests and the harness call this after each management
    /// request to run it to completion.
    pub fn run_until_idle(&self) {
        loop {
            let mut ran = false;
            while self.run_one_event() {
                ran = true;
            }
            ran |= self.run_pollers_once();
            if !ran && self.state.lock().queue.is_empty() {
                break;
            }
        }
    }

    /// Number of queued events, for tests.
    pub fn pending_events(&self) -> usize {
        self.state.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn events_run_in_fifo_order() {
        let reactor = Reactor::new();
        let order = Rc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = Rc::clone(&order);
            reactor.send(move || order.lock().push(i));
        }
        reactor.run_until_idle();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn events_observe_their_thread() {
        let reactor = Reactor::new();
        let mngt = reactor.create_thread("mngt");
        let seen = Rc::new(Cell::new(None));
        let seen2 = Rc::clone(&seen);
        let r2 = reactor.clone();
        reactor.send_msg(mngt, move || seen2.set(Some(r2.current_thread())));
        reactor.run_until_idle();
        assert_eq!(seen.get(), Some(mngt));
        assert_eq!(reactor.current_thread(), reactor.app_thread());
    }

    #[test]
    fn poller_runs_until_no_work() {
        let reactor = Reactor::new();
        let work = Rc::new(Cell::new(3u32));
        let ran = Rc::new(Cell::new(0u32));
        let (w, r) = (Rc::clone(&work), Rc::clone(&ran));
        let id = reactor.register_poller(reactor.app_thread(), "test", move || {
            r.set(r.get() + 1);
            if w.get() > 0 {
                w.set(w.get() - 1);
                true
            } else {
                false
            }
        });
        reactor.run_until_idle();
        assert_eq!(work.get(), 0);
        assert!(ran.get() >= 4);
        reactor.unregister_poller(id);
        let before = ran.get();
        reactor.run_until_idle();
        assert_eq!(ran.get(), before);
    }

    #[test]
    fn poller_can_unregister_itself() {
        let reactor = Reactor::new();
        let reactor2 = reactor.clone();
        let slot = Rc::new(Cell::new(None));
        let slot2 = Rc::clone(&slot);
        let id = reactor.register_poller(reactor.app_thread(), "self-stop", move || {
            if let Some(id) = slot2.get() {
                reactor2.unregister_poller(id);
            }
            false
        });
        slot.set(Some(id));
        reactor.run_until_idle();
    }

    #[test]
    fn events_enqueued_by_events_run() {
        let reactor = Reactor::new();
        let hit = Rc::new(Cell::new(false));
        let hit2 = Rc::clone(&hit);
        let r2 = reactor.clone();
        reactor.send(move || {
            r2.send(move || hit2.set(true));
        });
        reactor.run_until_idle();
        assert!(hit.get());
    }
}
