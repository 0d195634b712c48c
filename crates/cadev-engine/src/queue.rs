//! Engine work queues.
//!
//! The engine never calls a consumer back directly. Completions are pushed
//! onto a [`Queue`] owned by the consumer, which drains it from a poller on
//! the thread that created it. One queue per cache carries management
//! completions; each I/O channel carries its own queue for I/O completions.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// Jobs drained per poll call. Keeps one busy queue from starving the
/// reactor's other pollers.
const POLL_BATCH: usize = 32;

type Job = Box<dyn FnOnce()>;

struct QueueState {
    jobs: VecDeque<Job>,
    stopped: bool,
}

pub struct Queue {
    name: String,
    state: Mutex<QueueState>,
}

impl Queue {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Queue {
            name: name.to_string(),
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                stopped: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a job. Jobs pushed after `stop` run immediately so no
    /// completion is ever lost during teardown.
    pub fn push(&self, job: impl FnOnce() + 'static) {
        let run_now = {
            let mut st = self.state.lock();
            if st.stopped {
                true
            } else {
                st.jobs.push_back(Box::new(job));
                return;
            }
        };
        if run_now {
            job();
        }
    }

    /// Drain up to a batch of jobs. Returns whether any work was done.
    pub fn poll(&self) -> bool {
        let mut did_work = false;
        for _ in 0..POLL_BATCH {
            let job = self.state.lock().jobs.pop_front();
            match job {
                Some(job) => {
                    job();
                    did_work = true;
                }
                None => break,
            }
        }
        did_work
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the queue, running any jobs still pending.
    pub fn stop(&self) {
        trace!(queue = %self.name, "stopping queue");
        loop {
            let job = {
                let mut st = self.state.lock();
                st.stopped = true;
                st.jobs.pop_front()
            };
            match job {
                Some(job) => job(),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn poll_drains_in_order() {
        let q = Queue::new("test");
        let order = Rc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Rc::clone(&order);
            q.push(move || order.lock().push(i));
        }
        assert!(q.poll());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(!q.poll());
    }

    #[test]
    fn stop_runs_pending_jobs() {
        let q = Queue::new("test");
        let ran = Rc::new(Cell::new(false));
        let ran2 = Rc::clone(&ran);
        q.push(move || ran2.set(true));
        q.stop();
        assert!(ran.get());
        assert!(q.is_empty());

        // A job pushed after stop runs immediately.
        let late = Rc::new(Cell::new(false));
        let late2 = Rc::clone(&late);
        q.push(move || late2.set(true));
        assert!(late.get());
    }
}
