/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! A combiner: a FIFO task queue guarded by an atomic busy flag that gives
//! cooperative single-writer serialization over a piece of state.
//!
//! A submitter either wins the flag and runs queued tasks inline, or
//! enqueues and returns; the winner drains the queue.  Tasks are
//! non-reentrant: scheduling from inside a task enqueues for the current
//! drain pass.  Closures that must run outside the state lock (surface
//! callbacks, cross-combiner hand-offs) are queued as effects and executed
//! after each task releases the state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) type Effect = Box<dyn FnOnce() + Send>;

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

/// State owned by a combiner.  Tasks push deferred closures into the state;
/// the combiner runs them once the state lock has been released.
pub(crate) trait CombinerState: Send + 'static {
    fn take_effects(&mut self) -> Vec<Effect>;
}

pub(crate) struct Combiner<S: CombinerState> {
    inner: Arc<Inner<S>>,
}

impl<S: CombinerState> Clone for Combiner<S> {
    fn clone(&self) -> Self {
        Combiner {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S> {
    state: Mutex<S>,
    queue: Mutex<VecDeque<Task<S>>>,
    busy: AtomicBool,
}

impl<S: CombinerState> Combiner<S> {
    pub(crate) fn new(state: S) -> Self {
        Combiner {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                queue: Mutex::new(VecDeque::new()),
                busy: AtomicBool::new(false),
            }),
        }
    }

    /// Schedules `task` and drains the queue if no other submitter holds the
    /// combiner.  Returns once this submitter has no more work to do; the
    /// task itself may have run inline or may run on another thread that
    /// currently owns the flag.
    pub(crate) fn run(&self, task: impl FnOnce(&mut S) + Send + 'static) {
        self.inner.queue.lock().unwrap().push_back(Box::new(task));
        self.drain();
    }

    fn drain(&self) {
        loop {
            if self
                .inner
                .busy
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                // Another thread owns the combiner; it will see our task.
                return;
            }
            loop {
                let task = self.inner.queue.lock().unwrap().pop_front();
                let Some(task) = task else { break };
                let effects = {
                    let mut state = self.inner.state.lock().unwrap();
                    task(&mut state);
                    state.take_effects()
                };
                for effect in effects {
                    effect();
                }
            }
            self.inner.busy.store(false, Ordering::Release);
            // A task may have been enqueued between our final pop and the
            // flag release; retry the claim so it is not stranded.
            if self.inner.queue.lock().unwrap().is_empty() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        value: usize,
        effects: Vec<Effect>,
    }

    impl CombinerState for Counter {
        fn take_effects(&mut self) -> Vec<Effect> {
            std::mem::take(&mut self.effects)
        }
    }

    #[test]
    fn runs_tasks_in_fifo_order() {
        let combiner = Combiner::new(Counter {
            value: 0,
            effects: vec![],
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = seen.clone();
            combiner.run(move |c: &mut Counter| {
                c.value += 1;
                seen.lock().unwrap().push(i);
            });
        }
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn reentrant_scheduling_is_deferred() {
        let combiner = Combiner::new(Counter {
            value: 0,
            effects: vec![],
        });
        let inner = combiner.clone();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        let order3 = order.clone();
        combiner.run(move |_: &mut Counter| {
            order2.lock().unwrap().push("outer-start");
            let order = order2.clone();
            inner.run(move |_: &mut Counter| {
                order.lock().unwrap().push("inner");
            });
            order2.lock().unwrap().push("outer-end");
        });
        combiner.run(move |_: &mut Counter| {
            order3.lock().unwrap().push("after");
        });
        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer-start", "outer-end", "inner", "after"]
        );
    }

    #[test]
    fn effects_run_outside_the_state_lock() {
        let combiner = Combiner::new(Counter {
            value: 0,
            effects: vec![],
        });
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let reentry = combiner.clone();
        combiner.run(move |c: &mut Counter| {
            let reentry = reentry.clone();
            let ran = ran2.clone();
            c.effects.push(Box::new(move || {
                // Re-entering the combiner from an effect must not deadlock.
                reentry.run(move |c: &mut Counter| {
                    c.value += 1;
                });
                ran.store(true, Ordering::SeqCst);
            }));
        });
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn serializes_across_threads() {
        let combiner = Combiner::new(Counter {
            value: 0,
            effects: vec![],
        });
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let combiner = combiner.clone();
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let concurrent = concurrent.clone();
                    let max_seen = max_seen.clone();
                    combiner.run(move |c: &mut Counter| {
                        let n = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(n, Ordering::SeqCst);
                        c.value += 1;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
