//! FIFO worker pool that emulates grid-style launch on the host
//!
//! One mutex guards the queue plus an in-flight counter; one condition
//! variable covers every transition the pool cares about (work arrived,
//! queue drained, last unit finished). Workers hold the lock only to
//! dequeue, syncers only to observe the drained state, the submitter only
//! to enqueue. Teardown waits for quiescence, then feeds each worker one
//! quit sentinel and joins.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::abi::{ArgBlock, CpuKernelFn};

struct Work {
    /// `None` is the quit sentinel
    kernel: Option<CpuKernelFn>,
    index: usize,
    total: usize,
    args: Arc<ArgBlock>,
}

struct State {
    queue: VecDeque<Work>,
    /// Units popped but not yet finished
    active: usize,
}

struct Shared {
    state: Mutex<State>,
    signal: Condvar,
}

/// Fixed-size worker pool with a FIFO queue
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `workers` worker threads
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                active: 0,
            }),
            signal: Condvar::new(),
        });
        let handles = (0..workers)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || worker_loop(&shared))
            })
            .collect();
        Self {
            shared,
            workers: handles,
        }
    }

    /// Enqueue `count` units of `kernel` over the shared argument block
    ///
    /// A single unit runs inline on the submitting thread; everything else
    /// goes through the queue.
    pub fn submit(&self, count: usize, kernel: CpuKernelFn, args: Arc<ArgBlock>) {
        if count == 1 {
            // SAFETY: the block's backing attributes outlive this call
            unsafe { kernel(0, 1, args.as_ptr(), args.len()) };
            return;
        }
        if count == 0 {
            return;
        }
        trace!(count, "enqueueing kernel units");
        let mut state = self.shared.state.lock();
        for index in 0..count {
            state.queue.push_back(Work {
                kernel: Some(kernel),
                index,
                total: count,
                args: Arc::clone(&args),
            });
        }
        self.shared.signal.notify_all();
    }

    /// Block until every enqueued unit has finished
    pub fn sync(&self) {
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() || state.active > 0 {
            self.shared.signal.wait(&mut state);
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.sync();
        {
            let mut state = self.shared.state.lock();
            for _ in &self.workers {
                state.queue.push_back(Work {
                    kernel: None,
                    index: 0,
                    total: 1,
                    args: Arc::new(ArgBlock::empty()),
                });
            }
        }
        self.shared.signal.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let work = {
            let mut state = shared.state.lock();
            while state.queue.is_empty() {
                shared.signal.wait(&mut state);
            }
            let work = state.queue.pop_front().expect("queue checked non-empty");
            if work.kernel.is_some() {
                state.active += 1;
            }
            work
        };
        match work.kernel {
            None => break,
            // SAFETY: the argument block pins the backing attributes until
            // every unit holding an Arc to it has finished
            Some(kernel) => {
                unsafe { kernel(work.index, work.total, work.args.as_ptr(), work.args.len()) };
                let mut state = shared.state.lock();
                state.active -= 1;
                if state.queue.is_empty() && state.active == 0 {
                    // wake any syncer observing quiescence
                    shared.signal.notify_all();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cpu::abi::{marshal, HostArg};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static UNITS_SEEN: AtomicUsize = AtomicUsize::new(0);
    static MAX_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
    static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counting_kernel(_i: usize, _n: usize, _args: *const HostArg, _len: usize) {
        let now = IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
        MAX_IN_FLIGHT.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(2));
        IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
        UNITS_SEEN.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_all_units_run_and_parallelism_is_bounded() {
        UNITS_SEEN.store(0, Ordering::SeqCst);
        MAX_IN_FLIGHT.store(0, Ordering::SeqCst);

        let pool = ThreadPool::new(4);
        let args = Arc::new(marshal(&[]).unwrap());
        pool.submit(16, counting_kernel, args);
        pool.sync();

        assert_eq!(UNITS_SEEN.load(Ordering::SeqCst), 16);
        assert!(MAX_IN_FLIGHT.load(Ordering::SeqCst) <= 4);
    }

    #[test]
    fn test_sync_is_a_completion_fence() {
        static DONE: AtomicUsize = AtomicUsize::new(0);

        unsafe extern "C" fn slow_kernel(_i: usize, _n: usize, _a: *const HostArg, _l: usize) {
            std::thread::sleep(std::time::Duration::from_millis(10));
            DONE.fetch_add(1, Ordering::SeqCst);
        }

        let pool = ThreadPool::new(2);
        let args = Arc::new(marshal(&[]).unwrap());
        pool.submit(4, slow_kernel, args);
        pool.sync();
        assert_eq!(DONE.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_single_unit_runs_inline() {
        static INLINE_RUNS: AtomicUsize = AtomicUsize::new(0);

        unsafe extern "C" fn inline_kernel(i: usize, n: usize, _a: *const HostArg, _l: usize) {
            assert_eq!((i, n), (0, 1));
            INLINE_RUNS.fetch_add(1, Ordering::SeqCst);
        }

        let pool = ThreadPool::new(2);
        let args = Arc::new(marshal(&[]).unwrap());
        pool.submit(1, inline_kernel, args);
        // count == 1 executes before submit returns
        assert_eq!(INLINE_RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_teardown_with_idle_workers() {
        let pool = ThreadPool::new(3);
        pool.sync();
        drop(pool);
    }
}
