/*! Deadline-ordered timers with a dedicated worker thread.

Timers are registered once, yielding a [TimerHandle], and then armed and
cancelled any number of times. The queue keeps armed timers in an intrusive
min-heap keyed by deadline. The worker thread sleeps until the earliest
deadline; arming a timer that becomes the new earliest deadline wakes the
worker so it can shorten its sleep.

Callbacks run on the worker thread with the queue unlocked, so they are
free to re-arm their own or other timers.
*/

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::heap::{self, Heap, NOT_IN_HEAP};
use crate::time::{MonoClock, TimeDelta, TimePoint};

/// A registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(usize);

/// A timer action, invoked on the worker thread when the deadline passes.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

struct TimerSlot {
    deadline: TimePoint,
    heap_index: usize,
    callback: Callback,
}

impl heap::Element for TimerSlot {
    type Key = TimePoint;

    fn key(&self) -> TimePoint {
        self.deadline
    }

    fn heap_index(&self) -> usize {
        self.heap_index
    }

    fn set_heap_index(&mut self, index: usize) {
        self.heap_index = index;
    }
}

#[derive(Default)]
struct TimerState {
    slots: Vec<TimerSlot>,
    heap: Heap,
    done: bool,
}

struct Inner {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// A queue of timers serviced by a worker thread.
pub struct TimerQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(TimerState::default()),
                cond: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Register a timer callback. The timer starts out unarmed.
    pub fn register(&self, callback: Callback) -> TimerHandle {
        let mut state = self.inner.state.lock().unwrap();

        state.slots.push(TimerSlot {
            deadline: TimePoint::ZERO,
            heap_index: NOT_IN_HEAP,
            callback,
        });

        TimerHandle(state.slots.len() - 1)
    }

    /// Arm a timer to fire at a specific time, re-positioning it if it is
    /// already armed.
    pub fn run_at(&self, t: TimerHandle, when: TimePoint) {
        let mut state = self.inner.state.lock().unwrap();

        state.slots[t.0].deadline = when;

        if state.slots[t.0].heap_index == NOT_IN_HEAP {
            let TimerState { slots, heap, .. } = &mut *state;
            heap.push(slots.as_mut_slice(), t.0);
        } else {
            let TimerState { slots, heap, .. } = &mut *state;
            heap.update(slots.as_mut_slice(), t.0);
        }

        // Wake the worker if this timer is now the earliest deadline.
        if state.slots[t.0].heap_index == 0 {
            self.inner.cond.notify_all();
        }
    }

    /// Arm a timer to fire after a delay.
    pub fn run_in(&self, t: TimerHandle, delta: TimeDelta) {
        self.run_at(t, MonoClock::now() + delta);
    }

    /// Is the timer armed?
    pub fn running(&self, t: TimerHandle) -> bool {
        let state = self.inner.state.lock().unwrap();

        state.slots[t.0].heap_index != NOT_IN_HEAP
    }

    /// Disarm a timer. A no-op if it is not armed.
    pub fn cancel(&self, t: TimerHandle) {
        let mut state = self.inner.state.lock().unwrap();
        let TimerState { slots, heap, .. } = &mut *state;

        heap.remove(slots.as_mut_slice(), t.0);
    }

    /// Run all timers whose deadline has passed, on the caller's thread.
    pub fn run(&self) {
        let now = MonoClock::now();

        Self::fire_expired(&self.inner, now);
    }

    /// Start the worker thread.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();

        if worker.is_some() {
            return;
        }

        self.inner.state.lock().unwrap().done = false;

        let inner = Arc::clone(&self.inner);

        *worker = Some(thread::spawn(move || Self::timer_worker(inner)));
    }

    /// Stop and join the worker thread.
    pub fn stop(&self) {
        let handle = {
            let mut worker = self.worker.lock().unwrap();

            match worker.take() {
                Some(handle) => handle,
                None => return,
            }
        };

        self.inner.state.lock().unwrap().done = true;
        self.inner.cond.notify_all();

        let _ = handle.join();
    }

    fn fire_expired(inner: &Inner, now: TimePoint) {
        let mut state = inner.state.lock().unwrap();

        loop {
            let top = match state.heap.peek() {
                Some(id) if state.slots[id].deadline < now => id,
                _ => break,
            };

            {
                let TimerState { slots, heap, .. } = &mut *state;
                heap.pop(slots.as_mut_slice());
            }

            let callback = Arc::clone(&state.slots[top].callback);

            drop(state);
            callback();
            state = inner.state.lock().unwrap();
        }
    }

    fn timer_worker(inner: Arc<Inner>) {
        loop {
            Self::fire_expired(&inner, MonoClock::now());

            let state = inner.state.lock().unwrap();

            if state.done {
                return;
            }

            match state.heap.peek() {
                None => {
                    let _unused = inner.cond.wait(state).unwrap();
                }
                Some(id) => {
                    let delta = state.slots[id].deadline - MonoClock::now();

                    if delta > TimeDelta::ZERO {
                        let _unused = inner.cond.wait_timeout(state, delta.as_std()).unwrap();
                    }
                }
            }
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn recorder(order: &Arc<Mutex<Vec<u32>>>, id: u32) -> Callback {
        let order = Arc::clone(order);
        Arc::new(move || order.lock().unwrap().push(id))
    }

    #[test]
    fn fires_in_deadline_order() {
        let q = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let t100 = q.register(recorder(&order, 100));
        let t50 = q.register(recorder(&order, 50));
        let t75 = q.register(recorder(&order, 75));

        q.start();

        // Schedule out of order: 100ms, 50ms, 75ms
        q.run_in(t100, TimeDelta::from_millis(100));
        q.run_in(t50, TimeDelta::from_millis(50));
        q.run_in(t75, TimeDelta::from_millis(75));

        thread::sleep(Duration::from_millis(200));
        q.stop();

        assert_eq!(*order.lock().unwrap(), vec![50, 75, 100]);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let q = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let t100 = q.register(recorder(&order, 100));
        let t50 = q.register(recorder(&order, 50));
        let t75 = q.register(recorder(&order, 75));

        q.start();

        q.run_in(t100, TimeDelta::from_millis(100));
        q.run_in(t50, TimeDelta::from_millis(50));
        q.run_in(t75, TimeDelta::from_millis(75));

        assert!(q.running(t75));
        q.cancel(t75);
        assert!(!q.running(t75));

        thread::sleep(Duration::from_millis(200));
        q.stop();

        assert_eq!(*order.lock().unwrap(), vec![50, 100]);
    }

    #[test]
    fn rearm_moves_deadline() {
        let q = TimerQueue::new();
        let count = Arc::new(AtomicUsize::new(0));

        let t = {
            let count = Arc::clone(&count);
            q.register(Arc::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }))
        };

        q.start();

        q.run_in(t, TimeDelta::from_millis(500));
        q.run_in(t, TimeDelta::from_millis(20));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        q.stop();
    }

    #[test]
    fn callback_may_rearm_itself() {
        let q = Arc::new(TimerQueue::new());
        let count = Arc::new(AtomicUsize::new(0));

        let t = {
            let q2: Arc<TimerQueue> = Arc::clone(&q);
            let count = Arc::clone(&count);
            let handle: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));
            let handle2 = Arc::clone(&handle);

            let t = q.register(Arc::new(move || {
                if count.fetch_add(1, Ordering::SeqCst) < 2 {
                    let t = handle2.lock().unwrap().unwrap();
                    q2.run_in(t, TimeDelta::from_millis(10));
                }
            }));

            *handle.lock().unwrap() = Some(t);
            t
        };

        q.start();
        q.run_in(t, TimeDelta::from_millis(10));

        thread::sleep(Duration::from_millis(150));
        q.stop();

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
