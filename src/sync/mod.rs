/*! Thread quiescence for reconfiguration.

Hot-path workers (demodulators, modulators, MAC workers) read shared
configuration without locks. When configuration must change, a mutator
briefly stops the world: it sets a synchronization flag, wakes any sleeping
workers, and meets them all at a two-phase barrier. With every worker parked
at the barrier, the mutator applies the change, then releases everyone.

Workers poll [SyncBarrier::needs_sync] at loop boundaries and call
[SyncBarrier::sync] when it is set.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// A reusable two-phase rendezvous barrier.
pub struct Barrier {
    count: usize,
    state: Mutex<BarrierState>,
    cv: Condvar,
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    phase: usize,
}

impl Barrier {
    pub fn new(count: usize) -> Self {
        Barrier {
            count,
            state: Mutex::new(BarrierState::default()),
            cv: Condvar::new(),
        }
    }

    /// Block until `count` threads have arrived.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();

        state.arrived += 1;

        if state.arrived == self.count {
            state.arrived = 0;
            state.phase += 1;
            self.cv.notify_all();
        } else {
            let phase = state.phase;

            let _unused = self
                .cv
                .wait_while(state, |s| s.phase == phase)
                .unwrap();
        }
    }
}

/// Serialized modification of state shared with `n - 1` worker threads.
///
/// Constructed for `n` participants: the workers plus the mutating thread.
/// The synchronization flag starts set, so workers park at the barrier until
/// the owner's first `modify` (typically the initial configuration) releases
/// them.
pub struct SyncBarrier {
    mutex: Mutex<()>,
    done: AtomicBool,
    synchronize: AtomicBool,
    barrier: Barrier,
    wake_mutex: Mutex<()>,
    wake_cond: Condvar,
}

impl SyncBarrier {
    pub fn new(count: usize) -> Self {
        SyncBarrier {
            mutex: Mutex::new(()),
            done: AtomicBool::new(false),
            synchronize: AtomicBool::new(true),
            barrier: Barrier::new(count),
            wake_mutex: Mutex::new(()),
            wake_cond: Condvar::new(),
        }
    }

    /// Does a worker need to rendezvous for a state change?
    pub fn needs_sync(&self) -> bool {
        self.synchronize.load(Ordering::Acquire)
    }

    /// Has the owner shut down?
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Mark the owner as shut down. Must be called from within a `modify`
    /// closure so workers observe it when released.
    pub fn set_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Rendezvous with a state change: once to park, once to resume.
    pub fn sync(&self) {
        self.barrier.wait();
        self.barrier.wait();
    }

    /// Park until a state change is signalled.
    pub fn sleep_until_state_change(&self) {
        let guard = self.wake_mutex.lock().unwrap();

        let _unused = self
            .wake_cond
            .wait_while(guard, |_| !self.needs_sync())
            .unwrap();
    }

    /// Wake threads parked in [sleep_until_state_change].
    ///
    /// Components with workers blocked elsewhere (queues, condvars) wrap
    /// this in their own wake logic passed to [modify].
    pub fn wake(&self) {
        let _guard = self.wake_mutex.lock().unwrap();

        self.wake_cond.notify_all();
    }

    /// Apply a state change with all workers quiesced.
    ///
    /// `wake_dependents` must rouse every worker so it can reach its
    /// `needs_sync` check; it should call [wake] in addition to disabling
    /// any queues workers block on. Returns false if the barrier is done,
    /// in which case `f` does not run.
    pub fn modify<W, F>(&self, wake_dependents: W, f: F) -> bool
    where
        W: FnOnce(),
        F: FnOnce(),
    {
        let _lock = self.mutex.lock().unwrap();

        // After shutdown, further state changes would deadlock against
        // workers that have already exited.
        if self.is_done() {
            return false;
        }

        self.synchronize.store(true, Ordering::Release);

        wake_dependents();

        // Wait for all dependent threads to park
        self.barrier.wait();

        f();

        self.synchronize.store(false, Ordering::Release);

        // Wait for all dependent threads to resume
        self.barrier.wait();

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn barrier_releases_all() {
        let barrier = Arc::new(Barrier::new(3));
        let arrived = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..3 {
            let barrier = Arc::clone(&barrier);
            let arrived = Arc::clone(&arrived);

            handles.push(thread::spawn(move || {
                barrier.wait();
                arrived.fetch_add(1, Ordering::SeqCst);
                // Reusable: a second phase works too
                barrier.wait();
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(arrived.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn modify_quiesces_workers() {
        let sb = Arc::new(SyncBarrier::new(3));
        let value = Arc::new(AtomicUsize::new(0));
        let observed_during_sync = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..2 {
            let sb = Arc::clone(&sb);
            let value = Arc::clone(&value);
            let observed = Arc::clone(&observed_during_sync);

            handles.push(thread::spawn(move || loop {
                if sb.needs_sync() {
                    sb.sync();

                    if sb.is_done() {
                        return;
                    }

                    observed.store(value.load(Ordering::SeqCst), Ordering::SeqCst);
                }

                thread::sleep(Duration::from_millis(1));
            }));
        }

        // Initial modify releases the workers from their startup park
        assert!(sb.modify(|| sb.wake(), || value.store(1, Ordering::SeqCst)));

        thread::sleep(Duration::from_millis(20));
        assert!(sb.modify(|| sb.wake(), || value.store(2, Ordering::SeqCst)));

        thread::sleep(Duration::from_millis(20));
        assert_eq!(observed_during_sync.load(Ordering::SeqCst), 2);

        assert!(sb.modify(|| sb.wake(), || sb.set_done()));

        for handle in handles {
            handle.join().unwrap();
        }

        // Once done, modify is a no-op
        assert!(!sb.modify(|| sb.wake(), || value.store(3, Ordering::SeqCst)));
        assert_eq!(value.load(Ordering::SeqCst), 2);
    }
}
