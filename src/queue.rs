/*! A blocking queue with disable semantics.

Worker threads block in [SafeQueue::pop]. Disabling the queue wakes every
blocked producer and consumer with a `None`/false return, which is the
normal shutdown signal throughout the stack: a worker seeing a disabled
queue unwinds cleanly.
*/

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct QueueState<T> {
    items: VecDeque<T>,
    enabled: bool,
}

pub struct SafeQueue<T> {
    state: Mutex<QueueState<T>>,
    cv: Condvar,
}

impl<T> Default for SafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SafeQueue<T> {
    pub fn new() -> Self {
        SafeQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                enabled: true,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    pub fn enable(&self) {
        self.state.lock().unwrap().enabled = true;
        self.cv.notify_all();
    }

    /// Disable the queue, waking all blocked consumers with `None`.
    pub fn disable(&self) {
        self.state.lock().unwrap().enabled = false;
        self.cv.notify_all();
    }

    /// Disable the queue and discard its contents.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();

        state.enabled = false;
        state.items.clear();
        self.cv.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().items.is_empty()
    }

    /// Push an item. Returns false if the queue is disabled.
    pub fn push(&self, item: T) -> bool {
        {
            let mut state = self.state.lock().unwrap();

            if !state.enabled {
                return false;
            }

            state.items.push_back(item);
        }

        self.cv.notify_one();
        true
    }

    /// Push an item at the head of the queue.
    pub fn push_front(&self, item: T) -> bool {
        {
            let mut state = self.state.lock().unwrap();

            if !state.enabled {
                return false;
            }

            state.items.push_front(item);
        }

        self.cv.notify_one();
        true
    }

    /// Pop an item, blocking until one is available or the queue is
    /// disabled.
    pub fn pop(&self) -> Option<T> {
        let state = self.state.lock().unwrap();

        let mut state = self
            .cv
            .wait_while(state, |s| s.enabled && s.items.is_empty())
            .unwrap();

        if !state.enabled {
            None
        } else {
            state.items.pop_front()
        }
    }

    /// Pop an item if one is immediately available.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();

        if !state.enabled {
            None
        } else {
            state.items.pop_front()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let q = SafeQueue::new();

        q.push(1);
        q.push(2);
        q.push_front(0);

        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn disable_wakes_blocked_consumer() {
        let q = Arc::new(SafeQueue::<u32>::new());
        let q2 = Arc::clone(&q);

        let handle = thread::spawn(move || q2.pop());

        thread::sleep(Duration::from_millis(20));
        q.disable();

        assert_eq!(handle.join().unwrap(), None);
        assert!(!q.push(1));
    }

    #[test]
    fn blocked_consumer_gets_pushed_item() {
        let q = Arc::new(SafeQueue::<u32>::new());
        let q2 = Arc::clone(&q);

        let handle = thread::spawn(move || q2.pop());

        thread::sleep(Duration::from_millis(20));
        q.push(42);

        assert_eq!(handle.join().unwrap(), Some(42));
    }
}
