/*! The radio front-end interface.

The concrete driver (UHD/USRP) is an external collaborator. The stack
consumes this trait: streaming receive into IQ buffers, timed burst
transmit, and the radio's own notion of time, which may be installed as
the system time keeper.
*/

use std::sync::Arc;

use anyhow::Result;

use crate::buffer::IQBuf;
use crate::time::{TimeDelta, TimePoint};

pub trait Radio: Send + Sync {
    fn set_tx_frequency(&self, fc: f64) -> Result<()>;
    fn set_rx_frequency(&self, fc: f64) -> Result<()>;

    fn set_tx_rate(&self, rate: f64) -> Result<()>;
    fn set_rx_rate(&self, rate: f64) -> Result<()>;

    fn set_tx_gain(&self, db: f64);
    fn set_rx_gain(&self, db: f64);

    /// Start streaming receive, optionally at a given time.
    fn start_rx_stream(&self, when: Option<TimePoint>);

    fn stop_rx_stream(&self);

    /// Receive up to `count` samples into a fresh IQ buffer. The buffer's
    /// progress counters advance as samples arrive; the caller may hand it
    /// downstream before it is complete. Returns `None` when the stream
    /// is stopped.
    fn rx_stream(&self, count: usize) -> Option<Arc<IQBuf>>;

    /// Queue IQ buffers for transmission, optionally at a given time.
    ///
    /// `start_of_burst` begins a new burst; `end_of_burst` closes the
    /// burst after these buffers.
    fn burst_tx(
        &self,
        when: Option<TimePoint>,
        start_of_burst: bool,
        end_of_burst: bool,
        bufs: &[Arc<IQBuf>],
    );

    /// End the current burst on a sample boundary.
    fn stop_tx_burst(&self);

    /// If in a burst, the time at which the next queued sample will leave
    /// the antenna.
    fn next_tx_time(&self) -> Option<TimePoint>;

    fn in_tx_burst(&self) -> bool;

    /// How far ahead of a deadline samples must be queued.
    fn tx_lead_time(&self) -> TimeDelta;

    fn tx_underflow_count(&self) -> u64;

    fn tx_late_count(&self) -> u64;

    /// The radio's monotonic time.
    fn now(&self) -> TimePoint;
}

/// Slaves the system monotonic clock to a radio's hardware time.
///
/// Install with [crate::time::MonoClock::set_time_keeper].
pub struct RadioTimeKeeper(pub Arc<dyn Radio>);

impl crate::time::TimeKeeper for RadioTimeKeeper {
    fn now(&self) -> TimePoint {
        self.0.now()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    /*! A scriptable radio for tests: received buffers are fed in through a
    queue, and transmitted bursts are recorded for inspection. */

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::queue::SafeQueue;
    use crate::time::{MonoClock, TimeDelta};

    pub struct Burst {
        pub when: Option<TimePoint>,
        pub start_of_burst: bool,
        pub end_of_burst: bool,
        pub nsamples: usize,
        pub nbufs: usize,
    }

    #[derive(Default)]
    pub struct MockRadio {
        pub rx_bufs: SafeQueue<Arc<IQBuf>>,
        pub bursts: Mutex<Vec<Burst>>,
        in_burst: AtomicBool,
        streaming: AtomicBool,
    }

    impl MockRadio {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Queue a buffer for the RX stream to return.
        pub fn feed_rx(&self, buf: Arc<IQBuf>) {
            self.rx_bufs.push(buf);
        }

        pub fn burst_count(&self) -> usize {
            self.bursts.lock().unwrap().len()
        }
    }

    impl Radio for MockRadio {
        fn set_tx_frequency(&self, _fc: f64) -> Result<()> {
            Ok(())
        }

        fn set_rx_frequency(&self, _fc: f64) -> Result<()> {
            Ok(())
        }

        fn set_tx_rate(&self, _rate: f64) -> Result<()> {
            Ok(())
        }

        fn set_rx_rate(&self, _rate: f64) -> Result<()> {
            Ok(())
        }

        fn set_tx_gain(&self, _db: f64) {}

        fn set_rx_gain(&self, _db: f64) {}

        fn start_rx_stream(&self, _when: Option<TimePoint>) {
            self.streaming.store(true, Ordering::Release);
            self.rx_bufs.enable();
        }

        fn stop_rx_stream(&self) {
            self.streaming.store(false, Ordering::Release);
            self.rx_bufs.disable();
        }

        fn rx_stream(&self, _count: usize) -> Option<Arc<IQBuf>> {
            self.rx_bufs.pop()
        }

        fn burst_tx(
            &self,
            when: Option<TimePoint>,
            start_of_burst: bool,
            end_of_burst: bool,
            bufs: &[Arc<IQBuf>],
        ) {
            self.bursts.lock().unwrap().push(Burst {
                when,
                start_of_burst,
                end_of_burst,
                nsamples: bufs.iter().map(|buf| buf.len()).sum(),
                nbufs: bufs.len(),
            });

            self.in_burst.store(!end_of_burst, Ordering::Release);
        }

        fn stop_tx_burst(&self) {
            self.in_burst.store(false, Ordering::Release);
        }

        fn next_tx_time(&self) -> Option<TimePoint> {
            None
        }

        fn in_tx_burst(&self) -> bool {
            self.in_burst.load(Ordering::Acquire)
        }

        fn tx_lead_time(&self) -> TimeDelta {
            TimeDelta::from_millis(1)
        }

        fn tx_underflow_count(&self) -> u64 {
            0
        }

        fn tx_late_count(&self) -> u64 {
            0
        }

        fn now(&self) -> TimePoint {
            MonoClock::now()
        }
    }
}
