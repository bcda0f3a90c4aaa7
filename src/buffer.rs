/*! IQ sample buffers.

An [IQBuf] is an append-only buffer of IQ samples shared between one
producer and any number of consumers. The producer publishes progress
through an atomic sample counter with release ordering; consumers observe
it with acquire ordering and may demodulate a buffer while it is still
filling. A `complete` flag distinguishes "more will arrive" from "that's
all". This replaces any condition-variable scheme for the fine-grained
producer-consumer coupling on the receive path.
*/

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

pub use num_complex::Complex32;

use crate::time::TimePoint;

/// An IQ sample.
pub type C = Complex32;

/// A buffer of IQ samples with atomic fill progress.
pub struct IQBuf {
    /// Sample storage, sized at construction.
    buf: UnsafeCell<Box<[C]>>,

    /// Number of valid samples. Written by the producer with release
    /// ordering.
    nsamples: AtomicUsize,

    /// Set once the producer is finished with the buffer.
    complete: AtomicBool,

    /// Buffer sequence number, strictly monotonic per stream.
    pub seq: u64,

    /// Wall-clock timestamp of the first sample.
    pub timestamp: Option<TimePoint>,

    /// Center frequency.
    pub fc: f64,

    /// Sample rate.
    pub fs: f64,

    /// Offset of this buffer within the current snapshot, if one is being
    /// collected. Interior-mutable: the snapshot collector stamps buffers
    /// that are already shared.
    snapshot_off: AtomicI64,

    /// Number of leading samples that are filter delay, not signal.
    pub delay: usize,
}

/// Sentinel for "no snapshot offset".
const NO_SNAPSHOT_OFF: i64 = i64::MIN;

// SAFETY: the producer writes only past the published prefix and publishes
// with a release store of nsamples; consumers only read the published
// prefix after an acquire load. The unpublished suffix is never read.
unsafe impl Send for IQBuf {}
unsafe impl Sync for IQBuf {}

impl IQBuf {
    /// An empty buffer with room for `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        IQBuf {
            buf: UnsafeCell::new(vec![C::new(0.0, 0.0); capacity].into_boxed_slice()),
            nsamples: AtomicUsize::new(0),
            complete: AtomicBool::new(false),
            seq: 0,
            timestamp: None,
            fc: 0.0,
            fs: 0.0,
            snapshot_off: AtomicI64::new(NO_SNAPSHOT_OFF),
            delay: 0,
        }
    }

    /// A buffer holding the given samples, already complete.
    pub fn from_samples(samples: Vec<C>) -> Self {
        let n = samples.len();

        IQBuf {
            buf: UnsafeCell::new(samples.into_boxed_slice()),
            nsamples: AtomicUsize::new(n),
            complete: AtomicBool::new(true),
            seq: 0,
            timestamp: None,
            fc: 0.0,
            fs: 0.0,
            snapshot_off: AtomicI64::new(NO_SNAPSHOT_OFF),
            delay: 0,
        }
    }

    pub fn snapshot_off(&self) -> Option<isize> {
        match self.snapshot_off.load(Ordering::Acquire) {
            NO_SNAPSHOT_OFF => None,
            off => Some(off as isize),
        }
    }

    pub fn set_snapshot_off(&self, off: Option<isize>) {
        self.snapshot_off.store(
            off.map_or(NO_SNAPSHOT_OFF, |off| off as i64),
            Ordering::Release,
        );
    }

    pub fn capacity(&self) -> usize {
        // SAFETY: the box itself (pointer and length) is never mutated.
        unsafe { (&*self.buf.get()).len() }
    }

    /// Number of published samples.
    pub fn nsamples(&self) -> usize {
        self.nsamples.load(Ordering::Acquire)
    }

    /// Total number of samples; meaningful once the buffer is complete.
    pub fn len(&self) -> usize {
        self.nsamples()
    }

    pub fn is_empty(&self) -> bool {
        self.nsamples() == 0
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// The published samples.
    pub fn data(&self) -> &[C] {
        let n = self.nsamples();

        // SAFETY: samples below nsamples were published by a release store
        // and are never written again.
        unsafe { &(&*self.buf.get())[..n] }
    }

    /// Append samples and publish them.
    ///
    /// The caller must be the buffer's unique producer.
    pub fn extend(&self, samples: &[C]) {
        let n = self.nsamples.load(Ordering::Relaxed);

        // SAFETY: only the producer writes, and only past the published
        // prefix.
        unsafe {
            let buf = &mut *self.buf.get();

            buf[n..n + samples.len()].copy_from_slice(samples);
        }

        self.nsamples.store(n + samples.len(), Ordering::Release);
    }

    /// Mark the buffer complete.
    pub fn complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    /// Mark the buffer complete with a final sample count no larger than
    /// what has been published.
    pub fn complete_at(&self, n: usize) {
        debug_assert!(n <= self.nsamples.load(Ordering::Relaxed));
        self.nsamples.store(n, Ordering::Relaxed);
        self.complete.store(true, Ordering::Release);
    }

    /// Spin until the producer has published at least one sample (or
    /// finished outright).
    pub fn wait_to_start_filling(&self) {
        while self.nsamples() == 0 && !self.is_complete() {
            std::thread::yield_now();
        }
    }

    /// Spin until the producer has finished the buffer.
    pub fn wait_complete(&self) {
        while !self.is_complete() {
            std::thread::yield_now();
        }
    }
}

/// The sliding sample window a polyphase filter dot-products against its
/// per-phase taps.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    w: Vec<C>,
}

impl SampleWindow {
    pub fn new(n: usize) -> Self {
        SampleWindow {
            w: vec![C::new(0.0, 0.0); n],
        }
    }

    pub fn len(&self) -> usize {
        self.w.len()
    }

    pub fn is_empty(&self) -> bool {
        self.w.is_empty()
    }

    pub fn resize(&mut self, n: usize) {
        self.w.clear();
        self.w.resize(n, C::new(0.0, 0.0));
    }

    pub fn reset(&mut self) {
        self.w.fill(C::new(0.0, 0.0));
    }

    /// Shift the window and append a new sample.
    pub fn add(&mut self, x: C) {
        let n = self.w.len();

        self.w.copy_within(1.., 0);
        self.w[n - 1] = x;
    }

    /// Dot product against taps of the same length, newest sample last.
    pub fn dotprod(&self, taps: &[C]) -> C {
        debug_assert_eq!(taps.len(), self.w.len());

        self.w
            .iter()
            .zip(taps.iter())
            .map(|(x, h)| x * h)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn progress_is_visible_to_consumers() {
        let buf = Arc::new(IQBuf::new(16));

        buf.extend(&[C::new(1.0, 0.0); 4]);
        assert_eq!(buf.nsamples(), 4);
        assert!(!buf.is_complete());

        buf.extend(&[C::new(2.0, 0.0); 4]);
        assert_eq!(buf.data().len(), 8);
        assert_eq!(buf.data()[4], C::new(2.0, 0.0));

        buf.complete();
        assert!(buf.is_complete());
    }

    #[test]
    fn concurrent_reader_sees_prefix() {
        let buf = Arc::new(IQBuf::new(1024));
        let reader = Arc::clone(&buf);

        let handle = thread::spawn(move || {
            let mut seen = 0;

            loop {
                let n = reader.nsamples();

                // Every published sample must hold its index
                for (i, x) in reader.data().iter().enumerate() {
                    assert_eq!(x.re, i as f32);
                }

                seen = seen.max(n);

                if reader.is_complete() && n == reader.nsamples() {
                    break;
                }
            }

            seen
        });

        for i in 0..1024 {
            buf.extend(&[C::new(i as f32, 0.0)]);
        }
        buf.complete();

        assert_eq!(handle.join().unwrap(), 1024);
    }

    #[test]
    fn window_dotprod_tracks_newest() {
        let mut w = SampleWindow::new(3);
        let taps = [C::new(1.0, 0.0), C::new(2.0, 0.0), C::new(3.0, 0.0)];

        w.add(C::new(1.0, 0.0));
        w.add(C::new(2.0, 0.0));
        w.add(C::new(3.0, 0.0));

        // 1*1 + 2*2 + 3*3
        assert_eq!(w.dotprod(&taps).re, 14.0);

        w.add(C::new(4.0, 0.0));
        // 2*1 + 3*2 + 4*3
        assert_eq!(w.dotprod(&taps).re, 20.0);
    }
}
