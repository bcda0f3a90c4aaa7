/*! Snapshot collection.

A snapshot is a contiguous stretch of received wideband IQ together with
the self-transmission events that happened during it, collected for
offline spectrum analysis. While a snapshot is active, every RX buffer is
stamped with its offset from the snapshot start before it fills, and the
channelizer passes the offsets through so demodulated packets (our own
transmissions among them) can be located in the recording.
*/

use std::sync::{Arc, Mutex};

use crate::buffer::{IQBuf, C};
use crate::time::{MonoClock, TimeDelta, TimePoint};

/// A self-transmission event within a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct SelfTx {
    /// Produced by this node (as opposed to heard from a neighbor)?
    pub is_local: bool,

    /// Snapshot sample offset of the start of the transmission.
    pub start: isize,

    /// Snapshot sample offset of the end of the transmission.
    pub end: isize,

    /// Center frequency of the transmission.
    pub fc: f32,

    /// Sample rate of the transmission.
    pub fs: f32,
}

/// A snapshot of received spectrum.
pub struct Snapshot {
    /// Timestamp of the start of the snapshot.
    pub timestamp: TimePoint,

    /// The collected RX buffers.
    pub slots: Vec<Arc<IQBuf>>,

    /// Self-transmission events during the snapshot.
    pub selftx: Vec<SelfTx>,
}

impl Snapshot {
    /// Concatenate the leading run of slots sharing a center frequency and
    /// sample rate into one buffer.
    pub fn combined_slots(&self) -> Option<IQBuf> {
        let first = self.slots.first()?;
        let fc = first.fc;
        let fs = first.fs;

        let run: Vec<&Arc<IQBuf>> = self
            .slots
            .iter()
            .take_while(|slot| slot.fc == fc && slot.fs == fs)
            .collect();

        let mut samples: Vec<C> = Vec::with_capacity(run.iter().map(|s| s.len()).sum());

        for slot in run {
            samples.extend_from_slice(slot.data());
        }

        let mut buf = IQBuf::from_samples(samples);

        buf.timestamp = Some(self.timestamp);
        buf.fc = fc;
        buf.fs = fs;
        Some(buf)
    }
}

#[derive(Default)]
struct State {
    snapshot: Option<Snapshot>,
    curbuf: Option<Arc<IQBuf>>,

    /// Should new RX buffers be collected?
    collect: bool,

    /// Offset from the beginning of the first collected slot.
    snapshot_off: usize,

    /// The last local transmission, in case it is still in progress when a
    /// new snapshot starts.
    last_local_tx: Option<(TimePoint, f32, SelfTx)>,
}

/// Records snapshots of received IQ and self-transmission events.
#[derive(Default)]
pub struct SnapshotCollector {
    state: Mutex<State>,
}

impl SnapshotCollector {
    pub fn new() -> Self {
        Default::default()
    }

    /// Start collecting a snapshot.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();

        Self::new_snapshot(&mut state);
    }

    /// Stop collecting new slots. Pending demodulation may still report
    /// self-transmissions until [finalize] is called.
    ///
    /// [finalize]: #method.finalize
    pub fn stop(&self) {
        self.state.lock().unwrap().collect = false;
    }

    /// Take the collected snapshot.
    pub fn finalize(&self) -> Option<Snapshot> {
        self.state.lock().unwrap().snapshot.take()
    }

    /// Take the collected snapshot and immediately start a new one.
    pub fn next(&self) -> Option<Snapshot> {
        let mut state = self.state.lock().unwrap();
        let snapshot = state.snapshot.take();

        Self::new_snapshot(&mut state);
        snapshot
    }

    /// Is a snapshot being collected?
    pub fn active(&self) -> bool {
        self.state.lock().unwrap().snapshot.is_some()
    }

    /// Offer an RX buffer that is about to fill. If a snapshot is being
    /// collected, the buffer is stamped with its snapshot offset and true
    /// is returned; the caller must call [finalize_push] once the buffer
    /// is full.
    ///
    /// [finalize_push]: #method.finalize_push
    pub fn push(&self, buf: &Arc<IQBuf>) -> bool {
        let mut state = self.state.lock().unwrap();

        if state.snapshot.is_some() && state.collect {
            buf.set_snapshot_off(Some(state.snapshot_off as isize));
            state.curbuf = Some(Arc::clone(buf));
            true
        } else {
            false
        }
    }

    /// Account a filled RX buffer into the snapshot.
    pub fn finalize_push(&self) {
        let mut state = self.state.lock().unwrap();

        let Some(curbuf) = state.curbuf.take() else {
            return;
        };

        let curbuf_len = curbuf.len();
        let mut pushed = false;
        if let Some(snapshot) = state.snapshot.as_mut() {
            // First collected slot anchors the snapshot timestamp
            if snapshot.slots.is_empty() {
                if let Some(t) = curbuf.timestamp {
                    snapshot.timestamp = t;
                }
            }

            snapshot.slots.push(curbuf);
            pushed = true;
        }

        if pushed {
            state.snapshot_off += curbuf_len;
        }
    }

    /// Record a self-transmission heard over the air, located by snapshot
    /// offsets.
    pub fn self_tx(&self, start: isize, end: isize, fc: f32, fs: f32) {
        let mut state = self.state.lock().unwrap();

        if let Some(snapshot) = state.snapshot.as_mut() {
            snapshot.selftx.push(SelfTx {
                is_local: false,
                start,
                end,
                fc,
                fs,
            });
        }
    }

    /// Record a transmission made by this node, located by time.
    pub fn self_tx_local(
        &self,
        when: TimePoint,
        fs_rx: f32,
        fs_tx: f32,
        fc: f32,
        bw: f32,
        nsamples: usize,
    ) {
        let mut state = self.state.lock().unwrap();
        let scaled_nsamples = (nsamples as f32 * fs_rx / fs_tx) as isize;

        if let Some(snapshot) = state.snapshot.as_mut() {
            let start =
                ((when - snapshot.timestamp).as_secs_f64() * fs_rx as f64) as isize;

            snapshot.selftx.push(SelfTx {
                is_local: true,
                start,
                end: start + scaled_nsamples,
                fc,
                fs: bw,
            });
        } else {
            // Remember the transmission so a snapshot started while it is
            // still in the air can record its tail
            state.last_local_tx = Some((
                when,
                fs_rx,
                SelfTx {
                    is_local: true,
                    start: 0,
                    end: scaled_nsamples,
                    fc,
                    fs: fs_tx,
                },
            ));
        }
    }

    fn new_snapshot(state: &mut State) {
        let mut snapshot = Snapshot {
            // Provisional; replaced by the first collected slot's timestamp
            timestamp: MonoClock::now(),
            slots: Vec::new(),
            selftx: Vec::new(),
        };

        // Carry an in-progress local TX into the new snapshot
        if let Some((start, fs_rx, mut tx)) = state.last_local_tx.take() {
            let end = start + TimeDelta::from_secs_f64(tx.end as f64 / fs_rx as f64);

            if snapshot.timestamp < end {
                let elapsed = ((snapshot.timestamp - start).as_secs_f64()
                    * fs_rx as f64) as isize;

                tx.start -= elapsed;
                tx.end -= elapsed;
                snapshot.selftx.push(tx);
            }
        }

        state.snapshot = Some(snapshot);
        state.collect = true;
        state.snapshot_off = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_buf(n: usize, fc: f64, fs: f64) -> Arc<IQBuf> {
        let mut buf = IQBuf::from_samples(vec![C::new(1.0, 0.0); n]);

        buf.fc = fc;
        buf.fs = fs;
        buf.timestamp = Some(MonoClock::now());
        Arc::new(buf)
    }

    #[test]
    fn offsets_accumulate_across_slots() {
        let collector = SnapshotCollector::new();

        collector.start();

        let a = filled_buf(100, 0.0, 1e6);
        assert!(collector.push(&a));
        assert_eq!(a.snapshot_off(), Some(0));
        collector.finalize_push();

        let b = filled_buf(50, 0.0, 1e6);
        assert!(collector.push(&b));
        assert_eq!(b.snapshot_off(), Some(100));
        collector.finalize_push();

        collector.stop();

        let c = filled_buf(10, 0.0, 1e6);
        assert!(!collector.push(&c));

        let snapshot = collector.finalize().unwrap();
        assert_eq!(snapshot.slots.len(), 2);
        assert_eq!(snapshot.combined_slots().unwrap().len(), 150);
    }

    #[test]
    fn inactive_collector_ignores_buffers() {
        let collector = SnapshotCollector::new();
        let buf = filled_buf(10, 0.0, 1e6);

        assert!(!collector.push(&buf));
        assert_eq!(buf.snapshot_off(), None);
        assert!(collector.finalize().is_none());
    }

    #[test]
    fn self_tx_recorded_while_active() {
        let collector = SnapshotCollector::new();

        collector.start();
        collector.self_tx(100, 200, 0.0, 250e3);

        let snapshot = collector.finalize().unwrap();
        assert_eq!(snapshot.selftx.len(), 1);
        assert!(!snapshot.selftx[0].is_local);
        assert_eq!(snapshot.selftx[0].start, 100);
    }
}
