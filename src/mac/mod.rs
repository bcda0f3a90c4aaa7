/*! Medium access control.

A MAC orchestrates the radio, channelizer, and synthesizer according to
the schedule. All variants share the same skeleton: an RX worker streaming
IQ buffers from the radio into the channelizer, a TX worker moving samples
from the synthesizer to the radio (streaming for FDMA, slotted for
TDMA/ALOHA), and a TX-notification worker reporting transmitted packets
back to the controller. Reconfiguration quiesces them all through the sync
barrier.
*/

pub mod aloha;
pub mod fdma;
mod slotted;
pub mod tdma;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::channelizer::Channelizer;
use crate::llc::Controller;
use crate::queue::SafeQueue;
use crate::radio::Radio;
use crate::schedule::Schedule;
use crate::snapshot::SnapshotCollector;
use crate::sync::SyncBarrier;
use crate::synthesizer::{Synthesizer, TxRecord};
use crate::time::{TimeDelta, TimePoint, WallClock};

/// MAC load: samples transmitted per channel over a measurement period.
#[derive(Debug, Clone, Default)]
pub struct Load {
    pub start: TimePoint,
    pub end: TimePoint,
    pub nsamples: Vec<usize>,
}

impl Load {
    fn reset(&mut self, nchannels: usize) {
        self.start = WallClock::now();
        self.end = self.start;
        self.nsamples.clear();
        self.nsamples.resize(nchannels, 0);
    }
}

pub(crate) struct MacConfig {
    pub schedule: Schedule,
    pub rx_rate: f64,
    pub tx_rate: f64,

    /// Length of one RX buffer (sec).
    pub rx_period: f64,
}

/// State and workers shared by every MAC variant.
pub(crate) struct Mac {
    pub radio: Arc<dyn Radio>,
    pub controller: Arc<dyn Controller>,
    pub collector: Arc<SnapshotCollector>,
    pub channelizer: Arc<dyn Channelizer>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub sb: SyncBarrier,
    pub config: RwLock<MacConfig>,
    pub can_transmit: AtomicBool,
    pub load: Mutex<Load>,

    /// Transmitted batches awaiting notification.
    pub tx_records: SafeQueue<TxRecord>,
}

impl Mac {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        radio: Arc<dyn Radio>,
        controller: Arc<dyn Controller>,
        collector: Arc<SnapshotCollector>,
        channelizer: Arc<dyn Channelizer>,
        synthesizer: Arc<dyn Synthesizer>,
        rx_period: f64,
        nsyncthreads: usize,
    ) -> Self {
        let rx_rate = channelizer.rx_rate();
        let tx_rate = synthesizer.tx_rate();

        Mac {
            radio,
            controller,
            collector,
            channelizer,
            synthesizer,
            sb: SyncBarrier::new(nsyncthreads),
            config: RwLock::new(MacConfig {
                schedule: Schedule::default(),
                rx_rate,
                tx_rate,
                rx_period,
            }),
            can_transmit: AtomicBool::new(false),
            load: Mutex::new(Load::default()),
            tx_records: SafeQueue::new(),
        }
    }

    pub fn can_transmit(&self) -> bool {
        self.can_transmit.load(Ordering::Acquire)
    }

    /// The current load.
    pub fn load(&self) -> Load {
        let mut load = self.load.lock().unwrap().clone();

        load.end = load.end.max(WallClock::now());
        load
    }

    /// The current load, resetting the counters.
    pub fn pop_load(&self) -> Load {
        let nchannels = self.synthesizer.channels().len();
        let mut locked = self.load.lock().unwrap();
        let mut load = locked.clone();

        load.end = load.end.max(WallClock::now());
        locked.reset(nchannels);
        load
    }

    /// Quiesce everything the common workers block on.
    pub fn wake_dependents(&self) {
        self.radio.stop_rx_stream();
        self.tx_records.disable();
        self.sb.wake();
    }

    /// Undo [wake_dependents] after a reconfiguration.
    ///
    /// [wake_dependents]: #method.wake_dependents
    pub fn resume(&self) {
        self.tx_records.enable();
        self.radio.start_rx_stream(None);
    }

    /// Stream IQ buffers from the radio into the channelizer.
    pub fn rx_worker(&self) {
        loop {
            if self.sb.needs_sync() {
                self.sb.sync();

                if self.sb.is_done() {
                    return;
                }
            }

            let count = {
                let config = self.config.read().unwrap();

                (config.rx_rate * config.rx_period) as usize
            };

            let buf = match self.radio.rx_stream(count.max(1)) {
                Some(buf) => buf,
                None => continue, // stream stopped; re-check for sync
            };

            let snapshotted = self.collector.push(&buf);

            self.channelizer.push(Arc::clone(&buf));

            // The radio fills the buffer as we go; wait for it to finish
            // before asking for the next one
            buf.wait_complete();

            if snapshotted {
                self.collector.finalize_push();
            }
        }
    }

    /// Report transmitted packets upstream.
    pub fn tx_notifier(&self) {
        loop {
            if self.sb.needs_sync() {
                self.sb.sync();

                if self.sb.is_done() {
                    return;
                }
            }

            let mut record = match self.tx_records.pop() {
                Some(record) => record,
                None => continue,
            };

            let tx_rate = self.config.read().unwrap().tx_rate;

            // Stamp TX times on packets that do not already carry one
            // (slot-synthesized packets were stamped at slot packing)
            if let Some(t0) = record.timestamp {
                let t0 = WallClock::to_wall_time(t0);

                for mpkt in &mut record.mpkts {
                    if mpkt.pkt.tx_timestamp == TimePoint::ZERO {
                        mpkt.pkt.tx_timestamp = t0
                            + TimeDelta::from_secs_f64(
                                (record.delay + mpkt.start) as f64 / tx_rate,
                            );
                    }
                }
            }

            // Track per-channel load and snapshot self-transmissions
            {
                let rx_rate = self.config.read().unwrap().rx_rate;
                let mut load = self.load.lock().unwrap();

                for mpkt in &record.mpkts {
                    if mpkt.chanidx < load.nsamples.len() {
                        load.nsamples[mpkt.chanidx] += mpkt.nsamples;
                    }

                    if self.collector.active() {
                        self.collector.self_tx_local(
                            WallClock::to_mono_time(mpkt.pkt.tx_timestamp),
                            rx_rate as f32,
                            tx_rate as f32,
                            mpkt.channel.fc as f32,
                            mpkt.channel.bw as f32,
                            mpkt.nsamples,
                        );
                    }
                }

                load.end = WallClock::now();
            }

            self.controller.transmitted(&mut record.mpkts);
        }
    }
}
