/*! The FDMA MAC.

Streaming: the TX worker continuously drains the channel synthesizer. If
the radio is mid-burst it polls with a deadline derived from the radio's
next-TX time; when the queue runs dry the burst is stopped so the radio
can idle. Accurate TX timestamps can be requested by restarting the burst
at a known near-future time, at the cost of latency; packets carrying a
timestamp sequence force this behavior for one batch.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Result};

use super::{Mac, MacConfig};
use crate::channelizer::Channelizer;
use crate::llc::Controller;
use crate::radio::Radio;
use crate::schedule::Schedule;
use crate::snapshot::SnapshotCollector;
use crate::synthesizer::Synthesizer;

pub struct Fdma {
    mac: Mac,

    /// Amount of data to pre-modulate (sec).
    premod: f64,

    /// Trade latency for accurate TX timestamps.
    accurate_tx_timestamps: AtomicBool,

    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Fdma {
    pub fn new(
        radio: Arc<dyn Radio>,
        controller: Arc<dyn Controller>,
        collector: Arc<SnapshotCollector>,
        channelizer: Arc<dyn Channelizer>,
        synthesizer: Arc<dyn Synthesizer>,
        period: f64,
    ) -> Result<Arc<Self>> {
        // RX worker, TX worker, TX notifier, and the mutator
        let mac = Mac::new(
            radio,
            controller,
            collector,
            channelizer,
            synthesizer,
            period,
            4,
        );

        let fdma = Arc::new(Fdma {
            mac,
            premod: period,
            accurate_tx_timestamps: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });

        {
            let mut threads = fdma.threads.lock().unwrap();
            let workers: [fn(Arc<Self>); 3] =
                [Self::rx_entry, Self::tx_entry, Self::notifier_entry];

            for worker in workers {
                let this = Arc::clone(&fdma);

                threads.push(thread::spawn(move || worker(this)));
            }
        }

        fdma.modify(|_| {});

        Ok(fdma)
    }

    fn rx_entry(this: Arc<Self>) {
        this.mac.rx_worker();
    }

    fn notifier_entry(this: Arc<Self>) {
        this.mac.tx_notifier();
    }

    fn tx_entry(this: Arc<Self>) {
        this.tx_worker();
    }

    pub fn accurate_tx_timestamps(&self) -> bool {
        self.accurate_tx_timestamps.load(Ordering::Acquire)
    }

    pub fn set_accurate_tx_timestamps(&self, accurate: bool) {
        self.accurate_tx_timestamps.store(accurate, Ordering::Release);
    }

    pub fn can_transmit(&self) -> bool {
        self.mac.can_transmit()
    }

    pub fn load(&self) -> super::Load {
        self.mac.load()
    }

    pub fn pop_load(&self) -> super::Load {
        self.mac.pop_load()
    }

    /// Install a schedule. FDMA accepts only schedules in which every
    /// channel is either always ours or never ours.
    pub fn set_schedule(&self, schedule: Schedule) -> Result<()> {
        if !schedule.is_fdma() {
            bail!("schedule is not an FDMA schedule");
        }

        self.mac.synthesizer.set_schedule(schedule.clone())?;

        self.modify(move |config| {
            config.schedule = schedule;
        });

        Ok(())
    }

    pub fn set_rx_rate(&self, rate: f64) -> Result<()> {
        self.mac.channelizer.set_rx_rate(rate)?;
        self.mac.radio.set_rx_rate(rate)?;

        self.modify(move |config| {
            config.rx_rate = rate;
        });

        Ok(())
    }

    pub fn set_tx_rate(&self, rate: f64) -> Result<()> {
        self.mac.synthesizer.set_tx_rate(rate)?;
        self.mac.radio.set_tx_rate(rate)?;

        self.modify(move |config| {
            config.tx_rate = rate;
        });

        Ok(())
    }

    fn modify<F: FnOnce(&mut MacConfig)>(&self, f: F) -> bool {
        self.mac.sb.modify(
            || {
                self.mac.wake_dependents();
                self.mac.synthesizer.disable();
            },
            || {
                f(&mut self.mac.config.write().unwrap());
                self.reconfigure();
            },
        )
    }

    /// Runs with all workers quiesced.
    fn reconfigure(&self) {
        let config = self.mac.config.read().unwrap();

        // We can transmit iff some channel is ours
        let can_transmit = (0..config.schedule.nchannels())
            .any(|chan| config.schedule.row(chan).first().copied().unwrap_or(false));

        self.mac
            .can_transmit
            .store(can_transmit, Ordering::Release);

        self.mac
            .synthesizer
            .set_high_water_mark(Some((self.premod * config.tx_rate) as usize));

        self.mac
            .load
            .lock()
            .unwrap()
            .reset(self.mac.synthesizer.channels().len());

        drop(config);

        self.mac.synthesizer.enable();
        self.mac.resume();
    }

    fn tx_worker(&self) {
        loop {
            let record = if self.mac.radio.in_tx_burst() {
                match self.mac.radio.next_tx_time() {
                    Some(t) => self
                        .mac
                        .synthesizer
                        .pop_until(t - self.mac.radio.tx_lead_time()),
                    None => self.mac.synthesizer.try_pop(),
                }
            } else {
                self.mac.synthesizer.pop()
            };

            if self.mac.sb.needs_sync() {
                self.mac.sb.sync();

                if self.mac.sb.is_done() {
                    return;
                }
            }

            // Nothing to send: if we are mid-burst, this ends it
            if record.nsamples == 0 {
                self.mac.radio.stop_tx_burst();
                continue;
            }

            // Timestamped packets need to know exactly when they air
            let accurate = self.accurate_tx_timestamps()
                || record
                    .mpkts
                    .iter()
                    .any(|mpkt| mpkt.pkt.timestamp_seq.is_some());

            let mut t_next = self.mac.radio.next_tx_time();

            if accurate && t_next.is_none() {
                // Restart the burst at a known time in the near future
                if self.mac.radio.in_tx_burst() {
                    self.mac.radio.stop_tx_burst();
                }

                t_next = Some(self.mac.radio.now() + self.mac.radio.tx_lead_time());
            }

            self.mac.radio.burst_tx(
                t_next,
                !self.mac.radio.in_tx_burst(),
                false,
                &record.iqbufs,
            );

            let mut record = record;

            record.timestamp = t_next;
            self.mac.tx_records.push(record);
        }
    }

    pub fn stop(&self) {
        if self.mac.sb.modify(
            || {
                self.mac.wake_dependents();
                self.mac.synthesizer.disable();
            },
            || self.mac.sb.set_done(),
        ) {
            let mut threads = self.threads.lock().unwrap();

            for handle in threads.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::IQBuf;
    use crate::channel::{Channel, PhyChannel};
    use crate::channelizer::td::TdChannelizer;
    use crate::channelizer::PacketSink;
    use crate::llc::{DummyController, RadioOut};
    use crate::net::packet::NetPacket;
    use crate::net::queue::{NetLink, NetQueue};
    use crate::phy::loopback::LoopbackPhy;
    use crate::phy::{PacketModulator, Phy};
    use crate::queue::SafeQueue;
    use crate::radio::mock::MockRadio;
    use crate::synthesizer::channel::ChannelSynthesizer;
    use crate::synthesizer::PacketSource;

    fn phy_channels(phy: &Arc<LoopbackPhy>) -> Vec<PhyChannel> {
        vec![PhyChannel::new(
            Channel::new(0.0, 1e6),
            vec![],
            Arc::clone(phy) as Arc<dyn Phy>,
        )]
    }

    #[test]
    fn round_trip_through_the_mac() {
        let phy = Arc::new(LoopbackPhy::new(2));
        let radio = MockRadio::new();
        let collector = Arc::new(SnapshotCollector::new());

        let net_in = Arc::new(NetQueue::new());
        let radio_out: RadioOut = Arc::new(SafeQueue::new());
        let controller: Arc<dyn Controller> = Arc::new(DummyController::new(
            Arc::clone(&net_in) as Arc<dyn NetLink>,
            Arc::clone(&radio_out),
        ));

        let sink: PacketSink = Arc::new(SafeQueue::new());
        let channelizer =
            TdChannelizer::new(phy_channels(&phy), 1e6, 1, Arc::clone(&sink)).unwrap();

        let synthesizer = ChannelSynthesizer::new(
            phy_channels(&phy),
            1e6,
            1,
            Arc::new(Arc::clone(&controller)) as Arc<dyn PacketSource>,
        )
        .unwrap();

        let mac = Fdma::new(
            Arc::clone(&radio) as Arc<dyn Radio>,
            Arc::clone(&controller),
            collector,
            channelizer.clone() as Arc<dyn Channelizer>,
            synthesizer.clone() as Arc<dyn Synthesizer>,
            0.01,
        )
        .unwrap();

        mac.set_schedule(Schedule::new(vec![vec![true]]).unwrap())
            .unwrap();
        assert!(mac.can_transmit());

        // Transmit path: a packet from the network becomes a radio burst
        net_in.push(NetPacket::with_payload(1, 2, 1, 2, vec![42]));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while radio.burst_count() == 0 && std::time::Instant::now() < deadline {
            thread::yield_now();
        }

        assert!(radio.burst_count() > 0);

        // Receive path: a modulated frame fed to the radio comes out of
        // the channelizer's sink
        let mut modulator = phy.mk_modulator();
        let mpkt = modulator.modulate(NetPacket::with_payload(2, 1, 2, 1, vec![7]), 1.0);

        let mut iqbuf = IQBuf::new(mpkt.samples.len());
        iqbuf.seq = 1;
        iqbuf.timestamp = Some(crate::time::WallClock::now());
        iqbuf.extend(mpkt.samples.data());
        iqbuf.complete();

        radio.feed_rx(Arc::new(iqbuf));

        let pkt = sink.pop().unwrap();
        assert_eq!(pkt.payload, vec![7]);

        mac.stop();
        channelizer.stop();
        synthesizer.stop();
        net_in.disable();
    }

    #[test]
    fn rejects_non_fdma_schedule() {
        let phy = Arc::new(LoopbackPhy::new(2));
        let radio = MockRadio::new();
        let collector = Arc::new(SnapshotCollector::new());

        let net_in = Arc::new(NetQueue::new());
        let radio_out: RadioOut = Arc::new(SafeQueue::new());
        let controller: Arc<dyn Controller> = Arc::new(DummyController::new(
            Arc::clone(&net_in) as Arc<dyn NetLink>,
            Arc::clone(&radio_out),
        ));

        let sink: PacketSink = Arc::new(SafeQueue::new());
        let channelizer =
            TdChannelizer::new(phy_channels(&phy), 1e6, 1, Arc::clone(&sink)).unwrap();

        let synthesizer = ChannelSynthesizer::new(
            phy_channels(&phy),
            1e6,
            1,
            Arc::new(Arc::clone(&controller)) as Arc<dyn PacketSource>,
        )
        .unwrap();

        let mac = Fdma::new(
            Arc::clone(&radio) as Arc<dyn Radio>,
            controller,
            collector,
            channelizer.clone() as Arc<dyn Channelizer>,
            synthesizer.clone() as Arc<dyn Synthesizer>,
            0.01,
        )
        .unwrap();

        let tdma_schedule = Schedule::new(vec![vec![true, false]]).unwrap();
        assert!(mac.set_schedule(tdma_schedule).is_err());

        mac.stop();
        channelizer.stop();
        synthesizer.stop();
        net_in.disable();
    }
}
