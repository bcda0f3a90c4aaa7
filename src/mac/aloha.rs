/*! The slotted ALOHA MAC.

As TDMA, but contention-based: at every slot boundary we transmit with
independent probability `p` and otherwise yield the slot. The schedule
slot used for channel selection is fixed and configurable, since ALOHA
nodes do not own slots.
*/

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Result;
use rand::Rng;

use super::slotted::SlottedMac;
use super::{Load, Mac, MacConfig};
use crate::channelizer::Channelizer;
use crate::llc::Controller;
use crate::radio::Radio;
use crate::schedule::Schedule;
use crate::snapshot::SnapshotCollector;
use crate::synthesizer::Synthesizer;
use crate::time::{TimeDelta, TimePoint, WallClock};

pub struct SlottedAloha {
    slotted: SlottedMac,

    /// Slot index used for channel selection.
    slotidx: AtomicUsize,

    /// Probability of transmitting in a slot, as f64 bits.
    p: AtomicU64,

    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl SlottedAloha {
    pub fn new(
        radio: Arc<dyn Radio>,
        controller: Arc<dyn Controller>,
        collector: Arc<SnapshotCollector>,
        channelizer: Arc<dyn Channelizer>,
        synthesizer: Arc<dyn Synthesizer>,
        rx_period: f64,
        p: f64,
    ) -> Result<Arc<Self>> {
        // RX worker, TX worker, slot worker, TX notifier, and the mutator
        let mac = Mac::new(
            radio,
            controller,
            collector,
            channelizer,
            synthesizer,
            rx_period,
            5,
        );

        let aloha = Arc::new(SlottedAloha {
            slotted: SlottedMac::new(mac),
            slotidx: AtomicUsize::new(0),
            p: AtomicU64::new(p.to_bits()),
            threads: Mutex::new(Vec::new()),
        });

        {
            let mut threads = aloha.threads.lock().unwrap();
            let workers: [fn(Arc<Self>); 4] = [
                |this| this.slotted.mac.rx_worker(),
                |this| this.slotted.tx_worker(),
                |this| this.tx_slot_worker(),
                |this| this.slotted.mac.tx_notifier(),
            ];

            for worker in workers {
                let this = Arc::clone(&aloha);

                threads.push(thread::spawn(move || worker(this)));
            }
        }

        aloha.modify(|_| {});

        Ok(aloha)
    }

    pub fn slot_index(&self) -> usize {
        self.slotidx.load(Ordering::Relaxed)
    }

    pub fn set_slot_index(&self, slotidx: usize) {
        self.slotidx.store(slotidx, Ordering::Relaxed);
    }

    /// Probability of transmitting in a given slot.
    pub fn tx_prob(&self) -> f64 {
        f64::from_bits(self.p.load(Ordering::Relaxed))
    }

    pub fn set_tx_prob(&self, p: f64) {
        self.p.store(p.to_bits(), Ordering::Relaxed);
    }

    pub fn can_transmit(&self) -> bool {
        self.slotted.mac.can_transmit()
    }

    pub fn load(&self) -> Load {
        self.slotted.mac.load()
    }

    pub fn pop_load(&self) -> Load {
        self.slotted.mac.pop_load()
    }

    pub fn set_slot_size(&self, slot_size: TimeDelta, guard_size: TimeDelta) -> Result<()> {
        let mut config = self.slotted.slot_config.write().unwrap();

        config.slot_size = slot_size;
        config.guard_size = guard_size;
        Ok(())
    }

    pub fn set_schedule(&self, schedule: Schedule) -> Result<()> {
        self.slotted.mac.synthesizer.set_schedule(schedule.clone())?;

        self.modify(move |config| {
            config.schedule = schedule;
        });

        Ok(())
    }

    fn modify<F: FnOnce(&mut MacConfig)>(&self, f: F) -> bool {
        self.slotted.mac.sb.modify(
            || self.slotted.wake_dependents(),
            || {
                f(&mut self.slotted.mac.config.write().unwrap());
                self.reconfigure();
            },
        )
    }

    fn reconfigure(&self) {
        // ALOHA contends for every slot
        self.slotted.mac.can_transmit.store(true, Ordering::Release);
        *self.slotted.prev_oversample.lock().unwrap() = 0;
        self.slotted.resume();
    }

    /// The start of the next slot boundary after `t`.
    fn next_slot_boundary(&self, t: TimePoint) -> TimePoint {
        let slot_size = self.slotted.slot_config.read().unwrap().slot_size.as_secs_f64();
        let secs = (t - TimePoint::ZERO).as_secs_f64();

        TimePoint::from_secs_f64(((secs / slot_size).floor() + 1.0) * slot_size)
    }

    fn tx_slot_worker(&self) {
        let mut rng = rand::thread_rng();

        loop {
            if self.slotted.mac.sb.needs_sync() {
                self.slotted.mac.sb.sync();

                if self.slotted.mac.sb.is_done() {
                    return;
                }
            }

            let lead = self.slotted.slot_config.read().unwrap().slot_send_lead_time;
            let start = self.next_slot_boundary(WallClock::now() + lead);

            // Transmit in this slot with probability p; otherwise yield it
            if rng.gen::<f64>() < self.tx_prob() {
                self.slotted.run_slot(start, self.slot_index());
            } else {
                let delta = WallClock::to_mono_time(start) - crate::time::MonoClock::now();

                if delta > TimeDelta::ZERO {
                    thread::sleep(delta.as_std());
                }
            }
        }
    }

    pub fn stop(&self) {
        if self.slotted.mac.sb.modify(
            || self.slotted.wake_dependents(),
            || self.slotted.mac.sb.set_done(),
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
    use crate::channel::{Channel, PhyChannel};
    use crate::channelizer::td::TdChannelizer;
    use crate::channelizer::PacketSink;
    use crate::llc::{DummyController, RadioOut};
    use crate::net::packet::NetPacket;
    use crate::net::queue::{NetLink, NetQueue};
    use crate::phy::loopback::LoopbackPhy;
    use crate::phy::Phy;
    use crate::queue::SafeQueue;
    use crate::radio::mock::MockRadio;
    use crate::synthesizer::slot::SlotSynthesizer;
    use crate::synthesizer::PacketSource;

    #[test]
    fn p_one_always_transmits_p_zero_never() {
        let phy = Arc::new(LoopbackPhy::new(2));
        let radio = MockRadio::new();
        let collector = Arc::new(SnapshotCollector::new());

        let net_in = Arc::new(NetQueue::new());
        let radio_out: RadioOut = Arc::new(SafeQueue::new());
        let controller: Arc<dyn Controller> = Arc::new(DummyController::new(
            Arc::clone(&net_in) as Arc<dyn NetLink>,
            Arc::clone(&radio_out),
        ));

        let channels = vec![PhyChannel::new(
            Channel::new(0.0, 1e6),
            vec![],
            Arc::clone(&phy) as Arc<dyn Phy>,
        )];

        let sink: PacketSink = Arc::new(SafeQueue::new());
        let channelizer =
            TdChannelizer::new(channels.clone(), 1e6, 1, Arc::clone(&sink)).unwrap();

        let synthesizer = SlotSynthesizer::new(
            channels,
            1e6,
            1,
            Arc::new(Arc::clone(&controller)) as Arc<dyn PacketSource>,
        )
        .unwrap();

        let mac = SlottedAloha::new(
            Arc::clone(&radio) as Arc<dyn Radio>,
            controller,
            collector,
            channelizer.clone() as Arc<dyn Channelizer>,
            synthesizer.clone() as Arc<dyn Synthesizer>,
            0.01,
            0.0,
        )
        .unwrap();

        mac.set_slot_size(TimeDelta::from_millis(20), TimeDelta::from_millis(2))
            .unwrap();
        mac.set_schedule(Schedule::new(vec![vec![true]]).unwrap())
            .unwrap();

        // With p = 0 nothing is ever sent
        net_in.push(NetPacket::with_payload(1, 2, 1, 2, vec![1]));
        thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(mac.tx_prob(), 0.0);
        assert_eq!(radio.burst_count(), 0);

        // With p = 1 the queued packet goes out
        mac.set_tx_prob(1.0);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while radio.burst_count() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(5));
        }

        assert!(radio.burst_count() > 0);

        mac.stop();
        channelizer.stop();
        synthesizer.stop();
        net_in.disable();
    }
}
