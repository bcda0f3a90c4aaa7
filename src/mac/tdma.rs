/*! The TDMA MAC.

A dedicated slot worker walks the schedule, opening each of our slots in
the synthesizer ahead of its wall-clock start and handing the packed slot
to the TX worker `slot_send_lead_time` early. Nodes share the frame by
owning disjoint slots.
*/

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Result};

use super::slotted::SlottedMac;
use super::{Load, Mac, MacConfig};
use crate::channelizer::Channelizer;
use crate::llc::Controller;
use crate::radio::Radio;
use crate::schedule::Schedule;
use crate::snapshot::SnapshotCollector;
use crate::synthesizer::Synthesizer;
use crate::time::{TimeDelta, WallClock};

pub struct Tdma {
    slotted: SlottedMac,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Tdma {
    pub fn new(
        radio: Arc<dyn Radio>,
        controller: Arc<dyn Controller>,
        collector: Arc<SnapshotCollector>,
        channelizer: Arc<dyn Channelizer>,
        synthesizer: Arc<dyn Synthesizer>,
        rx_period: f64,
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

        let tdma = Arc::new(Tdma {
            slotted: SlottedMac::new(mac),
            threads: Mutex::new(Vec::new()),
        });

        {
            let mut threads = tdma.threads.lock().unwrap();
            let workers: [fn(Arc<Self>); 4] = [
                |this| this.slotted.mac.rx_worker(),
                |this| this.slotted.tx_worker(),
                |this| this.tx_slot_worker(),
                |this| this.slotted.mac.tx_notifier(),
            ];

            for worker in workers {
                let this = Arc::clone(&tdma);

                threads.push(thread::spawn(move || worker(this)));
            }
        }

        tdma.modify(|_| {});

        Ok(tdma)
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

    pub fn slot_send_lead_time(&self) -> TimeDelta {
        self.slotted.slot_config.read().unwrap().slot_send_lead_time
    }

    pub fn set_slot_send_lead_time(&self, t: TimeDelta) {
        self.slotted.slot_config.write().unwrap().slot_send_lead_time = t;
    }

    pub fn superslots(&self) -> bool {
        self.slotted.slot_config.read().unwrap().superslots
    }

    pub fn set_superslots(&self, superslots: bool) {
        self.slotted.slot_config.write().unwrap().superslots = superslots;
    }

    /// Set slot and guard sizes.
    pub fn set_slot_size(&self, slot_size: TimeDelta, guard_size: TimeDelta) -> Result<()> {
        if guard_size >= slot_size {
            bail!("guard interval must be shorter than the slot");
        }

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

    pub fn set_rx_rate(&self, rate: f64) -> Result<()> {
        self.slotted.mac.channelizer.set_rx_rate(rate)?;
        self.slotted.mac.radio.set_rx_rate(rate)?;

        self.modify(move |config| {
            config.rx_rate = rate;
        });

        Ok(())
    }

    pub fn set_tx_rate(&self, rate: f64) -> Result<()> {
        self.slotted.mac.synthesizer.set_tx_rate(rate)?;
        self.slotted.mac.radio.set_tx_rate(rate)?;

        self.modify(move |config| {
            config.tx_rate = rate;
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
        let config = self.slotted.mac.config.read().unwrap();
        let can_transmit =
            (0..config.schedule.nslots()).any(|slot| config.schedule.can_transmit_in_slot(slot));

        self.slotted
            .mac
            .can_transmit
            .store(can_transmit, Ordering::Release);

        drop(config);
        *self.slotted.prev_oversample.lock().unwrap() = 0;
        self.slotted.resume();
    }

    /// Walk the schedule, preparing each of our slots for transmission.
    fn tx_slot_worker(&self) {
        loop {
            if self.slotted.mac.sb.needs_sync() {
                self.slotted.mac.sb.sync();

                if self.slotted.mac.sb.is_done() {
                    return;
                }
            }

            let schedule = self.slotted.mac.config.read().unwrap().schedule.clone();
            let lead = self.slotted.slot_config.read().unwrap().slot_send_lead_time;

            // Search from the point where we could still make a deadline
            let t = WallClock::now() + lead;

            match self.slotted.find_next_slot(t, &schedule) {
                Some((start, slotidx)) => {
                    self.slotted.run_slot(start, slotidx);
                }
                None => {
                    // No slot is ours; nothing to do until the schedule
                    // changes
                    self.slotted.mac.sb.sleep_until_state_change();
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
    fn transmits_only_in_owned_slots() {
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

        let mac = Tdma::new(
            Arc::clone(&radio) as Arc<dyn Radio>,
            controller,
            collector,
            channelizer.clone() as Arc<dyn Channelizer>,
            synthesizer.clone() as Arc<dyn Synthesizer>,
            0.01,
        )
        .unwrap();

        mac.set_slot_size(TimeDelta::from_millis(40), TimeDelta::from_millis(4))
            .unwrap();
        mac.set_slot_send_lead_time(TimeDelta::from_millis(10));
        mac.set_schedule(Schedule::new(vec![vec![true, false]]).unwrap())
            .unwrap();
        assert!(mac.can_transmit());

        // Feed packets; they should go out in slot-0 bursts
        for _ in 0..2 {
            net_in.push(NetPacket::with_payload(1, 2, 1, 2, vec![1, 2, 3]));
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while radio.burst_count() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(5));
        }

        assert!(radio.burst_count() > 0);

        // Every burst is timed, and its deadline falls on an even slot
        // boundary (slot 0 of the two-slot frame)
        let slot_secs = 0.040;

        for burst in radio.bursts.lock().unwrap().iter() {
            let when = burst.when.expect("slotted bursts are timed");
            let wall = WallClock::to_wall_time(when);
            let in_frame = (wall - crate::time::TimePoint::ZERO).as_secs_f64()
                % (2.0 * slot_secs);

            assert!(
                in_frame < slot_secs + 1e-3,
                "burst landed {}s into the frame",
                in_frame
            );
        }

        mac.stop();
        channelizer.stop();
        synthesizer.stop();
        net_in.disable();
    }
}
