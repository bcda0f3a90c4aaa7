/*! The slot synthesizer (TDMA / slotted ALOHA).

The MAC opens a slot ahead of its deadline; modulation workers pack
modulated packets into it until the next packet no longer fits, then the
MAC closes the slot and transmits its contents as one timed burst.

A packet that does not fit stays in the synthesizer's pending queue and is
the first candidate for the next slot. When superslots are enabled and the
following slot on the same channel is also ours, a slot may overfill past
its sample budget; the spilled samples are accounted against the next slot
through its `deadline_delay`.

A packet's transmit timestamp is assigned at the moment it is placed in a
slot, from the slot deadline and the packet's sample offset within the
slot, so timestamp exchange sees the exact airtime.
*/

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;

use anyhow::Result;
use log::debug;

use super::{ChannelModulator, PacketSource, Synthesizer, TxRecord, TxSlot};
use crate::channel::PhyChannel;
use crate::phy::ModPacket;
use crate::schedule::Schedule;
use crate::time::{TimeDelta, TimePoint};

/// A time slot being synthesized.
pub struct Slot {
    /// Wall-clock time the slot's first sample must air.
    pub deadline: TimePoint,

    /// Samples of this slot already consumed by the previous slot's
    /// overfill.
    pub deadline_delay: usize,

    /// Number of samples in a full slot, including the guard.
    pub full_slot_samples: usize,

    /// The schedule slot this slot represents.
    pub slotidx: usize,

    /// TX sample rate, for timestamping packets by offset.
    tx_rate: f64,

    /// No further samples may be added.
    closed: AtomicBool,

    inner: Mutex<SlotInner>,
}

struct SlotInner {
    /// Usable sample budget.
    max_samples: usize,

    /// Number of samples packed so far.
    nsamples: usize,

    iqbufs: Vec<Arc<crate::buffer::IQBuf>>,
    mpkts: Vec<ModPacket>,
}

impl Slot {
    fn new(
        deadline: TimePoint,
        slotidx: usize,
        max_samples: usize,
        full_slot_samples: usize,
        deadline_delay: usize,
        tx_rate: f64,
    ) -> Self {
        Slot {
            deadline,
            deadline_delay,
            full_slot_samples,
            slotidx,
            tx_rate,
            closed: AtomicBool::new(false),
            inner: Mutex::new(SlotInner {
                max_samples,
                nsamples: 0,
                iqbufs: Vec::new(),
                mpkts: Vec::new(),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Try to pack a modulated packet into the slot. Returns the packet
    /// back if it does not fit or the slot is closed.
    ///
    /// With `overfill`, a packet may exceed the budget as long as the
    /// budget itself has not been reached.
    fn push(&self, mut mpkt: ModPacket, overfill: bool) -> Result<(), ModPacket> {
        if self.is_closed() {
            return Err(mpkt);
        }

        let mut inner = self.inner.lock().unwrap();
        let n = mpkt.nsamples;
        let budget = inner.max_samples;

        if inner.nsamples + n <= budget || (inner.nsamples < budget && overfill) {
            let start = self.deadline_delay + inner.nsamples;

            mpkt.start = start;
            mpkt.pkt.tx_timestamp =
                self.deadline + TimeDelta::from_secs_f64(start as f64 / self.tx_rate);

            inner.nsamples += n;
            inner.iqbufs.push(Arc::clone(&mpkt.samples));
            inner.mpkts.push(mpkt);

            Ok(())
        } else {
            Err(mpkt)
        }
    }

    /// Close the slot and take its contents.
    fn close(&self) -> TxSlot {
        self.closed.store(true, Ordering::Release);

        let mut inner = self.inner.lock().unwrap();

        TxSlot {
            deadline: self.deadline,
            deadline_delay: self.deadline_delay,
            nsamples: inner.nsamples,
            full_slot_samples: self.full_slot_samples,
            slotidx: self.slotidx,
            iqbufs: std::mem::take(&mut inner.iqbufs),
            mpkts: std::mem::take(&mut inner.mpkts),
        }
    }
}

struct Shared {
    channels: Vec<PhyChannel>,
    tx_rate: f64,
    schedule: Schedule,
}

pub struct SlotSynthesizer {
    sb: crate::sync::SyncBarrier,
    shared: RwLock<Shared>,

    /// The slot currently open for modulation.
    cur: Mutex<Option<Arc<Slot>>>,
    slot_cv: Condvar,

    /// Packets that missed their slot, first in line for the next one.
    pending: Mutex<VecDeque<ModPacket>>,

    /// May a slot bleed into a following slot we also own?
    superslots: AtomicBool,

    source: Arc<dyn PacketSource>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl SlotSynthesizer {
    pub fn new(
        channels: Vec<PhyChannel>,
        tx_rate: f64,
        nthreads: usize,
        source: Arc<dyn PacketSource>,
    ) -> Result<Arc<Self>> {
        let synthesizer = Arc::new(SlotSynthesizer {
            sb: crate::sync::SyncBarrier::new(nthreads + 1),
            shared: RwLock::new(Shared {
                channels: Vec::new(),
                tx_rate,
                schedule: Schedule::default(),
            }),
            cur: Mutex::new(None),
            slot_cv: Condvar::new(),
            pending: Mutex::new(VecDeque::new()),
            superslots: AtomicBool::new(false),
            source,
            threads: Mutex::new(Vec::new()),
        });

        {
            let mut threads = synthesizer.threads.lock().unwrap();

            for tid in 0..nthreads {
                let this = Arc::clone(&synthesizer);

                threads.push(thread::spawn(move || this.mod_worker(tid)));
            }
        }

        synthesizer.modify(|shared| {
            shared.channels = channels;
        });

        Ok(synthesizer)
    }

    pub fn superslots(&self) -> bool {
        self.superslots.load(Ordering::Acquire)
    }

    pub fn set_superslots(&self, superslots: bool) {
        self.superslots.store(superslots, Ordering::Release);
    }

    fn modify<F: FnOnce(&mut Shared)>(&self, f: F) -> bool {
        self.sb.modify(
            || {
                self.slot_cv.notify_all();
                self.source.kick();
                self.sb.wake();
            },
            || f(&mut self.shared.write().unwrap()),
        )
    }

    /// Wait until a slot other than `prev` is open. Returns `None` when a
    /// sync is pending instead.
    fn wait_for_slot(&self, prev: Option<&Arc<Slot>>) -> Option<Arc<Slot>> {
        let cur = self.cur.lock().unwrap();

        let cur = self
            .slot_cv
            .wait_while(cur, |cur| {
                if self.sb.needs_sync() {
                    return false;
                }

                match cur {
                    None => true,
                    Some(slot) => {
                        slot.is_closed()
                            || matches!(prev, Some(prev) if Arc::ptr_eq(prev, slot))
                    }
                }
            })
            .unwrap();

        if self.sb.needs_sync() {
            return None;
        }

        cur.clone()
    }

    /// Is overfilling permitted for the given slot? Only when superslots
    /// are enabled and the next slot on the same channel is also ours.
    fn may_overfill(&self, schedule: &Schedule, chanidx: usize, slotidx: usize) -> bool {
        if !self.superslots() || schedule.nslots() == 0 {
            return false;
        }

        schedule.row(chanidx)[(slotidx + 1) % schedule.nslots()]
    }

    fn mod_worker(self: Arc<Self>, _tid: usize) {
        let mut modulators: Vec<ChannelModulator> = Vec::new();
        let mut slot: Option<Arc<Slot>> = None;

        loop {
            if self.sb.needs_sync() {
                self.sb.sync();

                if self.sb.is_done() {
                    return;
                }

                let shared = self.shared.read().unwrap();

                modulators.clear();

                for (chanidx, channel) in shared.channels.iter().enumerate() {
                    match ChannelModulator::new(channel.clone(), chanidx, shared.tx_rate) {
                        Ok(modulator) => modulators.push(modulator),
                        Err(err) => {
                            debug!("channel {} misconfigured: {}", chanidx, err);
                        }
                    }
                }

                drop(shared);
                slot = None;
            }

            let cur = match self.wait_for_slot(slot.as_ref()) {
                Some(cur) => cur,
                None => continue,
            };

            let (chanidx, overfill) = {
                let shared = self.shared.read().unwrap();

                match shared.schedule.first_channel_idx(cur.slotidx) {
                    Some(chanidx) => (
                        chanidx,
                        self.may_overfill(&shared.schedule, chanidx, cur.slotidx),
                    ),
                    None => {
                        // Not our slot after a schedule change; wait for
                        // the next one
                        slot = Some(cur);
                        continue;
                    }
                }
            };

            if chanidx >= modulators.len() {
                slot = Some(cur);
                continue;
            }

            // A packet that missed an earlier slot goes first
            let held = self.pending.lock().unwrap().pop_front();

            let mpkt = match held {
                Some(mpkt) => mpkt,
                None => {
                    let pkt = match self.source.pull() {
                        Some(pkt) => pkt,
                        None => continue,
                    };

                    modulators[chanidx].modulate(pkt, 1.0)
                }
            };

            match cur.push(mpkt, overfill) {
                Ok(()) => {}
                Err(mpkt) => {
                    // Slot full or closed; hold the packet and move on to
                    // the next slot
                    self.pending.lock().unwrap().push_front(mpkt);
                    slot = Some(cur);
                }
            }
        }
    }
}

impl Synthesizer for SlotSynthesizer {
    fn channels(&self) -> Vec<PhyChannel> {
        self.shared.read().unwrap().channels.clone()
    }

    fn set_channels(&self, channels: Vec<PhyChannel>) -> Result<()> {
        self.modify(|shared| {
            shared.channels = channels;
        });

        Ok(())
    }

    fn tx_rate(&self) -> f64 {
        self.shared.read().unwrap().tx_rate
    }

    fn set_tx_rate(&self, rate: f64) -> Result<()> {
        self.modify(|shared| {
            shared.tx_rate = rate;
        });

        Ok(())
    }

    fn set_schedule(&self, schedule: Schedule) -> Result<()> {
        self.modify(|shared| {
            shared.schedule = schedule;
        });

        Ok(())
    }

    fn push_slot(
        &self,
        when: TimePoint,
        slotidx: usize,
        max_samples: usize,
        full_slot_samples: usize,
        prev_oversample: usize,
    ) {
        let tx_rate = self.shared.read().unwrap().tx_rate;
        let slot = Arc::new(Slot::new(
            when,
            slotidx,
            max_samples.saturating_sub(prev_oversample),
            full_slot_samples,
            prev_oversample,
            tx_rate,
        ));

        *self.cur.lock().unwrap() = Some(slot);
        self.slot_cv.notify_all();
    }

    fn pop_slot(&self) -> Option<TxSlot> {
        let slot = self.cur.lock().unwrap().take()?;

        Some(slot.close())
    }

    /// Slot synthesizers hand out samples only through slots.
    fn try_pop(&self) -> TxRecord {
        TxRecord::default()
    }

    fn stop(&self) {
        if self.sb.modify(
            || {
                self.slot_cv.notify_all();
                self.source.kick();
                self.sb.wake();
            },
            || self.sb.set_done(),
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
    use crate::channel::Channel;
    use crate::net::packet::NetPacket;
    use crate::net::queue::{NetLink, NetQueue};
    use crate::phy::loopback::LoopbackPhy;
    use crate::phy::Phy;
    use crate::time::WallClock;

    struct QueueSource(NetQueue);

    impl PacketSource for QueueSource {
        fn pull(&self) -> Option<NetPacket> {
            NetLink::pull(&self.0)
        }

        fn kick(&self) {
            NetLink::kick(&self.0);
        }
    }

    fn setup() -> (Arc<LoopbackPhy>, Arc<QueueSource>, Arc<SlotSynthesizer>) {
        let phy = Arc::new(LoopbackPhy::new(2));
        let source = Arc::new(QueueSource(NetQueue::new()));
        let channels = vec![PhyChannel::new(
            Channel::new(0.0, 1e6),
            vec![],
            Arc::clone(&phy) as Arc<dyn Phy>,
        )];

        let synthesizer = SlotSynthesizer::new(
            channels,
            1e6,
            1,
            Arc::clone(&source) as Arc<dyn PacketSource>,
        )
        .unwrap();

        synthesizer
            .set_schedule(Schedule::new(vec![vec![true, false]]).unwrap())
            .unwrap();

        (phy, source, synthesizer)
    }

    fn wait_for_samples(synthesizer: &SlotSynthesizer, want: usize) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);

        loop {
            {
                let cur = synthesizer.cur.lock().unwrap();

                if let Some(slot) = cur.as_ref() {
                    if slot.inner.lock().unwrap().nsamples >= want {
                        return;
                    }
                }
            }

            if std::time::Instant::now() > deadline {
                return;
            }

            thread::yield_now();
        }
    }

    #[test]
    fn packs_packets_into_slot() {
        let (phy, source, synthesizer) = setup();

        let pkt = NetPacket::with_payload(1, 2, 1, 2, vec![1, 2, 3]);
        let nsamples = phy.modulated_size(0, pkt.serialize().len());

        synthesizer.push_slot(WallClock::now(), 0, 10 * nsamples, 12 * nsamples, 0);

        source.0.push(pkt);
        wait_for_samples(&synthesizer, nsamples);

        let slot = synthesizer.pop_slot().unwrap();
        assert_eq!(slot.nsamples, nsamples);
        assert_eq!(slot.mpkts.len(), 1);
        assert_eq!(slot.slotidx, 0);
        assert!(!slot.overfills());

        synthesizer.stop();
    }

    #[test]
    fn oversized_packet_carries_to_next_slot() {
        let (phy, source, synthesizer) = setup();

        let pkt = NetPacket::with_payload(1, 2, 1, 2, vec![0; 64]);
        let nsamples = phy.modulated_size(0, pkt.serialize().len());

        // Slot too small for the packet
        synthesizer.push_slot(WallClock::now(), 0, nsamples / 2, nsamples, 0);
        source.0.push(pkt);

        // Give the worker time to try, fail, and hold the packet
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while synthesizer.pending.lock().unwrap().is_empty()
            && std::time::Instant::now() < deadline
        {
            thread::yield_now();
        }

        let slot = synthesizer.pop_slot().unwrap();
        assert_eq!(slot.nsamples, 0);

        // A big enough slot picks the held packet up
        synthesizer.push_slot(WallClock::now(), 0, 2 * nsamples, 2 * nsamples, 0);
        wait_for_samples(&synthesizer, nsamples);

        let slot = synthesizer.pop_slot().unwrap();
        assert_eq!(slot.nsamples, nsamples);

        synthesizer.stop();
    }

    #[test]
    fn slot_packing_carries_overflow() {
        let (phy, source, synthesizer) = setup();

        let mk = || NetPacket::with_payload(1, 2, 1, 2, vec![0; 16]);
        let nsamples = phy.modulated_size(0, mk().serialize().len());

        // Room for exactly three packets; the guard is not usable
        synthesizer.push_slot(WallClock::now(), 0, 3 * nsamples, 3 * nsamples + 400, 0);

        for _ in 0..4 {
            source.0.push(mk());
        }

        // Three packets pack; the fourth is held for the next slot
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while synthesizer.pending.lock().unwrap().is_empty()
            && std::time::Instant::now() < deadline
        {
            thread::yield_now();
        }

        let slot = synthesizer.pop_slot().unwrap();
        assert_eq!(slot.mpkts.len(), 3);
        assert_eq!(slot.nsamples, 3 * nsamples);
        assert!(!slot.overfills());

        // The held packet leads the next slot
        synthesizer.push_slot(WallClock::now(), 0, 3 * nsamples, 3 * nsamples + 400, 0);
        wait_for_samples(&synthesizer, nsamples);

        let slot = synthesizer.pop_slot().unwrap();
        assert_eq!(slot.mpkts.len(), 1);
        assert_eq!(slot.mpkts[0].start, 0);

        synthesizer.stop();
    }

    #[test]
    fn timestamps_follow_slot_offset() {
        let (phy, source, synthesizer) = setup();

        let pkt = NetPacket::with_payload(1, 2, 1, 2, vec![5]);
        let nsamples = phy.modulated_size(0, pkt.serialize().len());
        let deadline = WallClock::now();

        synthesizer.push_slot(deadline, 0, 4 * nsamples, 4 * nsamples, 0);
        source.0.push(pkt.clone());
        source.0.push(pkt);

        wait_for_samples(&synthesizer, 2 * nsamples);

        let slot = synthesizer.pop_slot().unwrap();
        assert_eq!(slot.mpkts.len(), 2);

        let t0 = slot.mpkts[0].pkt.tx_timestamp;
        let t1 = slot.mpkts[1].pkt.tx_timestamp;

        assert_eq!(slot.mpkts[0].start, 0);
        assert_eq!(slot.mpkts[1].start, nsamples);
        assert!(((t1 - t0).as_secs_f64() - nsamples as f64 / 1e6).abs() < 1e-9);
        assert!(((t0 - deadline).as_secs_f64()).abs() < 1e-9);

        synthesizer.stop();
    }
}
