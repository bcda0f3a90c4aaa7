/*! The free-running channel synthesizer (FDMA).

A pool of workers pulls packets, modulates them onto the synthesizer's
channel, and appends the samples to a shared [TxRecord] guarded by a mutex
and a pair of condition variables. The record is bounded by a high-water
mark in samples: producers block when the MAC falls behind, and the MAC
pops the accumulated record whenever it is ready to feed the radio.

The channel synthesized is the schedulable channel with the most slots;
with a proper FDMA schedule that is simply the channel assigned to us.
*/

use std::mem;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;

use anyhow::Result;
use log::debug;

use super::{ChannelModulator, PacketSource, Synthesizer, TxRecord};
use crate::channel::PhyChannel;
use crate::schedule::Schedule;
use crate::sync::SyncBarrier;
use crate::time::{MonoClock, TimePoint};

struct Shared {
    channels: Vec<PhyChannel>,
    tx_rate: f64,
    schedule: Schedule,

    /// Index of the channel we synthesize.
    chanidx: Option<usize>,
}

struct Queue {
    txrecord: TxRecord,
    enabled: bool,
    high_water_mark: Option<usize>,
}

pub struct ChannelSynthesizer {
    sb: SyncBarrier,
    shared: RwLock<Shared>,
    queue: Mutex<Queue>,
    producer_cv: Condvar,
    consumer_cv: Condvar,
    source: Arc<dyn PacketSource>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ChannelSynthesizer {
    pub fn new(
        channels: Vec<PhyChannel>,
        tx_rate: f64,
        nthreads: usize,
        source: Arc<dyn PacketSource>,
    ) -> Result<Arc<Self>> {
        let synthesizer = Arc::new(ChannelSynthesizer {
            sb: SyncBarrier::new(nthreads + 1),
            shared: RwLock::new(Shared {
                channels: Vec::new(),
                tx_rate,
                schedule: Schedule::default(),
                chanidx: None,
            }),
            queue: Mutex::new(Queue {
                txrecord: TxRecord::default(),
                enabled: true,
                high_water_mark: None,
            }),
            producer_cv: Condvar::new(),
            consumer_cv: Condvar::new(),
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
            Self::reconfigure(shared);
        });

        Ok(synthesizer)
    }

    fn modify<F: FnOnce(&mut Shared)>(&self, f: F) -> bool {
        self.sb.modify(
            || {
                // Wake producers blocked on the high-water mark or in the
                // packet source, and any consumer blocked in pop
                self.producer_cv.notify_all();
                self.consumer_cv.notify_all();
                self.source.kick();
                self.sb.wake();
            },
            || f(&mut self.shared.write().unwrap()),
        )
    }

    /// Pick the channel with the most schedulable slots.
    fn reconfigure(shared: &mut Shared) {
        shared.chanidx = None;

        let nchannels = shared.schedule.nchannels().min(shared.channels.len());
        let mut best = 0;

        for chan in 0..nchannels {
            let count = shared.schedule.row(chan).iter().filter(|&&s| s).count();

            if count > best {
                best = count;
                shared.chanidx = Some(chan);
            }
        }
    }

    /// Block until the queue has room below the high-water mark. Returns
    /// false if we should bail out for sync or shutdown instead.
    fn wait_until_can_push(&self) -> bool {
        let queue = self.queue.lock().unwrap();

        let queue = self
            .producer_cv
            .wait_while(queue, |q| {
                q.enabled
                    && !self.sb.needs_sync()
                    && matches!(q.high_water_mark, Some(mark) if q.txrecord.nsamples >= mark)
            })
            .unwrap();

        queue.enabled && !self.sb.needs_sync()
    }

    fn mod_worker(self: Arc<Self>, _tid: usize) {
        let mut modulator: Option<ChannelModulator> = None;

        loop {
            if self.sb.needs_sync() {
                self.sb.sync();

                if self.sb.is_done() {
                    return;
                }

                let shared = self.shared.read().unwrap();

                modulator = match shared.chanidx {
                    Some(chanidx) => {
                        match ChannelModulator::new(
                            shared.channels[chanidx].clone(),
                            chanidx,
                            shared.tx_rate,
                        ) {
                            Ok(modulator) => Some(modulator),
                            Err(err) => {
                                debug!("channel {} misconfigured: {}", chanidx, err);
                                None
                            }
                        }
                    }
                    None => None,
                };

                drop(shared);

                if modulator.is_none() {
                    self.sb.sleep_until_state_change();
                    continue;
                }
            }

            if !self.wait_until_can_push() {
                continue;
            }

            let pkt = match self.source.pull() {
                Some(pkt) => pkt,
                None => continue,
            };

            let mut mpkt = modulator.as_mut().unwrap().modulate(pkt, 1.0);

            let mut queue = self.queue.lock().unwrap();

            if !queue.enabled {
                // The packet is lost to reconfiguration; the link layer
                // will retransmit it if it mattered.
                continue;
            }

            // Offset within the batch, for TX timestamping downstream
            mpkt.start = queue.txrecord.nsamples;

            queue.txrecord.nsamples += mpkt.nsamples;
            queue.txrecord.iqbufs.push(Arc::clone(&mpkt.samples));
            queue.txrecord.mpkts.push(mpkt);

            drop(queue);
            self.consumer_cv.notify_all();
        }
    }

    fn take_record(queue: &mut Queue) -> TxRecord {
        mem::take(&mut queue.txrecord)
    }
}

impl Synthesizer for ChannelSynthesizer {
    fn channels(&self) -> Vec<PhyChannel> {
        self.shared.read().unwrap().channels.clone()
    }

    fn set_channels(&self, channels: Vec<PhyChannel>) -> Result<()> {
        self.modify(|shared| {
            shared.channels = channels;
            Self::reconfigure(shared);
        });

        Ok(())
    }

    fn tx_rate(&self) -> f64 {
        self.shared.read().unwrap().tx_rate
    }

    fn set_tx_rate(&self, rate: f64) -> Result<()> {
        self.modify(|shared| {
            shared.tx_rate = rate;
            Self::reconfigure(shared);
        });

        Ok(())
    }

    fn set_schedule(&self, schedule: Schedule) -> Result<()> {
        self.modify(|shared| {
            shared.schedule = schedule;
            Self::reconfigure(shared);
        });

        Ok(())
    }

    fn high_water_mark(&self) -> Option<usize> {
        self.queue.lock().unwrap().high_water_mark
    }

    fn set_high_water_mark(&self, mark: Option<usize>) {
        self.queue.lock().unwrap().high_water_mark = mark;
        self.producer_cv.notify_all();
    }

    fn is_enabled(&self) -> bool {
        self.queue.lock().unwrap().enabled
    }

    fn enable(&self) {
        self.queue.lock().unwrap().enabled = true;
        self.producer_cv.notify_all();
    }

    fn disable(&self) {
        self.queue.lock().unwrap().enabled = false;
        self.producer_cv.notify_all();
        self.consumer_cv.notify_all();
    }

    fn try_pop(&self) -> TxRecord {
        let mut queue = self.queue.lock().unwrap();
        let record = Self::take_record(&mut queue);

        drop(queue);
        self.producer_cv.notify_all();
        record
    }

    fn pop(&self) -> TxRecord {
        let queue = self.queue.lock().unwrap();

        let mut queue = self
            .consumer_cv
            .wait_while(queue, |q| q.enabled && q.txrecord.nsamples == 0)
            .unwrap();

        let record = Self::take_record(&mut queue);

        drop(queue);
        self.producer_cv.notify_all();
        record
    }

    fn pop_until(&self, when: TimePoint) -> TxRecord {
        let mut queue = self.queue.lock().unwrap();

        while queue.enabled && queue.txrecord.nsamples == 0 {
            let delta = when - MonoClock::now();

            if delta.as_secs_f64() <= 0.0 {
                break;
            }

            let (q, _timeout) = self
                .consumer_cv
                .wait_timeout(queue, delta.as_std())
                .unwrap();

            queue = q;
        }

        let record = Self::take_record(&mut queue);

        drop(queue);
        self.producer_cv.notify_all();
        record
    }

    fn stop(&self) {
        if self.sb.modify(
            || {
                self.queue.lock().unwrap().enabled = false;
                self.producer_cv.notify_all();
                self.consumer_cv.notify_all();
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

    struct QueueSource(NetQueue);

    impl PacketSource for QueueSource {
        fn pull(&self) -> Option<NetPacket> {
            NetLink::pull(&self.0)
        }

        fn kick(&self) {
            NetLink::kick(&self.0);
        }
    }

    fn setup(nmcs: usize) -> (Arc<LoopbackPhy>, Arc<QueueSource>, Arc<ChannelSynthesizer>) {
        let phy = Arc::new(LoopbackPhy::new(nmcs));
        let source = Arc::new(QueueSource(NetQueue::new()));
        let channels = vec![PhyChannel::new(
            Channel::new(0.0, 1e6),
            vec![],
            Arc::clone(&phy) as Arc<dyn Phy>,
        )];

        let synthesizer = ChannelSynthesizer::new(
            channels,
            1e6,
            2,
            Arc::clone(&source) as Arc<dyn PacketSource>,
        )
        .unwrap();

        // One channel, always ours
        synthesizer
            .set_schedule(Schedule::new(vec![vec![true]]).unwrap())
            .unwrap();

        (phy, source, synthesizer)
    }

    #[test]
    fn modulates_pulled_packets() {
        let (phy, source, synthesizer) = setup(2);

        let pkt = NetPacket::with_payload(1, 2, 1, 2, vec![1, 2, 3]);
        let expect = phy.modulated_size(0, pkt.serialize().len());

        source.0.push(pkt);

        let record = synthesizer.pop();
        assert_eq!(record.nsamples, expect);
        assert_eq!(record.mpkts.len(), 1);
        assert_eq!(record.iqbufs.len(), 1);

        synthesizer.stop();
    }

    #[test]
    fn pop_until_returns_empty_on_timeout() {
        let (_phy, _source, synthesizer) = setup(2);

        let record =
            synthesizer.pop_until(MonoClock::now() + crate::time::TimeDelta::from_millis(20));

        assert_eq!(record.nsamples, 0);
        synthesizer.stop();
    }

    #[test]
    fn accumulates_multiple_packets() {
        let (_phy, source, synthesizer) = setup(2);

        source.0.push(NetPacket::with_payload(1, 2, 1, 2, vec![1]));
        source.0.push(NetPacket::with_payload(1, 2, 1, 2, vec![2]));

        let mut total = 0;
        while total < 2 {
            total += synthesizer.pop().mpkts.len();
        }

        assert_eq!(total, 2);
        synthesizer.stop();
    }
}
