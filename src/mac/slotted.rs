/*! Machinery shared by the slotted MACs (TDMA and slotted ALOHA).

A slot worker walks wall-clock slot boundaries: it opens the next
transmittable slot in the synthesizer early enough for modulation, closes
it `slot_send_lead_time` before it starts, and hands the result to the TX
worker, which queues the samples on the radio timed to the slot start.

Slots are guarded against overrun by their sample budget; samples may
spill into the following slot only when it is ours too and superslots are
enabled, in which case the spill is charged against the next slot's
budget.
*/

use std::sync::{Mutex, RwLock};

use super::Mac;
use crate::queue::SafeQueue;
use crate::schedule::Schedule;
use crate::synthesizer::{TxRecord, TxSlot};
use crate::time::{TimeDelta, TimePoint, WallClock};

pub(crate) struct SlotConfig {
    /// Length of a slot (sec), guard included.
    pub slot_size: TimeDelta,

    /// Guard interval at the end of a slot (sec).
    pub guard_size: TimeDelta,

    /// How far ahead of a slot's start its samples must be ready.
    pub slot_send_lead_time: TimeDelta,

    /// Allow a burst to run through two consecutive slots we own.
    pub superslots: bool,
}

impl Default for SlotConfig {
    fn default() -> Self {
        SlotConfig {
            slot_size: TimeDelta::from_millis(10),
            guard_size: TimeDelta::from_millis(1),
            slot_send_lead_time: TimeDelta::from_millis(5),
            superslots: false,
        }
    }
}

impl SlotConfig {
    /// TX samples in the usable portion of a slot.
    pub fn tx_slot_samps(&self, tx_rate: f64) -> usize {
        ((self.slot_size - self.guard_size).as_secs_f64() * tx_rate) as usize
    }

    /// TX samples in a full slot, guard included.
    pub fn tx_full_slot_samps(&self, tx_rate: f64) -> usize {
        (self.slot_size.as_secs_f64() * tx_rate) as usize
    }
}

pub(crate) struct SlottedMac {
    pub mac: Mac,
    pub slot_config: RwLock<SlotConfig>,

    /// Synthesized slots awaiting transmission.
    pub tx_slot: SafeQueue<TxSlot>,

    /// Overfill carried into the next slot.
    pub prev_oversample: Mutex<usize>,
}

impl SlottedMac {
    pub fn new(mac: Mac) -> Self {
        SlottedMac {
            mac,
            slot_config: RwLock::new(SlotConfig::default()),
            tx_slot: SafeQueue::new(),
            prev_oversample: Mutex::new(0),
        }
    }

    /// Find the start time and index of the next slot after `t` in which
    /// the schedule lets us transmit.
    pub fn find_next_slot(
        &self,
        t: TimePoint,
        schedule: &Schedule,
    ) -> Option<(TimePoint, usize)> {
        let nslots = schedule.nslots();

        if nslots == 0 {
            return None;
        }

        let slot_size = self.slot_config.read().unwrap().slot_size;
        let secs = (t - TimePoint::ZERO).as_secs_f64();
        let cur = (secs / slot_size.as_secs_f64()).floor() as usize;

        for k in 1..=nslots {
            let slotidx = (cur + k) % nslots;

            if schedule.can_transmit_in_slot(slotidx) {
                let start =
                    TimePoint::from_secs_f64((cur + k) as f64 * slot_size.as_secs_f64());

                return Some((start, slotidx));
            }
        }

        None
    }

    /// Transmit synthesized slots at their deadlines.
    pub fn tx_worker(&self) {
        loop {
            if self.mac.sb.needs_sync() {
                self.mac.sb.sync();

                if self.mac.sb.is_done() {
                    return;
                }
            }

            let slot = match self.tx_slot.pop() {
                Some(slot) => slot,
                None => continue,
            };

            // An empty slot ends any burst in flight
            if slot.nsamples == 0 {
                if self.mac.radio.in_tx_burst() {
                    self.mac.radio.stop_tx_burst();
                }

                continue;
            }

            let tx_rate = self.mac.config.read().unwrap().tx_rate;
            let superslots = self.slot_config.read().unwrap().superslots;

            let when = WallClock::to_mono_time(slot.deadline)
                + TimeDelta::from_secs_f64(slot.deadline_delay as f64 / tx_rate);

            // Keep the burst open only when it legitimately continues into
            // the next slot
            let end_of_burst = !(superslots && slot.overfills());

            self.mac.radio.burst_tx(
                Some(when),
                !self.mac.radio.in_tx_burst(),
                end_of_burst,
                &slot.iqbufs,
            );

            self.mac.tx_records.push(TxRecord {
                timestamp: Some(when),
                delay: slot.deadline_delay,
                nsamples: slot.nsamples,
                iqbufs: slot.iqbufs,
                mpkts: slot.mpkts,
            });
        }
    }

    /// Open the slot in the synthesizer and, once its deadline is near,
    /// close it and queue it for transmission.
    pub fn run_slot(&self, start: TimePoint, slotidx: usize) {
        let (lead, superslots, tx_slot_samps, tx_full_slot_samps) = {
            let config = self.slot_config.read().unwrap();
            let tx_rate = self.mac.config.read().unwrap().tx_rate;

            (
                config.slot_send_lead_time,
                config.superslots,
                config.tx_slot_samps(tx_rate),
                config.tx_full_slot_samps(tx_rate),
            )
        };

        let prev_oversample = *self.prev_oversample.lock().unwrap();

        self.mac.synthesizer.push_slot(
            start,
            slotidx,
            tx_slot_samps,
            tx_full_slot_samps,
            prev_oversample,
        );

        // Sleep until the slot must be closed to make its deadline
        let close_at = WallClock::to_mono_time(start) - lead;
        let delta = close_at - crate::time::MonoClock::now();

        if delta > TimeDelta::ZERO {
            std::thread::sleep(delta.as_std());
        }

        if let Some(slot) = self.mac.synthesizer.pop_slot() {
            *self.prev_oversample.lock().unwrap() =
                if superslots { slot.oversample() } else { 0 };

            self.tx_slot.push(slot);
        }
    }

    pub fn wake_dependents(&self) {
        self.mac.wake_dependents();
        self.tx_slot.disable();
    }

    pub fn resume(&self) {
        self.tx_slot.enable();
        self.mac.resume();

        self.mac
            .load
            .lock()
            .unwrap()
            .reset(self.mac.synthesizer.channels().len());
    }
}
