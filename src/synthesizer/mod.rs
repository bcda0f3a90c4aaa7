/*! Synthesizers: packets in, modulated IQ out.

A synthesizer pulls packets from the link-layer controller, modulates each
at its assigned MCS, and upsamples/mixes the result onto its channel. The
two flavors differ in how samples leave:

 * [channel::ChannelSynthesizer] (FDMA) runs free: modulated samples
   accumulate in a bounded queue the MAC drains continuously.
 * [slot::SlotSynthesizer] (TDMA/ALOHA) packs samples into discrete,
   deadline-stamped slots the MAC transmits as timed bursts.
*/

pub mod channel;
pub mod slot;

use std::sync::Arc;

use anyhow::Result;

use crate::buffer::{IQBuf, C};
use crate::channel::PhyChannel;
use crate::dsp::pfb::MixingRationalResampler;
use crate::net::packet::NetPacket;
use crate::phy::{ModPacket, PacketModulator};
use crate::schedule::Schedule;
use crate::time::TimePoint;

/// A source of packets to modulate. The link-layer controller implements
/// this; `None` means the source was kicked or shut down.
pub trait PacketSource: Send + Sync {
    fn pull(&self) -> Option<NetPacket>;

    /// Wake all pulls currently blocked in [pull] with a `None` return, so
    /// modulation workers can reach a reconfiguration barrier.
    ///
    /// [pull]: #method.pull
    fn kick(&self);
}

/// A batch of transmitted (or to-be-transmitted) modulated packets.
#[derive(Default)]
pub struct TxRecord {
    /// TX deadline, if the batch is bound to one.
    pub timestamp: Option<TimePoint>,

    /// Number of samples the deadline was delayed.
    pub delay: usize,

    /// Number of samples in the batch.
    pub nsamples: usize,

    /// The IQ buffers to transmit.
    pub iqbufs: Vec<Arc<IQBuf>>,

    /// The packets modulated into those buffers.
    pub mpkts: Vec<ModPacket>,
}

/// A fully synthesized slot ready for timed transmission.
pub struct TxSlot {
    /// Wall-clock time the slot's first sample must air.
    pub deadline: TimePoint,

    /// Samples of the slot already consumed by the previous slot's
    /// overfill.
    pub deadline_delay: usize,

    /// Number of samples in the slot.
    pub nsamples: usize,

    /// Number of samples in a full slot, including the guard.
    pub full_slot_samples: usize,

    /// The schedule slot this transmission belongs to.
    pub slotidx: usize,

    pub iqbufs: Vec<Arc<IQBuf>>,
    pub mpkts: Vec<ModPacket>,
}

impl TxSlot {
    /// Does the slot spill past its own boundary into the next?
    pub fn overfills(&self) -> bool {
        self.deadline_delay + self.nsamples > self.full_slot_samples
    }

    /// How many samples spill into the next slot.
    pub fn oversample(&self) -> usize {
        (self.deadline_delay + self.nsamples).saturating_sub(self.full_slot_samples)
    }
}

/// The synthesizer interface the MAC drives.
///
/// The channel flavor implements the record surface (`pop`, `try_pop`,
/// `pop_until`); the slot flavor implements the slot surface (`push_slot`,
/// `pop_slot`). The unused surface of each is a no-op.
pub trait Synthesizer: Send + Sync {
    fn channels(&self) -> Vec<PhyChannel>;

    fn set_channels(&self, channels: Vec<PhyChannel>) -> Result<()>;

    fn tx_rate(&self) -> f64;

    fn set_tx_rate(&self, rate: f64) -> Result<()>;

    fn set_schedule(&self, schedule: Schedule) -> Result<()>;

    /// Maximum number of queued samples before modulation blocks.
    fn high_water_mark(&self) -> Option<usize> {
        None
    }

    fn set_high_water_mark(&self, _mark: Option<usize>) {}

    fn is_enabled(&self) -> bool {
        true
    }

    fn enable(&self) {}

    fn disable(&self) {}

    /// Pop whatever samples are ready, without blocking.
    fn try_pop(&self) -> TxRecord {
        TxRecord::default()
    }

    /// Pop samples, blocking until some are ready.
    fn pop(&self) -> TxRecord {
        TxRecord::default()
    }

    /// Pop samples, blocking no later than the given monotonic time.
    fn pop_until(&self, _when: TimePoint) -> TxRecord {
        TxRecord::default()
    }

    /// Open a slot for modulation.
    ///
    /// `when` is the slot's wall-clock deadline, `max_samples` its usable
    /// sample budget, `full_slot_samples` the full slot length including
    /// guard, and `prev_oversample` how many samples the previous slot
    /// spilled into this one.
    fn push_slot(
        &self,
        _when: TimePoint,
        _slotidx: usize,
        _max_samples: usize,
        _full_slot_samples: usize,
        _prev_oversample: usize,
    ) {
    }

    /// Close the open slot and take its contents.
    fn pop_slot(&self) -> Option<TxSlot> {
        None
    }

    /// Stop modulating and join all workers.
    fn stop(&self);
}

/// Time-domain modulation chain for one channel: modulate at the channel
/// rate, then upsample and mix to the channel's frequency offset.
pub struct ChannelModulator {
    channel: PhyChannel,
    chanidx: usize,
    upsampler: MixingRationalResampler,
    modulator: Box<dyn PacketModulator>,
}

impl ChannelModulator {
    pub fn new(channel: PhyChannel, chanidx: usize, tx_rate: f64) -> Result<Self> {
        let bw = channel.channel.bw;
        let oversample = channel.phy.min_tx_rate_oversample().max(1) as f64;
        let rate = if bw == 0.0 {
            1.0
        } else {
            tx_rate / (oversample * bw)
        };
        let fshift = channel.channel.fc / tx_rate;
        let taps = if channel.taps.is_empty() {
            vec![C::new(1.0, 0.0)]
        } else {
            channel.taps.clone()
        };

        Ok(ChannelModulator {
            chanidx,
            upsampler: MixingRationalResampler::from_rate(rate, fshift, taps)?,
            modulator: channel.phy.mk_modulator(),
            channel,
        })
    }

    /// Modulate a packet to IQ at the TX rate, mixed to the channel.
    pub fn modulate(&mut self, pkt: NetPacket, g: f32) -> ModPacket {
        let g_effective = pkt.g * g;

        if self.upsampler.theta() != 0.0 || self.upsampler.rate() != 1.0 {
            // Modulate without gain; gain is applied during resampling
            let mut mpkt = self.modulator.modulate(pkt, 1.0);

            let delay = self.upsampler.delay().ceil() as usize;
            let interp = self.upsampler.interpolation_rate();
            let decim = self.upsampler.decimation_rate();

            // Pad the input so the filter delay flushes through
            let mut input = mpkt.samples.data().to_vec();
            input.resize(input.len() + delay / interp, C::new(0.0, 0.0));

            self.upsampler.reset();

            let mut upsampled = Vec::with_capacity(self.upsampler.needed_out(input.len()));
            self.upsampler
                .resample_mix_up(&input, g_effective, &mut upsampled);

            let out_delay = delay / decim;
            let mut iqbuf = IQBuf::from_samples(upsampled);

            iqbuf.delay = out_delay;
            mpkt.nsamples = iqbuf.len() - out_delay;
            mpkt.offset = out_delay;
            mpkt.samples = Arc::new(iqbuf);

            mpkt.chanidx = self.chanidx;
            mpkt.channel = self.channel.channel;
            mpkt
        } else {
            let mut mpkt = self.modulator.modulate(pkt, g_effective);

            mpkt.chanidx = self.chanidx;
            mpkt.channel = self.channel.channel;
            mpkt
        }
    }
}
