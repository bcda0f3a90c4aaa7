/*! The time-domain channelizer.

Each channel runs an independent chain: mix down by the channel offset,
low-pass filter, and decimate with a mixing rational resampler, then feed
the channel-rate samples to the framing demodulator. A pool of worker
threads round-robins over the channels; every wideband buffer is fanned
out to a per-channel queue.

Per-channel demodulator state is owned by the worker responsible for the
channel and rebuilt after every reconfiguration.
*/

use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use anyhow::Result;
use log::debug;

use super::{check_channels, Channelizer, PacketSink};
use crate::buffer::{IQBuf, C};
use crate::channel::PhyChannel;
use crate::dsp::pfb::MixingRationalResampler;
use crate::phy::PacketDemodulator;
use crate::queue::SafeQueue;
use crate::sync::SyncBarrier;

/// Channel state for time-domain demodulation.
struct TdChannelDemodulator {
    chanidx: usize,
    channel: PhyChannel,
    rx_rate: f64,

    /// Resampling rate (channel rate / RX rate).
    rate: f64,

    /// Frequency shift (normalized).
    fshift: f64,

    /// Channel IQ buffer sequence number.
    seq: u64,

    /// Filter delay in wideband samples.
    delay: usize,

    resamp: MixingRationalResampler,
    resamp_buf: Vec<C>,
    demod: Box<dyn PacketDemodulator>,
}

impl TdChannelDemodulator {
    fn new(chanidx: usize, channel: PhyChannel, rx_rate: f64) -> Result<Self> {
        let rate = channel.channel.bw / rx_rate;
        let fshift = channel.channel.fc / rx_rate;
        let ntaps = channel.taps.len().max(1);
        let taps = if channel.taps.is_empty() {
            vec![C::new(1.0, 0.0)]
        } else {
            channel.taps.clone()
        };

        let resamp = MixingRationalResampler::from_rate(rate, fshift, taps)?;
        let demod = channel.phy.mk_demodulator();

        Ok(TdChannelDemodulator {
            chanidx,
            rx_rate,
            rate,
            fshift,
            seq: 0,
            delay: (ntaps - 1) / 2,
            resamp,
            resamp_buf: Vec::new(),
            demod,
            channel,
        })
    }

    /// Reset state on an IQ buffer discontinuity or when the demodulator
    /// is not mid-frame.
    fn update_seq(&mut self, seq: u64) {
        if seq != self.seq.wrapping_add(1) || !self.demod.is_frame_open() {
            self.reset();
        }

        self.seq = seq;
    }

    fn reset(&mut self) {
        self.resamp.reset();
        self.demod.reset(self.channel.channel);
        self.seq = 0;
    }

    fn timestamp(&mut self, t: crate::time::TimePoint, snapshot_off: Option<isize>) {
        self.demod
            .timestamp(t, snapshot_off, 0, self.delay, self.rate, self.rx_rate);
    }

    fn demodulate(&mut self, data: &[C], callback: crate::phy::DemodCallback) {
        if self.fshift != 0.0 || self.rate != 1.0 {
            self.resamp_buf.clear();
            self.resamp.resample_mix_down(data, &mut self.resamp_buf);
            self.demod.demodulate(&self.resamp_buf, callback);
        } else {
            self.demod.demodulate(data, callback);
        }
    }
}

/// Configuration shared between the control surface and the workers.
struct Shared {
    channels: Vec<PhyChannel>,
    rx_rate: f64,

    /// Per-channel queues of wideband buffers.
    iqbufs: Vec<Arc<SafeQueue<Arc<IQBuf>>>>,
}

pub struct TdChannelizer {
    sb: SyncBarrier,
    nthreads: usize,
    shared: RwLock<Shared>,
    sink: PacketSink,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl TdChannelizer {
    pub fn new(
        channels: Vec<PhyChannel>,
        rx_rate: f64,
        nthreads: usize,
        sink: PacketSink,
    ) -> Result<Arc<Self>> {
        check_channels(&channels, rx_rate)?;

        let channelizer = Arc::new(TdChannelizer {
            sb: SyncBarrier::new(nthreads + 1),
            nthreads,
            shared: RwLock::new(Shared {
                channels: Vec::new(),
                rx_rate,
                iqbufs: Vec::new(),
            }),
            sink,
            threads: Mutex::new(Vec::new()),
        });

        {
            let mut threads = channelizer.threads.lock().unwrap();

            for tid in 0..nthreads {
                let this = Arc::clone(&channelizer);

                threads.push(thread::spawn(move || this.demod_worker(tid)));
            }
        }

        // Initial configuration releases the workers from startup
        channelizer.modify(|shared| {
            shared.channels = channels;
            Self::rebuild_queues(shared);
        });

        Ok(channelizer)
    }

    fn rebuild_queues(shared: &mut Shared) {
        shared.iqbufs = (0..shared.channels.len())
            .map(|_| Arc::new(SafeQueue::new()))
            .collect();
    }

    /// Run a reconfiguration under the sync barrier.
    fn modify<F: FnOnce(&mut Shared)>(&self, f: F) -> bool {
        self.sb.modify(
            || {
                // Wake workers blocked on per-channel queues
                for q in self.shared.read().unwrap().iqbufs.iter() {
                    q.disable();
                }

                self.sb.wake();
            },
            || f(&mut self.shared.write().unwrap()),
        )
    }

    fn demod_worker(self: Arc<Self>, tid: usize) {
        let mut demods: Vec<TdChannelDemodulator> = Vec::new();
        let mut queues: Vec<Arc<SafeQueue<Arc<IQBuf>>>> = Vec::new();
        let mut next_snapshot_off: Option<isize> = None;

        loop {
            if self.sb.needs_sync() {
                self.sb.sync();

                if self.sb.is_done() {
                    return;
                }

                // Rebuild the state for the channels this worker owns
                let shared = self.shared.read().unwrap();

                demods.clear();
                queues.clear();

                for chanidx in (tid..shared.channels.len()).step_by(self.nthreads) {
                    match TdChannelDemodulator::new(
                        chanidx,
                        shared.channels[chanidx].clone(),
                        shared.rx_rate,
                    ) {
                        Ok(demod) => {
                            demods.push(demod);
                            queues.push(Arc::clone(&shared.iqbufs[chanidx]));
                        }
                        Err(err) => {
                            debug!("channel {} misconfigured: {}", chanidx, err);
                        }
                    }
                }

                drop(shared);

                // Nothing to do until the next reconfiguration
                if demods.is_empty() {
                    self.sb.sleep_until_state_change();
                    continue;
                }
            }

            for (demod, queue) in demods.iter_mut().zip(queues.iter()) {
                let iqbuf = match queue.pop() {
                    Some(iqbuf) => iqbuf,
                    None => break, // disabled; re-check for sync
                };

                iqbuf.wait_to_start_filling();

                // When the snapshot is over, keep accounting offsets for
                // one more buffer so a self-transmission spanning the
                // boundary is still recorded.
                let snapshot_off = iqbuf.snapshot_off().or(next_snapshot_off);

                demod.update_seq(iqbuf.seq);
                demod.timestamp(iqbuf.timestamp.unwrap_or_default(), snapshot_off);

                let chanidx = demod.chanidx;
                let channel = demod.channel.channel;
                let sink = &self.sink;
                let mut callback = |pkt: Option<crate::net::packet::RadioPacket>| {
                    if let Some(mut pkt) = pkt {
                        pkt.chanidx = chanidx;
                        pkt.channel = channel;
                        sink.push(pkt);
                    }
                };

                // Demodulate samples as the producer publishes them
                let mut ndemodulated = 0;

                loop {
                    let complete = iqbuf.is_complete();
                    let n = iqbuf.nsamples() - ndemodulated;

                    if n != 0 {
                        demod.demodulate(
                            &iqbuf.data()[ndemodulated..ndemodulated + n],
                            &mut callback,
                        );
                        ndemodulated += n;
                    } else if complete {
                        break;
                    } else {
                        thread::yield_now();
                    }
                }

                next_snapshot_off = iqbuf.snapshot_off().map(|off| off + iqbuf.len() as isize);
            }
        }
    }
}

impl Channelizer for TdChannelizer {
    fn push(&self, buf: Arc<IQBuf>) {
        let shared = self.shared.read().unwrap();

        for queue in &shared.iqbufs {
            queue.push(Arc::clone(&buf));
        }
    }

    fn channels(&self) -> Vec<PhyChannel> {
        self.shared.read().unwrap().channels.clone()
    }

    fn set_channels(&self, channels: Vec<PhyChannel>) -> Result<()> {
        check_channels(&channels, self.rx_rate())?;

        self.modify(|shared| {
            shared.channels = channels;
            Self::rebuild_queues(shared);
        });

        Ok(())
    }

    fn rx_rate(&self) -> f64 {
        self.shared.read().unwrap().rx_rate
    }

    fn set_rx_rate(&self, rate: f64) -> Result<()> {
        check_channels(&self.channels(), rate)?;

        self.modify(|shared| {
            shared.rx_rate = rate;
            Self::rebuild_queues(shared);
        });

        Ok(())
    }

    fn stop(&self) {
        if self.sb.modify(
            || {
                for q in self.shared.read().unwrap().iqbufs.iter() {
                    q.disable();
                }

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
    use crate::phy::loopback::LoopbackPhy;
    use crate::phy::{PacketModulator, Phy};
    use crate::time::MonoClock;

    fn loopback_channel(phy: &Arc<LoopbackPhy>) -> PhyChannel {
        // Single channel at baseband, full rate: no resampling in the way
        // of the loopback PHY's exact sample mapping.
        PhyChannel::new(
            Channel::new(0.0, 1e6),
            vec![],
            Arc::clone(phy) as Arc<dyn Phy>,
        )
    }

    #[test]
    fn demodulates_packets_from_stream() {
        let phy = Arc::new(LoopbackPhy::new(2));
        let sink: PacketSink = Arc::new(SafeQueue::new());
        let channelizer = TdChannelizer::new(
            vec![loopback_channel(&phy)],
            1e6,
            1,
            Arc::clone(&sink),
        )
        .unwrap();

        let mut modulator = phy.mk_modulator();
        let mpkt = modulator.modulate(NetPacket::with_payload(1, 2, 1, 2, vec![1, 2, 3]), 1.0);

        let mut iqbuf = IQBuf::new(mpkt.samples.len());
        iqbuf.seq = 1;
        iqbuf.timestamp = Some(MonoClock::now());
        let iqbuf = Arc::new(iqbuf);

        channelizer.push(Arc::clone(&iqbuf));

        // Stream the samples in after handing the buffer downstream
        iqbuf.extend(mpkt.samples.data());
        iqbuf.complete();

        let pkt = sink.pop().unwrap();
        assert_eq!(pkt.payload, vec![1, 2, 3]);
        assert_eq!(pkt.chanidx, 0);

        channelizer.stop();
    }

    #[test]
    fn sequence_gap_resets_demodulator() {
        let phy = Arc::new(LoopbackPhy::new(2));
        let sink: PacketSink = Arc::new(SafeQueue::new());
        let channelizer = TdChannelizer::new(
            vec![loopback_channel(&phy)],
            1e6,
            1,
            Arc::clone(&sink),
        )
        .unwrap();

        let mut modulator = phy.mk_modulator();
        let mpkt = modulator.modulate(NetPacket::with_payload(1, 2, 1, 2, vec![9; 16]), 1.0);
        let samples = mpkt.samples.data();
        let split = samples.len() / 2;

        // First half of the frame in buffer seq 1...
        let mut front = IQBuf::new(split);
        front.seq = 1;
        front.timestamp = Some(MonoClock::now());
        front.extend(&samples[..split]);
        front.complete();
        channelizer.push(Arc::new(front));

        // ...but the rest arrives in seq 3: the gap must reset the frame,
        // so nothing is delivered.
        let mut back = IQBuf::new(samples.len() - split);
        back.seq = 3;
        back.timestamp = Some(MonoClock::now());
        back.extend(&samples[split..]);
        back.complete();
        channelizer.push(Arc::new(back));

        // A complete frame afterwards still demodulates
        let mpkt = modulator.modulate(NetPacket::with_payload(1, 2, 1, 2, vec![7]), 1.0);
        let mut whole = IQBuf::new(mpkt.samples.len());
        whole.seq = 4;
        whole.timestamp = Some(MonoClock::now());
        whole.extend(mpkt.samples.data());
        whole.complete();
        channelizer.push(Arc::new(whole));

        let pkt = sink.pop().unwrap();
        assert_eq!(pkt.payload, vec![7]);
        assert!(sink.try_pop().is_none());

        channelizer.stop();
    }
}
