/*! The frequency-domain channelizer.

Overlap-save: one worker runs a single large forward FFT over the wideband
stream and publishes the spectra; per-channel workers then extract their
channel entirely in the frequency domain (bin rotation, filter multiply,
stride-sum decimation) and run a small inverse FFT to recover channel-rate
samples for the framing demodulator.

With prototype filter length `P` and overlap factor `V`:

```text
N = V*(P-1)    FFT size
O = P-1        overlap carried between blocks
L = N - O      new samples consumed per block
```

Each channel with decimation `D` and oversample `X` recovers `X*L/D`
samples per block after discarding `X*O/D` overlap samples. One FFT is
amortized across all channels at the cost of a latency floor of `L`
samples.
*/

use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use anyhow::{bail, Result};
use log::debug;

use super::{check_channels, Channelizer, PacketSink};
use crate::buffer::{IQBuf, C};
use crate::channel::PhyChannel;
use crate::dsp::fft::Fft;
use crate::phy::PacketDemodulator;
use crate::queue::SafeQueue;
use crate::sync::SyncBarrier;
use crate::time::TimePoint;

/// Overlap factor.
pub const V: usize = 4;

/// Largest supported prototype filter length.
pub const P_MAX: usize = 25 * 512 + 1;

/// A block of spectra handed to the per-channel workers.
#[derive(Clone)]
struct FdSlot {
    /// The slot's time-domain samples.
    iqbuf: Arc<IQBuf>,

    /// The slot's frequency-domain samples.
    fdbuf: Arc<IQBuf>,

    /// Offset of the frequency-domain samples from the time-domain
    /// samples: the FFT buffer may begin with samples carried over from
    /// the previous slot.
    fd_offset: isize,
}

/// Derived overlap-save geometry.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    p: usize,
    n: usize,
    o: usize,
    l: usize,
}

impl Geometry {
    fn for_taps(channels: &[PhyChannel]) -> Result<Geometry> {
        let p = channels
            .iter()
            .map(|chan| chan.taps.len())
            .max()
            .unwrap_or(1)
            .max(2);

        if p > P_MAX {
            bail!("prototype filter length {} exceeds maximum {}", p, P_MAX);
        }

        let n = V * (p - 1);
        let o = p - 1;

        Ok(Geometry { p, n, o, l: n - o })
    }
}

/// Per-channel state for frequency-domain demodulation.
struct FdChannelDemodulator {
    chanidx: usize,
    channel: PhyChannel,
    rx_rate: f64,
    rate: f64,
    geom: Geometry,

    /// Frequency-domain buffer sequence number.
    seq: u64,

    /// Oversample factor.
    x: usize,

    /// Decimation factor.
    d: usize,

    /// Number of FFT bins to rotate the channel down to bin zero.
    n_rot: usize,

    /// Filter delay in wideband samples.
    delay: usize,

    ifft: Fft,

    /// Rotated/filtered spectrum scratch.
    temp: Vec<C>,

    /// Stride-summed spectrum.
    dec: Vec<C>,

    /// Zero-padded IFFT input.
    ifft_in: Vec<C>,

    /// Frequency-domain filter: FFT of the zero-padded taps, scaled so a
    /// passband tone comes out at unit amplitude after the unnormalized
    /// inverse FFT.
    h: Vec<C>,

    demod: Box<dyn PacketDemodulator>,
}

impl FdChannelDemodulator {
    fn new(
        chanidx: usize,
        channel: PhyChannel,
        rx_rate: f64,
        geom: Geometry,
    ) -> Result<Self> {
        let bw = channel.channel.bw;
        let d = (rx_rate / bw).round() as usize;
        let x = channel.phy.min_rx_rate_oversample().max(1);
        let n = geom.n;

        if channel.taps.len() > geom.p {
            bail!(
                "channel filter has {} taps but the prototype length is {}",
                channel.taps.len(),
                geom.p
            );
        }

        if x > d {
            bail!("oversample factor {} exceeds decimation factor {}", x, d);
        }

        if n % d != 0 {
            bail!("FFT size {} is not divisible by decimation factor {}", n, d);
        }

        // Rotate the channel's center frequency down to bin 0
        let mut n_rot = (n as f64 * channel.channel.fc / rx_rate).round() as isize;

        while n_rot < 0 {
            n_rot += n as isize;
        }

        // The frequency-domain filter is the FFT of the zero-padded taps.
        // Fold in 1/N for the unnormalized inverse FFT and 1/D for the
        // summation during decimation.
        let mut h = vec![C::new(0.0, 0.0); n];
        let taps = if channel.taps.is_empty() {
            &[C::new(1.0, 0.0)][..]
        } else {
            &channel.taps[..]
        };

        h[..taps.len()].copy_from_slice(taps);
        Fft::forward(n).execute(&mut h);

        let inv = 1.0 / n as f32;

        for bin in &mut h {
            *bin *= inv;
        }

        let demod = channel.phy.mk_demodulator();

        Ok(FdChannelDemodulator {
            chanidx,
            rx_rate,
            rate: bw / rx_rate,
            geom,
            seq: 0,
            x,
            d,
            n_rot: n_rot as usize,
            delay: (taps.len().max(1) - 1) / 2,
            ifft: Fft::inverse(x * n / d),
            temp: vec![C::new(0.0, 0.0); n],
            dec: vec![C::new(0.0, 0.0); n / d],
            ifft_in: vec![C::new(0.0, 0.0); x * n / d],
            h,
            demod,
            channel,
        })
    }

    fn update_seq(&mut self, seq: u64) {
        if seq != self.seq.wrapping_add(1) || !self.demod.is_frame_open() {
            self.reset();
        }

        self.seq = seq;
    }

    fn reset(&mut self) {
        self.demod.reset(self.channel.channel);
        self.seq = 0;
    }

    fn timestamp(&mut self, t: TimePoint, snapshot_off: Option<isize>, offset: isize) {
        self.demod
            .timestamp(t, snapshot_off, offset, self.delay, self.rate, self.rx_rate);
    }

    /// Demodulate whole FFT blocks of spectrum.
    fn demodulate(&mut self, data: &[C], callback: crate::phy::DemodCallback) {
        let n = self.geom.n;
        let nchan = n / self.d;

        debug_assert_eq!(data.len() % n, 0);

        for block in data.chunks_exact(n) {
            // Shift FFT bins so the channel lands at bin 0
            let rot = self.n_rot;

            self.temp[..n - rot].copy_from_slice(&block[rot..]);
            self.temp[n - rot..].copy_from_slice(&block[..rot]);

            // Apply the frequency-domain filter
            for (bin, h) in self.temp.iter_mut().zip(self.h.iter()) {
                *bin *= h;
            }

            // Decimate by summing D strides of length N/D
            self.dec.copy_from_slice(&self.temp[..nchan]);

            for stride in 1..self.d {
                for k in 0..nchan {
                    self.dec[k] += self.temp[stride * nchan + k];
                }
            }

            // Zero-pad the middle of the spectrum when oversampling: the
            // positive frequencies stay at the head, the negative
            // frequencies move to the tail.
            let xn = self.x * nchan;

            self.ifft_in.fill(C::new(0.0, 0.0));
            self.ifft_in[..nchan / 2].copy_from_slice(&self.dec[..nchan / 2]);
            self.ifft_in[xn - nchan / 2..].copy_from_slice(&self.dec[nchan / 2..]);

            // Recover time-domain samples and discard the overlap
            self.ifft.execute(&mut self.ifft_in);

            let skip = self.x * self.geom.o / self.d;
            let take = self.x * self.geom.l / self.d;

            self.demod
                .demodulate(&self.ifft_in[skip..skip + take], callback);
        }
    }
}

struct Shared {
    channels: Vec<PhyChannel>,
    rx_rate: f64,
    geom: Geometry,

    /// Wideband buffers awaiting the FFT worker.
    tdbufs: Arc<SafeQueue<Arc<IQBuf>>>,

    /// Per-channel queues of spectra.
    slots: Vec<Arc<SafeQueue<FdSlot>>>,
}

pub struct FdChannelizer {
    sb: SyncBarrier,
    nthreads: usize,
    shared: RwLock<Shared>,
    sink: PacketSink,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl FdChannelizer {
    pub fn new(
        channels: Vec<PhyChannel>,
        rx_rate: f64,
        nthreads: usize,
        sink: PacketSink,
    ) -> Result<Arc<Self>> {
        check_channels(&channels, rx_rate)?;

        let geom = Geometry::for_taps(&channels)?;

        let channelizer = Arc::new(FdChannelizer {
            // Demod workers plus the FFT worker plus the mutator
            sb: SyncBarrier::new(nthreads + 2),
            nthreads,
            shared: RwLock::new(Shared {
                channels: Vec::new(),
                rx_rate,
                geom,
                tdbufs: Arc::new(SafeQueue::new()),
                slots: Vec::new(),
            }),
            sink,
            threads: Mutex::new(Vec::new()),
        });

        {
            let mut threads = channelizer.threads.lock().unwrap();
            let this = Arc::clone(&channelizer);

            threads.push(thread::spawn(move || this.fft_worker()));

            for tid in 0..nthreads {
                let this = Arc::clone(&channelizer);

                threads.push(thread::spawn(move || this.demod_worker(tid)));
            }
        }

        channelizer.modify(move |shared| {
            shared.channels = channels;
            shared.geom = geom;
            Self::rebuild_queues(shared);
        });

        Ok(channelizer)
    }

    fn rebuild_queues(shared: &mut Shared) {
        shared.tdbufs = Arc::new(SafeQueue::new());
        shared.slots = (0..shared.channels.len())
            .map(|_| Arc::new(SafeQueue::new()))
            .collect();
    }

    fn modify<F: FnOnce(&mut Shared)>(&self, f: F) -> bool {
        self.sb.modify(
            || {
                let shared = self.shared.read().unwrap();

                shared.tdbufs.disable();

                for q in &shared.slots {
                    q.disable();
                }

                drop(shared);
                self.sb.wake();
            },
            || f(&mut self.shared.write().unwrap()),
        )
    }

    /// The worker converting the wideband stream to the frequency domain.
    fn fft_worker(self: Arc<Self>) {
        let mut geom = Geometry { p: 2, n: V, o: 1, l: V - 1 };
        let mut fft = Fft::forward(geom.n);
        let mut fft_in: Vec<C> = vec![C::new(0.0, 0.0); geom.n];
        let mut fft_work: Vec<C> = vec![C::new(0.0, 0.0); geom.n];
        let mut fftoff = geom.o;
        let mut seq: u64 = 0;
        let mut tdbufs = None;
        let mut slots: Vec<Arc<SafeQueue<FdSlot>>> = Vec::new();

        loop {
            if self.sb.needs_sync() {
                self.sb.sync();

                if self.sb.is_done() {
                    return;
                }

                let shared = self.shared.read().unwrap();

                geom = shared.geom;
                fft = Fft::forward(geom.n);
                fft_in.clear();
                fft_in.resize(geom.n, C::new(0.0, 0.0));
                fft_work.clear();
                fft_work.resize(geom.n, C::new(0.0, 0.0));
                fftoff = geom.o;
                seq = 0;
                tdbufs = Some(Arc::clone(&shared.tdbufs));
                slots = shared.slots.clone();
            }

            let iqbuf = match tdbufs.as_ref().and_then(|q| q.pop()) {
                Some(iqbuf) => iqbuf,
                None => continue, // disabled; re-check for sync
            };

            // Reset FFT state on a discontinuity in the wideband stream
            if iqbuf.seq != seq.wrapping_add(1) {
                fft_in.fill(C::new(0.0, 0.0));
                fftoff = geom.o;
            }

            seq = iqbuf.seq;
            iqbuf.wait_to_start_filling();

            // One spectrum per block, with room for carryover and the
            // partial last block
            let nblocks = V + 1 + (iqbuf.capacity() + geom.l - 1) / geom.l;
            let mut fdbuf = IQBuf::new(geom.n * nblocks);

            fdbuf.seq = iqbuf.seq;
            fdbuf.timestamp = iqbuf.timestamp;
            fdbuf.fc = iqbuf.fc;
            fdbuf.fs = iqbuf.fs;
            fdbuf.set_snapshot_off(iqbuf.snapshot_off());

            let fdbuf = Arc::new(fdbuf);

            for q in &slots {
                q.push(FdSlot {
                    iqbuf: Arc::clone(&iqbuf),
                    fdbuf: Arc::clone(&fdbuf),
                    fd_offset: geom.o as isize - fftoff as isize,
                });
            }

            // Overlap-save over the buffer as samples become available
            let mut needed = geom.n - fftoff;
            let mut inoff = 0;
            let mut nsamples;

            loop {
                let complete = iqbuf.is_complete();
                nsamples = iqbuf.nsamples();

                if nsamples - inoff < needed {
                    if complete {
                        break;
                    }

                    thread::yield_now();
                    continue;
                }

                fft_in[fftoff..].copy_from_slice(&iqbuf.data()[inoff..inoff + needed]);

                fft_work.copy_from_slice(&fft_in);
                fft.execute(&mut fft_work);
                fdbuf.extend(&fft_work);

                // If the FFT buffer held no more than L samples, the next
                // FFT comes entirely from the input; otherwise part of the
                // current FFT input is reused.
                if fftoff <= geom.l {
                    inoff += geom.l - fftoff;
                    fftoff = 0;
                    needed = geom.n;
                } else {
                    fft_in.copy_within(geom.l.., 0);
                    fftoff -= geom.l;
                    needed += geom.l;
                }
            }

            fdbuf.complete();

            // Leftover samples seed the next buffer's first FFT
            let nleftover = nsamples - inoff;

            fft_in[fftoff..fftoff + nleftover]
                .copy_from_slice(&iqbuf.data()[inoff..nsamples]);
            fftoff += nleftover;
        }
    }

    fn demod_worker(self: Arc<Self>, tid: usize) {
        let mut demods: Vec<FdChannelDemodulator> = Vec::new();
        let mut queues: Vec<Arc<SafeQueue<FdSlot>>> = Vec::new();
        let mut next_snapshot_off: Option<isize> = None;
        let mut num_extra_snapshot_slots = 0u32;

        loop {
            if self.sb.needs_sync() {
                self.sb.sync();

                if self.sb.is_done() {
                    return;
                }

                let shared = self.shared.read().unwrap();

                demods.clear();
                queues.clear();

                for chanidx in (tid..shared.channels.len()).step_by(self.nthreads) {
                    match FdChannelDemodulator::new(
                        chanidx,
                        shared.channels[chanidx].clone(),
                        shared.rx_rate,
                        shared.geom,
                    ) {
                        Ok(demod) => {
                            demods.push(demod);
                            queues.push(Arc::clone(&shared.slots[chanidx]));
                        }
                        Err(err) => {
                            debug!("channel {} misconfigured: {}", chanidx, err);
                        }
                    }
                }

                drop(shared);

                if demods.is_empty() {
                    self.sb.sleep_until_state_change();
                    continue;
                }
            }

            for (demod, queue) in demods.iter_mut().zip(queues.iter()) {
                let slot = match queue.pop() {
                    Some(slot) => slot,
                    None => break, // disabled; re-check for sync
                };

                let fdbuf = &slot.fdbuf;
                let iqbuf = &slot.iqbuf;

                fdbuf.wait_to_start_filling();

                let snapshot_off = iqbuf.snapshot_off().or(next_snapshot_off);

                demod.update_seq(fdbuf.seq);
                demod.timestamp(
                    fdbuf.timestamp.unwrap_or_default(),
                    snapshot_off,
                    slot.fd_offset,
                );

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

                let n = demod.geom.n;
                let mut ndemodulated = 0;

                loop {
                    let complete = fdbuf.is_complete();
                    let avail = fdbuf.nsamples() - ndemodulated;
                    let nblocks = avail / n;

                    if nblocks > 0 {
                        demod.demodulate(
                            &fdbuf.data()[ndemodulated..ndemodulated + nblocks * n],
                            &mut callback,
                        );
                        ndemodulated += nblocks * n;
                    } else if complete {
                        break;
                    } else {
                        thread::yield_now();
                    }
                }

                // Keep snapshot offsets flowing for two slots past the end
                // of a snapshot so straddling transmissions are recorded.
                if let Some(off) = iqbuf.snapshot_off() {
                    next_snapshot_off = Some(off + iqbuf.len() as isize);
                    num_extra_snapshot_slots = 2;
                } else if num_extra_snapshot_slots > 0 {
                    num_extra_snapshot_slots -= 1;
                    next_snapshot_off =
                        next_snapshot_off.map(|off| off + iqbuf.len() as isize);
                } else {
                    next_snapshot_off = None;
                }
            }
        }
    }
}

impl Channelizer for FdChannelizer {
    fn push(&self, buf: Arc<IQBuf>) {
        self.shared.read().unwrap().tdbufs.push(buf);
    }

    fn channels(&self) -> Vec<PhyChannel> {
        self.shared.read().unwrap().channels.clone()
    }

    fn set_channels(&self, channels: Vec<PhyChannel>) -> Result<()> {
        check_channels(&channels, self.rx_rate())?;

        let geom = Geometry::for_taps(&channels)?;

        self.modify(move |shared| {
            shared.channels = channels;
            shared.geom = geom;
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
                let shared = self.shared.read().unwrap();

                shared.tdbufs.disable();

                for q in &shared.slots {
                    q.disable();
                }

                drop(shared);
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
    use crate::phy::{DemodCallback, McsEntry, PacketModulator, Phy};
    use std::f64::consts::PI;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A PHY whose demodulator records the samples it is fed.
    struct RecorderPhy {
        samples: Arc<Mutex<Vec<C>>>,
        calls: Arc<AtomicUsize>,
    }

    struct Recorder {
        samples: Arc<Mutex<Vec<C>>>,
        calls: Arc<AtomicUsize>,
    }

    impl PacketDemodulator for Recorder {
        fn reset(&mut self, _channel: Channel) {}

        fn timestamp(
            &mut self,
            _t: TimePoint,
            _snapshot_off: Option<isize>,
            _offset: isize,
            _delay: usize,
            _rate: f64,
            _rx_rate: f64,
        ) {
        }

        fn is_frame_open(&self) -> bool {
            // Keep demodulator state (and our recording) continuous
            true
        }

        fn demodulate(&mut self, samples: &[C], _callback: DemodCallback) {
            self.samples.lock().unwrap().extend_from_slice(samples);
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Phy for RecorderPhy {
        fn mcs_table(&self) -> Vec<McsEntry> {
            vec![]
        }

        fn modulated_size(&self, _mcsidx: usize, nbytes: usize) -> usize {
            nbytes
        }

        fn min_rx_rate_oversample(&self) -> usize {
            2
        }

        fn min_tx_rate_oversample(&self) -> usize {
            1
        }

        fn mk_modulator(&self) -> Box<dyn PacketModulator> {
            unimplemented!("receive-only test PHY")
        }

        fn mk_demodulator(&self) -> Box<dyn PacketDemodulator> {
            Box::new(Recorder {
                samples: Arc::clone(&self.samples),
                calls: Arc::clone(&self.calls),
            })
        }
    }

    /// Prototype lowpass with unity DC gain.
    fn lowpass(cutoff: f64, ntaps: usize) -> Vec<C> {
        let mid = (ntaps - 1) as f64 / 2.0;
        let mut taps: Vec<f64> = (0..ntaps)
            .map(|i| {
                let t = i as f64 - mid;
                let sinc = if t == 0.0 {
                    2.0 * cutoff
                } else {
                    (2.0 * PI * cutoff * t).sin() / (PI * t)
                };
                let window =
                    0.54 - 0.46 * (2.0 * PI * i as f64 / (ntaps - 1) as f64).cos();
                sinc * window
            })
            .collect();

        let sum: f64 = taps.iter().sum();
        for t in &mut taps {
            *t /= sum;
        }

        taps.into_iter().map(|t| C::new(t as f32, 0.0)).collect()
    }

    #[test]
    fn tone_lands_in_its_channel() {
        // Two channels at +/- bw/2 with D = 4, X = 2
        let rx_rate = 1.0e6;
        let bw = 250e3;
        let p = 129;
        let taps = lowpass(0.5 / 4.0, p);

        let phy0 = Arc::new(RecorderPhy {
            samples: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        });
        let phy1 = Arc::new(RecorderPhy {
            samples: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        });

        let chan0_samples = Arc::clone(&phy0.samples);
        let chan1_samples = Arc::clone(&phy1.samples);

        let channels = vec![
            PhyChannel::new(Channel::new(-bw / 2.0, bw), taps.clone(), phy0 as _),
            PhyChannel::new(Channel::new(bw / 2.0, bw), taps, phy1 as _),
        ];

        let sink: PacketSink = Arc::new(SafeQueue::new());
        let channelizer =
            FdChannelizer::new(channels, rx_rate, 2, Arc::clone(&sink)).unwrap();

        let geom = Geometry { p, n: V * (p - 1), o: p - 1, l: (V - 1) * (p - 1) };

        // A tone at channel 1's center frequency, three FFTs' worth
        let f = (bw / 2.0) / rx_rate;
        let total = 3 * geom.n;
        let samples: Vec<C> = (0..total)
            .map(|i| {
                let theta = 2.0 * PI * f * i as f64;
                C::new(theta.cos() as f32, theta.sin() as f32)
            })
            .collect();

        let mut iqbuf = IQBuf::new(total);
        iqbuf.seq = 1;
        iqbuf.timestamp = Some(crate::time::MonoClock::now());
        iqbuf.extend(&samples);
        iqbuf.complete();

        channelizer.push(Arc::new(iqbuf));

        // D = 4, X = 2: each block yields X*L/D channel samples
        let d = 4;
        let x = 2;
        let expect_per_block = x * geom.l / d;

        // Wait for the pipeline to drain
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let n1 = chan1_samples.lock().unwrap().len();

            if n1 >= 3 * expect_per_block || std::time::Instant::now() > deadline {
                break;
            }

            thread::yield_now();
        }

        channelizer.stop();

        let ch1 = chan1_samples.lock().unwrap();
        assert!(ch1.len() >= 3 * expect_per_block);

        // Skip the filter transient, then the tone should sit at DC on
        // channel 1 with amplitude within 0.5 dB of unity
        let steady = &ch1[expect_per_block..2 * expect_per_block];
        let mean_amp: f32 =
            steady.iter().map(|s| s.norm()).sum::<f32>() / steady.len() as f32;

        assert!(
            (20.0 * (mean_amp as f64).log10()).abs() < 0.5,
            "channel 1 amplitude {} off unity",
            mean_amp
        );

        // Channel 0 sees only stopband leakage: > 40 dB down
        let ch0 = chan0_samples.lock().unwrap();
        let steady0 = &ch0[expect_per_block..2 * expect_per_block];
        let mean_amp0: f32 =
            steady0.iter().map(|s| s.norm()).sum::<f32>() / steady0.len() as f32;

        assert!(
            mean_amp0 < mean_amp * 0.01,
            "channel 0 leakage {} vs channel 1 {}",
            mean_amp0,
            mean_amp
        );
    }
}
