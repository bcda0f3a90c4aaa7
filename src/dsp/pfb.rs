/*! Polyphase filter bank resamplers.

A prototype FIR filter of length `P` is decomposed into `L` phases: phase
`i` gets every `L`th tap starting at `i`, reversed and scaled by `L` to
compensate for interpolation loss. The sample window holds `ceil(P/L)`
input samples; each output is one dot product of the window against one
phase.

The mixing rational resampler additionally applies a frequency shift
`theta` (a normalized frequency, specified at the higher of the input and
output rates). The prototype lowpass is converted to a bandpass filter by
progressively rotating its taps, and a numerically controlled oscillator
mixes the signal itself: on the input side for upsampling, on the output
side for downsampling. The NCO advance is rate-compensated so the shift
comes out at `theta` regardless of the resampling ratio.
*/

use std::f64::consts::PI;

use anyhow::{bail, Result};

use crate::buffer::{SampleWindow, C};
use crate::dsp::nco::TableNco;
use crate::dsp::rationalize;

/// Largest denominator considered when converting a real rate to a
/// rational one.
const MAX_RATIO: usize = 512;

/// Tap decomposition shared by all the resamplers.
#[derive(Debug, Clone)]
struct Pfb {
    /// Number of phases.
    l: usize,

    /// Taps per phase.
    n: usize,

    /// Prototype filter taps.
    taps: Vec<C>,

    /// Adjusted (possibly bandpass-converted) taps.
    adjtaps: Vec<C>,

    /// Per-phase reversed taps.
    rtaps: Vec<Vec<C>>,

    /// Sample window.
    w: SampleWindow,
}

impl Pfb {
    fn new(l: usize, taps: Vec<C>) -> Result<Self> {
        if taps.is_empty() {
            bail!("polyphase filter taps must be non-empty");
        }

        let mut pfb = Pfb {
            l,
            n: 0,
            adjtaps: taps.clone(),
            taps,
            rtaps: Vec::new(),
            w: SampleWindow::new(1),
        };

        pfb.reconfigure();
        Ok(pfb)
    }

    /// Recompute per-phase taps and resize the window for the current
    /// number of phases and adjusted taps.
    fn reconfigure(&mut self) {
        let ntaps = self.adjtaps.len();

        // Each phase gets every l-th tap, padded with zeros so all phases
        // have the same length.
        self.n = (ntaps + self.l - 1) / self.l;
        self.w.resize(self.n);

        self.rtaps.clear();
        self.rtaps.resize(self.l, vec![C::new(0.0, 0.0); self.n]);

        for i in 0..ntaps {
            self.rtaps[i % self.l][self.n - 1 - i / self.l] =
                self.adjtaps[i] * self.l as f32;
        }
    }

    fn set_adjtaps(&mut self, adjtaps: Vec<C>) {
        self.adjtaps = adjtaps;
        self.reconfigure();
    }

    fn delay(&self) -> f64 {
        (self.taps.len() as f64 - 1.0) / 2.0
    }

    fn reset(&mut self) {
        self.w.reset();
    }
}

/// An upsampler by an integer rate `L`.
#[derive(Debug, Clone)]
pub struct Upsampler {
    pfb: Pfb,
}

impl Upsampler {
    /// `taps` is the prototype FIR filter, which should have unity gain.
    pub fn new(l: usize, taps: Vec<C>) -> Result<Self> {
        Ok(Upsampler {
            pfb: Pfb::new(l, taps)?,
        })
    }

    pub fn rate(&self) -> f64 {
        self.pfb.l as f64
    }

    /// Filter delay in prototype samples.
    pub fn delay(&self) -> f64 {
        self.pfb.delay()
    }

    pub fn reset(&mut self) {
        self.pfb.reset();
    }

    /// Resample, appending output samples to `out`.
    pub fn resample(&mut self, input: &[C], out: &mut Vec<C>) {
        for &x in input {
            self.pfb.w.add(x);

            for j in 0..self.pfb.l {
                out.push(self.pfb.w.dotprod(&self.pfb.rtaps[j]));
            }
        }
    }
}

/// A downsampler by an integer rate `M`.
#[derive(Debug, Clone)]
pub struct Downsampler {
    pfb: Pfb,
    m: usize,
    idx: usize,
}

impl Downsampler {
    /// `taps` is the prototype FIR filter, which should have unity gain.
    pub fn new(m: usize, taps: Vec<C>) -> Result<Self> {
        Ok(Downsampler {
            pfb: Pfb::new(1, taps)?,
            m,
            idx: 0,
        })
    }

    pub fn rate(&self) -> f64 {
        1.0 / self.m as f64
    }

    pub fn delay(&self) -> f64 {
        self.pfb.delay()
    }

    pub fn reset(&mut self) {
        self.idx = 0;
        self.pfb.reset();
    }

    pub fn resample(&mut self, input: &[C], out: &mut Vec<C>) {
        for &x in input {
            self.pfb.w.add(x);

            if self.idx == 0 {
                out.push(self.pfb.w.dotprod(&self.pfb.rtaps[0]));
            }

            self.idx = (self.idx + 1) % self.m;
        }
    }
}

/// A rational resampler by `L/M`.
#[derive(Debug, Clone)]
pub struct RationalResampler {
    pfb: Pfb,
    m: usize,
    idx: usize,
}

impl RationalResampler {
    pub fn new(l: usize, m: usize, taps: Vec<C>) -> Result<Self> {
        Ok(RationalResampler {
            pfb: Pfb::new(l, taps)?,
            m,
            idx: 0,
        })
    }

    pub fn rate(&self) -> f64 {
        self.pfb.l as f64 / self.m as f64
    }

    pub fn interpolation_rate(&self) -> usize {
        self.pfb.l
    }

    pub fn decimation_rate(&self) -> usize {
        self.m
    }

    pub fn delay(&self) -> f64 {
        self.pfb.delay()
    }

    /// Upper bound on the output count for `count` input samples.
    pub fn needed_out(&self, count: usize) -> usize {
        (count * self.pfb.l + self.idx) / self.m + 1
    }

    pub fn reset(&mut self) {
        self.idx = 0;
        self.pfb.reset();
    }

    pub fn resample(&mut self, input: &[C], out: &mut Vec<C>) {
        for &x in input {
            self.pfb.w.add(x);

            for j in 0..self.pfb.l {
                if self.idx == 0 {
                    out.push(self.pfb.w.dotprod(&self.pfb.rtaps[j]));
                }

                self.idx = (self.idx + 1) % self.m;
            }
        }
    }
}

/// A rational resampler that also mixes by a frequency shift.
#[derive(Debug, Clone)]
pub struct MixingRationalResampler {
    resamp: RationalResampler,
    theta: f64,
    nco: TableNco,
}

impl MixingRationalResampler {
    /// A resampler by `l/m` shifting by normalized frequency `theta`.
    pub fn new(l: usize, m: usize, theta: f64, taps: Vec<C>) -> Result<Self> {
        let mut resamp = MixingRationalResampler {
            resamp: RationalResampler::new(l, m, taps)?,
            theta,
            nco: TableNco::default(),
        };

        resamp.reconfigure();
        Ok(resamp)
    }

    /// A resampler for a real rate, approximated by a bounded rational.
    pub fn from_rate(rate: f64, theta: f64, taps: Vec<C>) -> Result<Self> {
        if rate <= 0.0 {
            bail!("resampling rate must be positive: {}", rate);
        }

        let (l, m) = rationalize(rate, MAX_RATIO);

        Self::new(l, m, theta, taps)
    }

    pub fn rate(&self) -> f64 {
        self.resamp.rate()
    }

    pub fn interpolation_rate(&self) -> usize {
        self.resamp.interpolation_rate()
    }

    pub fn decimation_rate(&self) -> usize {
        self.resamp.decimation_rate()
    }

    pub fn delay(&self) -> f64 {
        self.resamp.delay()
    }

    pub fn needed_out(&self, count: usize) -> usize {
        self.resamp.needed_out(count)
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn set_theta(&mut self, theta: f64) {
        self.theta = theta;
        self.reconfigure();
    }

    /// The bandpass-converted prototype taps.
    pub fn bandpass_taps(&self) -> &[C] {
        &self.resamp.pfb.adjtaps
    }

    pub fn reset(&mut self) {
        self.resamp.reset();
        self.nco.set_phase(0.0);
    }

    /// Resample and mix the input up by `theta`, scaling by `scale`.
    pub fn resample_mix_up(&mut self, input: &[C], scale: f32, out: &mut Vec<C>) {
        let RationalResampler { pfb, m, idx } = &mut self.resamp;

        for &x in input {
            pfb.w.add(self.nco.mix_up(x * scale));

            for j in 0..pfb.l {
                if *idx == 0 {
                    out.push(pfb.w.dotprod(&pfb.rtaps[j]));
                }

                *idx = (*idx + 1) % *m;
            }
        }
    }

    /// Resample the input, which carries a signal at `theta`, and mix it
    /// down to baseband.
    pub fn resample_mix_down(&mut self, input: &[C], out: &mut Vec<C>) {
        let RationalResampler { pfb, m, idx } = &mut self.resamp;

        for &x in input {
            pfb.w.add(x);

            for j in 0..pfb.l {
                if *idx == 0 {
                    let y = pfb.w.dotprod(&pfb.rtaps[j]);
                    out.push(self.nco.mix_down(y));
                }

                *idx = (*idx + 1) % *m;
            }
        }
    }

    /// Convert the prototype lowpass into a bandpass filter and set the
    /// NCO advance, both compensated for the resampling ratio: the shift
    /// is specified at the higher of the input and output rates.
    fn reconfigure(&mut self) {
        let l = self.resamp.pfb.l as f64;
        let m = self.resamp.m as f64;
        let rate = l / m;

        let dtheta = if rate > 1.0 {
            2.0 * PI * self.theta / m
        } else {
            2.0 * PI * self.theta / l
        };

        let mut tap_nco = TableNco::new(dtheta);
        let adjtaps: Vec<C> = self
            .resamp
            .pfb
            .taps
            .iter()
            .map(|&t| tap_nco.mix_up(t))
            .collect();

        self.resamp.pfb.set_adjtaps(adjtaps);
        self.resamp.reset();

        if rate > 1.0 {
            self.nco.reset(2.0 * PI * self.theta * l / m);
        } else {
            self.nco.reset(2.0 * PI * self.theta * m / l);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A Hamming-windowed sinc lowpass with unity DC gain.
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

    fn tone(f: f64, n: usize) -> Vec<C> {
        (0..n)
            .map(|i| {
                let theta = 2.0 * PI * f * i as f64;
                C::new(theta.cos() as f32, theta.sin() as f32)
            })
            .collect()
    }

    #[test]
    fn empty_taps_rejected() {
        assert!(Upsampler::new(4, vec![]).is_err());
        assert!(RationalResampler::new(2, 3, vec![]).is_err());
    }

    #[test]
    fn upsample_then_downsample_is_identity() {
        const L: usize = 4;
        const P: usize = 33; // (P - 1) divisible by L

        let taps = lowpass(0.5 / L as f64, P);
        let mut up = Upsampler::new(L, taps.clone()).unwrap();
        let mut down = Downsampler::new(L, taps).unwrap();

        let input = tone(0.02, 256);
        let mut mid = Vec::new();
        up.resample(&input, &mut mid);
        assert_eq!(mid.len(), input.len() * L);

        let mut out = Vec::new();
        down.resample(&mid, &mut out);
        assert_eq!(out.len(), input.len());

        // Total delay: (P-1)/2 at the high rate for each filter
        let delay = (P - 1) / L;

        for k in delay..out.len() {
            let expect = input[k - delay];
            assert!(
                (out[k].re - expect.re).abs() < 0.05,
                "sample {}: {} vs {}",
                k,
                out[k].re,
                expect.re
            );
            assert!((out[k].im - expect.im).abs() < 0.05);
        }
    }

    #[test]
    fn rational_resampler_output_count() {
        let taps = lowpass(0.25, 16);
        let mut resamp = RationalResampler::new(3, 2, taps).unwrap();

        let input = tone(0.01, 100);
        let mut out = Vec::new();
        resamp.resample(&input, &mut out);

        assert_eq!(out.len(), 150);
        assert!(out.len() <= resamp.needed_out(input.len()));
    }

    #[test]
    fn mixing_down_equals_plain_resampling_of_shifted_tone() {
        const M: usize = 4;
        const P: usize = 65;

        let theta = 0.125;
        let f = 0.01;
        let taps = lowpass(0.5 / M as f64, P);

        // Tone at theta + f through the mixing resampler...
        let mut mixing = MixingRationalResampler::new(1, M, theta, taps.clone()).unwrap();
        let mut mixed = Vec::new();
        mixing.resample_mix_down(&tone(theta + f, 512), &mut mixed);

        // ...versus a tone at f through the plain resampler
        let mut plain = RationalResampler::new(1, M, taps).unwrap();
        let mut expect = Vec::new();
        plain.resample(&tone(f, 512), &mut expect);

        assert_eq!(mixed.len(), expect.len());

        // Skip the filter transient
        let skip = P / M;

        for k in skip..mixed.len() {
            assert!(
                (mixed[k].re - expect[k].re).abs() < 0.05,
                "sample {}: {} vs {}",
                k,
                mixed[k].re,
                expect[k].re
            );
            assert!((mixed[k].im - expect[k].im).abs() < 0.05);
        }
    }

    #[test]
    fn mix_up_shifts_baseband_to_theta() {
        const L: usize = 4;
        const P: usize = 65;

        let theta = 0.2; // at the output rate
        let taps = lowpass(0.5 / L as f64, P);
        let mut mixing = MixingRationalResampler::new(L, 1, theta, taps).unwrap();

        let mut out = Vec::new();
        mixing.resample_mix_up(&tone(0.0, 256), 1.0, &mut out);

        // Compare against an ideal tone at theta, allowing a constant
        // phase offset from the filter transient: check the per-sample
        // phase advance instead of absolute phase.
        let skip = P;
        for k in skip..out.len() - 1 {
            let rot = out[k + 1] * out[k].conj();
            let advance = (rot.im.atan2(rot.re) as f64) / (2.0 * PI);

            assert!(
                (advance - theta).abs() < 0.01,
                "sample {}: advance {} vs {}",
                k,
                advance,
                theta
            );
        }
    }
}
