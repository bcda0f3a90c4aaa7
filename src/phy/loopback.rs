/*! A loopback PHY for testing and bench use.

Frames are "modulated" by mapping bytes directly onto sample amplitudes:
a start marker carrying the MCS index, a length sample, then each byte as
one sample repeated according to the MCS's samples-per-byte factor. A
matching demodulator decodes them exactly, so a TX-to-RX loop reproduces
packets bit-for-bit without a real framing stack.

Higher MCS indices use fewer samples per byte, so adaptive-MCS behavior
(packet sizing, PER window sizing) is exercised realistically.
*/

use std::sync::{Arc, Mutex};

use super::{
    DemodCallback, Mcs, McsEntry, McsIdx, ModPacket, PacketDemodulator, PacketModulator, Phy,
};
use crate::buffer::{IQBuf, C};
use crate::channel::Channel;
use crate::net::packet::{NetPacket, RadioPacket};
use crate::time::TimePoint;

const MARKER: f32 = -1000.0;

/// Per-frame overhead in samples: marker + length.
const OVERHEAD: usize = 2;

struct Shared {
    /// Synthesized (EVM, RSSI) reported on demodulated packets.
    quality: Mutex<(f32, f32)>,
}

/// A PHY that maps bytes directly to samples.
pub struct LoopbackPhy {
    mcs_table: Vec<McsEntry>,
    shared: Arc<Shared>,
}

impl LoopbackPhy {
    /// A loopback PHY with `nmcs` MCS levels.
    pub fn new(nmcs: usize) -> Self {
        assert!(nmcs > 0);

        let mcs_table = (0..nmcs)
            .map(|i| McsEntry {
                mcs: Mcs {
                    crc: "crc32",
                    fec0: "v29",
                    fec1: "rs8",
                    ms: ["bpsk", "qpsk", "qam16", "qam64", "qam128", "qam256"]
                        [i.min(5)],
                },
                valid: true,
            })
            .collect();

        LoopbackPhy {
            mcs_table,
            shared: Arc::new(Shared {
                quality: Mutex::new((-20.0, -40.0)),
            }),
        }
    }

    /// Samples per byte at the given MCS.
    pub fn samples_per_byte(&self, mcsidx: McsIdx) -> usize {
        2 * (self.mcs_table.len() - mcsidx)
    }

    /// Set the (EVM, RSSI) reported on subsequently demodulated packets.
    pub fn set_channel_quality(&self, evm: f32, rssi: f32) {
        *self.shared.quality.lock().unwrap() = (evm, rssi);
    }
}

impl Phy for LoopbackPhy {
    fn mcs_table(&self) -> Vec<McsEntry> {
        self.mcs_table.clone()
    }

    fn modulated_size(&self, mcsidx: McsIdx, nbytes: usize) -> usize {
        OVERHEAD + nbytes * self.samples_per_byte(mcsidx)
    }

    fn min_rx_rate_oversample(&self) -> usize {
        1
    }

    fn min_tx_rate_oversample(&self) -> usize {
        1
    }

    fn mk_modulator(&self) -> Box<dyn PacketModulator> {
        Box::new(LoopbackModulator {
            nmcs: self.mcs_table.len(),
        })
    }

    fn mk_demodulator(&self) -> Box<dyn PacketDemodulator> {
        Box::new(LoopbackDemodulator {
            nmcs: self.mcs_table.len(),
            shared: Arc::clone(&self.shared),
            state: DemodState::Idle,
            frame: Vec::new(),
            timestamp: TimePoint::ZERO,
            snapshot_off: None,
        })
    }
}

struct LoopbackModulator {
    nmcs: usize,
}

impl PacketModulator for LoopbackModulator {
    fn modulate(&mut self, pkt: NetPacket, _g: f32) -> ModPacket {
        let bytes = pkt.serialize();
        let spb = 2 * (self.nmcs - pkt.mcsidx);
        let mut samples = Vec::with_capacity(OVERHEAD + bytes.len() * spb);

        samples.push(C::new(MARKER, pkt.mcsidx as f32));
        samples.push(C::new(bytes.len() as f32, 0.0));

        for &byte in &bytes {
            for _ in 0..spb {
                samples.push(C::new(byte as f32, 0.0));
            }
        }

        let nsamples = samples.len();

        ModPacket {
            samples: Arc::new(IQBuf::from_samples(samples)),
            offset: 0,
            nsamples,
            chanidx: 0,
            channel: Channel::default(),
            start: 0,
            pkt,
        }
    }
}

enum DemodState {
    Idle,

    /// Seen the marker; `spb` decoded from it, awaiting the length.
    WantLen { spb: usize },

    /// Accumulating `nbytes * spb` frame samples.
    InFrame { spb: usize, nbytes: usize },
}

struct LoopbackDemodulator {
    nmcs: usize,
    shared: Arc<Shared>,
    state: DemodState,
    frame: Vec<C>,
    timestamp: TimePoint,
    snapshot_off: Option<isize>,
}

impl PacketDemodulator for LoopbackDemodulator {
    fn reset(&mut self, _channel: Channel) {
        self.state = DemodState::Idle;
        self.frame.clear();
    }

    fn timestamp(
        &mut self,
        t: TimePoint,
        snapshot_off: Option<isize>,
        _offset: isize,
        _delay: usize,
        _rate: f64,
        _rx_rate: f64,
    ) {
        self.timestamp = t;
        self.snapshot_off = snapshot_off;
    }

    fn is_frame_open(&self) -> bool {
        !matches!(self.state, DemodState::Idle)
    }

    fn demodulate(&mut self, samples: &[C], callback: DemodCallback) {
        for &x in samples {
            match self.state {
                DemodState::Idle => {
                    if x.re < MARKER / 2.0 {
                        let mcsidx = (x.im.round() as usize).min(self.nmcs - 1);

                        self.state = DemodState::WantLen {
                            spb: 2 * (self.nmcs - mcsidx),
                        };
                    }
                }
                DemodState::WantLen { spb } => {
                    let nbytes = x.re.round() as usize;

                    if nbytes == 0 {
                        self.state = DemodState::Idle;
                        callback(None);
                    } else {
                        self.frame.clear();
                        self.state = DemodState::InFrame { spb, nbytes };
                    }
                }
                DemodState::InFrame { spb, nbytes } => {
                    self.frame.push(x);

                    if self.frame.len() == nbytes * spb {
                        let bytes: Vec<u8> = self
                            .frame
                            .iter()
                            .step_by(spb)
                            .map(|s| s.re.round().clamp(0.0, 255.0) as u8)
                            .collect();

                        let mut pkt = RadioPacket::parse(&bytes, true);
                        let (evm, rssi) = *self.shared.quality.lock().unwrap();

                        pkt.evm = evm;
                        pkt.rssi = rssi;
                        pkt.timestamp = self.timestamp;
                        pkt.snapshot_off = self.snapshot_off;

                        self.state = DemodState::Idle;
                        self.frame.clear();
                        callback(Some(pkt));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::Seq;

    #[test]
    fn modulate_demodulate_round_trip() {
        let phy = LoopbackPhy::new(4);
        let mut modulator = phy.mk_modulator();
        let mut demodulator = phy.mk_demodulator();

        let mut pkt = NetPacket::with_payload(1, 2, 1, 2, vec![10, 20, 30]);
        pkt.hdr.seq = Seq(5);
        pkt.mcsidx = 2;

        let mpkt = modulator.modulate(pkt, 1.0);
        assert_eq!(
            mpkt.nsamples,
            phy.modulated_size(2, mpkt.pkt.serialize().len())
        );

        let mut out = Vec::new();
        demodulator.demodulate(mpkt.samples.data(), &mut |pkt| out.push(pkt));

        assert_eq!(out.len(), 1);
        let rx = out[0].as_ref().unwrap();
        assert_eq!(rx.hdr.seq, Seq(5));
        assert_eq!(rx.payload, vec![10, 20, 30]);
        assert!(!rx.internal_flags.invalid_header);
    }

    #[test]
    fn split_delivery_keeps_frame_open() {
        let phy = LoopbackPhy::new(4);
        let mut modulator = phy.mk_modulator();
        let mut demodulator = phy.mk_demodulator();

        let mpkt = modulator.modulate(NetPacket::with_payload(1, 2, 1, 2, vec![7; 8]), 1.0);
        let samples = mpkt.samples.data();
        let mut out = Vec::new();

        demodulator.demodulate(&samples[..10], &mut |pkt| out.push(pkt));
        assert!(demodulator.is_frame_open());
        assert!(out.is_empty());

        demodulator.demodulate(&samples[10..], &mut |pkt| out.push(pkt));
        assert!(!demodulator.is_frame_open());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn higher_mcs_is_denser() {
        let phy = LoopbackPhy::new(4);

        assert!(phy.modulated_size(3, 100) < phy.modulated_size(0, 100));
    }
}
