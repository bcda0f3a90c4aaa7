/*! The framing PHY abstraction.

The concrete framing implementation (OFDM frame synthesis, FEC, CRC) is an
external collaborator; this module defines the capability the rest of the
stack consumes: a table of modulation-and-coding schemes, per-packet
modulators producing IQ samples at the channel rate, and per-channel
demodulators turning IQ samples back into packets via a callback.
*/

pub mod loopback;

use std::sync::Arc;

use crate::buffer::{IQBuf, C};
use crate::channel::Channel;
use crate::net::packet::{NetPacket, RadioPacket};
use crate::time::TimePoint;

/// An index into a PHY's MCS table.
pub type McsIdx = usize;

/// A modulation and coding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mcs {
    /// Data validity check.
    pub crc: &'static str,

    /// Inner FEC.
    pub fec0: &'static str,

    /// Outer FEC.
    pub fec1: &'static str,

    /// Modulation scheme.
    pub ms: &'static str,
}

/// An MCS table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McsEntry {
    pub mcs: Mcs,

    /// Usable under the current PHY configuration?
    pub valid: bool,
}

/// A modulated packet.
pub struct ModPacket {
    /// The modulated samples, upsampled and mixed to the channel.
    pub samples: Arc<IQBuf>,

    /// Offset of the first valid sample (filter delay compensation).
    pub offset: usize,

    /// Number of valid samples.
    pub nsamples: usize,

    /// Index of the channel the packet was modulated on.
    pub chanidx: usize,

    /// The channel the packet was modulated on.
    pub channel: Channel,

    /// Sample offset of this packet within its slot or burst.
    pub start: usize,

    /// The packet that was modulated.
    pub pkt: NetPacket,
}

/// Modulates packets into baseband IQ at the channel rate.
pub trait PacketModulator: Send {
    fn modulate(&mut self, pkt: NetPacket, g: f32) -> ModPacket;
}

/// Sink for demodulated packets. `None` reports a frame that was detected
/// but could not be decoded at all.
pub type DemodCallback<'a> = &'a mut dyn FnMut(Option<RadioPacket>);

/// Demodulates a channel's worth of IQ samples into packets.
pub trait PacketDemodulator: Send {
    /// Reset demodulation state, e.g. after a sample discontinuity.
    fn reset(&mut self, channel: Channel);

    /// Set the timestamp and offsets for subsequent samples.
    ///
    /// `offset` is the offset of the first sample that will be
    /// demodulated (may be negative for overlap-save); `delay` the filter
    /// delay in wideband samples; `rate` the resampling rate applied
    /// before demodulation; `rx_rate` the wideband sample rate.
    fn timestamp(
        &mut self,
        t: TimePoint,
        snapshot_off: Option<isize>,
        offset: isize,
        delay: usize,
        rate: f64,
        rx_rate: f64,
    );

    /// Is the demodulator mid-frame?
    fn is_frame_open(&self) -> bool;

    /// Demodulate samples, emitting any completed packets through the
    /// callback.
    fn demodulate(&mut self, samples: &[C], callback: DemodCallback);
}

/// A framing PHY.
pub trait Phy: Send + Sync {
    /// The PHY's MCS table, indexed by [McsIdx].
    fn mcs_table(&self) -> Vec<McsEntry>;

    /// Number of samples (at the channel rate) needed to modulate
    /// `nbytes` of data at the given MCS.
    fn modulated_size(&self, mcsidx: McsIdx, nbytes: usize) -> usize;

    /// Minimum RX oversample ratio the PHY needs.
    fn min_rx_rate_oversample(&self) -> usize;

    /// Minimum TX oversample ratio the PHY needs.
    fn min_tx_rate_oversample(&self) -> usize;

    fn mk_modulator(&self) -> Box<dyn PacketModulator>;

    fn mk_demodulator(&self) -> Box<dyn PacketDemodulator>;
}
