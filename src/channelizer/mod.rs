/*! Channelizers: wideband IQ in, per-channel packets out.

A channelizer ingests a stream of wideband IQ buffers with monotonically
increasing sequence numbers and emits demodulated packets tagged with the
channel they arrived on. Channel lists and the RX rate are reconfigurable
at runtime; reconfiguration quiesces all demodulation workers through the
sync barrier.

Two interchangeable implementations: [td::TdChannelizer] runs one
mix/filter/decimate chain per channel; [fd::FdChannelizer] shares one
large FFT across all channels via overlap-save.
*/

pub mod fd;
pub mod td;

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::buffer::IQBuf;
use crate::channel::PhyChannel;
use crate::net::packet::RadioPacket;
use crate::queue::SafeQueue;

/// Where demodulated packets go.
pub type PacketSink = Arc<SafeQueue<RadioPacket>>;

pub trait Channelizer: Send + Sync {
    /// Add an IQ buffer to demodulate.
    fn push(&self, buf: Arc<IQBuf>);

    fn channels(&self) -> Vec<PhyChannel>;

    fn set_channels(&self, channels: Vec<PhyChannel>) -> Result<()>;

    fn rx_rate(&self) -> f64;

    fn set_rx_rate(&self, rate: f64) -> Result<()>;

    /// Stop demodulating and join all workers.
    fn stop(&self);
}

/// Validate a channel plan against a sample rate: every channel must fit
/// in the available bandwidth, and its bandwidth must evenly divide the
/// sample rate so decimation rates are integral.
pub(crate) fn check_channels(channels: &[PhyChannel], rate: f64) -> Result<()> {
    for chan in channels {
        let fc = chan.channel.fc;
        let bw = chan.channel.bw;

        if fc + bw / 2.0 > rate / 2.0 || fc - bw / 2.0 < -rate / 2.0 {
            bail!(
                "channel (fc={}, bw={}) does not fit in available bandwidth {}",
                fc,
                bw,
                rate
            );
        }

        if bw <= 0.0 || (rate / bw).fract().abs() > 1e-9 {
            bail!("channel bandwidth {} must evenly divide sample rate {}", bw, rate);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::phy::loopback::LoopbackPhy;

    #[test]
    fn channel_plan_validation() {
        let phy = Arc::new(LoopbackPhy::new(1));
        let chan = |fc: f64, bw: f64| {
            PhyChannel::new(Channel::new(fc, bw), vec![], Arc::clone(&phy) as _)
        };

        assert!(check_channels(&[chan(0.0, 250e3)], 1e6).is_ok());
        assert!(check_channels(&[chan(375e3, 250e3)], 1e6).is_ok());

        // Pokes out of the band
        assert!(check_channels(&[chan(400e3, 250e3)], 1e6).is_err());

        // Does not divide the rate evenly
        assert!(check_channels(&[chan(0.0, 300e3)], 1e6).is_err());
    }
}
