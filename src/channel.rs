//! Radio channel descriptors.

use std::sync::Arc;

use crate::buffer::C;
use crate::phy::Phy;

/// A channel: a frequency offset from the radio's center frequency and a
/// bandwidth.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Channel {
    /// Frequency shift from center (Hz).
    pub fc: f64,

    /// Bandwidth (Hz).
    pub bw: f64,
}

impl Channel {
    pub fn new(fc: f64, bw: f64) -> Self {
        Channel { fc, bw }
    }

    /// Do two channels overlap? The comparison is inclusive of nothing:
    /// adjacent channels sharing only an edge do not intersect.
    pub fn intersects(&self, other: &Channel) -> bool {
        let start = self.fc - self.bw / 2.0;
        let end = self.fc + self.bw / 2.0;
        let other_start = other.fc - other.bw / 2.0;
        let other_end = other.fc + other.bw / 2.0;

        start < other_end && end > other_start
    }
}

impl PartialOrd for Channel {
    fn partial_cmp(&self, other: &Channel) -> Option<std::cmp::Ordering> {
        self.fc.partial_cmp(&other.fc)
    }
}

/// A channel bound to its per-channel prototype filter taps and the PHY
/// that modulates and demodulates on it.
#[derive(Clone)]
pub struct PhyChannel {
    pub channel: Channel,
    pub taps: Vec<C>,
    pub phy: Arc<dyn Phy>,
}

impl PhyChannel {
    pub fn new(channel: Channel, taps: Vec<C>, phy: Arc<dyn Phy>) -> Self {
        PhyChannel { channel, taps, phy }
    }
}

impl std::fmt::Debug for PhyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PhyChannel")
            .field("channel", &self.channel)
            .field("ntaps", &self.taps.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection() {
        let a = Channel::new(0.0, 100e3);
        let b = Channel::new(50e3, 100e3);
        let c = Channel::new(100e3, 100e3);
        let d = Channel::new(200e3, 100e3);

        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c)); // share only an edge
        assert!(!a.intersects(&d));
    }

    #[test]
    fn ordering_by_center() {
        let lo = Channel::new(-100e3, 50e3);
        let hi = Channel::new(100e3, 50e3);

        assert!(lo < hi);
    }
}
