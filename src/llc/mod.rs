/*! Link-layer control.

A [Controller] sits between the network queue and the PHY pipeline: the
synthesizer pulls outgoing packets through it, the MAC reports transmitted
packets back to it, and the channelizer's demodulated packets flow into it.

[DummyController] passes packets straight through. [controller::ArqController]
is the real thing: selective-repeat ARQ with adaptive modulation and
coding.
*/

pub mod controller;
mod recvwin;
mod sendwin;

pub use controller::{ArqController, ArqConfig};

use std::sync::Arc;

use crate::net::packet::{NetPacket, RadioPacket};
use crate::net::queue::NetLink;
use crate::phy::ModPacket;
use crate::queue::SafeQueue;
use crate::synthesizer::PacketSource;

/// Where in-order packets are delivered.
pub type RadioOut = Arc<SafeQueue<RadioPacket>>;

pub trait Controller: Send + Sync {
    /// Pull the next packet to modulate and send.
    fn pull(&self) -> Option<NetPacket>;

    /// Wake all blocked pulls.
    fn kick(&self);

    /// A packet was demodulated off the air.
    fn received(&self, pkt: RadioPacket);

    /// Packets left the antenna; `mpkts` carry their TX timestamps.
    fn transmitted(&self, mpkts: &mut Vec<ModPacket>);

    /// Stop any internal machinery.
    fn stop(&self) {}
}

impl<T: Controller + ?Sized> PacketSource for Arc<T> {
    fn pull(&self) -> Option<NetPacket> {
        Controller::pull(self.as_ref())
    }

    fn kick(&self) {
        Controller::kick(self.as_ref())
    }
}

/// A controller with no link-layer smarts: packets pass through untouched.
pub struct DummyController {
    net_in: Arc<dyn NetLink>,
    radio_out: RadioOut,

    /// MCS index applied to every packet.
    pub mcsidx: usize,
}

impl DummyController {
    pub fn new(net_in: Arc<dyn NetLink>, radio_out: RadioOut) -> Self {
        DummyController {
            net_in,
            radio_out,
            mcsidx: 0,
        }
    }
}

impl Controller for DummyController {
    fn pull(&self) -> Option<NetPacket> {
        let mut pkt = self.net_in.pull()?;

        pkt.mcsidx = self.mcsidx;
        pkt.llc_timestamp = crate::time::MonoClock::now();
        Some(pkt)
    }

    fn kick(&self) {
        self.net_in.kick();
    }

    fn received(&self, pkt: RadioPacket) {
        if pkt.internal_flags.invalid_header || pkt.internal_flags.invalid_payload {
            return;
        }

        if pkt.ehdr.data_len != 0 {
            self.radio_out.push(pkt);
        }
    }

    fn transmitted(&self, _mpkts: &mut Vec<ModPacket>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::queue::NetQueue;

    #[test]
    fn dummy_controller_passes_through() {
        let net_in = Arc::new(NetQueue::new());
        let radio_out: RadioOut = Arc::new(SafeQueue::new());
        let controller =
            DummyController::new(Arc::clone(&net_in) as Arc<dyn NetLink>, Arc::clone(&radio_out));

        net_in.push(NetPacket::with_payload(1, 2, 1, 2, vec![1]));

        let pkt = controller.pull().unwrap();
        assert_eq!(pkt.mcsidx, 0);

        let rx = RadioPacket::parse(&pkt.serialize(), true);
        controller.received(rx);

        assert_eq!(radio_out.pop().unwrap().payload, vec![1]);
    }
}
