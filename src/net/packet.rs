/*! In-memory packets.

[NetPacket] is the transmit-side representation: built from tap data or
injected by the controller, it accumulates ACK fields, control messages,
and TX parameters as it flows toward the synthesizer, and is serialized to
wire bytes only at modulation time.

[RadioPacket] is the receive-side representation: parsed from demodulated
bytes and annotated with demodulation quality and timing.
*/

use crate::channel::Channel;
use crate::seq::Seq;
use crate::time::TimePoint;
use crate::wire::ctrl::{CtrlIter, CtrlMsg};
use crate::wire::{
    ExtendedHeader, Flags, Header, NodeId, Packet, TimestampSeq, HEADER_SIZE, NODE_BROADCAST,
};

/// Flags that exist only on this node, never on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct InternalFlags {
    /// The header failed demodulation; nothing in the packet can be
    /// trusted.
    pub invalid_header: bool,

    /// The header is good but the payload failed demodulation.
    pub invalid_payload: bool,

    /// The packet has been assigned a sequence number.
    pub assigned_seq: bool,

    /// This transmission is a retransmission.
    pub retransmission: bool,

    /// The packet carries selective ACKs.
    pub has_selective_ack: bool,

    /// The packet should have selective ACKs attached when it is pulled.
    pub need_selective_ack: bool,

    /// The packet carries a timestamp control message.
    pub is_timestamp: bool,
}

/// A packet on its way to the radio.
#[derive(Debug, Clone)]
pub struct NetPacket {
    pub hdr: Header,
    pub ehdr: ExtendedHeader,
    pub payload: Vec<u8>,
    pub ctrl: Vec<CtrlMsg>,
    pub internal_flags: InternalFlags,

    /// MCS index to modulate with.
    pub mcsidx: usize,

    /// Linear soft gain.
    pub g: f32,

    /// Drop-dead time; after this the packet is not worth sending.
    pub deadline: Option<TimePoint>,

    /// Number of retransmissions so far.
    pub nretrans: usize,

    /// Timestamp sequence carried by this packet, if any.
    pub timestamp_seq: Option<TimestampSeq>,

    /// When the controller released the packet.
    pub llc_timestamp: TimePoint,

    /// When the radio actually transmitted the packet.
    pub tx_timestamp: TimePoint,
}

impl NetPacket {
    pub fn new(curhop: NodeId, nexthop: NodeId, src: NodeId, dest: NodeId) -> Self {
        NetPacket {
            hdr: Header {
                curhop,
                nexthop,
                flags: Flags::default(),
                seq: Seq::ZERO,
            },
            ehdr: ExtendedHeader {
                src,
                dest,
                ack: Seq::ZERO,
                data_len: 0,
            },
            payload: Vec::new(),
            ctrl: Vec::new(),
            internal_flags: InternalFlags::default(),
            mcsidx: 0,
            g: 1.0,
            deadline: None,
            nretrans: 0,
            timestamp_seq: None,
            llc_timestamp: TimePoint::ZERO,
            tx_timestamp: TimePoint::ZERO,
        }
    }

    pub fn with_payload(
        curhop: NodeId,
        nexthop: NodeId,
        src: NodeId,
        dest: NodeId,
        payload: Vec<u8>,
    ) -> Self {
        let mut pkt = Self::new(curhop, nexthop, src, dest);

        pkt.ehdr.data_len = payload.len() as u16;
        pkt.payload = payload;
        pkt.hdr.flags.has_seq = true;

        if nexthop == NODE_BROADCAST {
            pkt.hdr.flags.broadcast = true;
            pkt.hdr.flags.has_seq = false;
        }

        pkt
    }

    pub fn is_broadcast(&self) -> bool {
        self.hdr.nexthop == NODE_BROADCAST
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        HEADER_SIZE
            + self.payload.len()
            + self.ctrl.iter().map(|msg| msg.wire_size()).sum::<usize>()
    }

    /// Append a control message.
    pub fn append_ctrl(&mut self, msg: CtrlMsg) {
        if let CtrlMsg::Timestamp { tseq } = msg {
            self.timestamp_seq = Some(tseq);
            self.internal_flags.is_timestamp = true;
        }

        self.hdr.flags.has_control = true;
        self.ctrl.push(msg);
    }

    /// Drop all control information, leaving only the data payload.
    pub fn clear_control(&mut self) {
        self.ctrl.clear();
        self.hdr.flags.has_control = false;
        self.internal_flags.has_selective_ack = false;
        self.internal_flags.is_timestamp = false;
        self.timestamp_seq = None;
    }

    /// May the packet ever be dropped? SYN packets may not: they carry the
    /// connection.
    pub fn may_drop(&self) -> bool {
        !self.hdr.flags.syn
    }

    pub fn deadline_passed(&self, now: TimePoint) -> bool {
        matches!(self.deadline, Some(deadline) if now > deadline)
    }

    /// Should the packet be dropped rather than (re)transmitted?
    pub fn should_drop(&self, max_retransmissions: Option<usize>, now: TimePoint) -> bool {
        if self.hdr.flags.syn {
            return false;
        }

        let retrans_exceeded =
            matches!(max_retransmissions, Some(max) if self.nretrans >= max);

        retrans_exceeded || self.deadline_passed(now)
    }

    /// Serialize to wire bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_SIZE + self.payload.len()];

        {
            let mut packet = Packet::new_unchecked(&mut bytes[..]);

            self.hdr.emit(&mut packet);

            let mut ehdr = self.ehdr;
            ehdr.data_len = self.payload.len() as u16;
            ehdr.emit(&mut packet);

            packet.payload_mut().copy_from_slice(&self.payload);
        }

        for msg in &self.ctrl {
            msg.emit(&mut bytes);
        }

        bytes
    }
}

/// A packet demodulated off the air.
#[derive(Debug, Clone)]
pub struct RadioPacket {
    pub hdr: Header,
    pub ehdr: ExtendedHeader,
    pub payload: Vec<u8>,
    pub ctrl: Vec<CtrlMsg>,
    pub internal_flags: InternalFlags,

    /// Error vector magnitude of the frame (dB).
    pub evm: f32,

    /// Received signal strength (dB).
    pub rssi: f32,

    /// Carrier frequency offset (f/Fs).
    pub cfo: f32,

    /// Index of the channel the packet was demodulated on.
    pub chanidx: usize,

    /// The channel the packet was demodulated on.
    pub channel: Channel,

    /// Receive timestamp.
    pub timestamp: TimePoint,

    /// Offset within the current snapshot, when one is being collected.
    pub snapshot_off: Option<isize>,
}

impl RadioPacket {
    /// Parse a demodulated frame. `payload_valid` reports the PHY's
    /// payload check; a header that does not parse yields a packet marked
    /// `invalid_header`.
    pub fn parse(bytes: &[u8], payload_valid: bool) -> Self {
        let mut pkt = RadioPacket {
            hdr: Header::default(),
            ehdr: ExtendedHeader::default(),
            payload: Vec::new(),
            ctrl: Vec::new(),
            internal_flags: InternalFlags::default(),
            evm: 0.0,
            rssi: 0.0,
            cfo: 0.0,
            chanidx: 0,
            channel: Channel::default(),
            timestamp: TimePoint::ZERO,
            snapshot_off: None,
        };

        match Packet::new_checked(bytes) {
            Err(_) => {
                pkt.internal_flags.invalid_header = true;
            }
            Ok(packet) => {
                pkt.hdr = Header::parse(&packet);
                pkt.ehdr = ExtendedHeader::parse(&packet);

                if payload_valid {
                    pkt.payload = packet.payload().to_vec();
                    pkt.ctrl = CtrlIter::new(packet.control()).collect();
                } else {
                    pkt.internal_flags.invalid_payload = true;
                }
            }
        }

        pkt
    }

    /// A frame whose header did not survive demodulation.
    pub fn invalid_header() -> Self {
        let mut pkt = Self::parse(&[], true);

        pkt.internal_flags.invalid_header = true;
        pkt
    }

    pub fn is_broadcast(&self) -> bool {
        self.hdr.nexthop == NODE_BROADCAST
    }

    pub fn ctrl_iter(&self) -> impl Iterator<Item = &CtrlMsg> {
        self.ctrl.iter()
    }

    /// Drop all control information, leaving only the data payload.
    pub fn clear_control(&mut self) {
        self.ctrl.clear();
        self.hdr.flags.has_control = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_parse_round_trip() {
        let mut pkt = NetPacket::with_payload(1, 2, 1, 2, vec![0xaa, 0xbb]);

        pkt.hdr.seq = Seq(7);
        pkt.hdr.flags.ack = true;
        pkt.ehdr.ack = Seq(3);
        pkt.append_ctrl(CtrlMsg::Nak { seq: Seq(5) });

        let bytes = pkt.serialize();
        let rx = RadioPacket::parse(&bytes, true);

        assert!(!rx.internal_flags.invalid_header);
        assert_eq!(rx.hdr, pkt.hdr);
        assert_eq!(rx.ehdr.ack, Seq(3));
        assert_eq!(rx.payload, vec![0xaa, 0xbb]);
        assert_eq!(rx.ctrl, vec![CtrlMsg::Nak { seq: Seq(5) }]);
    }

    #[test]
    fn truncated_frame_is_invalid_header() {
        let rx = RadioPacket::parse(&[1, 2, 3], true);
        assert!(rx.internal_flags.invalid_header);
    }

    #[test]
    fn bad_payload_is_flagged() {
        let pkt = NetPacket::with_payload(1, 2, 1, 2, vec![1, 2, 3]);
        let rx = RadioPacket::parse(&pkt.serialize(), false);

        assert!(!rx.internal_flags.invalid_header);
        assert!(rx.internal_flags.invalid_payload);
        assert!(rx.payload.is_empty());
    }

    #[test]
    fn drop_policy() {
        let now = TimePoint::new(100, 0.0);
        let mut pkt = NetPacket::with_payload(1, 2, 1, 2, vec![0]);

        assert!(!pkt.should_drop(None, now));

        pkt.nretrans = 3;
        assert!(pkt.should_drop(Some(3), now));
        assert!(!pkt.should_drop(Some(4), now));

        pkt.nretrans = 0;
        pkt.deadline = Some(TimePoint::new(99, 0.0));
        assert!(pkt.should_drop(None, now));

        // SYN packets are never dropped voluntarily
        pkt.hdr.flags.syn = true;
        assert!(!pkt.should_drop(Some(0), now));
        assert!(!pkt.may_drop());
    }

    #[test]
    fn timestamp_ctrl_sets_flags() {
        let mut pkt = NetPacket::new(1, 2, 1, 2);

        pkt.append_ctrl(CtrlMsg::Timestamp { tseq: 9 });
        assert_eq!(pkt.timestamp_seq, Some(9));
        assert!(pkt.internal_flags.is_timestamp);
        assert!(pkt.hdr.flags.has_control);

        pkt.clear_control();
        assert_eq!(pkt.timestamp_seq, None);
        assert!(!pkt.hdr.flags.has_control);
    }
}
