/*! Low-level packet access and construction.

The `wire` module deals with the packet *representation*. It provides two
levels of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens through the
   [Packet] wrapper.
 * Second, it provides a compact, high-level representation of packet data
   that can be parsed from and emitted into a sequence of octets. This
   happens through the [Header] and [ExtendedHeader] structs and the
   control-message types in [ctrl].

Wire layout, big-endian throughout:

```text
| curhop | nexthop | flags | seq (2) |          <- header
| src | dest | ack (2) | data_len (2) |        <- extended header
| payload (data_len bytes) |
| control messages ... |                       <- tagged, fixed-size bodies
```

The `Packet::new_checked` method is a shorthand for a combination of
`Packet::new_unchecked` and `Packet::check_len`. When parsing untrusted
input (anything demodulated off the air), it is *necessary* to use
`Packet::new_checked`; so long as the buffer is not modified, no accessor
will then panic.
*/

pub mod ctrl;

use byteorder::{ByteOrder, NetworkEndian};

use crate::seq::Seq;

/// A node identifier.
pub type NodeId = u8;

/// The broadcast address.
pub const NODE_BROADCAST: NodeId = 0xff;

/// A timestamp sequence number.
pub type TimestampSeq = u16;

/// The error type for the wire layer: a packet too short for its claimed
/// structure.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Error;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "truncated packet")
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

mod field {
    pub type Field = core::ops::Range<usize>;

    pub const CURHOP: usize = 0;
    pub const NEXTHOP: usize = 1;
    pub const FLAGS: usize = 2;
    pub const SEQ: Field = 3..5;

    pub const SRC: usize = 5;
    pub const DEST: usize = 6;
    pub const ACK: Field = 7..9;
    pub const DATA_LEN: Field = 9..11;

    pub const PAYLOAD: usize = 11;
}

/// Total size of the header plus extended header.
pub const HEADER_SIZE: usize = field::PAYLOAD;

mod flag {
    pub const SYN: u8 = 0x01;
    pub const ACK: u8 = 0x02;
    pub const HAS_SEQ: u8 = 0x04;
    pub const HAS_CONTROL: u8 = 0x08;
    pub const BROADCAST: u8 = 0x10;
}

/// Packed header flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub syn: bool,
    pub ack: bool,
    pub has_seq: bool,
    pub has_control: bool,
    pub broadcast: bool,
}

impl From<u8> for Flags {
    fn from(bits: u8) -> Flags {
        Flags {
            syn: bits & flag::SYN != 0,
            ack: bits & flag::ACK != 0,
            has_seq: bits & flag::HAS_SEQ != 0,
            has_control: bits & flag::HAS_CONTROL != 0,
            broadcast: bits & flag::BROADCAST != 0,
        }
    }
}

impl From<Flags> for u8 {
    fn from(flags: Flags) -> u8 {
        let mut bits = 0;

        if flags.syn {
            bits |= flag::SYN;
        }
        if flags.ack {
            bits |= flag::ACK;
        }
        if flags.has_seq {
            bits |= flag::HAS_SEQ;
        }
        if flags.has_control {
            bits |= flag::HAS_CONTROL;
        }
        if flags.broadcast {
            bits |= flag::BROADCAST;
        }

        bits
    }
}

/// A read/write wrapper around a link-layer packet buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with packet structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(Error)` if the buffer is too short.
    ///
    /// The result of this check is invalidated by calling [set_data_len].
    ///
    /// [set_data_len]: #method.set_data_len
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();

        if len < HEADER_SIZE || len < HEADER_SIZE + self.data_len() as usize {
            Err(Error)
        } else {
            Ok(())
        }
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the current-hop field.
    pub fn curhop(&self) -> NodeId {
        self.buffer.as_ref()[field::CURHOP]
    }

    /// Return the next-hop field.
    pub fn nexthop(&self) -> NodeId {
        self.buffer.as_ref()[field::NEXTHOP]
    }

    /// Return the packed flags.
    pub fn flags(&self) -> Flags {
        Flags::from(self.buffer.as_ref()[field::FLAGS])
    }

    /// Return the sequence number field.
    pub fn seq(&self) -> Seq {
        Seq(NetworkEndian::read_u16(&self.buffer.as_ref()[field::SEQ]))
    }

    /// Return the source field.
    pub fn src(&self) -> NodeId {
        self.buffer.as_ref()[field::SRC]
    }

    /// Return the destination field.
    pub fn dest(&self) -> NodeId {
        self.buffer.as_ref()[field::DEST]
    }

    /// Return the ACK field.
    pub fn ack(&self) -> Seq {
        Seq(NetworkEndian::read_u16(&self.buffer.as_ref()[field::ACK]))
    }

    /// Return the payload length field.
    pub fn data_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::DATA_LEN])
    }

    /// Return the payload.
    pub fn payload(&self) -> &[u8] {
        let range = field::PAYLOAD..field::PAYLOAD + self.data_len() as usize;

        &self.buffer.as_ref()[range]
    }

    /// Return the control-message bytes following the payload.
    pub fn control(&self) -> &[u8] {
        let start = field::PAYLOAD + self.data_len() as usize;

        &self.buffer.as_ref()[start..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn set_curhop(&mut self, value: NodeId) {
        self.buffer.as_mut()[field::CURHOP] = value;
    }

    pub fn set_nexthop(&mut self, value: NodeId) {
        self.buffer.as_mut()[field::NEXTHOP] = value;
    }

    pub fn set_flags(&mut self, value: Flags) {
        self.buffer.as_mut()[field::FLAGS] = value.into();
    }

    pub fn set_seq(&mut self, value: Seq) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::SEQ], value.0);
    }

    pub fn set_src(&mut self, value: NodeId) {
        self.buffer.as_mut()[field::SRC] = value;
    }

    pub fn set_dest(&mut self, value: NodeId) {
        self.buffer.as_mut()[field::DEST] = value;
    }

    pub fn set_ack(&mut self, value: Seq) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::ACK], value.0);
    }

    pub fn set_data_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::DATA_LEN], value);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let range = field::PAYLOAD..field::PAYLOAD + self.data_len() as usize;

        &mut self.buffer.as_mut()[range]
    }
}

/// A high-level representation of the fixed header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub curhop: NodeId,
    pub nexthop: NodeId,
    pub flags: Flags,
    pub seq: Seq,
}

impl Header {
    pub fn parse<T: AsRef<[u8]>>(packet: &Packet<T>) -> Header {
        Header {
            curhop: packet.curhop(),
            nexthop: packet.nexthop(),
            flags: packet.flags(),
            seq: packet.seq(),
        }
    }

    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<T>) {
        packet.set_curhop(self.curhop);
        packet.set_nexthop(self.nexthop);
        packet.set_flags(self.flags);
        packet.set_seq(self.seq);
    }
}

/// A high-level representation of the extended header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub src: NodeId,
    pub dest: NodeId,
    pub ack: Seq,
    pub data_len: u16,
}

impl ExtendedHeader {
    pub fn parse<T: AsRef<[u8]>>(packet: &Packet<T>) -> ExtendedHeader {
        ExtendedHeader {
            src: packet.src(),
            dest: packet.dest(),
            ack: packet.ack(),
            data_len: packet.data_len(),
        }
    }

    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<T>) {
        packet.set_src(self.src);
        packet.set_dest(self.dest);
        packet.set_ack(self.ack);
        packet.set_data_len(self.data_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static PACKET_BYTES: [u8; 15] = [
        0x01, // curhop
        0x02, // nexthop
        0x07, // flags: syn | ack | has_seq
        0x12, 0x34, // seq
        0x01, // src
        0x02, // dest
        0x00, 0x2a, // ack
        0x00, 0x04, // data_len
        0xde, 0xad, 0xbe, 0xef, // payload
    ];

    #[test]
    fn deconstruct() {
        let packet = Packet::new_checked(&PACKET_BYTES[..]).unwrap();

        assert_eq!(packet.curhop(), 1);
        assert_eq!(packet.nexthop(), 2);
        assert_eq!(
            packet.flags(),
            Flags {
                syn: true,
                ack: true,
                has_seq: true,
                has_control: false,
                broadcast: false,
            }
        );
        assert_eq!(packet.seq(), Seq(0x1234));
        assert_eq!(packet.src(), 1);
        assert_eq!(packet.dest(), 2);
        assert_eq!(packet.ack(), Seq(42));
        assert_eq!(packet.data_len(), 4);
        assert_eq!(packet.payload(), &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(packet.control(), &[]);
    }

    #[test]
    fn construct() {
        let mut bytes = vec![0u8; 15];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);

        Header {
            curhop: 1,
            nexthop: 2,
            flags: Flags {
                syn: true,
                ack: true,
                has_seq: true,
                ..Default::default()
            },
            seq: Seq(0x1234),
        }
        .emit(&mut packet);

        ExtendedHeader {
            src: 1,
            dest: 2,
            ack: Seq(42),
            data_len: 4,
        }
        .emit(&mut packet);

        packet.payload_mut().copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        assert_eq!(&bytes[..], &PACKET_BYTES[..]);
    }

    #[test]
    fn truncated_packet_rejected() {
        assert_eq!(Packet::new_checked(&PACKET_BYTES[..4]), Err(Error));

        // Claims 4 payload bytes but carries none
        assert_eq!(Packet::new_checked(&PACKET_BYTES[..11]), Err(Error));
    }

    #[test]
    fn flags_round_trip() {
        for bits in 0..0x20u8 {
            let flags = Flags::from(bits);
            assert_eq!(u8::from(flags), bits);
        }
    }
}
