/*! Control messages.

Control messages ride after the payload as a sequence of tagged,
fixed-size records. Each record is a one-byte tag followed by a body whose
size is determined by the tag. Unknown tags terminate parsing of the
control area: without a size table for them, nothing after an unknown tag
can be located.

Timestamps are carried as eight bytes of whole seconds and eight bytes of
IEEE-754 fractional seconds, big-endian.
*/

use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, NodeId, Result, TimestampSeq};
use crate::seq::Seq;
use crate::time::TimePoint;

enum_with_unknown! {
    /// Control message tag.
    pub enum Tag(u8) {
        Hello = 0x01,
        Ping = 0x02,
        Timestamp = 0x03,
        TimestampSent = 0x04,
        TimestampRecv = 0x05,
        SetUnack = 0x06,
        Nak = 0x07,
        SelectiveAck = 0x08,
        ShortTermReceiverStats = 0x09,
        LongTermReceiverStats = 0x0a,
    }
}

const TIMESTAMP_SIZE: usize = 16;

/// Body size for a given tag, excluding the tag byte.
fn body_size(tag: Tag) -> Option<usize> {
    match tag {
        Tag::Hello => Some(1),
        Tag::Ping => Some(0),
        Tag::Timestamp => Some(2),
        Tag::TimestampSent => Some(2 + TIMESTAMP_SIZE),
        Tag::TimestampRecv => Some(3 + TIMESTAMP_SIZE),
        Tag::SetUnack => Some(2),
        Tag::Nak => Some(2),
        Tag::SelectiveAck => Some(4),
        Tag::ShortTermReceiverStats => Some(8),
        Tag::LongTermReceiverStats => Some(8),
        Tag::Unknown(_) => None,
    }
}

/// A control message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CtrlMsg {
    /// Neighbor advertisement.
    Hello { is_gateway: bool },

    /// Solicit a response to probe reachability.
    Ping,

    /// This packet carries timestamp sequence `tseq`; the receiver should
    /// note when it arrived.
    Timestamp { tseq: TimestampSeq },

    /// Echo: timestamp sequence `tseq` left our antenna at `t`.
    TimestampSent { tseq: TimestampSeq, t: TimePoint },

    /// Echo: timestamp sequence `tseq` from `node` arrived here at `t`.
    TimestampRecv {
        node: NodeId,
        tseq: TimestampSeq,
        t: TimePoint,
    },

    /// The sender moved its window; realign the receive window.
    SetUnack { unack: Seq },

    /// Explicit retransmission request.
    Nak { seq: Seq },

    /// A contiguous run `[begin, end)` of received sequence numbers.
    SelectiveAck { begin: Seq, end: Seq },

    /// Short-term receiver quality feedback.
    ShortTermReceiverStats { evm: f32, rssi: f32 },

    /// Long-term receiver quality feedback.
    LongTermReceiverStats { evm: f32, rssi: f32 },
}

fn read_timepoint(buf: &[u8]) -> TimePoint {
    let full = NetworkEndian::read_i64(&buf[0..8]);
    let frac = f64::from_bits(NetworkEndian::read_u64(&buf[8..16]));

    TimePoint::new(full, frac)
}

fn write_timepoint(buf: &mut [u8], t: TimePoint) {
    NetworkEndian::write_i64(&mut buf[0..8], t.full());
    NetworkEndian::write_u64(&mut buf[8..16], t.frac().to_bits());
}

impl CtrlMsg {
    pub fn tag(&self) -> Tag {
        match self {
            CtrlMsg::Hello { .. } => Tag::Hello,
            CtrlMsg::Ping => Tag::Ping,
            CtrlMsg::Timestamp { .. } => Tag::Timestamp,
            CtrlMsg::TimestampSent { .. } => Tag::TimestampSent,
            CtrlMsg::TimestampRecv { .. } => Tag::TimestampRecv,
            CtrlMsg::SetUnack { .. } => Tag::SetUnack,
            CtrlMsg::Nak { .. } => Tag::Nak,
            CtrlMsg::SelectiveAck { .. } => Tag::SelectiveAck,
            CtrlMsg::ShortTermReceiverStats { .. } => Tag::ShortTermReceiverStats,
            CtrlMsg::LongTermReceiverStats { .. } => Tag::LongTermReceiverStats,
        }
    }

    /// Size on the wire, including the tag byte.
    pub fn wire_size(&self) -> usize {
        1 + body_size(self.tag()).unwrap()
    }

    /// Size on the wire of a selective ACK record.
    pub const SELECTIVE_ACK_SIZE: usize = 5;

    /// Parse one control message from the front of `buf`, returning it and
    /// the number of bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<(CtrlMsg, usize)> {
        if buf.is_empty() {
            return Err(Error);
        }

        let tag = Tag::from(buf[0]);
        let size = body_size(tag).ok_or(Error)?;

        if buf.len() < 1 + size {
            return Err(Error);
        }

        let body = &buf[1..1 + size];

        let msg = match tag {
            Tag::Hello => CtrlMsg::Hello {
                is_gateway: body[0] != 0,
            },
            Tag::Ping => CtrlMsg::Ping,
            Tag::Timestamp => CtrlMsg::Timestamp {
                tseq: NetworkEndian::read_u16(&body[0..2]),
            },
            Tag::TimestampSent => CtrlMsg::TimestampSent {
                tseq: NetworkEndian::read_u16(&body[0..2]),
                t: read_timepoint(&body[2..]),
            },
            Tag::TimestampRecv => CtrlMsg::TimestampRecv {
                node: body[0],
                tseq: NetworkEndian::read_u16(&body[1..3]),
                t: read_timepoint(&body[3..]),
            },
            Tag::SetUnack => CtrlMsg::SetUnack {
                unack: Seq(NetworkEndian::read_u16(&body[0..2])),
            },
            Tag::Nak => CtrlMsg::Nak {
                seq: Seq(NetworkEndian::read_u16(&body[0..2])),
            },
            Tag::SelectiveAck => CtrlMsg::SelectiveAck {
                begin: Seq(NetworkEndian::read_u16(&body[0..2])),
                end: Seq(NetworkEndian::read_u16(&body[2..4])),
            },
            Tag::ShortTermReceiverStats => CtrlMsg::ShortTermReceiverStats {
                evm: f32::from_bits(NetworkEndian::read_u32(&body[0..4])),
                rssi: f32::from_bits(NetworkEndian::read_u32(&body[4..8])),
            },
            Tag::LongTermReceiverStats => CtrlMsg::LongTermReceiverStats {
                evm: f32::from_bits(NetworkEndian::read_u32(&body[0..4])),
                rssi: f32::from_bits(NetworkEndian::read_u32(&body[4..8])),
            },
            Tag::Unknown(_) => unreachable!(),
        };

        Ok((msg, 1 + size))
    }

    /// Append this control message to `buf`.
    pub fn emit(&self, buf: &mut Vec<u8>) {
        let start = buf.len();

        buf.resize(start + self.wire_size(), 0);
        buf[start] = self.tag().into();

        let body = &mut buf[start + 1..];

        match *self {
            CtrlMsg::Hello { is_gateway } => {
                body[0] = is_gateway as u8;
            }
            CtrlMsg::Ping => {}
            CtrlMsg::Timestamp { tseq } => {
                NetworkEndian::write_u16(&mut body[0..2], tseq);
            }
            CtrlMsg::TimestampSent { tseq, t } => {
                NetworkEndian::write_u16(&mut body[0..2], tseq);
                write_timepoint(&mut body[2..], t);
            }
            CtrlMsg::TimestampRecv { node, tseq, t } => {
                body[0] = node;
                NetworkEndian::write_u16(&mut body[1..3], tseq);
                write_timepoint(&mut body[3..], t);
            }
            CtrlMsg::SetUnack { unack } => {
                NetworkEndian::write_u16(&mut body[0..2], unack.0);
            }
            CtrlMsg::Nak { seq } => {
                NetworkEndian::write_u16(&mut body[0..2], seq.0);
            }
            CtrlMsg::SelectiveAck { begin, end } => {
                NetworkEndian::write_u16(&mut body[0..2], begin.0);
                NetworkEndian::write_u16(&mut body[2..4], end.0);
            }
            CtrlMsg::ShortTermReceiverStats { evm, rssi }
            | CtrlMsg::LongTermReceiverStats { evm, rssi } => {
                NetworkEndian::write_u32(&mut body[0..4], evm.to_bits());
                NetworkEndian::write_u32(&mut body[4..8], rssi.to_bits());
            }
        }
    }
}

/// An iterator over the control messages in a control area.
pub struct CtrlIter<'a> {
    buf: &'a [u8],
}

impl<'a> CtrlIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        CtrlIter { buf }
    }
}

impl<'a> Iterator for CtrlIter<'a> {
    type Item = CtrlMsg;

    fn next(&mut self) -> Option<CtrlMsg> {
        if self.buf.is_empty() {
            return None;
        }

        match CtrlMsg::parse(self.buf) {
            Ok((msg, consumed)) => {
                self.buf = &self.buf[consumed..];
                Some(msg)
            }
            Err(_) => {
                // Malformed or unknown control data; nothing after it can
                // be located.
                self.buf = &[];
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_messages() {
        let msgs = vec![
            CtrlMsg::Hello { is_gateway: true },
            CtrlMsg::Ping,
            CtrlMsg::Timestamp { tseq: 7 },
            CtrlMsg::TimestampSent {
                tseq: 8,
                t: TimePoint::new(100, 0.25),
            },
            CtrlMsg::TimestampRecv {
                node: 3,
                tseq: 8,
                t: TimePoint::new(101, 0.5),
            },
            CtrlMsg::SetUnack { unack: Seq(9) },
            CtrlMsg::Nak { seq: Seq(4) },
            CtrlMsg::SelectiveAck {
                begin: Seq(5),
                end: Seq(7),
            },
            CtrlMsg::ShortTermReceiverStats {
                evm: -22.5,
                rssi: -40.0,
            },
            CtrlMsg::LongTermReceiverStats {
                evm: -21.0,
                rssi: -39.5,
            },
        ];

        let mut buf = Vec::new();
        for msg in &msgs {
            msg.emit(&mut buf);
        }

        let parsed: Vec<CtrlMsg> = CtrlIter::new(&buf).collect();
        assert_eq!(parsed, msgs);
    }

    #[test]
    fn unknown_tag_stops_iteration() {
        let mut buf = Vec::new();
        CtrlMsg::Ping.emit(&mut buf);
        buf.push(0x7f); // unknown tag
        CtrlMsg::Ping.emit(&mut buf);

        let parsed: Vec<CtrlMsg> = CtrlIter::new(&buf).collect();
        assert_eq!(parsed, vec![CtrlMsg::Ping]);
    }

    #[test]
    fn truncated_body_rejected() {
        let mut buf = Vec::new();
        CtrlMsg::SelectiveAck {
            begin: Seq(1),
            end: Seq(2),
        }
        .emit(&mut buf);

        buf.truncate(3);
        assert!(CtrlMsg::parse(&buf).is_err());
    }

    #[test]
    fn selective_ack_size_constant_matches() {
        let msg = CtrlMsg::SelectiveAck {
            begin: Seq(0),
            end: Seq(0),
        };

        assert_eq!(msg.wire_size(), CtrlMsg::SELECTIVE_ACK_SIZE);
    }
}
