/*! Per-destination send windows.

A send window is a ring of `maxwin` entries indexed by `seq mod maxwin`.
Invariants: `unack <= seq <= unack + win`, `max <= seq - 1`, and every
entry in `[unack, seq)` is either pending (packet buffered, retransmission
timer scheduled or running) or has been acknowledged (entry reset). The
window starts at 1 and opens to `maxwin` once the first ACK proves the
channel works.
*/

use std::sync::Arc;

use crate::net::packet::NetPacket;
use crate::net::Node;
use crate::seq::Seq;
use crate::stats::{TimeWindowMax, WindowedMean};
use crate::time::{MonoClock, TimeDelta, TimePoint};
use crate::timer::TimerHandle;

pub(crate) struct SendWindowEntry {
    /// The buffered packet, present while the entry is pending.
    pub pkt: Option<NetPacket>,

    /// When the packet was last queued for transmission. The time it
    /// actually aired is recorded in the packet itself.
    pub timestamp: TimePoint,

    /// Retransmission timer.
    pub timer: TimerHandle,
}

impl SendWindowEntry {
    pub fn pending(&self) -> bool {
        self.pkt.is_some()
    }

    pub fn reset(&mut self) {
        self.pkt = None;
    }

    /// May this entry ever be dropped? SYN entries may not: they carry
    /// the connection.
    pub fn may_drop(&self) -> bool {
        self.pkt.as_ref().map_or(true, |pkt| pkt.may_drop())
    }

    /// Should this entry be dropped rather than retransmitted?
    pub fn should_drop(&self, max_retransmissions: Option<usize>, now: TimePoint) -> bool {
        self.pkt
            .as_ref()
            .map_or(false, |pkt| pkt.should_drop(max_retransmissions, now))
    }
}

pub(crate) struct SendWindow {
    /// Destination node.
    pub node: Arc<Node>,

    /// Current MCS index for this destination.
    pub mcsidx: usize,

    /// Short-term EVM, as reported by the receiver.
    pub short_evm: Option<f64>,

    /// Long-term EVM, as reported by the receiver.
    pub long_evm: Option<f64>,

    /// Short-term RSSI, as reported by the receiver.
    pub short_rssi: Option<f64>,

    /// Long-term RSSI, as reported by the receiver.
    pub long_rssi: Option<f64>,

    /// No packet has been sent to this destination yet; the first one
    /// carries the SYN flag.
    pub new_window: bool,

    /// Is the window open for new packets?
    pub window_open: bool,

    /// Next sequence number to assign.
    pub seq: Seq,

    /// First un-ACKed sequence number.
    pub unack: Seq,

    /// Highest sequence number sent. INVARIANT: max < unack + win.
    pub max: Seq,

    /// We advanced `unack` locally and must tell the receiver.
    pub send_set_unack: bool,

    /// Current window size.
    pub win: u16,

    /// Maximum window size.
    pub maxwin: u16,

    /// Probability of accepting a transition to each MCS.
    pub mcsidx_prob: Vec<f64>,

    /// First sequence eligible for PER computation. Sequences before this
    /// were sent into a different environment.
    pub per_cutoff: Seq,

    /// Next sequence to be counted toward PER; everything before it has
    /// already been counted.
    pub per_end: Seq,

    pub prev_short_per: f64,
    pub prev_long_per: f64,

    /// Short-term packet error rate.
    pub short_per: WindowedMean,

    /// Long-term packet error rate.
    pub long_per: WindowedMean,

    /// Current retransmission timer duration.
    pub retransmission_delay: TimeDelta,

    /// Windowed maximum of observed ACK round trips.
    pub ack_delay: TimeWindowMax,

    /// Last time we heard anything from this node.
    pub last_heard_timestamp: TimePoint,

    entries: Vec<SendWindowEntry>,
}

impl SendWindow {
    pub fn new(
        node: Arc<Node>,
        maxwin: u16,
        nmcs: usize,
        retransmission_delay: TimeDelta,
        ack_delay_estimation_window: TimeDelta,
        mk_timer: impl FnMut(usize) -> TimerHandle,
    ) -> Self {
        let entries = (0..maxwin as usize)
            .map(mk_timer)
            .map(|timer| SendWindowEntry {
                pkt: None,
                timestamp: TimePoint::ZERO,
                timer,
            })
            .collect();

        SendWindow {
            node,
            mcsidx: 0,
            short_evm: None,
            long_evm: None,
            short_rssi: None,
            long_rssi: None,
            new_window: true,
            window_open: true,
            seq: Seq::ZERO,
            unack: Seq::ZERO,
            max: Seq::ZERO,
            send_set_unack: false,
            win: 1,
            maxwin,
            mcsidx_prob: vec![1.0; nmcs],
            per_cutoff: Seq::ZERO,
            per_end: Seq::ZERO,
            prev_short_per: 1.0,
            prev_long_per: 1.0,
            short_per: WindowedMean::new(1),
            long_per: WindowedMean::new(1),
            retransmission_delay,
            ack_delay: TimeWindowMax::new(ack_delay_estimation_window),
            last_heard_timestamp: MonoClock::now(),
            entries,
        }
    }

    pub fn entry(&self, seq: Seq) -> &SendWindowEntry {
        &self.entries[seq.index(self.entries.len())]
    }

    pub fn entry_mut(&mut self, seq: Seq) -> &mut SendWindowEntry {
        let index = seq.index(self.entries.len());

        &mut self.entries[index]
    }

    /// Ring slot index for a sequence number.
    pub fn slot_of(&self, seq: Seq) -> usize {
        seq.index(self.entries.len())
    }

    pub fn entry_at_slot_mut(&mut self, slot: usize) -> &mut SendWindowEntry {
        &mut self.entries[slot]
    }

    /// Is the window full?
    pub fn is_full(&self) -> bool {
        self.seq >= self.unack + self.win
    }

    /// Record a successful transmission toward PER.
    pub fn tx_success(&mut self) {
        self.short_per.update(0.0);
        self.long_per.update(0.0);
    }

    /// Record a failed transmission toward PER.
    pub fn tx_failure(&mut self) {
        self.short_per.update(1.0);
        self.long_per.update(1.0);
    }
}

pub(crate) struct RecvWindowEntry {
    pub received: bool,
    pub delivered: bool,
    pub pkt: Option<crate::net::packet::RadioPacket>,
}

impl RecvWindowEntry {
    pub fn set(&mut self, pkt: crate::net::packet::RadioPacket) {
        self.received = true;
        self.delivered = false;
        self.pkt = Some(pkt);
    }

    /// Mark the entry received and already delivered out of order.
    pub fn already_delivered(&mut self) {
        self.received = true;
        self.delivered = true;
        self.pkt = None;
    }

    pub fn reset(&mut self) {
        self.received = false;
        self.delivered = false;
        self.pkt = None;
    }
}
