/*! Per-source receive windows.

A receive window is a ring of `recvwin` entries. `ack` is the next
sequence number expected in order; `max` the highest received. Every entry
below `ack` is empty (delivered and released); entries in `[ack, max]` are
either buffered awaiting in-order delivery, already delivered out of
order, or holes.
*/

use std::sync::Arc;

use super::sendwin::RecvWindowEntry;
use crate::net::Node;
use crate::seq::Seq;
use crate::stats::TimeWindowMean;
use crate::time::{TimeDelta, TimePoint};
use crate::timer::TimerHandle;

pub(crate) struct RecvWindow {
    /// Sender node.
    pub node: Arc<Node>,

    /// Short-term packet EVM.
    pub short_evm: TimeWindowMean,

    /// Long-term packet EVM.
    pub long_evm: TimeWindowMean,

    /// Short-term packet RSSI.
    pub short_rssi: TimeWindowMean,

    /// Long-term packet RSSI.
    pub long_rssi: TimeWindowMean,

    /// Has this window received a packet?
    pub active: bool,

    /// Next sequence number we should ACK: we have received (or given up
    /// on) everything below it.
    pub ack: Seq,

    /// Highest sequence number received. INVARIANT: ack <= max < ack + win.
    pub max: Seq,

    /// Receive timestamp of the packet at `max`.
    pub max_timestamp: TimePoint,

    /// Window size.
    pub win: u16,

    /// A selective ACK should be attached to the next opportunity.
    pub need_selective_ack: bool,

    /// Is the running timer in its full-ACK phase (as opposed to its
    /// selective-ACK phase)?
    pub timer_for_ack: bool,

    /// Rolling timestamps limiting explicit NAK emission.
    pub explicit_nak_win: Vec<TimePoint>,
    pub explicit_nak_idx: usize,

    /// The two-phase SACK timer.
    pub timer: TimerHandle,

    entries: Vec<RecvWindowEntry>,
}

impl RecvWindow {
    pub fn new(
        node: Arc<Node>,
        win: u16,
        nak_win: usize,
        short_stats_window: TimeDelta,
        long_stats_window: TimeDelta,
        timer: TimerHandle,
    ) -> Self {
        RecvWindow {
            node,
            short_evm: TimeWindowMean::new(short_stats_window),
            long_evm: TimeWindowMean::new(long_stats_window),
            short_rssi: TimeWindowMean::new(short_stats_window),
            long_rssi: TimeWindowMean::new(long_stats_window),
            active: false,
            ack: Seq::ZERO,
            max: Seq::ZERO,
            max_timestamp: TimePoint::ZERO,
            win,
            need_selective_ack: false,
            timer_for_ack: false,
            explicit_nak_win: vec![TimePoint::ZERO; nak_win],
            explicit_nak_idx: 0,
            timer,
            entries: (0..win as usize)
                .map(|_| RecvWindowEntry {
                    received: false,
                    delivered: false,
                    pkt: None,
                })
                .collect(),
        }
    }

    /// Is the sequence number within the window?
    pub fn contains(&self, seq: Seq) -> bool {
        seq >= self.max - self.win && seq < self.ack + self.win
    }

    pub fn entry(&self, seq: Seq) -> &RecvWindowEntry {
        &self.entries[seq.index(self.entries.len())]
    }

    pub fn entry_mut(&mut self, seq: Seq) -> &mut RecvWindowEntry {
        let index = seq.index(self.entries.len());

        &mut self.entries[index]
    }

    /// Reset the window so `seq` is the next expected sequence number.
    pub fn reset(&mut self, seq: Seq) {
        self.active = true;
        self.ack = seq;
        self.max = seq - 1;
        self.need_selective_ack = false;
        self.timer_for_ack = false;

        self.explicit_nak_win.fill(TimePoint::ZERO);
        self.explicit_nak_idx = 0;

        for entry in &mut self.entries {
            entry.reset();
        }
    }
}
