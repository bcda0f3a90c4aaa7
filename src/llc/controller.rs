/*! The ARQ controller.

A selective-repeat sliding-window link controller with adaptive modulation
and coding. Each neighbor gets a send window (for traffic we originate)
and a receive window (for traffic we hear). ACKs ride on any unicast
packet; selective ACKs describe runs of received sequence numbers above
the cumulative ACK; NAKs explicitly request retransmission of packets
whose payload failed. Packet-error-rate and receiver-quality feedback
drive the MCS up and down per destination.

Locking: the per-map mutex is taken before any per-window mutex, never the
reverse, and a window lock is held only for the duration of a single event
(pull, receive, timer fire).
*/

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use anyhow::{bail, Result};
use log::{debug, error};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::recvwin::RecvWindow;
use super::sendwin::SendWindow;
use super::{Controller, RadioOut};
use crate::net::packet::{NetPacket, RadioPacket};
use crate::net::queue::NetLink;
use crate::net::{NodeId, RadioNet, NODE_BROADCAST};
use crate::phy::{McsEntry, ModPacket, Phy};
use crate::seq::Seq;
use crate::time::{MonoClock, TimeDelta, TimePoint, WallClock};
use crate::timer::TimerQueue;
use crate::wire::ctrl::CtrlMsg;
use crate::wire::{TimestampSeq, HEADER_SIZE};

/// Runtime-tunable controller parameters.
#[derive(Debug, Clone)]
pub struct ArqConfig {
    /// Maximum size of a send window.
    pub max_sendwin: u16,

    /// Size of a receive window.
    pub recvwin: u16,

    /// MTU of the attached network.
    pub mtu: usize,

    /// Maximum extra control bytes beyond the MTU.
    pub mcu: usize,

    /// MCS used for broadcast packets.
    pub mcsidx_broadcast: usize,

    /// MCS used for ACK-only packets.
    pub mcsidx_ack: usize,

    pub mcsidx_min: usize,
    pub mcsidx_max: usize,
    pub mcsidx_init: usize,

    /// Long-term PER below which we may move up a modulation level.
    pub mcsidx_up_per_threshold: f64,

    /// Short-term PER above which we move down a modulation level.
    pub mcsidx_down_per_threshold: f64,

    /// Multiplicative decay applied to an MCS transition probability when
    /// the MCS fails us.
    pub mcsidx_alpha: f64,

    /// Floor on MCS transition probabilities.
    pub mcsidx_prob_floor: f64,

    /// Per-MCS EVM thresholds (dB); `None` means no threshold.
    pub evm_thresholds: Vec<Option<f64>>,

    /// Time window for short-term PER (sec).
    pub short_per_window: f64,

    /// Time window for long-term PER (sec).
    pub long_per_window: f64,

    /// Time window for short-term receiver statistics (sec).
    pub short_stats_window: f64,

    /// Time window for long-term receiver statistics (sec).
    pub long_stats_window: f64,

    /// Narrowest channel bandwidth in the current plan (Hz), used to size
    /// PER windows in packets.
    pub min_channel_bandwidth: f64,

    /// Delay before a full ACK is forced out (sec).
    pub ack_delay: f64,

    /// ACK delay estimation window (sec).
    pub ack_delay_estimation_window: f64,

    /// Initial retransmission delay (sec).
    pub retransmission_delay: f64,

    /// Floor on the adaptive retransmission delay (sec).
    pub min_retransmission_delay: f64,

    /// Safety factor over the ACK delay estimate.
    pub retransmission_delay_slop: f64,

    /// How long we wait for a regular packet to carry a selective ACK
    /// before forcing one (sec).
    pub sack_delay: f64,

    /// Maximum number of selective ACK ranges per packet.
    pub max_sacks: Option<usize>,

    /// Number of entries in the explicit NAK rate-limit window; zero
    /// disables NAKs.
    pub explicit_nak_win: usize,

    /// Validity period of an explicit NAK window entry (sec).
    pub explicit_nak_win_duration: f64,

    /// Send selective ACKs at all?
    pub selective_ack: bool,

    /// Ignore selective-ACK feedback about packets sent more recently
    /// than this (sec).
    pub selective_ack_feedback_delay: f64,

    /// Cap on retransmissions per packet.
    pub max_retransmissions: Option<usize>,

    /// Are packets always demodulated in order?
    pub demod_always_ordered: bool,

    /// Deliver strictly in order?
    pub enforce_ordering: bool,

    /// Drop the oldest droppable entry instead of closing a full window.
    pub move_along: bool,

    /// Drop one MCS level on a final-attempt retransmission.
    pub decrease_retrans_mcsidx: bool,

    /// Mark a node unreachable after this long without hearing it (sec).
    pub unreachable_timeout: Option<f64>,

    /// MCS fast-adjustment period after an environment discontinuity
    /// (sec).
    pub mcs_fast_adjustment_period: f64,

    /// Linear gain for broadcast packets.
    pub broadcast_gain: f32,

    /// Linear gain for ACK-only packets.
    pub ack_gain: f32,
}

impl Default for ArqConfig {
    fn default() -> Self {
        ArqConfig {
            max_sendwin: 1024,
            recvwin: 1024,
            mtu: 1500,
            mcu: 100,
            mcsidx_broadcast: 0,
            mcsidx_ack: 0,
            mcsidx_min: 0,
            mcsidx_max: usize::MAX,
            mcsidx_init: 0,
            mcsidx_up_per_threshold: 0.04,
            mcsidx_down_per_threshold: 0.10,
            mcsidx_alpha: 0.5,
            mcsidx_prob_floor: 0.1,
            evm_thresholds: Vec::new(),
            short_per_window: 100e-3,
            long_per_window: 400e-3,
            short_stats_window: 100e-3,
            long_stats_window: 400e-3,
            min_channel_bandwidth: 1e6,
            ack_delay: 100e-3,
            ack_delay_estimation_window: 1.0,
            retransmission_delay: 500e-3,
            min_retransmission_delay: 200e-3,
            retransmission_delay_slop: 1.1,
            sack_delay: 50e-3,
            max_sacks: None,
            explicit_nak_win: 0,
            explicit_nak_win_duration: 0.0,
            selective_ack: true,
            selective_ack_feedback_delay: 0.0,
            max_retransmissions: None,
            demod_always_ordered: false,
            enforce_ordering: false,
            move_along: true,
            decrease_retrans_mcsidx: false,
            unreachable_timeout: None,
            mcs_fast_adjustment_period: 1.0,
            broadcast_gain: 1.0,
            ack_gain: 1.0,
        }
    }
}

/// Timestamp bookkeeping for one node's time-sync exchange.
#[derive(Default)]
pub struct Timestamps {
    /// Timestamp sequences sent, by us or by the node.
    pub sent: HashMap<TimestampSeq, TimePoint>,

    /// Timestamp sequences received from the node.
    pub recv: HashMap<TimestampSeq, TimePoint>,

    /// Timestamp sequences already echoed in a HELLO.
    pub echoed: HashSet<TimestampSeq>,

    /// Completed (sent, received) pairs.
    pub pairs: HashMap<TimestampSeq, (TimePoint, TimePoint)>,
}

pub struct ArqController {
    this: Weak<ArqController>,

    radionet: Arc<RadioNet>,
    phy: Arc<dyn Phy>,
    netlink: Arc<dyn NetLink>,
    radio_out: RadioOut,

    config: RwLock<ArqConfig>,

    /// Moment of the latest environment discontinuity.
    env_timestamp: Mutex<Option<TimePoint>>,

    send: Mutex<BTreeMap<NodeId, Arc<Mutex<SendWindow>>>>,
    recv: Mutex<BTreeMap<NodeId, Arc<Mutex<RecvWindow>>>>,
    timestamps: Mutex<BTreeMap<NodeId, Timestamps>>,

    timer_queue: TimerQueue,

    /// Samples needed to modulate a maximum-size packet at each MCS.
    max_packet_samples: Vec<usize>,

    mcs_table: Vec<McsEntry>,

    timestamp_seq: AtomicU16,

    /// Serializes packet intake against send-window status updates, so a
    /// packet cannot be pulled between an ACK arriving and the window
    /// closing.
    net_mutex: Mutex<()>,

    rng: Mutex<SmallRng>,
}

impl ArqController {
    pub fn new(
        radionet: Arc<RadioNet>,
        phy: Arc<dyn Phy>,
        netlink: Arc<dyn NetLink>,
        radio_out: RadioOut,
        config: ArqConfig,
    ) -> Result<Arc<Self>> {
        let mcs_table = phy.mcs_table();

        if config.evm_thresholds.is_empty() {
            // No thresholds at all is allowed; normalize to a full table
        } else if config.evm_thresholds.len() != mcs_table.len() {
            bail!("EVM threshold table and PHY MCS table must be the same size");
        }

        let mut config = config;

        if config.evm_thresholds.is_empty() {
            config.evm_thresholds = vec![None; mcs_table.len()];
        }

        config.mcsidx_max = config.mcsidx_max.min(mcs_table.len() - 1);

        // Samples needed to modulate the largest packet at each MCS
        let max_pkt_size = config.mtu + HEADER_SIZE;
        let max_packet_samples = (0..mcs_table.len())
            .map(|mcsidx| phy.modulated_size(mcsidx, max_pkt_size))
            .collect();

        let controller = Arc::new_cyclic(|this| ArqController {
            this: this.clone(),
            radionet,
            phy,
            netlink,
            radio_out,
            config: RwLock::new(config),
            env_timestamp: Mutex::new(None),
            send: Mutex::new(BTreeMap::new()),
            recv: Mutex::new(BTreeMap::new()),
            timestamps: Mutex::new(BTreeMap::new()),
            timer_queue: TimerQueue::new(),
            max_packet_samples,
            mcs_table,
            timestamp_seq: AtomicU16::new(0),
            net_mutex: Mutex::new(()),
            rng: Mutex::new(SmallRng::from_entropy()),
        });

        controller.timer_queue.start();

        Ok(controller)
    }

    pub fn config(&self) -> ArqConfig {
        self.config.read().unwrap().clone()
    }

    /// The PHY whose MCS table this controller adapts over.
    pub fn phy(&self) -> &Arc<dyn Phy> {
        &self.phy
    }

    /// Apply a configuration change. Validation failures leave the
    /// configuration untouched.
    pub fn modify_config<F: FnOnce(&mut ArqConfig)>(&self, f: F) -> Result<()> {
        let mut config = self.config.write().unwrap();
        let mut updated = config.clone();

        f(&mut updated);

        if updated.sack_delay >= updated.ack_delay {
            bail!("SACK delay must be less than the ACK delay");
        }

        if updated.mcsidx_init >= self.mcs_table.len()
            || updated.mcsidx_broadcast >= self.mcs_table.len()
            || updated.mcsidx_ack >= self.mcs_table.len()
            || updated.mcsidx_min >= self.mcs_table.len()
        {
            bail!("MCS index out of range");
        }

        updated.mcsidx_max = updated.mcsidx_max.min(self.mcs_table.len() - 1);

        if updated.evm_thresholds.len() != self.mcs_table.len() {
            bail!("EVM threshold table and PHY MCS table must be the same size");
        }

        *config = updated;
        Ok(())
    }

    /// Put a node into or out of emissions control.
    pub fn set_emcon(&self, node_id: NodeId, emcon: bool) {
        let node = self.radionet.node(node_id);

        if node.emcon() != emcon {
            // If we can no longer transmit, kick the network input so the
            // intake loop notices
            if node_id == self.radionet.this_node_id() {
                self.netlink.kick();
            }

            node.set_emcon(emcon);
        }
    }

    /// Are we within the fast-adjustment period following an environment
    /// discontinuity?
    fn is_fast_adjustment_period(&self, cfg: &ArqConfig) -> bool {
        match *self.env_timestamp.lock().unwrap() {
            Some(t) => {
                (MonoClock::now() - t).as_secs_f64() < cfg.mcs_fast_adjustment_period
            }
            None => false,
        }
    }

    /// The environment changed abruptly: forget everything the AMC loop
    /// has learned and re-probe every neighbor.
    pub fn environment_discontinuity(&self) {
        debug!("environment discontinuity");

        let cfg = self.config();
        let mut nodes = Vec::new();

        *self.env_timestamp.lock().unwrap() = Some(MonoClock::now());

        {
            let send = self.send.lock().unwrap();

            for (node_id, sendw) in send.iter() {
                let mut sendw = sendw.lock().unwrap();

                nodes.push(*node_id);

                sendw.mcsidx_prob.fill(1.0);
                self.set_mcs(&cfg, &mut sendw, cfg.mcsidx_init);

                // Don't let packets sent into the old environment count
                // toward PER in the new one
                sendw.per_cutoff = sendw.seq;

                self.reset_per_estimates(&cfg, &mut sendw);

                sendw.short_evm = None;
                sendw.long_evm = None;
                sendw.short_rssi = None;
                sendw.long_rssi = None;
            }
        }

        {
            let recv = self.recv.lock().unwrap();

            for (node_id, recvw) in recv.iter() {
                let mut recvw = recvw.lock().unwrap();

                if !nodes.contains(node_id) {
                    nodes.push(*node_id);
                }

                recvw.short_evm.reset();
                recvw.long_evm.reset();
                recvw.short_rssi.reset();
                recvw.long_rssi.reset();
            }
        }

        for node_id in nodes {
            self.send_ping(node_id);
        }
    }

    fn get_send_window(&self, node_id: NodeId) -> Arc<Mutex<SendWindow>> {
        let mut send = self.send.lock().unwrap();

        if let Some(sendw) = send.get(&node_id) {
            return Arc::clone(sendw);
        }

        let cfg = self.config();
        let this = self.this.clone();

        let sendw = SendWindow::new(
            self.radionet.node(node_id),
            cfg.max_sendwin,
            self.mcs_table.len(),
            TimeDelta::from_secs_f64(cfg.retransmission_delay),
            TimeDelta::from_secs_f64(cfg.ack_delay_estimation_window),
            |slot| {
                let this = this.clone();

                self.timer_queue.register(Arc::new(move || {
                    if let Some(controller) = this.upgrade() {
                        controller.retransmit_on_timeout(node_id, slot);
                    }
                }))
            },
        );

        let sendw = Arc::new(Mutex::new(sendw));

        {
            let mut guard = sendw.lock().unwrap();

            self.set_mcs(&cfg, &mut guard, cfg.mcsidx_init);
            self.reset_per_estimates(&cfg, &mut guard);
        }

        send.insert(node_id, Arc::clone(&sendw));
        sendw
    }

    fn get_recv_window(&self, node_id: NodeId) -> Arc<Mutex<RecvWindow>> {
        let mut recv = self.recv.lock().unwrap();

        if let Some(recvw) = recv.get(&node_id) {
            return Arc::clone(recvw);
        }

        let cfg = self.config();
        let this = self.this.clone();
        let timer = self.timer_queue.register(Arc::new(move || {
            if let Some(controller) = this.upgrade() {
                controller.sack_timer_fire(node_id);
            }
        }));

        let recvw = Arc::new(Mutex::new(RecvWindow::new(
            self.radionet.node(node_id),
            cfg.recvwin,
            cfg.explicit_nak_win,
            TimeDelta::from_secs_f64(cfg.short_stats_window),
            TimeDelta::from_secs_f64(cfg.long_stats_window),
            timer,
        )));

        recv.insert(node_id, Arc::clone(&recvw));
        recvw
    }

    /// Get a packet that is eligible to be sent.
    fn get_packet(&self, cfg: &ArqConfig) -> Option<NetPacket> {
        let me = self.radionet.this_node();

        loop {
            if me.emcon() {
                return None;
            }

            // Guard against the race between pulling a packet and the
            // destination's window closing while we wait for an ACK
            let _net_lock = self.net_mutex.lock().unwrap();

            let mut pkt = self.netlink.pull()?;

            if pkt.is_broadcast() {
                return Some(pkt);
            }

            let sendw = self.get_send_window(pkt.hdr.nexthop);
            let mut sendw = sendw.lock().unwrap();

            // Unsequenced packets carry control information and always
            // flow
            if !pkt.hdr.flags.has_seq {
                return Some(pkt);
            }

            if !pkt.internal_flags.assigned_seq {
                // If the window is full, move it along by dropping the
                // oldest packet when we may
                if sendw.is_full() && sendw.entry(sendw.unack).may_drop() {
                    debug!("moving window along: node={}", pkt.hdr.nexthop);

                    let unack = sendw.unack;
                    self.drop_entry(&mut sendw, unack);
                }

                pkt.hdr.seq = sendw.seq;
                sendw.seq += 1;
                pkt.internal_flags.assigned_seq = true;

                // The first packet to a destination opens the connection
                if sendw.new_window {
                    pkt.hdr.flags.syn = true;
                    sendw.new_window = false;
                }

                // Close the window if it is full and cannot be moved
                // along. A window of 1 always closes: we are waiting for
                // our SYN to be ACKed.
                if sendw.is_full()
                    && ((sendw.entry(sendw.unack).pending()
                        && !sendw.entry(sendw.unack).may_drop())
                        || !cfg.move_along
                        || sendw.win == 1)
                {
                    self.set_send_window_status(&mut sendw, false);
                }

                return Some(pkt);
            } else {
                // A retransmission that snuck in just before the send
                // window moved past it
                if pkt.hdr.seq < sendw.unack {
                    continue;
                }

                if pkt.hdr.seq >= sendw.unack + sendw.win {
                    error!(
                        "invariant violated: got packet outside window: seq={}; unack={}; win={}",
                        pkt.hdr.seq, sendw.unack, sendw.win
                    );
                    continue;
                }

                // Sequenced packets are dropped here, not in the network
                // queue, so the window is adjusted properly
                if pkt.should_drop(cfg.max_retransmissions, MonoClock::now()) {
                    let seq = pkt.hdr.seq;

                    self.drop_entry(&mut sendw, seq);
                    continue;
                }

                return Some(pkt);
            }
        }
    }

    fn set_send_window_status(&self, sendw: &mut SendWindow, open: bool) {
        if open != sendw.window_open {
            self.netlink.set_link_status(sendw.node.id, open);
            sendw.window_open = open;
        }
    }

    /// Record an observed ACK delay and refresh the retransmission timer
    /// duration.
    fn record_ack_delay(&self, cfg: &ArqConfig, sendw: &mut SendWindow, tx_time: TimePoint) {
        let now = MonoClock::now();

        sendw.ack_delay.update(now, (now - tx_time).as_secs_f64());

        sendw.retransmission_delay = match sendw.ack_delay.value_at(now) {
            Some(delay) => TimeDelta::from_secs_f64(
                cfg.min_retransmission_delay
                    .max(cfg.retransmission_delay_slop * delay),
            ),
            None => TimeDelta::from_secs_f64(cfg.min_retransmission_delay),
        };
    }

    /// Record that we heard from a node, restoring reachability.
    fn heard(&self, sendw: &mut SendWindow, when: Option<TimePoint>) {
        sendw.last_heard_timestamp = when.unwrap_or_else(MonoClock::now);

        if sendw.node.unreachable() {
            sendw.node.set_unreachable(false);

            if sendw.seq < sendw.unack + sendw.win {
                self.set_send_window_status(sendw, true);
            }

            debug!("node now reachable: node={}", sendw.node.id);
        }
    }

    /// Mark a node unreachable if we have not heard from it in too long.
    fn check_unheard(&self, cfg: &ArqConfig, sendw: &mut SendWindow) {
        let Some(timeout) = cfg.unreachable_timeout else {
            return;
        };

        if !sendw.node.emcon()
            && !sendw.node.unreachable()
            && (MonoClock::now() - sendw.last_heard_timestamp).as_secs_f64() > timeout
        {
            sendw.node.set_unreachable(true);
            self.set_send_window_status(sendw, false);

            debug!("node unreachable: node={}", sendw.node.id);
        }
    }

    /// Advance `unack` past acknowledged and dropped entries.
    fn advance_send_window(&self, sendw: &mut SendWindow) {
        let old_unack = sendw.unack;

        while sendw.unack <= sendw.max && !sendw.entry(sendw.unack).pending() {
            sendw.unack += 1;
        }

        if sendw.unack > sendw.per_cutoff {
            sendw.per_cutoff = sendw.unack;
        }

        // The window opens fully once any ACK has come back; doing it on
        // every advance is harmless
        sendw.win = sendw.maxwin;

        if sendw.seq < sendw.unack + sendw.win {
            self.set_send_window_status(sendw, true);
        }

        if sendw.unack > old_unack {
            sendw.send_set_unack = true;
        }
    }

    /// Slide the receive window forward so `seq` is its new maximum,
    /// delivering anything pushed out.
    fn advance_recv_window(&self, seq: Seq, recvw: &mut RecvWindow) {
        debug!(
            "recv outside window (advance): node={}; seq={}; ack={}; max={}",
            recvw.node.id, seq, recvw.ack, recvw.max
        );

        let new_ack = (seq + 1) - recvw.win;
        let forget = if new_ack > recvw.max {
            recvw.max + 1
        } else {
            new_ack
        };

        for s in recvw.ack.up_to(forget) {
            let entry = recvw.entry_mut(s);
            let delivered = entry.delivered;

            if let Some(pkt) = entry.pkt.take() {
                if !delivered && pkt.ehdr.data_len != 0 {
                    self.radio_out.push(pkt);
                }
            }

            entry.reset();
        }

        recvw.ack = new_ack;
    }

    fn start_retransmission_timer(&self, sendw: &SendWindow, seq: Seq) {
        let entry = sendw.entry(seq);

        if entry.pending() && !self.timer_queue.running(entry.timer) {
            self.timer_queue.run_in(entry.timer, sendw.retransmission_delay);
        }
    }

    fn start_sack_timer(&self, cfg: &ArqConfig, recvw: &mut RecvWindow) {
        if !self.timer_queue.running(recvw.timer) {
            recvw.need_selective_ack = false;
            recvw.timer_for_ack = false;
            self.timer_queue
                .run_in(recvw.timer, TimeDelta::from_secs_f64(cfg.sack_delay));
        }
    }

    /// First firing: request a selective ACK and re-arm for the full-ACK
    /// phase. Second firing: force an ACK-only packet out.
    fn sack_timer_fire(&self, node_id: NodeId) {
        let recvw = {
            let recv = self.recv.lock().unwrap();

            match recv.get(&node_id) {
                Some(recvw) => Arc::clone(recvw),
                None => return,
            }
        };

        let cfg = self.config();
        let mut recvw = recvw.lock().unwrap();

        if recvw.timer_for_ack {
            self.send_ack_packet(&recvw);
        } else {
            recvw.need_selective_ack = true;
            recvw.timer_for_ack = true;
            self.timer_queue.run_in(
                recvw.timer,
                TimeDelta::from_secs_f64(cfg.ack_delay - cfg.sack_delay),
            );
        }
    }

    /// Inject a zero-payload packet at the head of the send queue. Its ACK
    /// fields are filled in when it flows back through `pull`.
    fn send_ack_packet(&self, recvw: &RecvWindow) {
        if self.radionet.this_node().emcon() {
            return;
        }

        let this_id = self.radionet.this_node_id();
        let mut pkt = NetPacket::new(this_id, recvw.node.id, this_id, recvw.node.id);

        pkt.internal_flags.need_selective_ack = true;
        self.netlink.push_hi(pkt);
    }

    /// Send an explicit NAK, rate-limited by the rolling NAK window.
    fn nak(&self, cfg: &ArqConfig, recvw: &mut RecvWindow, seq: Seq) {
        if self.radionet.this_node().emcon() {
            return;
        }

        if recvw.explicit_nak_win.is_empty() {
            return;
        }

        let now = MonoClock::now();
        let last = recvw.explicit_nak_win[recvw.explicit_nak_idx];

        if last != TimePoint::ZERO
            && last + TimeDelta::from_secs_f64(cfg.explicit_nak_win_duration) > now
        {
            return;
        }

        recvw.explicit_nak_win[recvw.explicit_nak_idx] = now;
        recvw.explicit_nak_idx = (recvw.explicit_nak_idx + 1) % recvw.explicit_nak_win.len();

        debug!("send nak: node={}; nak={}", recvw.node.id, seq);

        let this_id = self.radionet.this_node_id();
        let mut pkt = NetPacket::new(this_id, recvw.node.id, this_id, recvw.node.id);

        pkt.append_ctrl(CtrlMsg::Nak { seq });
        pkt.internal_flags.need_selective_ack = true;
        self.netlink.push_hi(pkt);
    }

    /// Broadcast a HELLO carrying our gateway status, a fresh timestamp
    /// sequence, and (when we are the time master) echoes of the
    /// timestamps we have sent and received.
    pub fn broadcast_hello(&self) {
        let me = self.radionet.this_node();

        if me.emcon() {
            return;
        }

        let cfg = self.config();
        let this_id = self.radionet.this_node_id();
        let mut pkt = NetPacket::new(this_id, NODE_BROADCAST, this_id, NODE_BROADCAST);

        pkt.hdr.flags.broadcast = true;
        pkt.append_ctrl(CtrlMsg::Hello {
            is_gateway: me.is_gateway(),
        });

        // The time master echoes timestamps so every node can correlate
        // send and receive times against its clock
        if self.radionet.time_master() == Some(this_id) {
            let mut timestamps = self.timestamps.lock().unwrap();

            // Timestamps we sent
            {
                let ts = timestamps.entry(this_id).or_default();
                let unechoed: Vec<(TimestampSeq, TimePoint)> = ts
                    .sent
                    .iter()
                    .filter(|(tseq, _)| !ts.echoed.contains(tseq))
                    .map(|(&tseq, &t)| (tseq, t))
                    .collect();

                for (tseq, t) in unechoed {
                    pkt.append_ctrl(CtrlMsg::TimestampSent { tseq, t });
                    ts.echoed.insert(tseq);
                }
            }

            // Timestamps we received from each neighbor
            for node_id in self.radionet.node_ids() {
                if node_id == this_id {
                    continue;
                }

                let ts = timestamps.entry(node_id).or_default();
                let unechoed: Vec<(TimestampSeq, TimePoint)> = ts
                    .recv
                    .iter()
                    .filter(|(tseq, _)| !ts.echoed.contains(tseq))
                    .map(|(&tseq, &t)| (tseq, t))
                    .collect();

                for (tseq, t) in unechoed {
                    pkt.append_ctrl(CtrlMsg::TimestampRecv {
                        node: node_id,
                        tseq,
                        t,
                    });
                    ts.echoed.insert(tseq);
                }
            }
        }

        // Stamp this HELLO itself
        let tseq = self.timestamp_seq.fetch_add(1, Ordering::Release);

        pkt.append_ctrl(CtrlMsg::Timestamp { tseq });

        pkt.mcsidx = cfg.mcsidx_broadcast;
        pkt.g = 1.0;
        self.netlink.push_hi(pkt);
    }

    /// Probe a neighbor.
    pub fn send_ping(&self, dest: NodeId) {
        let this_id = self.radionet.this_node_id();
        let mut pkt = NetPacket::new(this_id, dest, this_id, dest);

        pkt.hdr.flags.has_seq = true;
        pkt.append_ctrl(CtrlMsg::Ping);
        pkt.internal_flags.need_selective_ack = true;

        debug!("ping send: node={}", dest);
        self.netlink.push_hi(pkt);
    }

    /// Answer a ping.
    fn send_pong(&self, dest: NodeId) {
        let this_id = self.radionet.this_node_id();
        let mut pkt = NetPacket::new(this_id, dest, this_id, dest);

        pkt.hdr.flags.has_seq = true;
        pkt.internal_flags.need_selective_ack = true;

        debug!("pong send: node={}", dest);
        self.netlink.push_hi(pkt);
    }

    fn handle_ctrl_hello_and_ping(&self, pkt: &RadioPacket, node: &crate::net::Node) {
        for msg in pkt.ctrl_iter() {
            match *msg {
                CtrlMsg::Hello { is_gateway } => {
                    node.set_gateway(is_gateway);

                    debug!(
                        "discovered neighbor: node={}; gateway={}",
                        pkt.hdr.curhop, is_gateway
                    );
                }
                CtrlMsg::Ping => {
                    debug!("ping recv: node={}", pkt.hdr.curhop);
                    self.send_pong(pkt.hdr.curhop);
                }
                _ => {}
            }
        }
    }

    fn handle_ctrl_timestamp(&self, pkt: &RadioPacket, node: &crate::net::Node) {
        let time_master = self.radionet.time_master();
        let this_id = self.radionet.this_node_id();

        for msg in pkt.ctrl_iter() {
            match *msg {
                CtrlMsg::Timestamp { tseq } => {
                    let mut timestamps = self.timestamps.lock().unwrap();

                    timestamps
                        .entry(node.id)
                        .or_default()
                        .recv
                        .insert(tseq, pkt.timestamp);
                }
                CtrlMsg::TimestampSent { tseq, t } => {
                    let mut timestamps = self.timestamps.lock().unwrap();
                    let ts = timestamps.entry(node.id).or_default();

                    ts.sent.insert(tseq, t);

                    if let Some(&t_recv) = ts.recv.get(&tseq) {
                        ts.pairs.insert(tseq, (t, t_recv));
                    }
                }
                CtrlMsg::TimestampRecv {
                    node: echoed_node,
                    tseq,
                    t,
                } => {
                    // Only the time master's echoes about us matter
                    if time_master == Some(node.id)
                        && node.id != this_id
                        && echoed_node == this_id
                    {
                        let mut timestamps = self.timestamps.lock().unwrap();
                        let ts = timestamps.entry(this_id).or_default();

                        ts.recv.insert(tseq, t);

                        if let Some(&t_sent) = ts.sent.get(&tseq) {
                            ts.pairs.insert(tseq, (t_sent, t));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// The `(sent, received)` timestamp pairs accumulated for a node.
    pub fn timestamps(&self, node_id: NodeId) -> Vec<(TimestampSeq, TimePoint, TimePoint)> {
        let timestamps = self.timestamps.lock().unwrap();

        timestamps.get(&node_id).map_or_else(Vec::new, |ts| {
            ts.pairs
                .iter()
                .map(|(&tseq, &(sent, recv))| (tseq, sent, recv))
                .collect()
        })
    }

    /// Attach receiver statistics and selective ACKs to an outgoing
    /// packet.
    fn append_feedback(&self, cfg: &ArqConfig, pkt: &mut NetPacket, recvw: &mut RecvWindow) {
        let now = WallClock::now();

        if let (Some(evm), Some(rssi)) = (
            recvw.short_evm.value_at(now),
            recvw.short_rssi.value_at(now),
        ) {
            pkt.append_ctrl(CtrlMsg::ShortTermReceiverStats {
                evm: evm as f32,
                rssi: rssi as f32,
            });
        }

        if let (Some(evm), Some(rssi)) =
            (recvw.long_evm.value_at(now), recvw.long_rssi.value_at(now))
        {
            pkt.append_ctrl(CtrlMsg::LongTermReceiverStats {
                evm: evm as f32,
                rssi: rssi as f32,
            });
        }

        if !cfg.selective_ack {
            return;
        }

        // The header ACK covers everything below recvw.ack; selective ACK
        // runs start above it
        let mut in_run = false;
        let mut begin = recvw.ack;
        let mut end = recvw.ack;
        let mut nsacks = 0;

        for seq in (recvw.ack + 1).up_to(recvw.max + 1) {
            if recvw.entry(seq).received {
                if !in_run {
                    in_run = true;
                    begin = seq;
                }

                end = seq;
            } else if in_run {
                pkt.append_ctrl(CtrlMsg::SelectiveAck {
                    begin,
                    end: end + 1,
                });
                nsacks += 1;
                in_run = false;
            }
        }

        if in_run {
            pkt.append_ctrl(CtrlMsg::SelectiveAck {
                begin,
                end: end + 1,
            });
            nsacks += 1;
        }

        // If the tail of the window is a hole, an empty range tells the
        // sender that everything past `end` was not received
        if end < recvw.max {
            pkt.append_ctrl(CtrlMsg::SelectiveAck {
                begin: recvw.max + 1,
                end: recvw.max + 1,
            });
            nsacks += 1;
        }

        // Prune the oldest ranges if the packet overflows the MTU (plus
        // control allowance) or the SACK cap; the latest ranges carry the
        // freshest information
        let sack_size = CtrlMsg::SELECTIVE_ACK_SIZE;
        let mut nremove = 0usize;
        let mut nkeep = nsacks;

        if pkt.size() > cfg.mtu {
            nremove = (pkt.size() - cfg.mtu).div_ceil(sack_size).min(nsacks);
            nkeep = nsacks - nremove;
        }

        if let Some(max_sacks) = cfg.max_sacks {
            if nkeep > max_sacks {
                nkeep = max_sacks;
                nremove = nsacks - nkeep;
            }
        }

        if nremove > 0 {
            debug!(
                "pruning SACKs: node={}; nremove={}; nkeep={}",
                recvw.node.id, nremove, nkeep
            );

            let start = pkt.ctrl.len() - nsacks;

            pkt.ctrl.drain(start..start + nremove);
        }

        pkt.internal_flags.has_selective_ack = true;
        recvw.need_selective_ack = false;
    }

    fn handle_receiver_stats(&self, pkt: &RadioPacket, sendw: &mut SendWindow) {
        for msg in pkt.ctrl_iter() {
            match *msg {
                CtrlMsg::ShortTermReceiverStats { evm, rssi } => {
                    sendw.short_evm = Some(evm as f64);
                    sendw.short_rssi = Some(rssi as f64);
                }
                CtrlMsg::LongTermReceiverStats { evm, rssi } => {
                    sendw.long_evm = Some(evm as f64);
                    sendw.long_rssi = Some(rssi as f64);
                }
                _ => {}
            }
        }
    }

    /// Handle a cumulative ACK of a single sequence number.
    fn handle_ack(&self, cfg: &ArqConfig, sendw: &mut SendWindow, seq: Seq) {
        if seq < sendw.unack || seq >= sendw.unack + sendw.win {
            debug!(
                "ack for packet outside send window: node={}; seq={}; unack={}",
                sendw.node.id, seq, sendw.unack
            );
            return;
        }

        let (pending, timestamp, timer) = {
            let entry = sendw.entry(seq);

            (entry.pending(), entry.timestamp, entry.timer)
        };

        if !pending {
            return;
        }

        self.record_ack_delay(cfg, sendw, timestamp);
        self.timer_queue.cancel(timer);
        sendw.entry_mut(seq).reset();
    }

    /// Handle any NAKs in the packet, returning the highest NAKed
    /// sequence number.
    fn handle_nak(&self, pkt: &RadioPacket, sendw: &mut SendWindow) -> Option<Seq> {
        let mut result = None;

        for msg in pkt.ctrl_iter() {
            if let CtrlMsg::Nak { seq } = *msg {
                if seq < sendw.unack
                    || seq >= sendw.unack + sendw.win
                    || !sendw.entry(seq).pending()
                {
                    debug!(
                        "nak ignored: node={}; seq={}; unack={}",
                        sendw.node.id, seq, sendw.unack
                    );
                } else {
                    debug!("nak: node={}; seq={}", sendw.node.id, seq);
                    result = Some(seq);
                }
            }
        }

        result
    }

    /// Handle selective ACK runs: ACKed ranges release entries; gaps
    /// between runs are treated as losses once their transmissions are
    /// old enough for the feedback to be trustworthy.
    fn handle_selective_ack(
        &self,
        cfg: &ArqConfig,
        pkt: &RadioPacket,
        sendw: &mut SendWindow,
        tfeedback: TimePoint,
    ) {
        let mut next_seq = sendw.unack;
        let mut saw_ack_run = false;

        for msg in pkt.ctrl_iter() {
            let CtrlMsg::SelectiveAck { begin, end } = *msg else {
                continue;
            };

            if !saw_ack_run && begin < sendw.unack {
                // The receiver is behind our window; tell it where the
                // window now starts
                debug!(
                    "sack before window: node={}; begin={}; unack={}",
                    sendw.node.id, begin, sendw.unack
                );
                sendw.send_set_unack = true;
            }

            // The gap between ACK runs was lost
            if next_seq < begin {
                for seq in next_seq.up_to(begin) {
                    if seq < sendw.per_end {
                        continue;
                    }

                    if sendw.entry(seq).pending() {
                        if sendw.entry(seq).timestamp < tfeedback {
                            if seq >= sendw.per_cutoff {
                                sendw.tx_failure();
                            }

                            self.retransmit(cfg, sendw, seq);
                            sendw.per_end = seq + 1;
                        }
                    } else {
                        sendw.per_end = seq + 1;
                    }
                }
            }

            for seq in begin.up_to(end) {
                if seq >= sendw.unack {
                    self.handle_ack(cfg, sendw, seq);
                }

                if seq >= sendw.per_end && sendw.entry(seq).timestamp < tfeedback {
                    sendw.tx_success();
                    sendw.per_end = seq + 1;
                }
            }

            saw_ack_run = true;
            next_seq = end;
        }
    }

    fn handle_set_unack(&self, pkt: &RadioPacket, recvw: &mut RecvWindow) {
        for msg in pkt.ctrl_iter() {
            if let CtrlMsg::SetUnack { unack } = *msg {
                debug!(
                    "set unack: node={}; cur_ack={}; unack={}",
                    recvw.node.id, recvw.ack, unack
                );

                if unack > recvw.ack {
                    for seq in recvw.ack.up_to(unack) {
                        recvw.entry_mut(seq).reset();
                    }

                    recvw.ack = unack;
                }
            }
        }
    }

    /// Retransmit or drop an entry whose retransmission timer expired.
    fn retransmit_on_timeout(&self, node_id: NodeId, slot: usize) {
        let sendw = {
            let send = self.send.lock().unwrap();

            match send.get(&node_id) {
                Some(sendw) => Arc::clone(sendw),
                None => return,
            }
        };

        let cfg = self.config();
        let mut sendw = sendw.lock().unwrap();

        let (seq, pkt_mcsidx) = {
            let entry = sendw.entry_at_slot_mut(slot);

            match &entry.pkt {
                Some(pkt) => (pkt.hdr.seq, pkt.mcsidx),
                None => {
                    debug!("timeout for already ACKed packet: node={}", node_id);
                    return;
                }
            }
        };

        // Count the error as long as the receiving node can answer at all
        if !sendw.node.emcon() && sendw.mcsidx >= pkt_mcsidx && seq >= sendw.per_cutoff {
            sendw.tx_failure();

            debug!(
                "tx failure on timeout: node={}; seq={}; short_per={:?}",
                node_id,
                seq,
                sendw.short_per.value()
            );

            let fast = self.is_fast_adjustment_period(&cfg);

            self.update_mcs(&cfg, &mut sendw, fast);
        }

        self.retransmit_or_drop(&cfg, &mut sendw, seq);
    }

    fn retransmit_or_drop(&self, cfg: &ArqConfig, sendw: &mut SendWindow, seq: Seq) {
        if sendw
            .entry(seq)
            .should_drop(cfg.max_retransmissions, MonoClock::now())
        {
            self.drop_entry(sendw, seq);
        } else {
            self.retransmit(cfg, sendw, seq);
        }
    }

    /// Re-queue an entry's packet at the head of the send queue.
    fn retransmit(&self, cfg: &ArqConfig, sendw: &mut SendWindow, seq: Seq) {
        self.check_unheard(cfg, sendw);

        // Squelch the retransmission when the destination cannot answer:
        // an emcon destination will never ACK, and an unreachable one gets
        // only its next-needed packet probed
        if sendw.node.emcon() || (sendw.node.unreachable() && seq != sendw.max) {
            let timer = sendw.entry(seq).timer;

            self.timer_queue.cancel(timer);
            self.start_retransmission_timer(sendw, seq);
            return;
        }

        if !sendw.entry(seq).pending() {
            debug!("attempted to retransmit ACKed packet: node={}", sendw.node.id);
            return;
        }

        debug!("retransmit: node={}; seq={}", sendw.node.id, seq);

        // The timer restarts when the packet is actually sent again.
        // Restarting it here would cascade timer fires when many
        // transmissions are outstanding; not cancelling it would let an
        // explicit NAK and a timeout retransmit the same packet twice.
        let timer = sendw.entry(seq).timer;

        self.timer_queue.cancel(timer);

        let entry = sendw.entry_mut(seq);
        let pkt = entry.pkt.as_mut().unwrap();

        pkt.clear_control();
        pkt.internal_flags.retransmission = true;

        self.netlink.repush(pkt.clone());
    }

    /// Release an entry without retransmitting it.
    fn drop_entry(&self, sendw: &mut SendWindow, seq: Seq) {
        if !sendw.entry(seq).pending() {
            return;
        }

        debug!("dropping packet: node={}; seq={}", sendw.node.id, seq);

        let timer = sendw.entry(seq).timer;

        self.timer_queue.cancel(timer);
        sendw.entry_mut(seq).reset();
        self.advance_send_window(sendw);
    }

    /// Resize and reset the PER estimators for the current MCS: the
    /// windows cover a fixed span of airtime, so their size in packets
    /// depends on how big a packet is at this MCS.
    fn reset_per_estimates(&self, cfg: &ArqConfig, sendw: &mut SendWindow) {
        let samples = self.max_packet_samples[sendw.mcsidx] as f64;

        let short = (cfg.short_per_window * cfg.min_channel_bandwidth / samples).max(1.0);
        sendw.short_per.set_window_size(short as usize);

        let long = (cfg.long_per_window * cfg.min_channel_bandwidth / samples).max(1.0);
        sendw.long_per.set_window_size(long as usize);
    }

    /// Change a window's MCS, skipping invalid entries, resetting PER
    /// state, and informing the network queue.
    fn set_mcs(&self, cfg: &ArqConfig, sendw: &mut SendWindow, mcsidx: usize) {
        let mut mcsidx = mcsidx;

        while mcsidx < self.mcs_table.len() - 1 && !self.mcs_table[mcsidx].valid {
            mcsidx += 1;
        }

        if mcsidx == sendw.mcsidx {
            return;
        }

        debug!(
            "moved {} modulation scheme: node={}; mcsidx={} (from {}); prob={:.2}",
            if mcsidx > sendw.mcsidx { "up" } else { "down" },
            sendw.node.id,
            mcsidx,
            sendw.mcsidx,
            sendw.mcsidx_prob[mcsidx],
        );

        sendw.mcsidx = mcsidx;
        sendw.per_end = sendw.seq;

        self.reset_per_estimates(cfg, sendw);
        self.netlink.update_mcs(sendw.node.id, mcsidx);
    }

    /// May the window move up one MCS level? Either the next level's EVM
    /// threshold is met, or (without a threshold) a Bernoulli draw against
    /// the learned transition probability succeeds.
    fn may_move_up_mcs(&self, cfg: &ArqConfig, sendw: &SendWindow) -> bool {
        if sendw.mcsidx >= cfg.mcsidx_max || sendw.mcsidx == self.mcs_table.len() - 1 {
            return false;
        }

        match cfg.evm_thresholds[sendw.mcsidx + 1] {
            Some(threshold) => match sendw.long_evm {
                Some(evm) => evm < threshold,
                None => false,
            },
            None => {
                self.rng.lock().unwrap().gen::<f64>() < sendw.mcsidx_prob[sendw.mcsidx + 1]
            }
        }
    }

    /// The AMC update, run after each feedback event.
    fn update_mcs(&self, cfg: &ArqConfig, sendw: &mut SendWindow, fast_adjust: bool) {
        if let Some(short_per) = sendw.short_per.value() {
            sendw.prev_short_per = short_per;
        }

        if let Some(long_per) = sendw.long_per.value() {
            sendw.prev_long_per = long_per;
        }

        let short_per = sendw.short_per.value();
        let long_per = sendw.long_per.value();

        if matches!(short_per, Some(per) if per > cfg.mcsidx_down_per_threshold) {
            // Learn to be reluctant about coming back to this MCS
            let mcsidx = sendw.mcsidx;

            sendw.mcsidx_prob[mcsidx] =
                (sendw.mcsidx_prob[mcsidx] * cfg.mcsidx_alpha).max(cfg.mcsidx_prob_floor);

            debug!(
                "transition probability for MCS: node={}; index={}; prob={:.2}",
                sendw.node.id, mcsidx, sendw.mcsidx_prob[mcsidx]
            );

            // Descend while EVM reported by the receiver says the next
            // level down still is not enough
            let mut n = 0;

            while sendw.mcsidx > n
                && sendw.mcsidx - n > cfg.mcsidx_min
                && self.mcs_table[sendw.mcsidx - (n + 1)].valid
            {
                n += 1;

                let next_threshold = cfg.evm_thresholds[sendw.mcsidx - n];

                match (next_threshold, sendw.long_evm) {
                    (Some(threshold), Some(evm)) if evm >= threshold => continue,
                    _ => break,
                }
            }

            if n != 0 {
                let mcsidx = sendw.mcsidx - n;

                self.set_mcs(cfg, sendw, mcsidx);
            } else {
                self.reset_per_estimates(cfg, sendw);
            }
        } else if fast_adjust && sendw.short_evm.is_some() {
            // Environment just changed: snap straight to the highest MCS
            // whose EVM threshold the link meets
            let current_evm = sendw.long_evm.or(sendw.short_evm).unwrap();
            let mut new_mcsidx = cfg.mcsidx_min;

            while new_mcsidx < cfg.mcsidx_max.min(self.mcs_table.len() - 1) {
                match cfg.evm_thresholds[new_mcsidx + 1] {
                    Some(threshold) if current_evm < threshold => new_mcsidx += 1,
                    _ => break,
                }
            }

            self.set_mcs(cfg, sendw, new_mcsidx);
        } else if matches!(long_per, Some(per) if per < cfg.mcsidx_up_per_threshold) {
            // This MCS has proven itself
            let mcsidx = sendw.mcsidx;

            sendw.mcsidx_prob[mcsidx] = 1.0;

            if self.may_move_up_mcs(cfg, sendw) {
                let mcsidx = sendw.mcsidx + 1;

                self.set_mcs(cfg, sendw, mcsidx);
            } else {
                self.reset_per_estimates(cfg, sendw);
            }
        }
    }

    /// The `received` path for a packet that has cleared header checks
    /// and addressing: ACK/SACK/NAK bookkeeping against our send window.
    fn process_feedback(&self, cfg: &ArqConfig, pkt: &RadioPacket, sendw: &mut SendWindow) {
        sendw.last_heard_timestamp = MonoClock::now();

        if sendw.new_window {
            return;
        }

        let mut tfeedback =
            MonoClock::now() - TimeDelta::from_secs_f64(cfg.selective_ack_feedback_delay);

        let nak = self.handle_nak(pkt, sendw);

        // If packets are always demodulated in order, an explicit NAK
        // proves the receiver saw everything up to and including the
        // NAKed packet; trust feedback at least that far. The slop makes
        // sure the NAKed packet itself is included.
        if cfg.demod_always_ordered {
            if let Some(nakked) = nak {
                let t = sendw.entry(nakked).timestamp + TimeDelta::from_secs_f64(0.001);

                if t > tfeedback {
                    tfeedback = t;
                }
            }
        }

        if pkt.hdr.flags.ack {
            // Statistics first: they feed the MCS decision below
            self.handle_receiver_stats(pkt, sendw);

            if pkt.ehdr.ack > sendw.unack {
                debug!(
                    "ack: node={}; seq=[{},{})",
                    pkt.hdr.curhop, sendw.unack, pkt.ehdr.ack
                );

                // The sender may ACK something we never sent; the bound on
                // max protects against that
                while sendw.unack < pkt.ehdr.ack && sendw.unack <= sendw.max {
                    let unack = sendw.unack;

                    self.handle_ack(cfg, sendw, unack);

                    if unack >= sendw.per_end {
                        sendw.tx_success();
                    }

                    sendw.unack += 1;
                }

                // A retransmission may be ACKed after we already counted
                // it bad; never rewind the PER window
                if sendw.unack > sendw.per_end {
                    sendw.per_end = sendw.unack;
                }
            }

            // Selective ACKs describe packets beyond the cumulative ACK
            self.handle_selective_ack(cfg, pkt, sendw, tfeedback);

            // A NAK for a retransmitted packet is a failure that was not
            // yet counted (the first NAK counted the original)
            if let Some(nakked) = nak {
                let failed = match &sendw.entry(nakked).pkt {
                    Some(epkt) => {
                        sendw.mcsidx >= epkt.mcsidx
                            && epkt.nretrans > 0
                            && nakked >= sendw.per_cutoff
                    }
                    None => false,
                };

                if failed {
                    sendw.tx_failure();
                }
            }

            let fast = self.is_fast_adjustment_period(cfg);

            self.update_mcs(cfg, sendw, fast);

            // Packets right after the ACKed one may have been dropped;
            // push the window up toward max
            self.advance_send_window(sendw);
        }
    }
}

impl Controller for ArqController {
    fn pull(&self) -> Option<NetPacket> {
        let cfg = self.config();

        loop {
            let mut pkt = self.get_packet(&cfg)?;

            if pkt.is_broadcast() {
                pkt.mcsidx = cfg.mcsidx_broadcast;
                pkt.g = cfg.broadcast_gain;
                pkt.llc_timestamp = MonoClock::now();
                return Some(pkt);
            }

            let nexthop = pkt.hdr.nexthop;

            // Attach an ACK if we have heard from the destination
            {
                let recvw = self.get_recv_window(nexthop);
                let mut recvw = recvw.lock().unwrap();

                if recvw.active {
                    if recvw.ack > recvw.max + 1 {
                        error!(
                            "invariant violated: ack={} > max={} + 1",
                            recvw.ack, recvw.max
                        );
                    }

                    pkt.hdr.flags.ack = true;
                    pkt.ehdr.ack = recvw.ack;

                    // A NAK packet always carries selective ACK state
                    if recvw.need_selective_ack || pkt.internal_flags.need_selective_ack {
                        self.append_feedback(&cfg, &mut pkt, &mut recvw);
                    }
                }
            }

            if pkt.hdr.flags.has_seq {
                let sendw = self.get_send_window(nexthop);
                let mut sendw = sendw.lock().unwrap();

                // The window may have shifted between intake and here: an
                // ACK could have arrived while the receive-window lock was
                // held. If so, get another packet.
                if pkt.hdr.seq < sendw.unack {
                    continue;
                }

                if pkt.hdr.seq >= sendw.unack + sendw.win {
                    error!(
                        "invariant violated: sending packet outside window: seq={}; unack={}; win={}",
                        pkt.hdr.seq, sendw.unack, sendw.win
                    );
                    continue;
                }

                if pkt.internal_flags.retransmission {
                    pkt.nretrans += 1;
                }

                if pkt.hdr.seq > sendw.max {
                    sendw.max = pkt.hdr.seq;
                }

                // Tell the receiver when we advanced our window locally
                if sendw.send_set_unack {
                    debug!(
                        "send set unack: nexthop={}; unack={}",
                        nexthop, sendw.unack
                    );
                    pkt.append_ctrl(CtrlMsg::SetUnack { unack: sendw.unack });
                    sendw.send_set_unack = false;
                }

                // On a final-attempt retransmission, trade rate for
                // robustness
                if cfg.decrease_retrans_mcsidx
                    && pkt.internal_flags.retransmission
                    && pkt.deadline.is_some()
                    && pkt.mcsidx == sendw.mcsidx
                    && pkt.mcsidx > cfg.mcsidx_min
                {
                    pkt.mcsidx -= 1;
                } else {
                    pkt.mcsidx = sendw.mcsidx;
                }

                pkt.g = sendw.node.gain();

                // Buffer the packet for retransmission
                let now = MonoClock::now();
                let seq = pkt.hdr.seq;
                let entry = sendw.entry_mut(seq);

                entry.pkt = Some(pkt.clone());
                entry.timestamp = now;
            } else {
                pkt.mcsidx = cfg.mcsidx_ack;
                pkt.g = cfg.ack_gain;
            }

            pkt.llc_timestamp = MonoClock::now();
            return Some(pkt);
        }
    }

    fn kick(&self) {
        self.netlink.kick();
    }

    fn received(&self, mut pkt: RadioPacket) {
        // An invalid header leaves nothing to trust
        if pkt.internal_flags.invalid_header {
            return;
        }

        let cfg = self.config();
        let prevhop = pkt.hdr.curhop;
        let recvw_arc = self.get_recv_window(prevhop);
        let sendw_arc = self.get_send_window(prevhop);

        // Reachability: any valid frame from the node counts
        {
            let mut sendw = sendw_arc.lock().unwrap();
            let when = WallClock::to_mono_time(pkt.timestamp);

            self.heard(&mut sendw, Some(when));
        }

        let this_id = self.radionet.this_node_id();

        if pkt.hdr.nexthop != NODE_BROADCAST && pkt.hdr.nexthop != this_id {
            return;
        }

        {
            let mut recvw = recvw_arc.lock().unwrap();

            // EVM and RSSI are valid whenever the header is
            recvw.short_evm.update(pkt.timestamp, pkt.evm as f64);
            recvw.long_evm.update(pkt.timestamp, pkt.evm as f64);
            recvw.short_rssi.update(pkt.timestamp, pkt.rssi as f64);
            recvw.long_rssi.update(pkt.timestamp, pkt.rssi as f64);

            // In the fast-adjustment period, feedback flows as fast as
            // possible
            let now = WallClock::now();

            if recvw.short_evm.value_at(now).is_some()
                && recvw.short_rssi.value_at(now).is_some()
                && self.is_fast_adjustment_period(&cfg)
            {
                self.start_sack_timer(&cfg, &mut recvw);
            }

            if pkt.hdr.flags.has_seq {
                // Activate the window on first contact; reset it on SYN or
                // when the sequence falls outside the window (the sender
                // restarted)
                if pkt.hdr.nexthop == this_id
                    && (!recvw.active
                        || pkt.hdr.flags.syn
                        || !recvw.contains(pkt.hdr.seq))
                {
                    self.timer_queue.cancel(recvw.timer);
                    recvw.reset(pkt.hdr.seq);
                }

                // A bad payload on a unicast data packet earns a NAK; we
                // can do nothing else with it
                if pkt.internal_flags.invalid_payload {
                    if pkt.hdr.nexthop != NODE_BROADCAST {
                        if pkt.hdr.seq >= recvw.ack + recvw.win {
                            self.advance_recv_window(pkt.hdr.seq, &mut recvw);
                        }

                        if pkt.hdr.seq > recvw.max {
                            recvw.max = pkt.hdr.seq;
                            recvw.max_timestamp = pkt.timestamp;
                        }

                        self.nak(&cfg, &mut recvw, pkt.hdr.seq);
                    }

                    return;
                }
            } else if pkt.internal_flags.invalid_payload {
                return;
            }
        }

        if pkt.hdr.flags.has_control {
            let node = self.radionet.node(prevhop);

            self.handle_ctrl_hello_and_ping(&pkt, &node);
            self.handle_ctrl_timestamp(&pkt, &node);
        }

        // Broadcast: strip control, deliver data, done
        if pkt.hdr.nexthop == NODE_BROADCAST {
            pkt.clear_control();

            if pkt.ehdr.data_len != 0 {
                self.radio_out.push(pkt);
            }

            return;
        }

        // The packet is addressed to us: process ACK/SACK/NAK feedback
        {
            let mut sendw = sendw_arc.lock().unwrap();

            self.process_feedback(&cfg, &pkt, &mut sendw);
        }

        if !pkt.hdr.flags.has_seq {
            return;
        }

        // Fill the receive window
        let mut recvw = recvw_arc.lock().unwrap();

        // A SYN is ACKed immediately to open the sender's window; anything
        // else (duplicates included, since our previous ACK may have been
        // lost) starts the SACK timer
        if pkt.hdr.flags.syn {
            self.send_ack_packet(&recvw);
        } else {
            self.start_sack_timer(&cfg, &mut recvw);
        }

        self.handle_set_unack(&pkt, &mut recvw);

        // Before the window: a duplicate of something already delivered
        if pkt.hdr.seq < recvw.ack {
            debug!(
                "recv outside window (dup): node={}; seq={}",
                prevhop, pkt.hdr.seq
            );
            return;
        }

        if pkt.hdr.seq >= recvw.ack + recvw.win {
            self.advance_recv_window(pkt.hdr.seq, &mut recvw);
        } else if recvw.entry(pkt.hdr.seq).received {
            debug!("recv dup: node={}; seq={}", prevhop, pkt.hdr.seq);
            return;
        }

        if pkt.hdr.seq > recvw.max {
            recvw.max = pkt.hdr.seq;
            recvw.max_timestamp = pkt.timestamp;
        }

        // Control information has been processed; only data remains
        pkt.clear_control();

        let seq = pkt.hdr.seq;
        let data_len = pkt.ehdr.data_len;

        if seq == recvw.ack {
            recvw.ack += 1;

            if data_len != 0 {
                self.radio_out.push(pkt);
            }
        } else if !cfg.enforce_ordering {
            // Deliver out of order now, but remember we did
            if data_len != 0 {
                self.radio_out.push(pkt);
            }

            recvw.entry_mut(seq).already_delivered();
        } else {
            recvw.entry_mut(seq).set(pkt);
        }

        // Drain consecutive received entries up to the first hole
        while recvw.ack <= recvw.max {
            let ack = recvw.ack;
            let entry = recvw.entry_mut(ack);

            if !entry.received {
                break;
            }

            let delivered = entry.delivered;

            if let Some(qpkt) = entry.pkt.take() {
                if !delivered && qpkt.ehdr.data_len != 0 {
                    self.radio_out.push(qpkt);
                }
            }

            entry.reset();
            recvw.ack += 1;
        }
    }

    fn transmitted(&self, mpkts: &mut Vec<ModPacket>) {
        for mpkt in mpkts.iter() {
            let pkt = &mpkt.pkt;

            if pkt.hdr.nexthop != NODE_BROADCAST && pkt.hdr.flags.has_seq {
                let sendw = self.get_send_window(pkt.hdr.nexthop);
                let mut sendw = sendw.lock().unwrap();

                if sendw.node.emcon() {
                    // We will never hear an ACK; treat the packet as
                    // delivered and move on
                    let seq = pkt.hdr.seq;

                    sendw.entry_mut(seq).reset();

                    if sendw.unack < seq + 1 {
                        sendw.unack = seq + 1;
                    }

                    self.advance_send_window(&mut sendw);
                } else {
                    self.start_retransmission_timer(&sendw, pkt.hdr.seq);
                }
            }

            // A selective ACK went out; the SACK timer's job is done
            if pkt.internal_flags.has_selective_ack {
                let recvw = self.get_recv_window(pkt.hdr.nexthop);
                let recvw = recvw.lock().unwrap();

                self.timer_queue.cancel(recvw.timer);
            }

            // Remember when our timestamp sequences actually aired
            if let Some(tseq) = pkt.timestamp_seq {
                let this_id = self.radionet.this_node_id();
                let mut timestamps = self.timestamps.lock().unwrap();

                timestamps
                    .entry(this_id)
                    .or_default()
                    .sent
                    .insert(tseq, pkt.tx_timestamp);

                debug!(
                    "transmitted timestamp: tseq={}; t_sent={:.6}",
                    tseq,
                    pkt.tx_timestamp.as_secs_f64()
                );
            }
        }
    }

    fn stop(&self) {
        self.timer_queue.stop();
    }
}

impl Drop for ArqController {
    fn drop(&mut self) {
        self.timer_queue.stop();
    }
}
