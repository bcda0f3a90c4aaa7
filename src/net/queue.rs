/*! The controller's network-facing queue.

The network tap itself is an external collaborator; what the controller
sees is a [NetLink]: a pullable queue of outgoing packets with a priority
band for control traffic, a head-of-queue band for retransmissions, and
notifications flowing the other way (link status, MCS updates).

[NetQueue] is the concrete implementation. Packets for a destination whose
link is closed stay queued and ineligible until the link reopens; the
high-priority and retransmission bands always flow, since that is where
ACK-only packets and retransmissions (which must keep moving to reopen the
window) travel.
*/

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};

use super::packet::NetPacket;
use super::NodeId;

pub trait NetLink: Send + Sync {
    /// Pull the next packet to send, blocking until one is eligible.
    /// Returns `None` on kick or shutdown.
    fn pull(&self) -> Option<NetPacket>;

    /// Re-enqueue a packet at the head of the queue (retransmission).
    fn repush(&self, pkt: NetPacket);

    /// Enqueue a high-priority control packet.
    fn push_hi(&self, pkt: NetPacket);

    /// Wake any blocked pull with a `None` return.
    fn kick(&self);

    /// The send window for `node` opened or closed.
    fn set_link_status(&self, node: NodeId, open: bool);

    /// The MCS used for `node` changed; packet sizing may follow it.
    fn update_mcs(&self, node: NodeId, mcsidx: usize);

    /// Shut the queue down, waking all blocked pulls.
    fn disable(&self);
}

struct QueueState {
    hi: VecDeque<NetPacket>,
    repush: VecDeque<NetPacket>,
    queue: VecDeque<NetPacket>,
    enabled: bool,

    /// Bumped by kick; pulls that entered under an older epoch return
    /// `None`.
    kick_epoch: u64,
}

pub struct NetQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
    link_open: Mutex<HashMap<NodeId, bool>>,
    mcs: Mutex<HashMap<NodeId, usize>>,
}

impl Default for NetQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl NetQueue {
    pub fn new() -> Self {
        NetQueue {
            state: Mutex::new(QueueState {
                hi: VecDeque::new(),
                repush: VecDeque::new(),
                queue: VecDeque::new(),
                enabled: true,
                kick_epoch: 0,
            }),
            cv: Condvar::new(),
            link_open: Mutex::new(HashMap::new()),
            mcs: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue a packet from the network tap.
    pub fn push(&self, pkt: NetPacket) -> bool {
        {
            let mut state = self.state.lock().unwrap();

            if !state.enabled {
                return false;
            }

            state.queue.push_back(pkt);
        }

        self.cv.notify_one();
        true
    }

    pub fn is_link_open(&self, node: NodeId) -> bool {
        self.link_open.lock().unwrap().get(&node).copied().unwrap_or(true)
    }

    pub fn mcs_for(&self, node: NodeId) -> Option<usize> {
        self.mcs.lock().unwrap().get(&node).copied()
    }

    fn pop_eligible(&self, state: &mut QueueState) -> Option<NetPacket> {
        if let Some(pkt) = state.hi.pop_front() {
            return Some(pkt);
        }

        if let Some(pkt) = state.repush.pop_front() {
            return Some(pkt);
        }

        let link_open = self.link_open.lock().unwrap();
        let pos = state
            .queue
            .iter()
            .position(|pkt| *link_open.get(&pkt.hdr.nexthop).unwrap_or(&true));

        drop(link_open);
        pos.and_then(|pos| state.queue.remove(pos))
    }

    fn has_eligible(&self, state: &QueueState) -> bool {
        if !state.hi.is_empty() || !state.repush.is_empty() {
            return true;
        }

        let link_open = self.link_open.lock().unwrap();

        state
            .queue
            .iter()
            .any(|pkt| *link_open.get(&pkt.hdr.nexthop).unwrap_or(&true))
    }
}

impl NetLink for NetQueue {
    fn pull(&self) -> Option<NetPacket> {
        let state = self.state.lock().unwrap();
        let epoch = state.kick_epoch;

        let mut state = self
            .cv
            .wait_while(state, |s| {
                s.enabled && s.kick_epoch == epoch && !self.has_eligible(s)
            })
            .unwrap();

        if !state.enabled || state.kick_epoch != epoch {
            return None;
        }

        self.pop_eligible(&mut state)
    }

    fn repush(&self, pkt: NetPacket) {
        {
            let mut state = self.state.lock().unwrap();

            if !state.enabled {
                return;
            }

            state.repush.push_back(pkt);
        }

        self.cv.notify_one();
    }

    fn push_hi(&self, pkt: NetPacket) {
        {
            let mut state = self.state.lock().unwrap();

            if !state.enabled {
                return;
            }

            state.hi.push_back(pkt);
        }

        self.cv.notify_one();
    }

    fn kick(&self) {
        self.state.lock().unwrap().kick_epoch += 1;
        self.cv.notify_all();
    }

    fn set_link_status(&self, node: NodeId, open: bool) {
        self.link_open.lock().unwrap().insert(node, open);

        if open {
            self.cv.notify_all();
        }
    }

    fn update_mcs(&self, node: NodeId, mcsidx: usize) {
        self.mcs.lock().unwrap().insert(node, mcsidx);
    }

    fn disable(&self) {
        self.state.lock().unwrap().enabled = false;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(nexthop: NodeId) -> NetPacket {
        NetPacket::with_payload(1, nexthop, 1, nexthop, vec![0])
    }

    #[test]
    fn priority_bands() {
        let q = NetQueue::new();

        q.push(pkt(2));
        q.repush(pkt(3));
        q.push_hi(pkt(4));

        assert_eq!(q.pull().unwrap().hdr.nexthop, 4);
        assert_eq!(q.pull().unwrap().hdr.nexthop, 3);
        assert_eq!(q.pull().unwrap().hdr.nexthop, 2);
    }

    #[test]
    fn closed_link_holds_data_packets() {
        let q = NetQueue::new();

        q.set_link_status(2, false);
        q.push(pkt(2));
        q.push(pkt(3));

        // Node 3's packet flows past node 2's parked packet
        assert_eq!(q.pull().unwrap().hdr.nexthop, 3);

        // Reopening releases the parked packet
        q.set_link_status(2, true);
        assert_eq!(q.pull().unwrap().hdr.nexthop, 2);
    }

    #[test]
    fn kick_wakes_blocked_pulls() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let q = Arc::new(NetQueue::new());
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || q.pull())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        q.kick();

        for handle in handles {
            assert!(handle.join().unwrap().is_none());
        }

        // The queue still works afterwards
        q.push(pkt(2));
        assert!(q.pull().is_some());
    }

    #[test]
    fn disable_ends_pulls() {
        let q = NetQueue::new();

        q.disable();
        assert!(q.pull().is_none());
        assert!(!q.push(pkt(2)));
    }

    #[test]
    fn mcs_updates_recorded() {
        let q = NetQueue::new();

        q.update_mcs(2, 3);
        assert_eq!(q.mcs_for(2), Some(3));
        assert_eq!(q.mcs_for(9), None);
    }
}
