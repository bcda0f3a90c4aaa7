/*! The radio network: neighbors and this node.

Nodes are discovered through HELLO exchange and created on demand when a
packet is first sent to or heard from them. Per-node mode bits (emissions
control, unreachable) are atomics: window code checks them while holding
its own locks, and they must never require taking the neighbor-table lock.
*/

pub mod flowperf;
pub mod packet;
pub mod queue;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub use crate::wire::{NodeId, NODE_BROADCAST};

/// A node in the radio network.
pub struct Node {
    pub id: NodeId,
    is_gateway: AtomicBool,
    emcon: AtomicBool,
    unreachable: AtomicBool,
    gain: AtomicU32,
}

impl Node {
    fn new(id: NodeId) -> Self {
        Node {
            id,
            is_gateway: AtomicBool::new(false),
            emcon: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            gain: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    pub fn is_gateway(&self) -> bool {
        self.is_gateway.load(Ordering::Acquire)
    }

    pub fn set_gateway(&self, is_gateway: bool) {
        self.is_gateway.store(is_gateway, Ordering::Release);
    }

    /// Is this node under emissions control (transmit forbidden)?
    pub fn emcon(&self) -> bool {
        self.emcon.load(Ordering::Acquire)
    }

    pub fn set_emcon(&self, emcon: bool) {
        self.emcon.store(emcon, Ordering::Release);
    }

    /// Have we given up hearing from this node?
    pub fn unreachable(&self) -> bool {
        self.unreachable.load(Ordering::Acquire)
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Release);
    }

    /// Linear soft TX gain applied to packets sent to this node.
    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Acquire))
    }

    pub fn set_gain(&self, g: f32) {
        self.gain.store(g.to_bits(), Ordering::Release);
    }
}

/// The neighbor table.
pub struct RadioNet {
    this_id: NodeId,
    nodes: Mutex<BTreeMap<NodeId, Arc<Node>>>,
}

impl RadioNet {
    pub fn new(this_id: NodeId, is_gateway: bool) -> Self {
        let net = RadioNet {
            this_id,
            nodes: Mutex::new(BTreeMap::new()),
        };

        net.node(this_id).set_gateway(is_gateway);
        net
    }

    pub fn this_node_id(&self) -> NodeId {
        self.this_id
    }

    pub fn this_node(&self) -> Arc<Node> {
        self.node(self.this_id)
    }

    /// Look up a node, adding it to the network if it is new.
    pub fn node(&self, id: NodeId) -> Arc<Node> {
        let mut nodes = self.nodes.lock().unwrap();

        Arc::clone(nodes.entry(id).or_insert_with(|| Arc::new(Node::new(id))))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.lock().unwrap().contains_key(&id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.lock().unwrap().keys().copied().collect()
    }

    pub fn foreach<F: FnMut(&Arc<Node>)>(&self, mut f: F) {
        for node in self.nodes.lock().unwrap().values() {
            f(node);
        }
    }

    /// The time master: the lowest-numbered gateway, if any gateway is
    /// known.
    pub fn time_master(&self) -> Option<NodeId> {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .find(|node| node.is_gateway())
            .map(|node| node.id)
    }
}
