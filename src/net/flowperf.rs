/*! Flow performance measurement.

Packets are grouped into flows by their extended-header `(src, dest)`
pair. For each flow, byte and packet counts are bucketed by measurement
period on both the send (source) and receive (sink) sides, and flows can
be associated with mandated-outcome records describing what the flow is
supposed to achieve.
*/

use std::collections::HashMap;
use std::sync::Mutex;

use super::packet::{NetPacket, RadioPacket};
use super::NodeId;
use crate::time::{TimeDelta, TimePoint, WallClock};

/// A flow identifier.
pub type FlowUid = (NodeId, NodeId);

/// What a flow is mandated to achieve.
#[derive(Debug, Clone, Default)]
pub struct MandatedOutcome {
    /// Seconds over which the mandate must hold to count as achieved.
    pub hold_period: f64,

    /// Maximum packet latency (sec).
    pub max_latency: Option<f64>,

    /// Minimum throughput (bits/sec).
    pub min_throughput_bps: Option<f64>,

    /// File-transfer deadline (sec).
    pub file_transfer_deadline: Option<f64>,
}

/// Per-measurement-period traffic counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MPStats {
    pub npackets: usize,
    pub nbytes: usize,
}

/// Counts for one flow, bucketed by measurement period.
#[derive(Debug, Clone, Default)]
pub struct FlowStats {
    /// First measurement period with traffic.
    pub first_mp: Option<usize>,

    /// Stats per measurement period, starting at period 0.
    pub stats: Vec<MPStats>,
}

impl FlowStats {
    fn record(&mut self, mp: usize, nbytes: usize) {
        if self.stats.len() <= mp {
            self.stats.resize(mp + 1, MPStats::default());
        }

        self.stats[mp].npackets += 1;
        self.stats[mp].nbytes += nbytes;

        if self.first_mp.is_none() {
            self.first_mp = Some(mp);
        }
    }
}

/// Measures per-flow performance on both sides of the link.
pub struct FlowPerformance {
    /// Measurement period (sec).
    mp: TimeDelta,

    /// Time origin for bucketing.
    start: TimePoint,

    sources: Mutex<HashMap<FlowUid, FlowStats>>,
    sinks: Mutex<HashMap<FlowUid, FlowStats>>,
    mandates: Mutex<HashMap<FlowUid, MandatedOutcome>>,
}

impl FlowPerformance {
    pub fn new(mp: TimeDelta) -> Self {
        FlowPerformance {
            mp,
            start: WallClock::now(),
            sources: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            mandates: Mutex::new(HashMap::new()),
        }
    }

    pub fn measurement_period(&self) -> TimeDelta {
        self.mp
    }

    pub fn start(&self) -> TimePoint {
        self.start
    }

    fn mp_index(&self, t: TimePoint) -> usize {
        let elapsed = (t - self.start).as_secs_f64();

        if elapsed <= 0.0 {
            0
        } else {
            (elapsed / self.mp.as_secs_f64()) as usize
        }
    }

    /// Record a packet leaving through us.
    pub fn record_source(&self, pkt: &NetPacket) {
        let uid = (pkt.ehdr.src, pkt.ehdr.dest);
        let mp = self.mp_index(WallClock::now());

        self.sources
            .lock()
            .unwrap()
            .entry(uid)
            .or_default()
            .record(mp, pkt.payload.len());
    }

    /// Record a packet delivered through us.
    pub fn record_sink(&self, pkt: &RadioPacket) {
        let uid = (pkt.ehdr.src, pkt.ehdr.dest);
        let mp = self.mp_index(WallClock::now());

        self.sinks
            .lock()
            .unwrap()
            .entry(uid)
            .or_default()
            .record(mp, pkt.payload.len());
    }

    pub fn source_stats(&self, uid: FlowUid) -> Option<FlowStats> {
        self.sources.lock().unwrap().get(&uid).cloned()
    }

    pub fn sink_stats(&self, uid: FlowUid) -> Option<FlowStats> {
        self.sinks.lock().unwrap().get(&uid).cloned()
    }

    pub fn source_flows(&self) -> Vec<FlowUid> {
        self.sources.lock().unwrap().keys().copied().collect()
    }

    pub fn sink_flows(&self) -> Vec<FlowUid> {
        self.sinks.lock().unwrap().keys().copied().collect()
    }

    /// Replace the set of mandated outcomes.
    pub fn set_mandates(&self, mandates: HashMap<FlowUid, MandatedOutcome>) {
        *self.mandates.lock().unwrap() = mandates;
    }

    pub fn mandate(&self, uid: FlowUid) -> Option<MandatedOutcome> {
        self.mandates.lock().unwrap().get(&uid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_counts_bucket_by_flow() {
        let perf = FlowPerformance::new(TimeDelta::from_secs_f64(1.0));

        let a = NetPacket::with_payload(1, 2, 1, 2, vec![0; 100]);
        let b = NetPacket::with_payload(1, 3, 1, 3, vec![0; 50]);

        perf.record_source(&a);
        perf.record_source(&a);
        perf.record_source(&b);

        let stats = perf.source_stats((1, 2)).unwrap();
        assert_eq!(stats.first_mp, Some(0));
        assert_eq!(stats.stats[0], MPStats { npackets: 2, nbytes: 200 });

        let stats = perf.source_stats((1, 3)).unwrap();
        assert_eq!(stats.stats[0], MPStats { npackets: 1, nbytes: 50 });

        assert!(perf.source_stats((2, 1)).is_none());
    }

    #[test]
    fn mandates_are_associated() {
        let perf = FlowPerformance::new(TimeDelta::from_secs_f64(1.0));
        let mut mandates = HashMap::new();

        mandates.insert(
            (1u8, 2u8),
            MandatedOutcome {
                hold_period: 10.0,
                min_throughput_bps: Some(1e6),
                ..Default::default()
            },
        );

        perf.set_mandates(mandates);

        assert!(perf.mandate((1, 2)).is_some());
        assert!(perf.mandate((1, 3)).is_none());
    }
}
