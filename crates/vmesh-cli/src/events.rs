use serde::Serialize;
use std::io::Write;
use vmesh_protocol::{MmcpEvent, NeighborInfo, RouteInfo, RouterStats};

/// Emit a JSONL event to stdout (flushed immediately for piped output).
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();
    }
}

pub use vmesh_transport::now_ms;

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub address: String,
    pub relay_port: u16,
    pub mode: &'static str,
    pub timestamp_ms: u64,
}

impl EventStarted {
    pub fn new(address: String, relay_port: u16, mode: &'static str) -> Self {
        Self {
            event: "started",
            address,
            relay_port,
            mode,
            timestamp_ms: now_ms(),
        }
    }
}

#[derive(Serialize)]
pub struct EventListening {
    pub event: &'static str,
    pub kind: &'static str,
    pub addr: String,
    pub target: Option<String>,
}

// ── Mesh events ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventMesh {
    pub event: &'static str,
    pub peer: String,
    pub next_hop: Option<String>,
    pub metric: Option<u32>,
    pub rtt_ms: Option<f64>,
    pub elapsed_s: f64,
}

impl EventMesh {
    /// JSONL form of an MMCP event. Acks and hotspot traffic are not reported.
    pub fn from_mmcp(event: &MmcpEvent, elapsed_s: f64) -> Option<Self> {
        let base = |event: &'static str, peer: String| Self {
            event,
            peer,
            next_hop: None,
            metric: None,
            rtt_ms: None,
            elapsed_s,
        };
        match event {
            MmcpEvent::RouteUpdated {
                destination,
                next_hop,
                metric,
                ..
            } => Some(Self {
                next_hop: Some(next_hop.to_string()),
                metric: Some(*metric),
                ..base("route_updated", destination.to_string())
            }),
            MmcpEvent::RouteExpired { destination } => {
                Some(base("route_expired", destination.to_string()))
            }
            MmcpEvent::NeighborDeparted { neighbor } => {
                Some(base("neighbor_departed", neighbor.to_string()))
            }
            MmcpEvent::RttMeasured { neighbor, srtt, .. } => Some(Self {
                rtt_ms: Some(srtt.as_secs_f64() * 1000.0),
                ..base("rtt", neighbor.to_string())
            }),
            _ => None,
        }
    }
}

// ── Periodic snapshot ───────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStats<'a> {
    pub event: &'static str,
    pub elapsed_s: f64,
    pub stats: &'a RouterStats,
    pub neighbors: Vec<NeighborInfo>,
    pub routes: Vec<RouteInfo>,
}

// ── Send mode ───────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventReply {
    pub event: &'static str,
    pub from: String,
    pub bytes: usize,
    pub rtt_ms: f64,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vmesh_protocol::VirtualAddress;

    #[test]
    fn route_event_carries_metric() {
        let event = MmcpEvent::RouteUpdated {
            destination: VirtualAddress::from_octets(169, 254, 0, 9),
            next_hop: VirtualAddress::from_octets(169, 254, 0, 2),
            metric: 42,
            hops: 3,
            connect_config: None,
        };
        let mesh = EventMesh::from_mmcp(&event, 1.5).unwrap();
        let json = serde_json::to_value(&mesh).unwrap();
        assert_eq!(json["event"], "route_updated");
        assert_eq!(json["peer"], "169.254.0.9");
        assert_eq!(json["next_hop"], "169.254.0.2");
        assert_eq!(json["metric"], 42);
    }

    #[test]
    fn rtt_event_in_milliseconds() {
        let event = MmcpEvent::RttMeasured {
            neighbor: VirtualAddress::from_octets(169, 254, 0, 2),
            rtt: Duration::from_millis(12),
            srtt: Duration::from_millis(8),
        };
        let mesh = EventMesh::from_mmcp(&event, 0.0).unwrap();
        assert_eq!(mesh.event, "rtt");
        assert_eq!(mesh.rtt_ms, Some(8.0));
    }

    #[test]
    fn acks_are_not_reported() {
        let event = MmcpEvent::AckReceived {
            from: VirtualAddress::from_octets(169, 254, 0, 2),
            ack_of: 1,
        };
        assert!(EventMesh::from_mmcp(&event, 0.0).is_none());
    }
}
