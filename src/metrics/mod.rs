//! Statsd metrics
//!
//! Counters, gauges, and timings as DataDog-flavored statsd datagrams over
//! UDP. Sends are fire-and-forget; a metrics outage never slows the data
//! path. No statsd crate is involved: the datagram format is three lines
//! of string building.

use crate::pool::{Event, EventType, Monitor};
use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Statsd client with a fixed namespace and base tags.
pub struct StatsdClient {
    socket: Option<UdpSocket>,
    namespace: String,
    base_tags: Vec<String>,
}

impl StatsdClient {
    /// Connect a UDP socket to the statsd sink. The address is resolved
    /// once, at startup.
    pub fn new(address: &str, namespace: &str, base_tags: Vec<String>) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(address)?;
        socket.set_nonblocking(true)?;
        Ok(StatsdClient {
            socket: Some(socket),
            namespace: namespace.to_string(),
            base_tags,
        })
    }

    /// A client that drops every metric. Used in tests and when no sink
    /// is configured.
    pub fn disabled() -> Self {
        StatsdClient {
            socket: None,
            namespace: String::new(),
            base_tags: Vec::new(),
        }
    }

    /// Derive a client sharing the sink with extra base tags.
    pub fn with_tags(&self, extra: Vec<String>) -> io::Result<Self> {
        let socket = match &self.socket {
            Some(socket) => Some(socket.try_clone()?),
            None => None,
        };
        let mut base_tags = self.base_tags.clone();
        base_tags.extend(extra);
        Ok(StatsdClient {
            socket,
            namespace: self.namespace.clone(),
            base_tags,
        })
    }

    fn send(&self, name: &str, value: &str, kind: &str, tags: &[String]) {
        let Some(socket) = &self.socket else {
            return;
        };

        let mut datagram = if self.namespace.is_empty() {
            format!("{}:{}|{}", name, value, kind)
        } else {
            format!("{}.{}:{}|{}", self.namespace, name, value, kind)
        };

        if !self.base_tags.is_empty() || !tags.is_empty() {
            datagram.push_str("|#");
            let mut first = true;
            for tag in self.base_tags.iter().chain(tags.iter()) {
                if !first {
                    datagram.push(',');
                }
                datagram.push_str(tag);
                first = false;
            }
        }

        let _ = socket.send(datagram.as_bytes());
    }

    /// Increment a counter by one.
    pub fn incr(&self, name: &str, tags: &[String]) {
        self.send(name, "1", "c", tags);
    }

    /// Report a gauge value.
    pub fn gauge(&self, name: &str, value: i64, tags: &[String]) {
        self.send(name, &value.to_string(), "g", tags);
    }

    /// Report a millisecond timing.
    pub fn timing(&self, name: &str, duration: Duration, tags: &[String]) {
        self.send(name, &duration.as_millis().to_string(), "ms", tags);
    }
}

/// A gauge maintained by paired increment/decrement events: each call
/// bumps a named counter and re-reports the gauge.
pub struct GaugeTracker {
    client: Arc<StatsdClient>,
    gauge_name: String,
    value: AtomicI64,
}

impl GaugeTracker {
    /// Track `gauge_name` on `client`.
    pub fn new(client: Arc<StatsdClient>, gauge_name: &str) -> Self {
        GaugeTracker {
            client,
            gauge_name: gauge_name.to_string(),
            value: AtomicI64::new(0),
        }
    }

    /// Record one more tracked object.
    pub fn increment(&self, event_name: &str, tags: &[String]) {
        let value = self.value.fetch_add(1, Ordering::SeqCst) + 1;
        self.client.incr(event_name, tags);
        self.client.gauge(&self.gauge_name, value, tags);
    }

    /// Record one fewer tracked object.
    pub fn decrement(&self, event_name: &str, tags: &[String]) {
        let value = self.value.fetch_sub(1, Ordering::SeqCst) - 1;
        self.client.incr(event_name, tags);
        self.client.gauge(&self.gauge_name, value, tags);
    }

    /// Current tracked count.
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }
}

/// Pool monitor that maps events onto statsd counters and gauges.
pub struct StatsdMonitor {
    client: Arc<StatsdClient>,
    open_connections: GaugeTracker,
    checked_out: GaugeTracker,
}

impl StatsdMonitor {
    /// Build a monitor reporting through `client`.
    pub fn new(client: Arc<StatsdClient>) -> Self {
        StatsdMonitor {
            open_connections: GaugeTracker::new(client.clone(), "pool.open_connections"),
            checked_out: GaugeTracker::new(client.clone(), "pool.checked_out_connections"),
            client,
        }
    }
}

impl Monitor for StatsdMonitor {
    fn event(&self, event: &Event) {
        let name = format!("pool_event.{}", event.event_type.as_str());
        let tags = [
            format!("address:{}", event.address),
            format!("reason:{}", event.reason.unwrap_or("")),
        ];

        match event.event_type {
            EventType::ConnectionCreated => self.open_connections.increment(&name, &tags),
            EventType::ConnectionClosed => self.open_connections.decrement(&name, &tags),
            EventType::GetSucceeded => self.checked_out.increment(&name, &tags),
            EventType::ConnectionReturned => self.checked_out.decrement(&name, &tags),
            _ => self.client.incr(&name, &tags),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket as StdUdpSocket;

    fn bound_sink() -> (StdUdpSocket, String) {
        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        (socket, addr)
    }

    fn recv(sink: &StdUdpSocket) -> String {
        let mut buf = [0u8; 512];
        let n = sink.recv(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[test]
    fn test_counter_datagram_format() {
        let (sink, addr) = bound_sink();
        let client = StatsdClient::new(&addr, "mcbridge", vec![]).unwrap();

        client.incr("handle_message", &["success:true".to_string()]);
        assert_eq!(recv(&sink), "mcbridge.handle_message:1|c|#success:true");
    }

    #[test]
    fn test_gauge_and_timing_format() {
        let (sink, addr) = bound_sink();
        let client = StatsdClient::new(&addr, "mcbridge", vec![]).unwrap();

        client.gauge("open_connections", 3, &[]);
        assert_eq!(recv(&sink), "mcbridge.open_connections:3|g");

        client.timing("handle_message", Duration::from_millis(42), &[]);
        assert_eq!(recv(&sink), "mcbridge.handle_message:42|ms");
    }

    #[test]
    fn test_base_tags_precede_call_tags() {
        let (sink, addr) = bound_sink();
        let client = StatsdClient::new(&addr, "mcbridge", vec!["upstream:a".to_string()]).unwrap();
        let client = client.with_tags(vec!["local:b".to_string()]).unwrap();

        client.incr("x", &["c:d".to_string()]);
        assert_eq!(recv(&sink), "mcbridge.x:1|c|#upstream:a,local:b,c:d");
    }

    #[test]
    fn test_disabled_client_drops_metrics() {
        let client = StatsdClient::disabled();
        client.incr("x", &[]);
        client.gauge("y", 1, &[]);

        let derived = client.with_tags(vec!["a:b".to_string()]).unwrap();
        derived.timing("z", Duration::from_millis(1), &[]);
    }

    #[test]
    fn test_gauge_tracker_counts() {
        let (sink, addr) = bound_sink();
        let client = Arc::new(StatsdClient::new(&addr, "mcbridge", vec![]).unwrap());
        let tracker = GaugeTracker::new(client, "open_connections");

        tracker.increment("connection_opened", &[]);
        assert_eq!(tracker.value(), 1);
        assert_eq!(recv(&sink), "mcbridge.connection_opened:1|c");
        assert_eq!(recv(&sink), "mcbridge.open_connections:1|g");

        tracker.decrement("connection_closed", &[]);
        assert_eq!(tracker.value(), 0);
        assert_eq!(recv(&sink), "mcbridge.connection_closed:1|c");
        assert_eq!(recv(&sink), "mcbridge.open_connections:0|g");
    }

    #[test]
    fn test_statsd_monitor_maps_pool_events() {
        let (sink, addr) = bound_sink();
        let client = Arc::new(StatsdClient::new(&addr, "mcbridge", vec![]).unwrap());
        let monitor = StatsdMonitor::new(client);

        monitor.event(&Event {
            event_type: EventType::ConnectionCreated,
            address: "localhost:11211".to_string(),
            connection_id: 1,
            reason: None,
        });
        assert_eq!(
            recv(&sink),
            "mcbridge.pool_event.connection_created:1|c|#address:localhost:11211,reason:"
        );
        assert_eq!(
            recv(&sink),
            "mcbridge.pool.open_connections:1|g|#address:localhost:11211,reason:"
        );

        monitor.event(&Event {
            event_type: EventType::ConnectionClosed,
            address: "localhost:11211".to_string(),
            connection_id: 1,
            reason: Some("stale"),
        });
        assert_eq!(
            recv(&sink),
            "mcbridge.pool_event.connection_closed:1|c|#address:localhost:11211,reason:stale"
        );
        assert_eq!(
            recv(&sink),
            "mcbridge.pool.open_connections:0|g|#address:localhost:11211,reason:stale"
        );
    }
}
