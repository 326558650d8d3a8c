//! Gateway assembly: binds every listener and wires the adapters to the bridge.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mangahub_bridge::{
    BridgeConfig, BridgeStats, CircuitBreaker, ConnectionHealthTracker, EventRouter,
    HeartbeatManager, UnifiedBridge,
};
use mangahub_settings::MangahubSettings;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{info, warn};

use crate::http::{self, AppState};
use crate::notify::{NotificationIngress, forwarding_router};
use crate::shutdown::ShutdownCoordinator;
use crate::tcp::TcpAdapter;
use crate::udp::UdpNotifier;

/// A bound, not yet started gateway.
pub struct Gateway {
    bridge: Arc<UnifiedBridge>,
    health: Arc<ConnectionHealthTracker>,
    heartbeat: Arc<HeartbeatManager>,
    notifier: Arc<UdpNotifier>,
    router: Arc<EventRouter>,
    tcp: Option<TcpListener>,
    notify: Option<TcpListener>,
    http: Option<TcpListener>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    notify_addr: SocketAddr,
    http_addr: SocketAddr,
}

async fn bind_tcp(host: &str, port: u16, what: &str) -> Result<TcpListener> {
    TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {what} listener on {host}:{port}"))
}

impl Gateway {
    /// Bind all listeners and build the bridge with its trackers.
    pub async fn bind(settings: &MangahubSettings) -> Result<Self> {
        let host = settings.gateway.host.as_str();
        let tcp = bind_tcp(host, settings.gateway.tcp_port, "tcp").await?;
        let notify = bind_tcp(host, settings.gateway.notify_port, "notification").await?;
        let http = bind_tcp(host, settings.gateway.http_port, "http").await?;
        let udp = UdpSocket::bind((host, settings.gateway.udp_port))
            .await
            .with_context(|| {
                format!("failed to bind udp socket on {host}:{}", settings.gateway.udp_port)
            })?;

        let bridge = UnifiedBridge::new(
            BridgeConfig {
                queue_capacity: settings.bridge.queue_capacity,
            },
            Arc::new(BridgeStats::new()),
        );
        let health = ConnectionHealthTracker::new(
            settings.health.check_interval(),
            settings.health.timeout(),
            settings.health.max_missed_checks,
        );
        let heartbeat =
            HeartbeatManager::new(settings.heartbeat.interval(), settings.heartbeat.timeout());
        let breaker = CircuitBreaker::new(
            "udp",
            settings.circuit_breaker.threshold,
            settings.circuit_breaker.timeout(),
        );

        let udp_addr = udp.local_addr()?;
        let notifier = UdpNotifier::new(Arc::new(udp), &bridge, Arc::clone(&heartbeat), breaker);
        bridge.set_udp_broadcaster(notifier.clone());
        let router = Arc::new(forwarding_router(&bridge));

        Ok(Self {
            tcp_addr: tcp.local_addr()?,
            notify_addr: notify.local_addr()?,
            http_addr: http.local_addr()?,
            udp_addr,
            bridge,
            health,
            heartbeat,
            notifier,
            router,
            tcp: Some(tcp),
            notify: Some(notify),
            http: Some(http),
        })
    }

    /// Start the bridge, the trackers and every listener task.
    pub fn start(&mut self, shutdown: &ShutdownCoordinator, prometheus: Option<PrometheusHandle>) {
        if shutdown.is_shutting_down() {
            warn!("not starting gateway during shutdown");
            return;
        }
        let _ = self.bridge.start();
        let _ = self.health.start();
        let _ = self.heartbeat.start();

        if let Some(listener) = self.tcp.take() {
            let adapter = TcpAdapter::new(Arc::clone(&self.bridge), Arc::clone(&self.health));
            shutdown.spawn("tcp", adapter.serve(listener, shutdown.token()));
        }
        shutdown.spawn("udp", Arc::clone(&self.notifier).serve(shutdown.token()));
        if let Some(listener) = self.notify.take() {
            let ingress = NotificationIngress::new(Arc::clone(&self.router));
            shutdown.spawn("notify", ingress.serve(listener, shutdown.token()));
        }
        if let Some(listener) = self.http.take() {
            let state = AppState {
                bridge: Arc::clone(&self.bridge),
                prometheus,
                start_time: Instant::now(),
            };
            shutdown.spawn("http", http::serve(listener, state, shutdown.token()));
        }
    }

    /// Stop listeners, then the bridge and its trackers.
    pub async fn shutdown(&self, shutdown: &ShutdownCoordinator, timeout: Duration) {
        shutdown.graceful_shutdown(timeout).await;
        self.heartbeat.stop();
        self.health.stop();
        self.bridge.stop().await;
        info!(
            events_routed = self.bridge.stats().events_routed(),
            "gateway stopped"
        );
    }

    /// The bridge.
    pub fn bridge(&self) -> &Arc<UnifiedBridge> {
        &self.bridge
    }

    /// Bound TCP sync address.
    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Bound UDP address.
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Bound notification ingress address.
    pub fn notify_addr(&self) -> SocketAddr {
        self.notify_addr
    }

    /// Bound HTTP address.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mangahub_core::{EventType, UnifiedEvent};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    fn local_settings() -> MangahubSettings {
        let mut settings = MangahubSettings::default();
        settings.gateway.host = "127.0.0.1".to_string();
        settings.gateway.tcp_port = 0;
        settings.gateway.udp_port = 0;
        settings.gateway.notify_port = 0;
        settings.gateway.http_port = 0;
        settings
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn notification_reaches_tcp_and_udp_clients() {
        let mut gateway = Gateway::bind(&local_settings()).await.unwrap();
        let shutdown = ShutdownCoordinator::new();
        gateway.start(&shutdown, None);

        // TCP subscriber
        let tcp = TcpStream::connect(gateway.tcp_addr()).await.unwrap();
        let (read, mut write) = tcp.into_split();
        let mut lines = BufReader::new(read).lines();
        write.write_all(b"{\"user_id\":\"reader\"}\n").await.unwrap();

        // UDP subscriber
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let _ = udp
            .send_to(b"{\"type\":\"register\",\"user_id\":\"reader\"}", gateway.udp_addr())
            .await
            .unwrap();

        let bridge = Arc::clone(gateway.bridge());
        wait_for(|| bridge.get_total_connection_count() == 2).await;

        let mut notify = TcpStream::connect(gateway.notify_addr()).await.unwrap();
        notify
            .write_all(
                b"{\"type\":\"notification\",\"event_type\":\"chapter_completed\",\"user_id\":\"reader\",\"data\":{\"chapter\":7}}\n",
            )
            .await
            .unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let got: UnifiedEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(got.event_type, EventType::ChapterCompleted);
        assert_eq!(got.user_id, "reader");
        assert_eq!(got.data["chapter"], 7);

        let mut buf = [0u8; 4096];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), udp.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let got: UnifiedEvent = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(got.event_type, EventType::ChapterCompleted);

        drop(write);
        gateway.shutdown(&shutdown, Duration::from_secs(2)).await;
        assert!(!gateway.bridge().is_running());
    }

    #[tokio::test]
    async fn health_endpoint_is_served() {
        let mut gateway = Gateway::bind(&local_settings()).await.unwrap();
        let shutdown = ShutdownCoordinator::new();
        gateway.start(&shutdown, None);

        let mut stream = TcpStream::connect(gateway.http_addr()).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"status\":\"ok\""));

        gateway.shutdown(&shutdown, Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut settings = local_settings();
        settings.gateway.tcp_port = taken.local_addr().unwrap().port();
        let err = Gateway::bind(&settings).await.err().unwrap();
        assert!(format!("{err:#}").contains("tcp listener"));
    }
}
