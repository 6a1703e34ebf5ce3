use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use packline::{ClientId, ClientInfo, NetError, ServerRegistry};

use crate::config::RelayConfig;
use crate::events::{DisconnectReason, ServerEvent};
use crate::relay::TextRelay;

pub struct RelayServer {
    registry: ServerRegistry,
    events: mpsc::Receiver<ServerEvent>,
    pending_events: VecDeque<ServerEvent>,
    tick: u64,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    running: Arc<AtomicBool>,
    start_time: Instant,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Result<Self, NetError> {
        let (tx, events) = mpsc::channel();
        let tick_duration = config.tick_duration();

        let mut registry = ServerRegistry::with_handler(config.network, TextRelay::new(tx));
        registry.start()?;

        Ok(Self {
            registry,
            events,
            pending_events: VecDeque::new(),
            tick: 0,
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            running: Arc::new(AtomicBool::new(true)),
            start_time: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.registry.local_addr()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.extend(self.events.try_iter());
        self.pending_events.drain(..)
    }

    /// Headless loop; returns once the running flag is cleared.
    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            for event in self.drain_events().collect::<Vec<_>>() {
                log_event(&event);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown_connections();
    }

    pub fn shutdown_connections(&mut self) {
        if self.registry.stop() {
            log::info!("Closed all client connections");
        }
    }

    pub fn kick_client(&mut self, client_id: ClientId) {
        if self.registry.remove_client(client_id) {
            self.pending_events.push_back(ServerEvent::ClientDisconnected {
                client_id,
                reason: DisconnectReason::Kicked,
            });
        }
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        self.accumulator += now - self.last_tick_time;
        self.last_tick_time = now;

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.registry.update(self.tick_duration);
            self.tick += 1;
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            tick: self.tick,
            uptime_secs: self.start_time.elapsed().as_secs(),
            client_count: self.registry.client_count(),
            max_clients: self.registry.max_clients(),
            bytes_sent: self.registry.bytes_sent(),
            bytes_received: self.registry.bytes_received(),
        }
    }

    pub fn client_infos(&self) -> Vec<ClientInfo> {
        self.registry.clients()
    }
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::ClientConnected { client_id, addr } => {
            log::info!("Client {} connected from {}", client_id, addr);
        }
        ServerEvent::ClientDisconnected { client_id, reason } => {
            log::info!("Client {} {}", client_id, reason.as_str());
        }
        ServerEvent::Message { client_id, body } => {
            log::info!("<{}> {}", client_id, body);
        }
        ServerEvent::Error { message } => log::warn!("{}", message),
    }
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub tick: u64,
    pub uptime_secs: u64,
    pub client_count: usize,
    pub max_clients: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use packline::ServerConfig;

    use super::*;

    fn localhost(port: u16) -> RelayConfig {
        RelayConfig {
            tick_rate: 100,
            network: ServerConfig {
                bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port,
                max_clients: 3,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_fresh_server_stats() {
        let server = RelayServer::new(localhost(43100)).unwrap();
        let stats = server.stats();
        assert_eq!(stats.client_count, 0);
        assert_eq!(stats.max_clients, 3);
        assert_eq!(stats.tick, 0);
        assert_eq!(server.local_addr().map(|a| a.port()), Some(43100));
    }

    #[test]
    fn test_ticks_follow_wall_clock() {
        let mut server = RelayServer::new(localhost(43101)).unwrap();
        std::thread::sleep(Duration::from_millis(55));
        server.tick_once();
        assert!(server.stats().tick >= 5);
    }

    #[test]
    fn test_kicking_unknown_client_emits_nothing() {
        let mut server = RelayServer::new(localhost(43102)).unwrap();
        server.kick_client(ClientId(9));
        assert_eq!(server.drain_events().count(), 0);
    }
}
