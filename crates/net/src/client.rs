use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use super::ack::{AckConfig, AckEngine, check_loss_timeout};
use super::connection::{ClientId, ResendQueue};
use super::endpoint::{Inbound, Listener, Outbound};
use super::error::NetError;
use super::protocol::{DEFAULT_PORT, Datagram, HIGHEST_TIMESTAMP, MAX_PACKET_SIZE, Packet, PacketType};
use super::sequence::SequenceId;
use super::stats::{LinkStats, LossSimulation};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub connect_timeout: Duration,
    /// Heartbeat silence after which the session gives up on the server.
    pub timeout: Duration,
    /// The server's heartbeat interval. Replies to its probes carry our
    /// acks, so the loss timeout is checked against it.
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub ack: AckConfig,
    pub loss: LossSimulation,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            connect_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
            ack: AckConfig::default(),
            loss: LossSimulation::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// [`ClientSession::disconnect`] was called.
    Local,
    /// The server sent a Disconnect notice.
    Remote,
    /// No heartbeat arrived within the configured timeout.
    TimedOut,
}

pub trait ClientHandler: Send {
    fn on_packet(&mut self, session: &mut ClientSession, packet: &Packet);

    fn on_connect(&mut self, _id: ClientId) {}

    fn on_disconnect(&mut self, _reason: DisconnectReason) {}
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), NetError> {
        check_loss_timeout(&self.ack, self.heartbeat_interval)
    }
}

/// One client's connection to a server.
pub struct ClientSession {
    config: ClientConfig,
    state: SessionState,
    client_id: Option<ClientId>,
    ack: AckEngine,
    resends: ResendQueue,
    listener: Option<Listener>,
    outbound: Option<Outbound>,
    handler: Option<Box<dyn ClientHandler>>,
    server_time: Duration,
    since_heartbeat: Duration,
    bytes_received: u64,
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Self {
        let ack = AckEngine::new(config.ack.clone());
        Self {
            config,
            state: SessionState::Disconnected,
            client_id: None,
            ack,
            resends: ResendQueue::default(),
            listener: None,
            outbound: None,
            handler: None,
            server_time: Duration::ZERO,
            since_heartbeat: Duration::ZERO,
            bytes_received: 0,
        }
    }

    pub fn with_handler(config: ClientConfig, handler: impl ClientHandler + 'static) -> Self {
        let mut session = Self::new(config);
        session.set_handler(handler);
        session
    }

    pub fn set_handler(&mut self, handler: impl ClientHandler + 'static) {
        self.handler = Some(Box::new(handler));
    }

    /// Performs the handshake, blocking until the server answers or the
    /// connect timeout passes.
    pub fn connect(&mut self) -> Result<ClientId, NetError> {
        if self.state != SessionState::Disconnected {
            return Err(NetError::AlreadyConnected(self.config.server_addr));
        }
        self.config.validate()?;

        self.state = SessionState::Connecting;
        self.ack.reset();
        self.resends.clear();

        match self
            .handshake()
            .and_then(|(id, socket)| self.establish(id, socket))
        {
            Ok(id) => Ok(id),
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    fn handshake(&mut self) -> Result<(ClientId, UdpSocket), NetError> {
        let server = self.config.server_addr;
        let unspecified = match server {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind((unspecified, 0))?;
        socket.set_read_timeout(Some(self.config.poll_interval))?;

        let request = Packet::empty(PacketType::Connect).stamp(self.ack.create_header())?;
        socket.send_to(&request, server)?;
        self.ack.packet_sent(request.len());
        log::info!("Sent connection request to {}", server);

        let deadline = Instant::now() + self.config.connect_timeout;
        let mut buffer = [0u8; MAX_PACKET_SIZE];

        while Instant::now() < deadline {
            let (size, from) = match socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            // replies leave from the server's outbound port
            if from.ip() != server.ip() {
                continue;
            }
            let datagram = match Datagram::decode(&buffer[..size]) {
                Ok(datagram) => datagram,
                Err(e) => {
                    log::debug!("Discarding handshake reply from {}: {}", from, e);
                    continue;
                }
            };

            match datagram.packet.packet_type {
                PacketType::Connect => {
                    let id = match datagram.packet.read_u32() {
                        Ok(id) => ClientId(id),
                        Err(e) => {
                            log::debug!("Discarding malformed acceptance from {}: {}", from, e);
                            continue;
                        }
                    };
                    self.bytes_received += size as u64;
                    self.ack.packet_received(datagram.header.sequence, size);
                    self.ack
                        .process_ack(datagram.header.ack, datagram.header.ack_bits);
                    return Ok((id, socket));
                }
                PacketType::ServerFull => {
                    log::info!("Connection to {} refused, server full", server);
                    return Err(NetError::ServerFull);
                }
                other => log::debug!("Ignoring {:?} during handshake", other),
            }
        }

        log::info!("No reply from {} before connect timeout", server);
        Err(NetError::ConnectTimeout(server))
    }

    fn establish(&mut self, id: ClientId, socket: UdpSocket) -> Result<ClientId, NetError> {
        let receive = socket.try_clone()?;
        let listener = Listener::spawn("packline-client", receive, self.config.poll_interval)?;

        self.outbound = Some(Outbound::new(socket, self.config.loss.clone()));
        self.listener = Some(listener);
        self.client_id = Some(id);
        self.state = SessionState::Connected;
        self.server_time = Duration::ZERO;
        self.since_heartbeat = Duration::ZERO;

        log::info!("Connected to {} as client {}", self.config.server_addr, id);
        self.dispatch(|handler, _| handler.on_connect(id));
        Ok(id)
    }

    /// Sends a best-effort Disconnect and closes the session. Returns
    /// `false` if it was not connected.
    pub fn disconnect(&mut self) -> bool {
        if self.state != SessionState::Connected {
            return false;
        }
        self.teardown(DisconnectReason::Local, true);
        true
    }

    fn teardown(&mut self, reason: DisconnectReason, notify: bool) {
        if notify {
            if let Some(outbound) = self.outbound.as_mut() {
                let notice = Packet::empty(PacketType::Disconnect);
                let _ = outbound.transmit(self.config.server_addr, &mut self.ack, &notice);
            }
        }
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        self.outbound = None;
        self.client_id = None;
        self.resends.clear();
        self.state = SessionState::Disconnected;

        log::info!("Disconnected from {} ({:?})", self.config.server_addr, reason);
        self.dispatch(|handler, _| handler.on_disconnect(reason));
    }

    /// Stamps and sends `packet`. With `retry`, a lost transmission is
    /// re-sent up to `retry_count` times.
    pub fn send(
        &mut self,
        packet: &Packet,
        retry: bool,
        retry_count: u8,
    ) -> Result<SequenceId, NetError> {
        if packet.packet_type.is_reserved() {
            return Err(NetError::ReservedPacketType(packet.packet_type));
        }
        let outbound = self.outbound.as_mut().ok_or(NetError::NotConnected)?;
        let sequence = outbound.transmit(self.config.server_addr, &mut self.ack, packet)?;
        if retry && retry_count > 0 {
            self.resends.push(packet.clone(), sequence, retry_count);
        }
        Ok(sequence)
    }

    pub fn update(&mut self, dt: Duration) {
        if self.state != SessionState::Connected {
            return;
        }

        let inbound = self.listener.as_ref().map(Listener::drain).unwrap_or_default();
        for datagram in inbound {
            self.handle_inbound(datagram);
            if self.state != SessionState::Connected {
                return;
            }
        }

        self.server_time += dt;
        let wrap = Duration::from_millis(HIGHEST_TIMESTAMP as u64);
        if self.server_time >= wrap {
            self.server_time -= wrap;
        }

        self.since_heartbeat += dt;
        if self.since_heartbeat > self.config.timeout {
            log::warn!("Server {} stopped responding", self.config.server_addr);
            self.teardown(DisconnectReason::TimedOut, true);
            return;
        }

        let lost = self.ack.update(dt);
        for attempt in self.resends.take_lost(&lost) {
            let Some(outbound) = self.outbound.as_mut() else {
                break;
            };
            match outbound.transmit(self.config.server_addr, &mut self.ack, &attempt.packet) {
                Ok(sequence) => self.resends.push(attempt.packet, sequence, attempt.remaining),
                Err(e) => log::warn!("Dropping resend of {:?}: {}", attempt.packet.packet_type, e),
            }
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let Inbound {
            addr,
            datagram,
            size,
        } = inbound;
        if addr.ip() != self.config.server_addr.ip() {
            log::debug!("Ignoring datagram from stranger {}", addr);
            return;
        }

        self.bytes_received += size as u64;
        let header = datagram.header;
        if !self.ack.packet_received(header.sequence, size) {
            return;
        }
        let acked = self.ack.process_ack(header.ack, header.ack_bits);
        self.resends.acknowledge(&acked);

        let packet = datagram.packet;
        match packet.packet_type {
            PacketType::HeartBeat => {
                if let Ok(millis) = packet.read_u32() {
                    self.server_time = Duration::from_millis(millis as u64);
                }
                self.since_heartbeat = Duration::ZERO;
                if let Some(outbound) = self.outbound.as_mut() {
                    let reply = Packet::empty(PacketType::HeartBeat);
                    let _ = outbound.transmit(self.config.server_addr, &mut self.ack, &reply);
                }
            }
            PacketType::Disconnect => {
                log::info!("Server {} closed the connection", self.config.server_addr);
                self.teardown(DisconnectReason::Remote, false);
            }
            PacketType::Connect | PacketType::ServerFull => {
                log::debug!("Ignoring late {:?} reply", packet.packet_type);
            }
            PacketType::Custom(_) => {
                self.dispatch(|handler, session| handler.on_packet(session, &packet));
            }
        }
    }

    fn dispatch(&mut self, f: impl FnOnce(&mut Box<dyn ClientHandler>, &mut Self)) {
        let Some(mut handler) = self.handler.take() else {
            return;
        };
        f(&mut handler, self);
        if self.handler.is_none() {
            self.handler = Some(handler);
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.config.server_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.outbound.as_ref().and_then(|o| o.local_addr().ok())
    }

    /// Server clock as last synchronized by a heartbeat, advanced locally.
    pub fn server_time(&self) -> Duration {
        self.server_time
    }

    pub fn ack(&self) -> &AckEngine {
        &self.ack
    }

    pub fn stats(&self) -> LinkStats {
        self.ack.stats()
    }

    pub fn pending_resends(&self) -> usize {
        self.resends.len()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.outbound.as_ref().map_or(0, Outbound::bytes_sent)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn set_loss_simulation(&mut self, loss: LossSimulation) {
        if let Some(outbound) = self.outbound.as_mut() {
            outbound.set_loss_simulation(loss.clone());
        }
        self.config.loss = loss;
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::protocol::AckHeader;

    struct Recorder {
        events: mpsc::Sender<String>,
    }

    impl ClientHandler for Recorder {
        fn on_packet(&mut self, _session: &mut ClientSession, packet: &Packet) {
            let _ = self.events.send(format!("packet {:?}", packet.payload));
        }

        fn on_connect(&mut self, id: ClientId) {
            let _ = self.events.send(format!("connect {}", id));
        }

        fn on_disconnect(&mut self, reason: DisconnectReason) {
            let _ = self.events.send(format!("disconnect {:?}", reason));
        }
    }

    /// A socket that answers the first datagram it receives with `replies`,
    /// in order.
    fn fake_server(replies: Vec<Packet>) -> (UdpSocket, thread::JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let responder = socket.try_clone().unwrap();
        let handle = thread::spawn(move || {
            let mut buffer = [0u8; MAX_PACKET_SIZE];
            let (size, from) = responder.recv_from(&mut buffer).unwrap();
            let request = Datagram::decode(&buffer[..size]).unwrap();
            assert_eq!(request.packet.packet_type, PacketType::Connect);

            for (sequence, reply) in replies.into_iter().enumerate() {
                let header = AckHeader::new(SequenceId(sequence as u16), request.header.sequence, 0);
                responder.send_to(&reply.stamp(header).unwrap(), from).unwrap();
            }
        });
        (socket, handle)
    }

    fn acceptance(id: u32) -> Packet {
        Packet::new(PacketType::Connect, id.to_be_bytes().to_vec())
    }

    fn config_for(server: SocketAddr) -> ClientConfig {
        ClientConfig {
            server_addr: server,
            connect_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn connected() -> (ClientSession, UdpSocket, mpsc::Receiver<String>) {
        let (server, handle) = fake_server(vec![acceptance(7)]);
        let (events, rx) = mpsc::channel();
        let mut session = ClientSession::with_handler(config_for(server.local_addr().unwrap()), Recorder { events });
        assert_eq!(session.connect().unwrap(), ClientId(7));
        handle.join().unwrap();
        (session, server, rx)
    }

    fn inject(session: &ClientSession, from: SocketAddr, sequence: u16, packet: Packet) {
        let datagram = Datagram::new(AckHeader::new(SequenceId(sequence), SequenceId(0), 0), packet);
        let size = datagram.encode().unwrap().len();
        session.listener.as_ref().unwrap().inject(Inbound {
            addr: from,
            datagram,
            size,
        });
    }

    #[test]
    fn test_connect_assigns_client_id() {
        let (session, _server, events) = connected();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.client_id(), Some(ClientId(7)));
        assert_eq!(session.stats().packets_acked, 1);
        assert_eq!(events.try_recv().unwrap(), "connect 7");
    }

    #[test]
    fn test_connect_refused_when_server_full() {
        let (server, handle) = fake_server(vec![Packet::empty(PacketType::ServerFull)]);
        let mut session = ClientSession::new(config_for(server.local_addr().unwrap()));

        assert!(matches!(session.connect(), Err(NetError::ServerFull)));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.client_id(), None);
        handle.join().unwrap();
    }

    #[test]
    fn test_short_acceptance_is_skipped() {
        let truncated = Packet::new(PacketType::Connect, vec![0, 7]);
        let (server, handle) = fake_server(vec![Packet::empty(PacketType::Connect), truncated, acceptance(7)]);
        let mut session = ClientSession::new(config_for(server.local_addr().unwrap()));

        assert_eq!(session.connect().unwrap(), ClientId(7));
        assert_eq!(session.state(), SessionState::Connected);
        handle.join().unwrap();
    }

    #[test]
    fn test_connect_rejects_loss_timeout_shorter_than_heartbeats() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut config = config_for(silent.local_addr().unwrap());
        config.ack.loss_timeout = Duration::from_secs(1);
        let mut session = ClientSession::new(config);

        assert!(matches!(session.connect(), Err(NetError::InvalidConfig(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_connect_times_out_against_silent_server() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = silent.local_addr().unwrap();
        let mut session = ClientSession::new(ClientConfig {
            connect_timeout: Duration::from_millis(100),
            ..config_for(addr)
        });

        let started = Instant::now();
        assert!(matches!(session.connect(), Err(NetError::ConnectTimeout(a)) if a == addr));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let (mut session, _server, _) = connected();
        assert!(matches!(
            session.connect(),
            Err(NetError::AlreadyConnected(_))
        ));
    }

    #[test]
    fn test_heartbeat_syncs_time_and_replies() {
        let (mut session, server, _) = connected();
        let server_addr = server.local_addr().unwrap();

        session.update(Duration::from_secs(3));
        inject(&session, server_addr, 1, Packet::new(PacketType::HeartBeat, 4200u32.to_be_bytes().to_vec()));
        session.update(Duration::from_millis(100));

        assert_eq!(session.server_time(), Duration::from_millis(4300));
        assert_eq!(session.since_heartbeat, Duration::from_millis(100));

        let mut buffer = [0u8; MAX_PACKET_SIZE];
        let (size, _) = server.recv_from(&mut buffer).unwrap();
        let reply = Datagram::decode(&buffer[..size]).unwrap();
        assert_eq!(reply.packet.packet_type, PacketType::HeartBeat);
        assert_eq!(reply.header.ack, SequenceId(1));
    }

    #[test]
    fn test_heartbeat_silence_times_out() {
        let (mut session, _server, events) = connected();
        for _ in 0..100 {
            session.update(Duration::from_millis(100));
        }
        assert!(session.is_connected());

        session.update(Duration::from_millis(100));
        assert_eq!(session.state(), SessionState::Disconnected);
        let log: Vec<String> = events.try_iter().collect();
        assert_eq!(log.last().map(String::as_str), Some("disconnect TimedOut"));
    }

    #[test]
    fn test_server_disconnect_notice() {
        let (mut session, server, events) = connected();
        inject(&session, server.local_addr().unwrap(), 1, Packet::empty(PacketType::Disconnect));
        session.update(Duration::from_millis(10));

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.disconnect());
        let log: Vec<String> = events.try_iter().collect();
        assert_eq!(log, vec!["connect 7", "disconnect Remote"]);
    }

    #[test]
    fn test_custom_packets_reach_handler() {
        let (mut session, server, events) = connected();
        let server_addr = server.local_addr().unwrap();
        let stranger: SocketAddr = "10.1.2.3:9000".parse().unwrap();

        inject(&session, server_addr, 1, Packet::new(PacketType::Custom(12), vec![5]));
        inject(&session, server_addr, 1, Packet::new(PacketType::Custom(12), vec![5]));
        inject(&session, stranger, 2, Packet::new(PacketType::Custom(12), vec![6]));
        session.update(Duration::from_millis(10));

        let log: Vec<String> = events.try_iter().collect();
        assert_eq!(log, vec!["connect 7", "packet [5]"]);
    }

    #[test]
    fn test_local_disconnect_notifies_server() {
        let (mut session, server, events) = connected();
        assert!(session.disconnect());

        let mut buffer = [0u8; MAX_PACKET_SIZE];
        let (size, _) = server.recv_from(&mut buffer).unwrap();
        let notice = Datagram::decode(&buffer[..size]).unwrap();
        assert_eq!(notice.packet.packet_type, PacketType::Disconnect);
        assert_eq!(events.try_iter().last().as_deref(), Some("disconnect Local"));
        assert!(matches!(
            session.send(&Packet::empty(PacketType::Custom(4)), false, 0),
            Err(NetError::NotConnected)
        ));
    }
}
