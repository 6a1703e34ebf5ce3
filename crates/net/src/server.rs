use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use super::ack::{AckConfig, check_loss_timeout};
use super::connection::{ClientEntry, ClientId, ClientInfo, EntryState};
use super::endpoint::{Inbound, Listener, Outbound};
use super::error::NetError;
use super::protocol::{DEFAULT_PORT, HIGHEST_TIMESTAMP, Packet, PacketType};
use super::sequence::SequenceId;
use super::stats::LossSimulation;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    /// Well-known inbound port. Outbound traffic leaves from an ephemeral one.
    pub port: u16,
    pub max_clients: usize,
    pub heartbeat_interval: Duration,
    /// Unanswered probes tolerated before eviction.
    pub heartbeat_retries: u16,
    pub client_timeout: Duration,
    pub poll_interval: Duration,
    pub ack: AckConfig,
    pub loss: LossSimulation,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_clients: 4,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_retries: 5,
            client_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            ack: AckConfig::default(),
            loss: LossSimulation::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), NetError> {
        check_loss_timeout(&self.ack, self.heartbeat_interval)
    }
}

/// Application hooks for a [`ServerRegistry`].
pub trait ServerHandler: Send {
    /// Every inbound packet the registry does not consume itself.
    fn on_packet(
        &mut self,
        server: &mut ServerRegistry,
        sender: SocketAddr,
        client: Option<ClientId>,
        packet: &Packet,
    );

    /// Called once per client evicted for heartbeat silence.
    fn on_timeout(&mut self, _client: ClientId) {}

    fn on_connect(&mut self, _client: ClientId, _addr: SocketAddr) {}

    /// Called when a client announces its own disconnect.
    fn on_disconnect(&mut self, _client: ClientId) {}
}

/// Maintains the table of connected clients.
///
/// Inbound datagrams are received on a background thread and queued; they
/// are applied, together with heartbeats, resends and eviction, on each
/// [`ServerRegistry::update`].
pub struct ServerRegistry {
    config: ServerConfig,
    clients: HashMap<ClientId, ClientEntry>,
    next_client_id: u32,
    server_time: Duration,
    listener: Option<Listener>,
    outbound: Option<Outbound>,
    handler: Option<Box<dyn ServerHandler>>,
    bytes_received: u64,
}

impl ServerRegistry {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            clients: HashMap::new(),
            next_client_id: 0,
            server_time: Duration::ZERO,
            listener: None,
            outbound: None,
            handler: None,
            bytes_received: 0,
        }
    }

    pub fn with_handler(config: ServerConfig, handler: impl ServerHandler + 'static) -> Self {
        let mut server = Self::new(config);
        server.set_handler(handler);
        server
    }

    pub fn set_handler(&mut self, handler: impl ServerHandler + 'static) {
        self.handler = Some(Box::new(handler));
    }

    pub fn start(&mut self) -> Result<(), NetError> {
        if self.is_running() {
            return Err(NetError::AlreadyRunning);
        }
        self.config.validate()?;

        let incoming = UdpSocket::bind((self.config.bind_addr, self.config.port))?;
        let outgoing = UdpSocket::bind((self.config.bind_addr, 0))?;

        let outbound = Outbound::new(outgoing, self.config.loss.clone());
        let listener = Listener::spawn("packline-server", incoming, self.config.poll_interval)?;

        log::info!("Opened incoming port: {}", listener.local_addr().port());
        if let Ok(addr) = outbound.local_addr() {
            log::info!("Opened outgoing port: {}", addr.port());
        }

        self.clients.clear();
        self.next_client_id = 0;
        self.server_time = Duration::ZERO;
        self.bytes_received = 0;
        self.outbound = Some(outbound);
        self.listener = Some(listener);
        Ok(())
    }

    /// Notifies every client, clears the table and releases both ports.
    /// Returns `false` if the registry was not running.
    pub fn stop(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }

        self.disconnect_all();
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        self.outbound = None;
        log::info!("Server stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.listener.as_ref().is_some_and(Listener::is_running)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(Listener::local_addr)
    }

    pub fn outbound_addr(&self) -> Option<SocketAddr> {
        self.outbound.as_ref().and_then(|o| o.local_addr().ok())
    }

    /// Admits a client. Returns `None` for an address already in the table
    /// or when the table is full.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<ClientId> {
        if self.client_id(addr).is_some() {
            log::debug!("Client at {} already added", addr);
            return None;
        }
        if self.clients.len() >= self.config.max_clients {
            log::debug!("Rejecting {}: {} clients connected", addr, self.clients.len());
            return None;
        }

        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;

        let entry = ClientEntry::new(id, addr, self.server_time, self.config.ack.clone());
        self.clients.insert(id, entry);
        log::info!("Added client with ID: {} at {}", id, addr);
        Some(id)
    }

    pub fn client_id(&self, addr: SocketAddr) -> Option<ClientId> {
        self.clients
            .values()
            .find(|entry| entry.addr == addr)
            .map(|entry| entry.id)
    }

    pub fn has_client(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn client_info(&self, id: ClientId) -> Option<ClientInfo> {
        self.clients.get(&id).map(ClientEntry::info)
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut infos: Vec<ClientInfo> = self.clients.values().map(ClientEntry::info).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn max_clients(&self) -> usize {
        self.config.max_clients
    }

    pub fn set_max_clients(&mut self, max_clients: usize) {
        self.config.max_clients = max_clients;
    }

    pub fn server_time(&self) -> Duration {
        self.server_time
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

    /// Sends a best-effort Disconnect and drops the entry. Delivery of the
    /// notice is not guaranteed.
    pub fn remove_client(&mut self, id: ClientId) -> bool {
        let Some(mut entry) = self.clients.remove(&id) else {
            return false;
        };
        if let Some(outbound) = self.outbound.as_mut() {
            let _ = outbound.transmit(entry.addr, &mut entry.ack, &Packet::empty(PacketType::Disconnect));
        }
        log::info!("Removed client {}", id);
        true
    }

    pub fn remove_client_by_addr(&mut self, addr: SocketAddr) -> bool {
        match self.client_id(addr) {
            Some(id) => self.remove_client(id),
            None => false,
        }
    }

    pub fn disconnect_all(&mut self) {
        if let Some(outbound) = self.outbound.as_mut() {
            let notice = Packet::empty(PacketType::Disconnect);
            for entry in self.clients.values_mut() {
                let _ = outbound.transmit(entry.addr, &mut entry.ack, &notice);
            }
        }
        self.clients.clear();
    }

    /// Stamps `packet` with the client's ack header and sends it. With
    /// `retry`, a lost transmission is re-sent up to `retry_count` times.
    pub fn send(
        &mut self,
        id: ClientId,
        packet: &Packet,
        retry: bool,
        retry_count: u8,
    ) -> Result<SequenceId, NetError> {
        if packet.packet_type.is_reserved() {
            return Err(NetError::ReservedPacketType(packet.packet_type));
        }
        self.transmit(id, packet, retry, retry_count)
    }

    /// Sends to any address. Known clients get their ack header, anyone
    /// else an empty one.
    pub fn send_to(&mut self, addr: SocketAddr, packet: &Packet) -> Result<(), NetError> {
        if packet.packet_type.is_reserved() {
            return Err(NetError::ReservedPacketType(packet.packet_type));
        }
        match self.client_id(addr) {
            Some(id) => self.transmit(id, packet, false, 0).map(|_| ()),
            None => self
                .outbound
                .as_mut()
                .ok_or(NetError::NotConnected)?
                .transmit_unstamped(addr, packet),
        }
    }

    /// Sends to every client except `ignore`; returns how many sends
    /// succeeded.
    pub fn broadcast(
        &mut self,
        packet: &Packet,
        retry: bool,
        retry_count: u8,
        ignore: Option<ClientId>,
    ) -> Result<usize, NetError> {
        if packet.packet_type.is_reserved() {
            return Err(NetError::ReservedPacketType(packet.packet_type));
        }

        let targets: Vec<ClientId> = self
            .clients
            .keys()
            .copied()
            .filter(|id| Some(*id) != ignore)
            .collect();

        let mut delivered = 0;
        for id in targets {
            if self.transmit(id, packet, retry, retry_count).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    fn transmit(
        &mut self,
        id: ClientId,
        packet: &Packet,
        retry: bool,
        retry_count: u8,
    ) -> Result<SequenceId, NetError> {
        let outbound = self.outbound.as_mut().ok_or(NetError::NotConnected)?;
        let entry = self.clients.get_mut(&id).ok_or(NetError::UnknownClient(id))?;

        let sequence = outbound.transmit(entry.addr, &mut entry.ack, packet)?;
        if retry && retry_count > 0 {
            entry.resends.push(packet.clone(), sequence, retry_count);
        }
        Ok(sequence)
    }

    pub fn update(&mut self, dt: Duration) {
        self.process_inbound();

        // monotonic; only the wire timestamp wraps
        self.server_time += dt;

        let now = self.server_time;
        let interval = self.config.heartbeat_interval;
        let mut timed_out = Vec::new();

        for entry in self.clients.values_mut() {
            let elapsed = now.saturating_sub(entry.last_heartbeat);

            if elapsed > interval {
                if elapsed > self.config.client_timeout
                    || entry.heartbeat_retry > self.config.heartbeat_retries
                {
                    timed_out.push(entry.id);
                    continue;
                }

                let due = interval * (entry.heartbeat_retry as u32 + 1);
                if !entry.is_waiting() || elapsed >= due {
                    let probe = Packet::new(
                        PacketType::HeartBeat,
                        timestamp_millis(now).to_be_bytes().to_vec(),
                    );
                    if let Some(outbound) = self.outbound.as_mut() {
                        let _ = outbound.transmit(entry.addr, &mut entry.ack, &probe);
                    }
                    if entry.heartbeat_retry == 0 {
                        entry.heartbeat_sent = now;
                    }
                    entry.state = EntryState::HeartbeatWaiting;
                    entry.heartbeat_retry += 1;
                }
            }

            let lost = entry.ack.update(dt);
            for attempt in entry.resends.take_lost(&lost) {
                let Some(outbound) = self.outbound.as_mut() else {
                    break;
                };
                match outbound.transmit(entry.addr, &mut entry.ack, &attempt.packet) {
                    Ok(sequence) => entry.resends.push(attempt.packet, sequence, attempt.remaining),
                    Err(e) => log::warn!("Dropping resend to client {}: {}", entry.id, e),
                }
            }
        }

        timed_out.sort();
        for id in timed_out {
            if self.clients.remove(&id).is_some() {
                log::info!("Client {} has timed out", id);
                self.dispatch(|handler, _| handler.on_timeout(id));
            }
        }
    }

    fn process_inbound(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        for inbound in listener.drain() {
            self.handle_inbound(inbound);
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let Inbound {
            addr,
            datagram,
            size,
        } = inbound;
        self.bytes_received += size as u64;

        let header = datagram.header;
        let client = self.client_id(addr);
        if let Some(entry) = client.and_then(|id| self.clients.get_mut(&id)) {
            if !entry.ack.packet_received(header.sequence, size) {
                log::debug!("Duplicate {} from client {}", header.sequence, entry.id);
                return;
            }
            let acked = entry.ack.process_ack(header.ack, header.ack_bits);
            entry.resends.acknowledge(&acked);
        }

        let packet = datagram.packet;
        match (client, packet.packet_type) {
            (Some(id), PacketType::Disconnect) => {
                self.clients.remove(&id);
                log::info!("Client {} disconnected", id);
                self.dispatch(|handler, _| handler.on_disconnect(id));
            }
            (Some(id), PacketType::HeartBeat) => {
                let now = self.server_time;
                if let Some(entry) = self.clients.get_mut(&id) {
                    if !entry.heartbeat_received(now) {
                        log::warn!("Unexpected heartbeat from client {}", id);
                    }
                }
            }
            (Some(id), PacketType::Connect) => {
                // reply lost on the way; repeat it
                self.accept(id);
            }
            (None, PacketType::Connect) => match self.add_client(addr) {
                Some(id) => {
                    // the acceptance acks the request
                    if let Some(entry) = self.clients.get_mut(&id) {
                        entry.ack.packet_received(header.sequence, size);
                    }
                    self.accept(id);
                    self.dispatch(|handler, _| handler.on_connect(id, addr));
                }
                None => {
                    if let Some(outbound) = self.outbound.as_mut() {
                        let refusal = Packet::empty(PacketType::ServerFull);
                        if outbound.transmit_unstamped(addr, &refusal).is_ok() {
                            log::info!("Sent connection refusal to {}, server full", addr);
                        }
                    }
                }
            },
            (_, PacketType::ServerFull) | (None, PacketType::Disconnect | PacketType::HeartBeat) => {
                log::debug!("Ignoring {:?} from unknown sender {}", packet.packet_type, addr);
            }
            (_, _) => {
                self.dispatch(|handler, server| handler.on_packet(server, addr, client, &packet));
            }
        }
    }

    fn accept(&mut self, id: ClientId) {
        let reply = Packet::new(PacketType::Connect, id.0.to_be_bytes().to_vec());
        if self.transmit(id, &reply, false, 0).is_ok() {
            log::info!("Sent connection acceptance to client {}", id);
        }
    }

    fn dispatch(&mut self, f: impl FnOnce(&mut Box<dyn ServerHandler>, &mut Self)) {
        let Some(mut handler) = self.handler.take() else {
            return;
        };
        f(&mut handler, self);
        // the handler may have installed a replacement
        if self.handler.is_none() {
            self.handler = Some(handler);
        }
    }
}

impl Drop for ServerRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

fn timestamp_millis(time: Duration) -> u32 {
    (time.as_millis() % HIGHEST_TIMESTAMP as u128) as u32
}
