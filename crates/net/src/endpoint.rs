use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::ack::AckEngine;
use super::error::NetError;
use super::protocol::{AckHeader, Datagram, DecodeError, MAX_PACKET_SIZE, Packet};
use super::sequence::SequenceId;
use super::stats::LossSimulation;

/// A validated datagram handed from the receive thread to the tick context.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub addr: SocketAddr,
    pub datagram: Datagram,
    pub size: usize,
}

/// Background receive loop.
///
/// The thread polls its socket with a read timeout and checks the running
/// flag between polls, so [`Listener::stop`] returns within one poll
/// interval without closing the socket underneath it.
pub struct Listener {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    inbound: mpsc::Receiver<Inbound>,
    #[cfg(test)]
    injector: mpsc::Sender<Inbound>,
}

impl Listener {
    pub fn spawn(name: &str, socket: UdpSocket, poll_interval: Duration) -> io::Result<Self> {
        socket.set_read_timeout(Some(poll_interval))?;
        let local_addr = socket.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();
        #[cfg(test)]
        let injector = tx.clone();

        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || listen(socket, flag, tx, poll_interval))?;

        Ok(Self {
            local_addr,
            running,
            handle: Some(handle),
            inbound: rx,
            #[cfg(test)]
            injector,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Everything received since the last drain, in arrival order.
    pub fn drain(&self) -> Vec<Inbound> {
        self.inbound.try_iter().collect()
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("receive thread on {} panicked", self.local_addr);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, inbound: Inbound) {
        let _ = self.injector.send(inbound);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen(
    socket: UdpSocket,
    running: Arc<AtomicBool>,
    tx: mpsc::Sender<Inbound>,
    poll_interval: Duration,
) {
    // one spare byte to detect datagrams the MTU check would reject
    let mut buffer = [0u8; MAX_PACKET_SIZE + 1];
    let local = socket.local_addr().ok();
    log::info!("Started listening on {:?}", local);

    while running.load(Ordering::SeqCst) {
        let (size, addr) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    log::warn!("Error receiving on {:?}: {}", local, e);
                    thread::sleep(poll_interval);
                }
                continue;
            }
        };

        let decoded = if size > MAX_PACKET_SIZE {
            Err(DecodeError::TooLarge(size))
        } else {
            Datagram::decode(&buffer[..size])
        };

        match decoded {
            Ok(datagram) => {
                if tx.send(Inbound { addr, datagram, size }).is_err() {
                    break;
                }
            }
            Err(e) => log::debug!("Discarding datagram from {}: {}", addr, e),
        }
    }

    log::info!("Stopped listening on {:?}", local);
}

/// Sending half of a connection: stamps packets and feeds the ack engine.
#[derive(Debug)]
pub struct Outbound {
    socket: UdpSocket,
    loss: LossSimulation,
    bytes_sent: u64,
}

impl Outbound {
    pub fn new(socket: UdpSocket, loss: LossSimulation) -> Self {
        Self {
            socket,
            loss,
            bytes_sent: 0,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Stamps `packet` with the engine's header and sends it to `addr`.
    ///
    /// A datagram dropped by the loss simulation still counts as sent so
    /// the engine later reports it lost.
    pub fn transmit(
        &mut self,
        addr: SocketAddr,
        ack: &mut AckEngine,
        packet: &Packet,
    ) -> Result<SequenceId, NetError> {
        let bytes = packet.stamp(ack.create_header())?;

        if self.loss.should_drop() {
            log::trace!("Simulated loss of {:?} to {}", packet.packet_type, addr);
        } else {
            self.socket.send_to(&bytes, addr).map_err(|e| {
                log::warn!("Failed sending {:?} to {}: {}", packet.packet_type, addr, e);
                e
            })?;
            self.bytes_sent += bytes.len() as u64;
        }

        Ok(ack.packet_sent(bytes.len()))
    }

    /// Sends with an empty ack header, for peers without an ack engine.
    pub fn transmit_unstamped(&mut self, addr: SocketAddr, packet: &Packet) -> Result<(), NetError> {
        let bytes = packet.stamp(AckHeader::default())?;
        self.socket.send_to(&bytes, addr).map_err(|e| {
            log::warn!("Failed sending {:?} to {}: {}", packet.packet_type, addr, e);
            e
        })?;
        self.bytes_sent += bytes.len() as u64;
        Ok(())
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn set_loss_simulation(&mut self, loss: LossSimulation) {
        self.loss = loss;
    }
}
