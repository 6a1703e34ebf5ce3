use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use super::ack::{AckConfig, AckEngine};
use super::protocol::Packet;
use super::sequence::SequenceId;
use super::stats::LinkStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Connected,
    HeartbeatWaiting,
    HeartbeatAcked,
}

#[derive(Debug, Clone)]
pub struct ResendAttempt {
    pub packet: Packet,
    pub sequence: SequenceId,
    pub remaining: u8,
}

/// Packets sent with retry requested, keyed by the sequence of their most
/// recent transmission.
#[derive(Debug, Default)]
pub struct ResendQueue {
    attempts: VecDeque<ResendAttempt>,
}

impl ResendQueue {
    pub fn push(&mut self, packet: Packet, sequence: SequenceId, remaining: u8) {
        self.attempts.push_back(ResendAttempt {
            packet,
            sequence,
            remaining,
        });
    }

    pub fn acknowledge(&mut self, acked: &[SequenceId]) {
        if acked.is_empty() {
            return;
        }
        self.attempts.retain(|a| !acked.contains(&a.sequence));
    }

    /// Removes attempts whose last transmission was lost. Attempts with
    /// retries left are returned with `remaining` already decremented;
    /// exhausted ones are dropped.
    pub fn take_lost(&mut self, lost: &[SequenceId]) -> Vec<ResendAttempt> {
        if lost.is_empty() {
            return Vec::new();
        }

        let mut due = Vec::new();
        self.attempts.retain(|attempt| {
            if !lost.contains(&attempt.sequence) {
                return true;
            }
            if attempt.remaining == 0 {
                log::debug!(
                    "Giving up on {:?} after sequence {}",
                    attempt.packet.packet_type,
                    attempt.sequence
                );
            } else {
                let mut retry = attempt.clone();
                retry.remaining -= 1;
                due.push(retry);
            }
            false
        });
        due
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn clear(&mut self) {
        self.attempts.clear();
    }
}

/// Server-side record of one admitted client.
#[derive(Debug)]
pub struct ClientEntry {
    pub id: ClientId,
    pub addr: SocketAddr,
    pub state: EntryState,
    pub ack: AckEngine,
    pub last_heartbeat: Duration,
    pub heartbeat_sent: Duration,
    pub heartbeat_retry: u16,
    pub ping: Duration,
    pub resends: ResendQueue,
}

impl ClientEntry {
    pub fn new(id: ClientId, addr: SocketAddr, now: Duration, ack: AckConfig) -> Self {
        Self {
            id,
            addr,
            state: EntryState::Connected,
            ack: AckEngine::new(ack),
            last_heartbeat: now,
            heartbeat_sent: now,
            heartbeat_retry: 0,
            ping: Duration::ZERO,
            resends: ResendQueue::default(),
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.state == EntryState::HeartbeatWaiting
    }

    /// Records a heartbeat reply; returns `false` if none was outstanding.
    pub fn heartbeat_received(&mut self, now: Duration) -> bool {
        if !self.is_waiting() {
            return false;
        }
        self.ping = now.saturating_sub(self.heartbeat_sent);
        self.last_heartbeat = now;
        self.heartbeat_retry = 0;
        self.state = EntryState::HeartbeatAcked;
        true
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id,
            addr: self.addr,
            state: self.state,
            ping: self.ping,
            heartbeat_retry: self.heartbeat_retry,
            pending_resends: self.resends.len(),
            link: self.ack.stats(),
        }
    }
}

/// Read-only view of a client entry.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: ClientId,
    pub addr: SocketAddr,
    pub state: EntryState,
    pub ping: Duration,
    pub heartbeat_retry: u16,
    pub pending_resends: usize,
    pub link: LinkStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketType;

    fn packet() -> Packet {
        Packet::new(PacketType::Custom(8), vec![1, 2, 3])
    }

    #[test]
    fn test_acknowledge_consumes_attempt() {
        let mut queue = ResendQueue::default();
        queue.push(packet(), SequenceId(4), 3);
        queue.push(packet(), SequenceId(5), 3);

        queue.acknowledge(&[SequenceId(4)]);
        assert_eq!(queue.len(), 1);
        assert!(queue.take_lost(&[SequenceId(4)]).is_empty());
    }

    #[test]
    fn test_lost_attempt_retries_until_exhausted() {
        let mut queue = ResendQueue::default();
        queue.push(packet(), SequenceId(1), 1);

        let due = queue.take_lost(&[SequenceId(1)]);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].remaining, 0);
        assert_eq!(queue.len(), 0);

        queue.push(due[0].packet.clone(), SequenceId(9), due[0].remaining);
        assert!(queue.take_lost(&[SequenceId(9)]).is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_heartbeat_reply_resets_retry() {
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let mut entry = ClientEntry::new(ClientId(0), addr, Duration::ZERO, AckConfig::default());

        assert!(!entry.heartbeat_received(Duration::from_millis(10)));

        entry.state = EntryState::HeartbeatWaiting;
        entry.heartbeat_sent = Duration::from_millis(1000);
        entry.heartbeat_retry = 3;

        assert!(entry.heartbeat_received(Duration::from_millis(1250)));
        assert_eq!(entry.heartbeat_retry, 0);
        assert_eq!(entry.ping, Duration::from_millis(250));
        assert_eq!(entry.state, EntryState::HeartbeatAcked);
        assert_eq!(entry.last_heartbeat, Duration::from_millis(1250));
    }
}
