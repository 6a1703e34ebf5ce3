use std::collections::VecDeque;
use std::time::Duration;

use super::error::NetError;
use super::protocol::AckHeader;
use super::sequence::{DEFAULT_MAX_SEQUENCE, SequenceId, bit_index};
use super::stats::LinkStats;
use super::window::PacketWindow;

/// Received records older than this many sequences can no longer appear in
/// an ack bitfield.
const RECEIVED_SEQUENCE_SPAN: u32 = 34;

#[derive(Debug, Clone)]
pub struct AckConfig {
    /// Highest sequence id before wrapping back to zero.
    pub max_sequence: u16,
    /// Weight given to each new RTT sample.
    pub rtt_smoothing: f32,
    /// How long a sent packet may wait for its ack before it counts as lost.
    /// Acks ride on the peer's next packet, so this must outlast the
    /// heartbeat interval plus a round trip.
    pub loss_timeout: Duration,
    /// Span over which bandwidth figures are averaged.
    pub bandwidth_window: Duration,
    /// Capacity of the recent-acks list.
    pub max_recent_acks: usize,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            max_sequence: DEFAULT_MAX_SEQUENCE,
            rtt_smoothing: 0.1,
            loss_timeout: Duration::from_secs(3),
            bandwidth_window: Duration::from_secs(1),
            max_recent_acks: 50,
        }
    }
}

/// Rejects a loss timeout that a healthy link can outlive.
///
/// Traffic between heartbeats may only be acked by the next probe or reply,
/// so the timeout has to cover at least two heartbeat intervals.
pub(crate) fn check_loss_timeout(
    config: &AckConfig,
    heartbeat_interval: Duration,
) -> Result<(), NetError> {
    if config.loss_timeout < heartbeat_interval * 2 {
        return Err(NetError::InvalidConfig(format!(
            "loss timeout {:?} must be at least twice the heartbeat interval {:?}",
            config.loss_timeout, heartbeat_interval
        )));
    }
    Ok(())
}

/// Sequence and acknowledgement bookkeeping for one logical connection.
///
/// All timing is driven by [`AckEngine::update`], so RTT samples have the
/// resolution of the caller's tick.
#[derive(Debug, Clone)]
pub struct AckEngine {
    config: AckConfig,
    local_sequence: SequenceId,
    remote_sequence: SequenceId,

    sent_packets: u32,
    received_packets: u32,
    lost_packets: u32,
    acked_packets: u32,

    sent_bandwidth: f32,
    acked_bandwidth: f32,
    received_bandwidth: f32,
    lost_bandwidth: f32,
    rtt_ms: f32,

    recent_acks: VecDeque<SequenceId>,
    sent: PacketWindow,
    pending_ack: PacketWindow,
    received: PacketWindow,
    acked: PacketWindow,
    lost: PacketWindow,
}

impl Default for AckEngine {
    fn default() -> Self {
        Self::new(AckConfig::default())
    }
}

impl AckEngine {
    pub fn new(config: AckConfig) -> Self {
        let window = config.bandwidth_window;
        Self {
            local_sequence: SequenceId::ZERO,
            remote_sequence: SequenceId::ZERO,
            sent_packets: 0,
            received_packets: 0,
            lost_packets: 0,
            acked_packets: 0,
            sent_bandwidth: 0.0,
            acked_bandwidth: 0.0,
            received_bandwidth: 0.0,
            lost_bandwidth: 0.0,
            rtt_ms: 0.0,
            recent_acks: VecDeque::with_capacity(config.max_recent_acks),
            sent: PacketWindow::new(window),
            pending_ack: PacketWindow::new(config.loss_timeout),
            received: PacketWindow::new(window),
            acked: PacketWindow::new(window),
            lost: PacketWindow::new(window),
            config,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    /// Records an outgoing packet under the current local sequence and
    /// returns that sequence.
    pub fn packet_sent(&mut self, size: usize) -> SequenceId {
        let sequence = self.local_sequence;

        // a wrapped id still waiting on its previous incarnation
        if self.pending_ack.remove(sequence).is_some() {
            log::debug!("sequence {} reused before it was acked", sequence);
        }

        self.sent.insert(sequence, size);
        self.pending_ack.insert(sequence, size);
        self.sent_packets = self.sent_packets.wrapping_add(1);
        self.local_sequence = sequence.next(self.config.max_sequence);

        sequence
    }

    /// Records an inbound packet. Returns `false` when the sequence was
    /// already received recently; duplicates are not counted.
    pub fn packet_received(&mut self, sequence: SequenceId, size: usize) -> bool {
        if self.received.contains(sequence) {
            return false;
        }

        self.received_packets = self.received_packets.wrapping_add(1);
        self.received.insert(sequence, size);
        if sequence.is_more_recent(self.remote_sequence, self.config.max_sequence) {
            self.remote_sequence = sequence;
        }

        while self.recent_acks.len() >= self.config.max_recent_acks.max(1) {
            self.recent_acks.pop_front();
        }
        self.recent_acks.push_back(sequence);

        self.received.retain_recent(
            self.remote_sequence,
            RECEIVED_SEQUENCE_SPAN,
            self.config.max_sequence,
        );

        true
    }

    pub fn generate_ack_bits(&self) -> u32 {
        let max = self.config.max_sequence;
        (0..32u32).fold(0, |bits, i| {
            let sequence = self.remote_sequence.back(i + 1, max);
            if self.received.contains(sequence) {
                bits | (1 << i)
            } else {
                bits
            }
        })
    }

    /// Applies a remote ack header and returns the sequences it acknowledged
    /// for the first time.
    pub fn process_ack(&mut self, ack: SequenceId, ack_bits: u32) -> Vec<SequenceId> {
        let max = self.config.max_sequence;

        let acked_sequences: Vec<SequenceId> = self
            .pending_ack
            .iter()
            .filter(|record| {
                if record.sequence == ack {
                    return true;
                }
                if !ack.is_more_recent(record.sequence, max) {
                    return false;
                }
                let index = bit_index(record.sequence, ack, max);
                index <= 31 && (ack_bits >> index) & 1 == 1
            })
            .map(|record| record.sequence)
            .collect();

        let mut newly_acked = Vec::with_capacity(acked_sequences.len());
        for sequence in acked_sequences {
            let Some(record) = self.pending_ack.remove(sequence) else {
                continue;
            };
            if self.acked.contains(sequence) {
                continue;
            }

            let sample_ms = self.pending_ack.age_of(&record).as_secs_f32() * 1000.0;
            self.rtt_ms += (sample_ms - self.rtt_ms) * self.config.rtt_smoothing;

            self.acked.insert(sequence, record.size);
            self.acked_packets = self.acked_packets.wrapping_add(1);
            newly_acked.push(sequence);
        }

        newly_acked
    }

    /// Ages every window by `dt` and returns the sequences that timed out
    /// waiting for an ack.
    pub fn update(&mut self, dt: Duration) -> Vec<SequenceId> {
        self.sent.advance(dt);
        self.received.advance(dt);
        self.acked.advance(dt);
        self.lost.advance(dt);

        let expired = self.pending_ack.advance(dt);
        let mut lost = Vec::with_capacity(expired.len());
        for record in expired {
            self.lost.insert(record.sequence, record.size);
            self.lost_packets = self.lost_packets.wrapping_add(1);
            lost.push(record.sequence);
        }

        self.sent_bandwidth = self.sent.bandwidth();
        self.acked_bandwidth = self.acked.bandwidth();
        self.received_bandwidth = self.received.bandwidth();
        self.lost_bandwidth = self.lost.bandwidth();

        lost
    }

    pub fn create_header(&self) -> AckHeader {
        AckHeader::new(
            self.local_sequence,
            self.remote_sequence,
            self.generate_ack_bits(),
        )
    }

    pub fn is_pending(&self, sequence: SequenceId) -> bool {
        self.pending_ack.contains(sequence)
    }

    pub fn local_sequence(&self) -> SequenceId {
        self.local_sequence
    }

    pub fn remote_sequence(&self) -> SequenceId {
        self.remote_sequence
    }

    pub fn max_sequence(&self) -> u16 {
        self.config.max_sequence
    }

    pub fn recent_acks(&self) -> impl Iterator<Item = SequenceId> + '_ {
        self.recent_acks.iter().copied()
    }

    pub fn sent_packets(&self) -> u32 {
        self.sent_packets
    }

    pub fn received_packets(&self) -> u32 {
        self.received_packets
    }

    pub fn lost_packets(&self) -> u32 {
        self.lost_packets
    }

    pub fn acked_packets(&self) -> u32 {
        self.acked_packets
    }

    pub fn sent_bandwidth(&self) -> f32 {
        self.sent_bandwidth
    }

    pub fn acked_bandwidth(&self) -> f32 {
        self.acked_bandwidth
    }

    pub fn received_bandwidth(&self) -> f32 {
        self.received_bandwidth
    }

    pub fn lost_bandwidth(&self) -> f32 {
        self.lost_bandwidth
    }

    pub fn rtt_ms(&self) -> f32 {
        self.rtt_ms
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            packets_sent: self.sent_packets,
            packets_received: self.received_packets,
            packets_lost: self.lost_packets,
            packets_acked: self.acked_packets,
            sent_bandwidth: self.sent_bandwidth,
            acked_bandwidth: self.acked_bandwidth,
            received_bandwidth: self.received_bandwidth,
            lost_bandwidth: self.lost_bandwidth,
            rtt_ms: self.rtt_ms,
        }
    }
}
