use std::collections::VecDeque;
use std::time::Duration;

use super::sequence::{SequenceId, is_more_recent};

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRecord {
    pub sequence: SequenceId,
    pub size: usize,
    /// Window clock reading at insertion.
    pub timestamp: Duration,
}

/// Time-bucketed ledger of packet metadata.
///
/// Records are kept in insertion order, which is also timestamp order, so
/// expiry only ever pops from the front.
#[derive(Debug, Clone)]
pub struct PacketWindow {
    records: VecDeque<PacketRecord>,
    retention: Duration,
    clock: Duration,
    bytes: usize,
}

impl Default for PacketWindow {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl PacketWindow {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: VecDeque::new(),
            retention,
            clock: Duration::ZERO,
            bytes: 0,
        }
    }

    pub fn insert(&mut self, sequence: SequenceId, size: usize) {
        self.records.push_back(PacketRecord {
            sequence,
            size,
            timestamp: self.clock,
        });
        self.bytes += size;
    }

    /// Moves the clock forward and returns every record that aged past the
    /// retention window.
    pub fn advance(&mut self, dt: Duration) -> Vec<PacketRecord> {
        self.clock += dt;

        let mut expired = Vec::new();
        while let Some(front) = self.records.front() {
            if self.age_of(front) <= self.retention {
                break;
            }
            if let Some(record) = self.records.pop_front() {
                self.bytes -= record.size;
                expired.push(record);
            }
        }
        expired
    }

    pub fn remove(&mut self, sequence: SequenceId) -> Option<PacketRecord> {
        let index = self.records.iter().position(|r| r.sequence == sequence)?;
        let record = self.records.remove(index)?;
        self.bytes -= record.size;
        Some(record)
    }

    pub fn contains(&self, sequence: SequenceId) -> bool {
        self.records.iter().any(|r| r.sequence == sequence)
    }

    /// Drops records more than `span` sequences behind `latest`.
    pub fn retain_recent(&mut self, latest: SequenceId, span: u32, max: u16) {
        let minimum = latest.back(span, max);
        let mut dropped = 0;
        self.records.retain(|r| {
            let keep = is_more_recent(r.sequence.0, minimum.0, max);
            if !keep {
                dropped += r.size;
            }
            keep
        });
        self.bytes -= dropped;
    }

    pub fn age_of(&self, record: &PacketRecord) -> Duration {
        self.clock.saturating_sub(record.timestamp)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PacketRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn now(&self) -> Duration {
        self.clock
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Bytes per second held across the retention window.
    pub fn bandwidth(&self) -> f32 {
        let secs = self.retention.as_secs_f32();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes as f32 / secs
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.bytes = 0;
        self.clock = Duration::ZERO;
    }
}
