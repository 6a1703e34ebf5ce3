use rand::Rng;

/// Outbound loss injection for exercising the ack engine on a clean network.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossSimulation {
    pub enabled: bool,
    /// Share of outbound datagrams to drop, `0.0..=100.0`.
    pub loss_percent: f32,
}

impl LossSimulation {
    pub fn new(loss_percent: f32) -> Self {
        Self {
            enabled: loss_percent > 0.0,
            loss_percent: loss_percent.clamp(0.0, 100.0),
        }
    }

    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand::rng().random_range(0.0..100.0) < self.loss_percent
    }
}

/// Snapshot of one connection's ack engine counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkStats {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub packets_lost: u32,
    pub packets_acked: u32,
    /// Bytes per second over the bandwidth window.
    pub sent_bandwidth: f32,
    pub acked_bandwidth: f32,
    pub received_bandwidth: f32,
    pub lost_bandwidth: f32,
    pub rtt_ms: f32,
}

impl LinkStats {
    pub fn packet_loss_percent(&self) -> f32 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.packets_lost as f32 / self.packets_sent as f32 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_simulation_never_drops() {
        let sim = LossSimulation::default();
        assert!((0..1000).all(|_| !sim.should_drop()));
    }

    #[test]
    fn test_full_loss_always_drops() {
        let sim = LossSimulation::new(100.0);
        assert!((0..1000).all(|_| sim.should_drop()));
    }

    #[test]
    fn test_loss_percent() {
        let stats = LinkStats {
            packets_sent: 200,
            packets_lost: 5,
            ..Default::default()
        };
        assert!((stats.packet_loss_percent() - 2.5).abs() < 0.001);
        assert_eq!(LinkStats::default().packet_loss_percent(), 0.0);
    }
}
