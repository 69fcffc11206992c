use std::time::Duration;
use crate::rolling_mean::RollingMean;

const WINDOW: usize = 32;

/// Delivery statistics of a writer, fed once per fully acknowledged message
#[derive(Default)]
pub struct QualityOfService {
    delivered_bytes: u64,
    acknowledged_fragments: u64,
    lost_fragments: u64,
    loss_rate: RollingMean<WINDOW>,
    latency_millis: RollingMean<WINDOW>,
}

impl QualityOfService {
    /// `latency` is the time from first sending the message until its acknowledgment, the
    ///  counts are fragments acknowledged and written off since the previous call
    pub fn add(&mut self, latency: Duration, size: usize, ack_count: u64, lost_count: u64) {
        self.delivered_bytes += size as u64;
        self.acknowledged_fragments += ack_count;
        self.lost_fragments += lost_count;

        let total = ack_count + lost_count;
        if total > 0 {
            self.loss_rate.add_value(lost_count as f64 / total as f64);
        }
        self.latency_millis.add_value(latency.as_secs_f64() * 1000.0);
    }

    pub fn delivered_bytes(&self) -> u64 {
        self.delivered_bytes
    }

    pub fn acknowledged_fragments(&self) -> u64 {
        self.acknowledged_fragments
    }

    pub fn lost_fragments(&self) -> u64 {
        self.lost_fragments
    }

    /// fraction of fragments written off, averaged over recent messages
    pub fn loss_rate(&self) -> f64 {
        self.loss_rate.mean().unwrap_or(0.0)
    }

    pub fn mean_latency(&self) -> Option<Duration> {
        self.latency_millis.mean()
            .map(|millis| Duration::from_secs_f64(millis / 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate() {
        let mut qos = QualityOfService::default();
        assert_eq!(qos.loss_rate(), 0.0);
        assert_eq!(qos.mean_latency(), None);

        qos.add(Duration::from_millis(100), 1000, 3, 1);
        qos.add(Duration::from_millis(300), 500, 4, 0);

        assert_eq!(qos.delivered_bytes(), 1500);
        assert_eq!(qos.acknowledged_fragments(), 7);
        assert_eq!(qos.lost_fragments(), 1);
        assert_eq!(qos.loss_rate(), 0.125);
        assert!((qos.mean_latency().unwrap().as_secs_f64() - 0.2).abs() < 1e-6);
    }
}
