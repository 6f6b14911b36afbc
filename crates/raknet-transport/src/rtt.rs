//! RTT estimation (RFC 6298) and the retransmission timeout derived from it.

use std::time::Duration;

use serde::Serialize;

/// Snapshot of observed round-trip latency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub last_us: u64,
    pub lowest_us: u64,
    pub highest_us: u64,
    pub average_us: u64,
    pub samples: u64,
}

/// Smoothed RTT, variance and the clamped RTO.
#[derive(Debug, Clone)]
pub struct RttTracker {
    /// Smoothed RTT (SRTT) in µs.
    srtt_us: f64,
    /// RTT variation (RTTVAR) in µs.
    rttvar_us: f64,
    last_us: f64,
    min_us: f64,
    max_us: f64,
    total_us: f64,
    sample_count: u64,
    initial_rto: Duration,
    rto_floor: Duration,
    rto_ceiling: Duration,
}

impl RttTracker {
    /// Crossed bounds are swapped, so `rto()` always has a valid range.
    pub fn new(initial_rto: Duration, rto_floor: Duration, rto_ceiling: Duration) -> Self {
        let (rto_floor, rto_ceiling) = (rto_floor.min(rto_ceiling), rto_floor.max(rto_ceiling));
        RttTracker {
            srtt_us: 0.0,
            rttvar_us: 0.0,
            last_us: 0.0,
            min_us: f64::MAX,
            max_us: 0.0,
            total_us: 0.0,
            sample_count: 0,
            initial_rto,
            rto_floor,
            rto_ceiling,
        }
    }

    /// Feed one RTT measurement.
    pub fn sample(&mut self, rtt: Duration) {
        let rtt_us = rtt.as_micros() as f64;
        self.sample_count += 1;
        self.last_us = rtt_us;
        self.total_us += rtt_us;
        self.min_us = self.min_us.min(rtt_us);
        self.max_us = self.max_us.max(rtt_us);

        if self.sample_count == 1 {
            self.srtt_us = rtt_us;
            self.rttvar_us = rtt_us / 2.0;
        } else {
            // α = 1/8, β = 1/4
            self.rttvar_us = 0.75 * self.rttvar_us + 0.25 * (self.srtt_us - rtt_us).abs();
            self.srtt_us = 0.875 * self.srtt_us + 0.125 * rtt_us;
        }
    }

    /// `SRTT + 4·RTTVAR`, clamped; `initial_rto` until the first sample.
    pub fn rto(&self) -> Duration {
        if self.sample_count == 0 {
            return self.initial_rto.clamp(self.rto_floor, self.rto_ceiling);
        }
        let rto_us = self.srtt_us + 4.0 * self.rttvar_us;
        Duration::from_micros(rto_us as u64).clamp(self.rto_floor, self.rto_ceiling)
    }

    pub fn srtt(&self) -> Option<Duration> {
        (self.sample_count > 0).then(|| Duration::from_micros(self.srtt_us as u64))
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn latency(&self) -> LatencyStats {
        if self.sample_count == 0 {
            return LatencyStats::default();
        }
        LatencyStats {
            last_us: self.last_us as u64,
            lowest_us: self.min_us as u64,
            highest_us: self.max_us as u64,
            average_us: (self.total_us / self.sample_count as f64) as u64,
            samples: self.sample_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> RttTracker {
        RttTracker::new(
            Duration::from_millis(250),
            Duration::from_millis(50),
            Duration::from_secs(4),
        )
    }

    #[test]
    fn crossed_bounds_are_ordered() {
        let mut t = RttTracker::new(
            Duration::from_millis(10),
            Duration::from_secs(2),
            Duration::from_millis(100),
        );
        assert_eq!(t.rto(), Duration::from_millis(100));
        t.sample(Duration::from_secs(5));
        assert_eq!(t.rto(), Duration::from_secs(2));
    }

    #[test]
    fn initial_rto_before_samples() {
        let t = tracker();
        assert_eq!(t.rto(), Duration::from_millis(250));
        assert_eq!(t.srtt(), None);
        assert_eq!(t.latency(), LatencyStats::default());
    }

    #[test]
    fn first_sample_sets_srtt() {
        let mut t = tracker();
        t.sample(Duration::from_millis(100));
        assert_eq!(t.srtt(), Some(Duration::from_millis(100)));
        // 100 + 4 × 50
        assert_eq!(t.rto(), Duration::from_millis(300));
    }

    #[test]
    fn rto_clamped_to_floor_and_ceiling() {
        let mut fast = tracker();
        fast.sample(Duration::from_millis(1));
        assert_eq!(fast.rto(), Duration::from_millis(50));

        let mut slow = tracker();
        slow.sample(Duration::from_secs(3));
        assert_eq!(slow.rto(), Duration::from_secs(4));
    }

    #[test]
    fn srtt_converges() {
        let mut t = tracker();
        for _ in 0..100 {
            t.sample(Duration::from_millis(40));
        }
        let srtt = t.srtt().unwrap();
        assert!(srtt >= Duration::from_millis(39) && srtt <= Duration::from_millis(41));
        assert_eq!(t.sample_count(), 100);
    }

    #[test]
    fn latency_stats() {
        let mut t = tracker();
        t.sample(Duration::from_millis(10));
        t.sample(Duration::from_millis(30));
        t.sample(Duration::from_millis(20));
        let stats = t.latency();
        assert_eq!(stats.last_us, 20_000);
        assert_eq!(stats.lowest_us, 10_000);
        assert_eq!(stats.highest_us, 30_000);
        assert_eq!(stats.average_us, 20_000);
        assert_eq!(stats.samples, 3);
    }
}
