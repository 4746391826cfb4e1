use std::time::Duration;

/// Smoothed retransmission timeout: an exponentially weighted moving average of RTT samples.
///  The first sample replaces the initial value outright.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    rto: Duration,
    has_sample: bool,
    alpha: f64,
    min_rto: Duration,
}

impl RtoEstimator {
    pub fn new(initial_rto: Duration, alpha: f64, min_rto: Duration) -> RtoEstimator {
        RtoEstimator {
            rto: initial_rto,
            has_sample: false,
            alpha,
            min_rto,
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn on_sample(&mut self, rtt: Duration) {
        let smoothed = if self.has_sample {
            let nanos = self.alpha * self.rto.as_nanos() as f64 + (1.0 - self.alpha) * rtt.as_nanos() as f64;
            Duration::from_nanos(nanos.round() as u64)
        }
        else {
            rtt
        };
        self.has_sample = true;
        self.rto = smoothed.max(self.min_rto);
    }

    /// doubles the RTO, but not beyond `max`
    pub fn back_off(&mut self, max: Duration) {
        self.rto = (self.rto * 2).min(max);
    }
}
