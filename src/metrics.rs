//! Bounded latency ring buffer with percentile reporting.

use tokio::sync::Mutex;

const MAX_SAMPLES: usize = 1000;

#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyPercentiles {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub min: u64,
    pub max: u64,
    pub avg: f64,
}

pub struct LatencyTracker {
    samples: Mutex<Vec<u64>>,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(Vec::with_capacity(MAX_SAMPLES)),
        }
    }

    pub async fn record(&self, latency_ms: u64) {
        let mut samples = self.samples.lock().await;
        if samples.len() >= MAX_SAMPLES {
            samples.remove(0);
        }
        samples.push(latency_ms);
    }

    pub async fn percentiles(&self) -> Option<LatencyPercentiles> {
        let samples = self.samples.lock().await;
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let n = sorted.len();
        let idx = |p: f64| -> usize { ((p * n as f64).ceil() as usize).saturating_sub(1).min(n - 1) };

        let sum: u64 = sorted.iter().sum();
        Some(LatencyPercentiles {
            p50: sorted[idx(0.50)],
            p95: sorted[idx(0.95)],
            p99: sorted[idx(0.99)],
            min: sorted[0],
            max: sorted[n - 1],
            avg: sum as f64 / n as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_tracker_has_no_percentiles() {
        let tracker = LatencyTracker::new();
        assert!(tracker.percentiles().await.is_none());
    }

    #[tokio::test]
    async fn computes_percentiles_over_samples() {
        let tracker = LatencyTracker::new();
        for ms in 1..=100u64 {
            tracker.record(ms).await;
        }
        let p = tracker.percentiles().await.unwrap();
        assert_eq!(p.min, 1);
        assert_eq!(p.max, 100);
        assert_eq!(p.p50, 50);
        assert_eq!(p.p95, 95);
        assert_eq!(p.p99, 99);
    }

    #[tokio::test]
    async fn ring_buffer_drops_oldest_beyond_capacity() {
        let tracker = LatencyTracker::new();
        for ms in 0..(MAX_SAMPLES as u64 + 10) {
            tracker.record(ms).await;
        }
        let samples = tracker.samples.lock().await;
        assert_eq!(samples.len(), MAX_SAMPLES);
        assert_eq!(samples[0], 10);
    }
}
