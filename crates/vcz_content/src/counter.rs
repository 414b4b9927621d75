//! Transfer rates of a download.
//!
//! There is no global clock in here, the owner of the counters passes the
//! current time on every refresh, usually once per tick of its event loop.
use tokio::time::Instant;

/// Exponential Moving Average (EMA) smoothing factor
/// Higher values = more responsive to changes, lower values = smoother
const EMA_ALPHA: f64 = 0.3;

/// Cumulative total and smoothed rate of a single byte stream.
#[derive(Debug, Clone)]
pub struct Rate {
    total: u64,
    window: u64,
    ema: f64,
    last_update: Instant,
}

impl Rate {
    pub fn new(now: Instant) -> Self {
        Self { total: 0, window: 0, ema: 0.0, last_update: now }
    }

    pub fn record(&mut self, bytes: u64) {
        self.total += bytes;
        self.window += bytes;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Bytes per second.
    pub fn rate(&self) -> u64 {
        self.ema as u64
    }

    /// Fold the bytes recorded since the last update into the rate.
    pub fn update(&mut self, now: Instant) {
        let elapsed =
            now.saturating_duration_since(self.last_update).as_secs_f64();

        // Minimum 1ms elapsed
        if elapsed < 0.001 {
            return;
        }

        let instant_rate = self.window as f64 / elapsed;
        self.window = 0;

        self.ema = if self.ema == 0.0 {
            instant_rate
        } else {
            EMA_ALPHA * instant_rate + (1.0 - EMA_ALPHA) * self.ema
        };

        self.last_update = now;
    }
}

/// Counter of rates, of the useful payload and of the payload that was
/// received but thrown away.
#[derive(Debug, Clone)]
pub struct Counter {
    pub downloaded: Rate,
    /// Bytes of piece messages that we did not want, and bytes of chunks
    /// that failed the hash check.
    pub wasted: Rate,
}

impl Counter {
    pub fn new(now: Instant) -> Self {
        Self { downloaded: Rate::new(now), wasted: Rate::new(now) }
    }

    pub fn update_rates(&mut self, now: Instant) {
        self.downloaded.update(now);
        self.wasted.update(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn counter_rates() {
        let start = Instant::now();
        let mut counter = Counter::new(start);

        counter.downloaded.record(1000);
        counter.wasted.record(500);

        // First update: should set EMA to first instantaneous rate
        let t1 = start + Duration::from_millis(100);
        counter.update_rates(t1);

        assert!((9_990..=10_010).contains(&counter.downloaded.rate()));
        assert!((4_990..=5_010).contains(&counter.wasted.rate()));

        // Second window: same data as first, the EMA holds
        counter.downloaded.record(1000);
        let t2 = t1 + Duration::from_millis(100);
        counter.update_rates(t2);
        assert!((9_990..=10_010).contains(&counter.downloaded.rate()));

        // Third window: double the data
        // 0.3 * 20_000 + 0.7 * 10_000
        counter.downloaded.record(2000);
        counter.update_rates(t2 + Duration::from_millis(100));
        assert!((12_990..=13_010).contains(&counter.downloaded.rate()));

        assert_eq!(counter.downloaded.total(), 4000);
        assert_eq!(counter.wasted.total(), 500);
    }

    #[test]
    fn too_soon_is_ignored() {
        let start = Instant::now();
        let mut rate = Rate::new(start);
        rate.record(1000);
        rate.update(start);
        assert_eq!(rate.rate(), 0);

        rate.update(start + Duration::from_secs(1));
        assert!((999..=1000).contains(&rate.rate()));
    }
}
