use super::*;

/// Maximum ratio where `1 - e^(-x)` is distinguishable from 1.0.
const EXP_SATURATION_LIMIT: f64 = 36.0;

/// Minimum time before considering a retarget, as a fraction of the window.
const MIN_TIME_WINDOW_RATIO: f64 = 0.8;

/// Minimum shares before considering a retarget, as a multiple of expected shares per window.
const MIN_SHARES_WINDOW_RATIO: f64 = 1.2;

/// Don't decrease difficulty unless the rate drops below this fraction of target.
const HYSTERESIS_LOW: f64 = 0.5;

/// Don't increase difficulty unless the rate exceeds this fraction of target.
const HYSTERESIS_HIGH: f64 = 1.33;

/// Computes `1 - e^(-x)`, saturating at [`EXP_SATURATION_LIMIT`].
fn exponential_fill_fraction(x: f64) -> f64 {
    -(-x.min(EXP_SATURATION_LIMIT)).exp_m1()
}

/// Approaches 1.0 as elapsed time exceeds the window.
fn calculate_time_bias(elapsed: Duration, window: Duration) -> f64 {
    exponential_fill_fraction(elapsed.as_secs_f64() / window.as_secs_f64())
}

#[derive(Debug, Clone)]
pub struct DecayingAverage {
    value: f64,
    window: Duration,
    last_update: Instant,
}

impl DecayingAverage {
    pub fn new(window: Duration, start: Instant) -> Self {
        Self {
            value: 0.0,
            window,
            last_update: start,
        }
    }

    pub fn record(&mut self, sample: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }

        let decay_factor = exponential_fill_fraction(elapsed / self.window.as_secs_f64());
        let normalizer = 1.0 + decay_factor;

        self.value = (self.value + (sample / elapsed) * decay_factor) / normalizer;
        self.last_update = now;
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VardiffConfig {
    /// Desired seconds between shares.
    pub target_time: Duration,
    /// Averaging window for the share rate.
    pub window: Duration,
    pub min_difficulty: f64,
    pub max_difficulty: Option<f64>,
}

impl Default for VardiffConfig {
    fn default() -> Self {
        Self {
            target_time: Duration::from_secs(15),
            window: Duration::from_secs(300),
            min_difficulty: 0.01,
            max_difficulty: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Timing {
    first_share: Instant,
    last_diff_change: Instant,
}

/// Per-connection retarget advisory. Feed it accepted shares and it answers
/// with a new difficulty when the observed rate leaves the hysteresis band.
#[derive(Debug, Clone)]
pub struct Vardiff {
    config: VardiffConfig,
    min_shares_for_adjustment: u32,
    min_time_for_adjustment: Duration,
    dsps: DecayingAverage,
    current_diff: f64,
    timing: Option<Timing>,
    shares_since_change: u32,
    last_update: Option<Instant>,
}

impl Vardiff {
    pub fn new(config: VardiffConfig, start_diff: f64) -> Self {
        let window_secs = config.window.as_secs_f64();
        let expected_shares_per_window = window_secs / config.target_time.as_secs_f64();

        Self {
            config,
            min_shares_for_adjustment: (expected_shares_per_window * MIN_SHARES_WINDOW_RATIO)
                as u32,
            min_time_for_adjustment: Duration::from_secs_f64(window_secs * MIN_TIME_WINDOW_RATIO),
            dsps: DecayingAverage::new(config.window, Instant::now()),
            current_diff: start_diff,
            timing: None,
            shares_since_change: 0,
            last_update: None,
        }
    }

    pub fn config(&self) -> &VardiffConfig {
        &self.config
    }

    pub fn current_diff(&self) -> f64 {
        self.current_diff
    }

    /// When the advisory last changed the difficulty.
    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    /// Difficulty-weighted shares per second.
    pub fn dsps(&self) -> f64 {
        self.dsps.value()
    }

    /// Keeps the advisory in step with a difficulty set from elsewhere.
    pub fn reset(&mut self, difficulty: f64) {
        self.current_diff = difficulty;
        self.shares_since_change = 0;
    }

    fn target_rate(&self) -> f64 {
        1.0 / self.config.target_time.as_secs_f64()
    }

    pub fn record_share(&mut self, difficulty: f64, network_diff: f64) -> Option<f64> {
        self.record_share_at(difficulty, network_diff, Instant::now())
    }

    fn record_share_at(&mut self, difficulty: f64, network_diff: f64, now: Instant) -> Option<f64> {
        if self.timing.is_none() {
            self.timing = Some(Timing {
                first_share: now,
                last_diff_change: now,
            });
            self.dsps = DecayingAverage::new(self.config.window, now);
        }

        self.dsps.record(difficulty, now);
        self.shares_since_change = self.shares_since_change.saturating_add(1);

        self.evaluate_adjustment(network_diff, now)
    }

    fn evaluate_adjustment(&mut self, network_diff: f64, now: Instant) -> Option<f64> {
        let timing = self.timing.as_ref()?;

        let time_since_first = now.saturating_duration_since(timing.first_share);
        let time_since_change = now.saturating_duration_since(timing.last_diff_change);

        if !self.ready_for_evaluation(time_since_change) {
            return None;
        }

        let metrics = self.calculate_metrics(time_since_first);

        debug!(
            "Vardiff: evaluating | dsps={:.6} bias={:.4} drr={:.4} target={:.4} range=[{:.4}, {:.4}]",
            metrics.dsps,
            metrics.bias,
            metrics.diff_rate_ratio,
            self.target_rate(),
            metrics.low_threshold,
            metrics.high_threshold
        );

        if metrics.is_within_hysteresis() {
            return None;
        }

        self.calculate_new_difficulty(metrics, network_diff, now)
    }

    fn ready_for_evaluation(&self, time_since_change: Duration) -> bool {
        self.shares_since_change >= self.min_shares_for_adjustment
            || time_since_change >= self.min_time_for_adjustment
    }

    fn calculate_metrics(&self, time_since_first: Duration) -> Metrics {
        let bias = calculate_time_bias(time_since_first, self.config.window);
        let dsps = self.dsps.value() / bias;
        let diff_rate_ratio = dsps / self.current_diff;
        let target_rate = self.target_rate();

        Metrics {
            dsps,
            bias,
            diff_rate_ratio,
            low_threshold: target_rate * HYSTERESIS_LOW,
            high_threshold: target_rate * HYSTERESIS_HIGH,
        }
    }

    fn calculate_new_difficulty(
        &mut self,
        metrics: Metrics,
        network_diff: f64,
        now: Instant,
    ) -> Option<f64> {
        let optimal = metrics.dsps * self.config.target_time.as_secs_f64();

        let mut max_diff = self.config.max_difficulty.unwrap_or(f64::MAX);
        if network_diff > 0.0 {
            max_diff = max_diff.min(network_diff);
        }
        let min_diff = self.config.min_difficulty.min(max_diff);

        let new_diff = optimal.clamp(min_diff, max_diff);

        if !new_diff.is_finite() || new_diff <= 0.0 || new_diff == self.current_diff {
            return None;
        }

        // A single share right after a decrease is too little evidence.
        if new_diff < self.current_diff && self.shares_since_change == 1 {
            if let Some(timing) = &mut self.timing {
                timing.last_diff_change = now;
            }
            return None;
        }

        debug!(
            "Vardiff: adjusting {} -> {} (drr={:.4} outside [{:.4}, {:.4}])",
            self.current_diff,
            new_diff,
            metrics.diff_rate_ratio,
            metrics.low_threshold,
            metrics.high_threshold
        );

        self.current_diff = new_diff;
        self.shares_since_change = 0;
        self.last_update = Some(now);
        if let Some(timing) = &mut self.timing {
            timing.last_diff_change = now;
        }

        Some(new_diff)
    }
}

struct Metrics {
    dsps: f64,
    bias: f64,
    diff_rate_ratio: f64,
    low_threshold: f64,
    high_threshold: f64,
}

impl Metrics {
    fn is_within_hysteresis(&self) -> bool {
        self.diff_rate_ratio > self.low_threshold && self.diff_rate_ratio < self.high_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn config(target: u64, window: u64) -> VardiffConfig {
        VardiffConfig {
            target_time: secs(target),
            window: secs(window),
            min_difficulty: 1.0,
            max_difficulty: None,
        }
    }

    #[test]
    fn average_starts_at_zero() {
        let avg = DecayingAverage::new(secs(300), Instant::now());
        assert_eq!(avg.value(), 0.0);
    }

    #[test]
    fn average_decays_over_time() {
        let start = Instant::now();
        let mut avg = DecayingAverage::new(secs(60), start);

        avg.record(100.0, start + secs(1));
        let initial = avg.value();

        avg.record(0.0, start + secs(31));
        assert!(avg.value() < initial);
    }

    #[test]
    fn average_stabilizes_with_constant_input() {
        let start = Instant::now();
        let mut avg = DecayingAverage::new(secs(60), start);

        let mut t = start;
        for _ in 0..120 {
            t += secs(1);
            avg.record(10.0, t);
        }

        let value = avg.value();
        assert!((8.0..12.0).contains(&value), "Expected ~10, got {value}");
    }

    #[test]
    fn average_ignores_zero_elapsed_time() {
        let start = Instant::now();
        let mut avg = DecayingAverage::new(secs(60), start);

        avg.record(100.0, start);
        assert_eq!(avg.value(), 0.0);
    }

    #[test]
    fn time_bias() {
        assert!(calculate_time_bias(secs(1), secs(300)) < 0.01);
        assert!(calculate_time_bias(secs(3000), secs(300)) > 0.99);
        assert!((0.3..0.5).contains(&calculate_time_bias(secs(150), secs(300))));
    }

    #[test]
    fn no_change_on_first_share() {
        let mut vardiff = Vardiff::new(config(5, 300), 10.0);
        assert!(vardiff.record_share(10.0, 1_000_000.0).is_none());
        assert_eq!(vardiff.current_diff(), 10.0);
        assert!(vardiff.last_update().is_none());
    }

    #[test]
    fn increases_difficulty_for_fast_shares() {
        let mut vardiff = Vardiff::new(config(5, 10), 10.0);

        let start = Instant::now();
        let mut t = start;
        let mut adjusted = None;

        for _ in 0..200 {
            t += millis(100);
            if let Some(diff) = vardiff.record_share_at(10.0, 1_000_000.0, t) {
                adjusted = Some(diff);
                break;
            }
        }

        let adjusted = adjusted.expect("fast shares should raise difficulty");
        assert!(adjusted > 10.0);
        assert_eq!(vardiff.current_diff(), adjusted);
        assert!(vardiff.last_update().is_some());
    }

    #[test]
    fn respects_network_and_max_ceiling() {
        let mut vardiff = Vardiff::new(
            VardiffConfig {
                max_difficulty: Some(50.0),
                ..config(5, 10)
            },
            10.0,
        );

        let mut t = Instant::now();
        for _ in 0..500 {
            t += millis(10);
            if let Some(diff) = vardiff.record_share_at(10.0, 100.0, t) {
                assert!(diff <= 50.0);
            }
        }
    }

    #[test]
    fn respects_min_floor() {
        let mut vardiff = Vardiff::new(
            VardiffConfig {
                min_difficulty: 8.0,
                ..config(1, 10)
            },
            64.0,
        );

        let mut t = Instant::now();
        for _ in 0..20 {
            t += secs(60);
            if let Some(diff) = vardiff.record_share_at(64.0, 1e9, t) {
                assert!(diff >= 8.0);
            }
        }
    }

    #[test]
    fn min_shares_and_time_derived_from_window() {
        let vardiff = Vardiff::new(config(1, 60), 1.0);
        assert_eq!(vardiff.min_shares_for_adjustment, 72);
        assert_eq!(vardiff.min_time_for_adjustment, secs(48));

        let vardiff = Vardiff::new(config(5, 300), 1.0);
        assert_eq!(vardiff.min_shares_for_adjustment, 72);
        assert_eq!(vardiff.min_time_for_adjustment, secs(240));
    }

    #[test]
    fn reset_tracks_external_changes() {
        let mut vardiff = Vardiff::new(config(5, 300), 10.0);
        vardiff.record_share(10.0, 1e9);
        vardiff.reset(512.0);
        assert_eq!(vardiff.current_diff(), 512.0);
        assert_eq!(vardiff.shares_since_change, 0);
    }
}
