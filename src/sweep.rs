//! S-curve sweep engine and optimal-threshold analysis.
//!
//! A sweep steps the discriminator level of one channel through evenly
//! spaced thresholds, counts at each for a dwell period, and records the
//! resulting rate. The engine runs on a worker task (see
//! [`crate::device::Sr400Device::start_sweep`]), reports progress through the
//! event channel, honors cooperative cancellation between points, and always
//! restores the discriminator level that was programmed before the sweep.
//!
//! [`find_optimal_threshold`] turns the resulting curve into an operating
//! point: the middle of the plateau where the count rate stops responding to
//! the threshold, biased away from the curve's noisy edges.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::device::Sr400Device;
use crate::error::{Result, Sr400Error};
use crate::events::{Event, EventHub};
use crate::protocol::{
    CountChannel, DiscriminatorChannel, MAX_DISCRIMINATOR_V, MIN_DISCRIMINATOR_V,
};

/// Practical upper bound on sweep resolution.
pub const MAX_SWEEP_STEPS: usize = 200;

/// Default pause after setting a level, letting the discriminator settle.
pub const DEFAULT_SETTLE_TIME_SEC: f64 = 0.05;

/// Default plateau tolerance, as a fraction of the measured rate span.
pub const DEFAULT_PLATEAU_TOLERANCE: f64 = 0.1;

fn default_counter() -> CountChannel {
    CountChannel::A
}
fn default_channel() -> DiscriminatorChannel {
    DiscriminatorChannel::A
}
fn default_start_v() -> f64 {
    -0.1
}
fn default_end_v() -> f64 {
    0.1
}
fn default_steps() -> usize {
    50
}
fn default_dwell() -> f64 {
    0.5
}
fn default_settle() -> f64 {
    DEFAULT_SETTLE_TIME_SEC
}
fn default_tolerance() -> f64 {
    DEFAULT_PLATEAU_TOLERANCE
}

/// Parameters of one S-curve sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Discriminator channel to sweep.
    #[serde(default = "default_channel")]
    pub channel: DiscriminatorChannel,

    /// Counter whose rate is recorded at each threshold.
    #[serde(default = "default_counter")]
    pub counter: CountChannel,

    /// First threshold in volts.
    #[serde(default = "default_start_v")]
    pub start_v: f64,

    /// Last threshold in volts; must exceed `start_v`.
    #[serde(default = "default_end_v")]
    pub end_v: f64,

    /// Number of thresholds, endpoints included.
    #[serde(default = "default_steps")]
    pub steps: usize,

    /// Counting time per threshold, in seconds.
    #[serde(default = "default_dwell")]
    pub dwell_time_sec: f64,

    /// Settling pause after each level change, in seconds.
    #[serde(default = "default_settle")]
    pub settle_time_sec: f64,

    /// Plateau tolerance for the optimal-threshold analysis, as a fraction
    /// of the measured rate span.
    #[serde(default = "default_tolerance")]
    pub plateau_tolerance: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            counter: default_counter(),
            start_v: default_start_v(),
            end_v: default_end_v(),
            steps: default_steps(),
            dwell_time_sec: default_dwell(),
            settle_time_sec: default_settle(),
            plateau_tolerance: default_tolerance(),
        }
    }
}

impl SweepConfig {
    /// Sweep `channel` from `start_v` to `end_v` in `steps` points, with
    /// default timing.
    pub fn new(channel: DiscriminatorChannel, start_v: f64, end_v: f64, steps: usize) -> Self {
        Self {
            channel,
            start_v,
            end_v,
            steps,
            ..Self::default()
        }
    }

    /// Reject parameter combinations before any hardware is touched.
    pub fn validate(&self) -> Result<()> {
        if self.start_v >= self.end_v {
            return Err(Sr400Error::Validation(format!(
                "sweep start {} V must be below end {} V",
                self.start_v, self.end_v
            )));
        }
        for volts in [self.start_v, self.end_v] {
            if !(MIN_DISCRIMINATOR_V..=MAX_DISCRIMINATOR_V).contains(&volts) {
                return Err(Sr400Error::Validation(format!(
                    "sweep endpoint {volts} V outside [{MIN_DISCRIMINATOR_V}, {MAX_DISCRIMINATOR_V}] V"
                )));
            }
        }
        if self.steps < 2 || self.steps > MAX_SWEEP_STEPS {
            return Err(Sr400Error::Validation(format!(
                "sweep steps {} outside [2, {MAX_SWEEP_STEPS}]",
                self.steps
            )));
        }
        if self.dwell_time_sec <= 0.0 {
            return Err(Sr400Error::Validation(format!(
                "dwell time {} s must be positive",
                self.dwell_time_sec
            )));
        }
        if self.settle_time_sec < 0.0 {
            return Err(Sr400Error::Validation(format!(
                "settle time {} s must not be negative",
                self.settle_time_sec
            )));
        }
        Ok(())
    }
}

/// Measured S-curve: parallel threshold/rate sequences of equal length.
#[derive(Debug, Clone, Default)]
pub struct SweepResult {
    /// Thresholds actually measured, ascending, in volts.
    pub thresholds: Vec<f64>,
    /// Count rate at each threshold, in Hz.
    pub rates: Vec<f64>,
}

impl SweepResult {
    /// Number of points measured.
    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    /// Whether no point was measured.
    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    pub(crate) fn push(&mut self, threshold_v: f64, rate_hz: f64) {
        self.thresholds.push(threshold_v);
        self.rates.push(rate_hz);
    }

    /// Optimal threshold of this curve; see [`find_optimal_threshold`].
    pub fn optimal_threshold(&self, plateau_tolerance: f64) -> Option<f64> {
        find_optimal_threshold(&self.thresholds, &self.rates, plateau_tolerance)
    }

    /// Export the curve as two-column CSV: header
    /// `Threshold (V),Count Rate (Hz)`, thresholds with 6 decimals, rates
    /// with 2.
    #[cfg(feature = "storage_csv")]
    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(["Threshold (V)", "Count Rate (Hz)"])?;
        for (threshold, rate) in self.thresholds.iter().zip(&self.rates) {
            csv_writer.write_record([format!("{threshold:.6}"), format!("{rate:.2}")])?;
        }
        csv_writer.flush()?;
        Ok(())
    }
}

/// Shared cooperative-cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// New, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation at the next safe boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handle to a sweep running on a worker task.
pub struct SweepHandle {
    cancel: CancelFlag,
    handle: tokio::task::JoinHandle<Result<SweepResult>>,
}

impl SweepHandle {
    pub(crate) fn new(
        cancel: CancelFlag,
        handle: tokio::task::JoinHandle<Result<SweepResult>>,
    ) -> Self {
        Self { cancel, handle }
    }

    /// Request cancellation; the sweep stops at the next point boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Clone of the sweep's cancellation flag.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Wait for the sweep to finish and take its result.
    pub async fn join(self) -> Result<SweepResult> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(Sr400Error::SweepAborted {
                reason: format!("sweep worker terminated: {e}"),
                partial: SweepResult::default(),
            }),
        }
    }
}

/// `steps` evenly spaced values from `start` to `end`, endpoints included.
///
/// `steps == 1` degenerates to `[start]`; `steps == 0` to an empty sequence.
pub fn generate_thresholds(start: f64, end: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let span = (end - start) / (steps - 1) as f64;
            (0..steps).map(|i| start + span * i as f64).collect()
        }
    }
}

/// Derive the optimal discriminator threshold from a measured S-curve.
///
/// With fewer than four points no derivative analysis is possible and the
/// threshold at the maximum rate is returned. Otherwise the discrete
/// derivative of the rate sequence is computed (one-sided at the ends,
/// central inside); points whose absolute derivative is below
/// `plateau_tolerance × (max rate − min rate)` form the plateau, and the
/// threshold at the *middle* plateau index is returned, so the choice lands
/// on the most stable part of the curve rather than its edges. Without a
/// plateau the maximum-rate threshold is the fallback.
///
/// Returns `None` for empty input.
pub fn find_optimal_threshold(
    thresholds: &[f64],
    rates: &[f64],
    plateau_tolerance: f64,
) -> Option<f64> {
    let n = thresholds.len().min(rates.len());
    if n == 0 {
        return None;
    }
    if n < 4 {
        return threshold_at_max_rate(&thresholds[..n], &rates[..n]);
    }

    let rates = &rates[..n];
    let derivative = gradient(rates);

    let span = rates.iter().cloned().fold(f64::MIN, f64::max)
        - rates.iter().cloned().fold(f64::MAX, f64::min);
    let cutoff = plateau_tolerance * span;

    let plateau: Vec<usize> = derivative
        .iter()
        .enumerate()
        .filter(|(_, d)| d.abs() < cutoff)
        .map(|(i, _)| i)
        .collect();

    if plateau.is_empty() {
        return threshold_at_max_rate(&thresholds[..n], rates);
    }
    Some(thresholds[plateau[plateau.len() / 2]])
}

/// Discrete derivative with the same stencil as a numeric gradient:
/// one-sided differences at the ends, central differences inside.
fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    debug_assert!(n >= 2);
    let mut derivative = vec![0.0; n];
    derivative[0] = values[1] - values[0];
    derivative[n - 1] = values[n - 1] - values[n - 2];
    for i in 1..n - 1 {
        derivative[i] = (values[i + 1] - values[i - 1]) / 2.0;
    }
    derivative
}

fn threshold_at_max_rate(thresholds: &[f64], rates: &[f64]) -> Option<f64> {
    rates
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| thresholds[i])
}

/// Run a sweep against `device`. Called from the worker task spawned by
/// [`Sr400Device::start_sweep`]; the caller has already validated the config
/// and acquired the device's exclusive token.
pub(crate) async fn run(
    device: &Sr400Device,
    config: &SweepConfig,
    cancel: &CancelFlag,
) -> Result<SweepResult> {
    let events = device.events().clone();
    info!(
        "starting S-curve sweep on channel {}: {} V to {} V, {} points, dwell {} s",
        config.channel, config.start_v, config.end_v, config.steps, config.dwell_time_sec
    );

    let original_level = device.get_discriminator_level(config.channel).await;
    let outcome = run_points(device, config, cancel, &events).await;

    // Restore the pre-sweep operating point no matter how the loop ended.
    match original_level {
        Some(volts) => {
            if let Err(e) = device.set_discriminator_level(config.channel, volts).await {
                events.error(format!(
                    "failed to restore discriminator level {volts:.4} V after sweep: {e}"
                ));
            }
        }
        None => warn!(
            "pre-sweep level of channel {} unknown; leaving last swept value",
            config.channel
        ),
    }

    match outcome {
        Ok(result) => {
            info!("sweep finished with {} of {} points", result.len(), config.steps);
            Ok(result)
        }
        Err(err) => {
            events.error(err.to_string());
            Err(err)
        }
    }
}

async fn run_points(
    device: &Sr400Device,
    config: &SweepConfig,
    cancel: &CancelFlag,
    events: &EventHub,
) -> Result<SweepResult> {
    let thresholds = generate_thresholds(config.start_v, config.end_v, config.steps);
    let settle = Duration::from_secs_f64(config.settle_time_sec);
    let dwell = Duration::from_secs_f64(config.dwell_time_sec);
    let mut result = SweepResult::default();

    for (i, &threshold) in thresholds.iter().enumerate() {
        if cancel.is_cancelled() {
            info!("sweep cancelled after {} of {} points", result.len(), config.steps);
            break;
        }

        if let Err(e) = device.set_discriminator_level(config.channel, threshold).await {
            return Err(Sr400Error::SweepAborted {
                reason: format!("failed to set discriminator level {threshold:.4} V: {e}"),
                partial: result,
            });
        }
        tokio::time::sleep(settle).await;

        // Last safe boundary before the counters start.
        if cancel.is_cancelled() {
            info!("sweep cancelled after {} of {} points", result.len(), config.steps);
            break;
        }

        let rate = match measure_point(device, config.counter, dwell).await {
            // A single missing reading must not invalidate the sweep.
            Ok(rate) => rate.unwrap_or(0.0),
            Err(e) => {
                return Err(Sr400Error::SweepAborted {
                    reason: format!("measurement failed at {threshold:.4} V: {e}"),
                    partial: result,
                });
            }
        };
        result.push(threshold, rate);

        events.emit(Event::Progress {
            fraction: (i + 1) as f64 / config.steps as f64,
            message: format!(
                "point {}/{}: {threshold:.4} V -> {rate:.1} Hz",
                i + 1,
                config.steps
            ),
        });
    }

    Ok(result)
}

async fn measure_point(
    device: &Sr400Device,
    counter: CountChannel,
    dwell: Duration,
) -> Result<Option<f64>> {
    device.reset_count().await?;
    device.start_count().await?;
    tokio::time::sleep(dwell).await;
    device.stop_count().await?;
    Ok(device.get_count_rate(counter).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sigmoid_curve(points: usize) -> (Vec<f64>, Vec<f64>) {
        let thresholds = generate_thresholds(-0.1, 0.1, points);
        let rates = thresholds
            .iter()
            .map(|v| 1500.0 / (1.0 + (-(v - 0.0) / 0.05).exp()))
            .collect();
        (thresholds, rates)
    }

    #[test]
    fn thresholds_are_evenly_spaced_with_exact_endpoints() {
        let values = generate_thresholds(-0.1, 0.1, 50);
        assert_eq!(values.len(), 50);
        assert!((values[0] - -0.1).abs() < 1e-12);
        assert!((values[49] - 0.1).abs() < 1e-12);
        for pair in values.windows(2) {
            assert!(pair[1] > pair[0]);
            assert!((pair[1] - pair[0] - 0.2 / 49.0).abs() < 1e-12);
        }
    }

    #[test]
    fn single_step_degenerates_to_start() {
        assert_eq!(generate_thresholds(-0.1, 0.1, 1), vec![-0.1]);
        assert!(generate_thresholds(-0.1, 0.1, 0).is_empty());
    }

    #[test]
    fn optimal_threshold_of_noiseless_sigmoid_is_the_center() {
        let (thresholds, rates) = sigmoid_curve(50);
        let optimal =
            find_optimal_threshold(&thresholds, &rates, DEFAULT_PLATEAU_TOLERANCE).unwrap();
        assert!(
            optimal.abs() < 0.01,
            "optimal {optimal} V too far from curve center"
        );
    }

    #[test]
    fn fewer_than_four_points_return_the_max_rate_threshold() {
        let thresholds = [-0.05, 0.0, 0.05];
        let rates = [10.0, 500.0, 30.0];
        let optimal = find_optimal_threshold(&thresholds, &rates, DEFAULT_PLATEAU_TOLERANCE);
        assert_eq!(optimal, Some(0.0));
    }

    #[test]
    fn no_plateau_falls_back_to_the_max_rate_threshold() {
        // Constant steep slope: every derivative equals the full span / 4.
        let thresholds = [0.0, 0.01, 0.02, 0.03, 0.04];
        let rates = [0.0, 1000.0, 2000.0, 3000.0, 4000.0];
        let optimal = find_optimal_threshold(&thresholds, &rates, DEFAULT_PLATEAU_TOLERANCE);
        assert_eq!(optimal, Some(0.04));
    }

    #[test]
    fn empty_input_has_no_optimal_threshold() {
        assert_eq!(find_optimal_threshold(&[], &[], 0.1), None);
    }

    #[test]
    fn config_validation_rejects_bad_parameters() {
        SweepConfig::default().validate().unwrap();

        let bad_configs = [
            // Inverted range
            SweepConfig {
                start_v: 0.1,
                end_v: -0.1,
                ..Default::default()
            },
            // Endpoint outside the discriminator range
            SweepConfig {
                end_v: 0.5,
                ..Default::default()
            },
            // Too few and too many points
            SweepConfig {
                steps: 1,
                ..Default::default()
            },
            SweepConfig {
                steps: MAX_SWEEP_STEPS + 1,
                ..Default::default()
            },
            // Zero dwell
            SweepConfig {
                dwell_time_sec: 0.0,
                ..Default::default()
            },
        ];
        for config in bad_configs {
            assert!(matches!(config.validate(), Err(Sr400Error::Validation(_))));
        }
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn csv_export_formats_header_and_rows() {
        let mut result = SweepResult::default();
        result.push(-0.1, 12.345);
        result.push(0.0, 750.0);

        let mut buffer = Vec::new();
        result.write_csv(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();

        assert_eq!(lines.next(), Some("Threshold (V),Count Rate (Hz)"));
        assert_eq!(lines.next(), Some("-0.100000,12.35"));
        assert_eq!(lines.next(), Some("0.000000,750.00"));
        assert_eq!(lines.next(), None);
    }
}
