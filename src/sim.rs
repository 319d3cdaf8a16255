//! Simulated SR400 for development and test without hardware.
//!
//! [`Sr400Simulator`] implements [`Transport`] and parses the same
//! CR-terminated commands the protocol layer emits, so the entire protocol /
//! facade / sweep stack runs against it unmodified. Count-rate replies follow
//! a sigmoid of the discriminator level (so threshold scans produce a real
//! S-curve with a plateau to find), plus bounded uniform noise and a slow
//! sinusoidal drift.
//!
//! # Example
//!
//! ```rust,ignore
//! let sim = Sr400Simulator::new().with_noise(0.0).with_drift(false);
//! let device = Sr400Device::new(Box::new(sim));
//! device.connect().await?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use rand::Rng;

use crate::error::{Result, Sr400Error};
use crate::transport::Transport;

/// Drift cycle length in seconds.
const DRIFT_PERIOD_SEC: f64 = 60.0;
/// Drift amplitude as a fraction of the maximum rate.
const DRIFT_FRACTION: f64 = 0.05;

/// Per-gate simulated state.
#[derive(Debug, Clone, Copy, Default)]
struct SimGate {
    mode: u8,
    width_sec: f64,
    delay_sec: f64,
}

/// Protocol-compatible stand-in for the instrument.
pub struct Sr400Simulator {
    open: bool,
    counting: bool,
    replies: VecDeque<String>,

    levels: HashMap<u8, f64>,
    slopes: HashMap<u8, u8>,
    disc_modes: HashMap<u8, u8>,
    gates: HashMap<u8, SimGate>,
    input_sources: HashMap<u8, u8>,
    count_mode: u8,
    dwell_sec: f64,
    scan_periods: u32,
    remote_mode: u8,
    scan_position: i64,

    // Response curve of the simulated detector
    center_v: f64,
    width_v: f64,
    max_rate_hz: f64,
    noise_hz: f64,
    drift: bool,

    connect_latency: Duration,
    started: Instant,
}

impl Sr400Simulator {
    /// Create a simulator with the stock detector response (sigmoid centered
    /// at 0 V, 50 mV transition width, 1500 Hz saturation).
    pub fn new() -> Self {
        let mut levels = HashMap::new();
        for code in 1..=3u8 {
            levels.insert(code, -0.010);
        }
        Self {
            open: false,
            counting: false,
            replies: VecDeque::new(),
            levels,
            slopes: HashMap::new(),
            disc_modes: HashMap::new(),
            gates: HashMap::new(),
            input_sources: HashMap::new(),
            count_mode: 0,
            dwell_sec: 1.0,
            scan_periods: 1,
            remote_mode: 0,
            scan_position: 0,
            center_v: 0.0,
            width_v: 0.05,
            max_rate_hz: 1500.0,
            noise_hz: 50.0,
            drift: true,
            connect_latency: Duration::from_millis(10),
            started: Instant::now(),
        }
    }

    /// Override the detector response curve.
    pub fn with_curve(mut self, center_v: f64, width_v: f64, max_rate_hz: f64) -> Self {
        self.center_v = center_v;
        self.width_v = width_v;
        self.max_rate_hz = max_rate_hz;
        self
    }

    /// Set the noise amplitude in Hz; zero disables noise.
    pub fn with_noise(mut self, noise_hz: f64) -> Self {
        self.noise_hz = noise_hz;
        self
    }

    /// Enable or disable the slow periodic drift.
    pub fn with_drift(mut self, drift: bool) -> Self {
        self.drift = drift;
        self
    }

    /// Override the simulated connection latency.
    pub fn with_connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }

    /// Whether the simulated counters are currently running.
    pub fn is_counting(&self) -> bool {
        self.counting
    }

    // Inspection hooks for test verification, reporting what the simulated
    // instrument retained from the command stream. Raw wire codes, exactly
    // as parsed.

    /// Stored slope code of a discriminator channel.
    pub fn slope(&self, channel_code: u8) -> Option<u8> {
        self.slopes.get(&channel_code).copied()
    }

    /// Stored mode code of a discriminator channel.
    pub fn discriminator_mode(&self, channel_code: u8) -> Option<u8> {
        self.disc_modes.get(&channel_code).copied()
    }

    /// Stored (mode, width, delay) of a gate channel.
    pub fn gate(&self, channel_code: u8) -> Option<(u8, f64, f64)> {
        self.gates
            .get(&channel_code)
            .map(|g| (g.mode, g.width_sec, g.delay_sec))
    }

    /// Stored input source code of a counter.
    pub fn input_source(&self, counter_code: u8) -> Option<u8> {
        self.input_sources.get(&counter_code).copied()
    }

    /// Stored count mode code.
    pub fn count_mode(&self) -> u8 {
        self.count_mode
    }

    /// Stored dwell time in seconds.
    pub fn dwell_time(&self) -> f64 {
        self.dwell_sec
    }

    /// Stored scan period count.
    pub fn scan_periods(&self) -> u32 {
        self.scan_periods
    }

    /// Stored remote-control mode code.
    pub fn remote_mode(&self) -> u8 {
        self.remote_mode
    }

    fn count_rate(&self, counter_code: u8) -> f64 {
        let level = self.levels.get(&counter_code).copied().unwrap_or(-0.010);
        let sigmoid = self.max_rate_hz / (1.0 + (-(level - self.center_v) / self.width_v).exp());

        let noise = if self.noise_hz > 0.0 {
            rand::thread_rng().gen_range(-self.noise_hz..self.noise_hz)
        } else {
            0.0
        };

        let drift = if self.drift {
            let phase = (self.started.elapsed().as_secs_f64() % DRIFT_PERIOD_SEC)
                / DRIFT_PERIOD_SEC;
            (phase * std::f64::consts::TAU).sin() * self.max_rate_hz * DRIFT_FRACTION
        } else {
            0.0
        };

        (sigmoid + noise + drift).max(0.0)
    }

    fn execute(&mut self, cmd: &str) {
        if cmd.is_empty() {
            return;
        }
        if cmd == "*IDN?" {
            self.replies
                .push_back("Stanford_Research_Systems,SR400,s/n99999,ver2.05".into());
            return;
        }
        match cmd {
            "CS" => {
                self.counting = true;
                return;
            }
            "CH" => {
                self.counting = false;
                return;
            }
            "CR" => {
                self.scan_position = 0;
                return;
            }
            "NN" => {
                self.replies.push_back(self.scan_position.to_string());
                return;
            }
            _ => {}
        }

        if let Some(rest) = cmd.strip_prefix("DZ") {
            if let Some(code) = rest.strip_suffix('?').and_then(|s| s.parse::<u8>().ok()) {
                let level = self.levels.get(&code).copied().unwrap_or(0.0);
                self.replies.push_back(format!("{level:.4}"));
            }
        } else if let Some(rest) = cmd.strip_prefix("DL") {
            if let Some((code, volts)) = parse_pair::<f64>(rest) {
                self.levels.insert(code, volts);
            }
        } else if let Some(rest) = cmd.strip_prefix("DS") {
            if let Some((code, slope)) = parse_pair::<u8>(rest) {
                self.slopes.insert(code, slope);
            }
        } else if let Some(rest) = cmd.strip_prefix("DM") {
            if let Some((code, mode)) = parse_pair::<u8>(rest) {
                self.disc_modes.insert(code, mode);
            }
        } else if let Some(rest) = cmd.strip_prefix("GM") {
            if let Some((code, mode)) = parse_pair::<u8>(rest) {
                self.gates.entry(code).or_default().mode = mode;
            }
        } else if let Some(rest) = cmd.strip_prefix("GW") {
            if let Some((code, width)) = parse_pair::<f64>(rest) {
                self.gates.entry(code).or_default().width_sec = width;
            }
        } else if let Some(rest) = cmd.strip_prefix("GD") {
            if let Some((code, delay)) = parse_pair::<f64>(rest) {
                self.gates.entry(code).or_default().delay_sec = delay;
            }
        } else if let Some(rest) = cmd.strip_prefix("CI") {
            if let Some((code, source)) = parse_pair::<u8>(rest) {
                self.input_sources.insert(code, source);
            }
        } else if let Some(rest) = cmd.strip_prefix("CM") {
            if let Ok(mode) = rest.trim().parse::<u8>() {
                self.count_mode = mode;
            }
        } else if let Some(rest) = cmd.strip_prefix("DT") {
            if let Ok(dwell) = rest.trim().parse::<f64>() {
                self.dwell_sec = dwell;
            }
        } else if let Some(rest) = cmd.strip_prefix("NP") {
            if let Ok(periods) = rest.trim().parse::<u32>() {
                self.scan_periods = periods;
            }
        } else if let Some(rest) = cmd.strip_prefix("MI") {
            if let Ok(mode) = rest.trim().parse::<u8>() {
                self.remote_mode = mode;
            }
        } else if let Some(rest) = cmd.strip_prefix('X') {
            let code = match rest.trim() {
                "A" => Some(1),
                "B" => Some(2),
                _ => None,
            };
            if let Some(code) = code {
                let rate = self.count_rate(code);
                self.replies.push_back(format!("{rate:.1}"));
            }
        } else {
            debug!("simulator ignoring unknown command {cmd:?}");
        }
    }
}

fn parse_pair<T: std::str::FromStr>(rest: &str) -> Option<(u8, T)> {
    let (code, value) = rest.split_once(',')?;
    Some((code.trim().parse().ok()?, value.trim().parse().ok()?))
}

impl Default for Sr400Simulator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for Sr400Simulator {
    async fn open(&mut self) -> Result<()> {
        if !self.open {
            tokio::time::sleep(self.connect_latency).await;
            self.open = true;
            self.counting = false;
            debug!("simulator connected");
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.counting = false;
            self.replies.clear();
            debug!("simulator disconnected");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        if !self.open {
            return Err(Sr400Error::Connection("simulator not connected".into()));
        }
        let cmd = line.trim_end_matches(['\r', '\n']).trim();
        debug!("simulator received {cmd:?}");
        self.execute(cmd);
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String> {
        if !self.open {
            return Err(Sr400Error::Connection("simulator not connected".into()));
        }
        match self.replies.pop_front() {
            Some(reply) => Ok(reply),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(String::new())
            }
        }
    }

    fn info(&self) -> String {
        "Sr400Simulator".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_sim() -> Sr400Simulator {
        let mut sim = Sr400Simulator::new()
            .with_noise(0.0)
            .with_drift(false)
            .with_connect_latency(Duration::ZERO);
        sim.open().await.unwrap();
        sim
    }

    #[tokio::test]
    async fn identification_reply() {
        let mut sim = open_sim().await;
        sim.write_line("*IDN?").await.unwrap();
        let reply = sim.read_line(Duration::from_millis(5)).await.unwrap();
        assert!(reply.contains("SR400"));
    }

    #[tokio::test]
    async fn level_set_then_query_round_trip() {
        let mut sim = open_sim().await;
        sim.write_line("DL1,-0.1234").await.unwrap();
        sim.write_line("DZ1?").await.unwrap();
        let reply = sim.read_line(Duration::from_millis(5)).await.unwrap();
        assert_eq!(reply, "-0.1234");
    }

    #[tokio::test]
    async fn count_rate_follows_the_sigmoid() {
        let mut sim = open_sim().await;

        // At the curve center the rate is half the maximum.
        sim.write_line("DL1,0.0000").await.unwrap();
        sim.write_line("XA").await.unwrap();
        let mid: f64 = sim
            .read_line(Duration::from_millis(5))
            .await
            .unwrap()
            .parse()
            .unwrap();
        assert!((mid - 750.0).abs() < 1.0, "mid-curve rate {mid}");

        // Far above threshold the rate saturates.
        sim.write_line("DL1,0.3000").await.unwrap();
        sim.write_line("XA").await.unwrap();
        let high: f64 = sim
            .read_line(Duration::from_millis(5))
            .await
            .unwrap()
            .parse()
            .unwrap();
        assert!(high > 1495.0, "saturated rate {high}");
    }

    #[tokio::test]
    async fn configuration_commands_are_retained() {
        let mut sim = open_sim().await;
        for cmd in [
            "DS1,1", "DM1,0", "GM2,0", "GW2,0", "GD2,0.000000005", "CI3,0", "CM0", "DT1",
            "NP1", "MI2",
        ] {
            sim.write_line(cmd).await.unwrap();
        }

        assert_eq!(sim.slope(1), Some(1));
        assert_eq!(sim.discriminator_mode(1), Some(0));
        assert_eq!(sim.gate(2), Some((0, 0.0, 5e-9)));
        assert_eq!(sim.input_source(3), Some(0));
        assert_eq!(sim.count_mode(), 0);
        assert_eq!(sim.dwell_time(), 1.0);
        assert_eq!(sim.scan_periods(), 1);
        assert_eq!(sim.remote_mode(), 2);
    }

    #[tokio::test]
    async fn counting_flag_tracks_start_and_stop() {
        let mut sim = open_sim().await;
        sim.write_line("CS").await.unwrap();
        assert!(sim.is_counting());
        sim.write_line("CH").await.unwrap();
        assert!(!sim.is_counting());
    }

    #[tokio::test]
    async fn commands_fail_when_not_connected() {
        let mut sim = Sr400Simulator::new();
        let err = sim.write_line("CS").await.unwrap_err();
        assert!(matches!(err, Sr400Error::Connection(_)));
    }

    #[tokio::test]
    async fn read_without_pending_reply_is_empty() {
        let mut sim = open_sim().await;
        let reply = sim.read_line(Duration::from_millis(1)).await.unwrap();
        assert!(reply.is_empty());
    }
}
