//! Typed command protocol for the SR400 photon counter.
//!
//! The instrument speaks CR-terminated ASCII at 9600 baud 8N1. Each setter
//! below wraps one wire command; the ones with a firmware-independent hard
//! range (`DL`, `NP`) validate locally so an out-of-range argument never
//! reaches the wire. All other setters pass their value straight through;
//! the instrument firmware is the range authority for them.
//!
//! | Command | Meaning |
//! |---|---|
//! | `CM<n>` | count mode |
//! | `DL<ch>,<volts>` | discriminator level (4 decimal digits) |
//! | `DZ<ch>?` | query discriminator level |
//! | `DS<ch>,<slope>` | discriminator slope |
//! | `DM<ch>,<mode>` | discriminator mode |
//! | `GM<ch>,<mode>` | gate mode |
//! | `GW<ch>,<seconds>` | gate width |
//! | `GD<ch>,<seconds>` | gate delay |
//! | `CI<ch>,<source>` | counter input source |
//! | `X<A\|B>` | query count rate |
//! | `CS` / `CH` / `CR` | start / stop / reset count |
//! | `DT<seconds>` | dwell time |
//! | `NP<n>` | scan periods |
//! | `MI<mode>` | remote-control mode |
//! | `NN` | query scan position |
//! | `*IDN?` | identification (optional on real hardware) |
//!
//! Every transmission and every received line is mirrored onto the event
//! channel so observers can trace protocol traffic without polling.

use std::fmt;
use std::time::Duration;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, Sr400Error};
use crate::events::{Event, EventHub};
use crate::transport::Transport;

/// Lower bound of the discriminator level range, in volts.
pub const MIN_DISCRIMINATOR_V: f64 = -0.3;
/// Upper bound of the discriminator level range, in volts.
pub const MAX_DISCRIMINATOR_V: f64 = 0.3;
/// Valid scan-period counts.
pub const SCAN_PERIOD_RANGE: std::ops::RangeInclusive<u32> = 1..=2000;

/// First signed decimal token in a reply, for instruments that pad replies
/// with status text.
#[allow(clippy::unwrap_used)]
static NUMERIC_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-+]?\d*\.\d+|[-+]?\d+").unwrap());

/// Discriminator channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiscriminatorChannel {
    /// Counter A discriminator.
    A,
    /// Counter B discriminator.
    B,
    /// Trigger discriminator.
    T,
}

impl DiscriminatorChannel {
    /// All channels, in instrument order.
    pub const ALL: [Self; 3] = [Self::A, Self::B, Self::T];

    /// Wire code of the channel.
    pub fn code(self) -> u8 {
        match self {
            Self::A => 1,
            Self::B => 2,
            Self::T => 3,
        }
    }
}

impl fmt::Display for DiscriminatorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::T => write!(f, "T"),
        }
    }
}

/// Gate channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateChannel {
    /// Gate for counter A.
    A,
    /// Gate for counter B.
    B,
}

impl GateChannel {
    /// Both gate channels, in instrument order.
    pub const ALL: [Self; 2] = [Self::A, Self::B];

    /// Wire code of the channel.
    pub fn code(self) -> u8 {
        match self {
            Self::A => 1,
            Self::B => 2,
        }
    }
}

impl fmt::Display for GateChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// Counters whose rate can be read back with `X<ch>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CountChannel {
    /// Counter A.
    A,
    /// Counter B.
    B,
}

impl CountChannel {
    /// Wire suffix of the counter.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }
}

impl fmt::Display for CountChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter combine strategies (`CM` command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountMode {
    /// Count A and B independently.
    AB,
    /// Count A minus B.
    AMinusB,
    /// Count A plus B.
    APlusB,
    /// Count A for B ticks of the timebase.
    AForB,
}

impl CountMode {
    /// Wire code of the mode.
    pub fn code(self) -> u8 {
        match self {
            Self::AB => 0,
            Self::AMinusB => 1,
            Self::APlusB => 2,
            Self::AForB => 3,
        }
    }
}

/// Counter input sources (`CI` command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputSource {
    /// Internal 10 MHz reference.
    TenMhz,
    /// Front-panel input 1.
    Inp1,
    /// Front-panel input 2.
    Inp2,
    /// Trigger input.
    Trig,
}

impl InputSource {
    /// Wire code of the source.
    pub fn code(self) -> u8 {
        match self {
            Self::TenMhz => 0,
            Self::Inp1 => 1,
            Self::Inp2 => 2,
            Self::Trig => 3,
        }
    }
}

/// Discriminator edge selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscriminatorSlope {
    /// Trigger on the rising edge.
    Rise,
    /// Trigger on the falling edge.
    Fall,
}

impl DiscriminatorSlope {
    /// Wire code of the slope.
    pub fn code(self) -> u8 {
        match self {
            Self::Rise => 0,
            Self::Fall => 1,
        }
    }
}

/// Discriminator level mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscriminatorMode {
    /// Level held at the programmed value.
    Fixed,
    /// Level swept by the instrument's internal scan.
    Scan,
}

impl DiscriminatorMode {
    /// Wire code of the mode.
    pub fn code(self) -> u8 {
        match self {
            Self::Fixed => 0,
            Self::Scan => 1,
        }
    }
}

/// Gate operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateMode {
    /// Continuous-wave: gate always open.
    Cw,
    /// Fixed gate window.
    Fixed,
    /// Gate delay swept by the internal scan.
    Scan,
}

impl GateMode {
    /// Wire code of the mode.
    pub fn code(self) -> u8 {
        match self {
            Self::Cw => 0,
            Self::Fixed => 1,
            Self::Scan => 2,
        }
    }
}

/// Front-panel lockout mode (`MI` command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteMode {
    /// Front panel active.
    Local,
    /// Remote control, front panel still readable.
    Remote,
    /// Front panel locked out.
    LockedOut,
}

impl RemoteMode {
    /// Wire code of the mode.
    pub fn code(self) -> u8 {
        match self {
            Self::Local => 0,
            Self::Remote => 1,
            Self::LockedOut => 2,
        }
    }
}

/// Typed command client over a line transport.
///
/// The client owns the transport exclusively; higher layers share it behind
/// a mutex so at most one command sequence is in flight at a time.
pub struct Sr400Protocol {
    transport: Box<dyn Transport>,
    events: EventHub,
    /// Pacing pause after each transmitted command.
    command_delay: Duration,
    /// How long to wait for a query reply.
    reply_timeout: Duration,
}

impl Sr400Protocol {
    /// Wrap a transport, mirroring traffic onto `events`.
    pub fn new(transport: Box<dyn Transport>, events: EventHub) -> Self {
        Self {
            transport,
            events,
            command_delay: Duration::from_millis(100),
            reply_timeout: Duration::from_secs(1),
        }
    }

    /// Override the pacing pause after each command.
    pub fn with_command_delay(mut self, delay: Duration) -> Self {
        self.command_delay = delay;
        self
    }

    /// Override the reply timeout for queries.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// The event hub traffic is mirrored to.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Open the transport (including the hardware warm-up wait).
    pub async fn open(&mut self) -> Result<()> {
        self.transport.open().await
    }

    /// Close the transport; idempotent.
    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }

    /// Whether the transport is open.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Transport description for diagnostics.
    pub fn transport_info(&self) -> String {
        self.transport.info()
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        self.transport.write_line(command).await?;
        debug!("-> {command}");
        self.events.emit(Event::CommandSent(command.to_string()));
        if !self.command_delay.is_zero() {
            tokio::time::sleep(self.command_delay).await;
        }
        Ok(())
    }

    /// Send a command and read one reply line.
    pub async fn query(&mut self, command: &str) -> Result<String> {
        self.send(command).await?;
        let reply = self.transport.read_line(self.reply_timeout).await?;
        if !reply.is_empty() {
            debug!("<- {reply}");
            self.events.emit(Event::DataReceived(reply.clone()));
        }
        Ok(reply)
    }

    /// Send a query and parse the reply as a number.
    ///
    /// Falls back to the first numeric token for padded replies. An empty
    /// reply is `Ok(None)`: absence is propagated, never guessed. A
    /// non-empty reply with no numeric token is a protocol error.
    pub async fn query_numeric(&mut self, command: &str) -> Result<Option<f64>> {
        let reply = self.query(command).await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Ok(None);
        }
        if let Ok(value) = reply.parse::<f64>() {
            return Ok(Some(value));
        }
        match NUMERIC_TOKEN
            .find(reply)
            .and_then(|m| m.as_str().parse::<f64>().ok())
        {
            Some(value) => Ok(Some(value)),
            None => Err(Sr400Error::Protocol(reply.to_string())),
        }
    }

    /// Set the counter combine strategy.
    pub async fn set_count_mode(&mut self, mode: CountMode) -> Result<()> {
        self.send(&format!("CM{}", mode.code())).await
    }

    /// Set a discriminator level in volts.
    ///
    /// Levels outside [`MIN_DISCRIMINATOR_V`, `MAX_DISCRIMINATOR_V`] are
    /// rejected before any transport I/O.
    pub async fn set_discriminator_level(
        &mut self,
        channel: DiscriminatorChannel,
        volts: f64,
    ) -> Result<()> {
        if !(MIN_DISCRIMINATOR_V..=MAX_DISCRIMINATOR_V).contains(&volts) {
            return Err(Sr400Error::Validation(format!(
                "discriminator level {volts} V outside [{MIN_DISCRIMINATOR_V}, {MAX_DISCRIMINATOR_V}] V"
            )));
        }
        self.send(&format!("DL{},{volts:.4}", channel.code())).await
    }

    /// Read back a discriminator level in volts.
    pub async fn discriminator_level(
        &mut self,
        channel: DiscriminatorChannel,
    ) -> Result<Option<f64>> {
        self.query_numeric(&format!("DZ{}?", channel.code())).await
    }

    /// Set a discriminator slope.
    pub async fn set_discriminator_slope(
        &mut self,
        channel: DiscriminatorChannel,
        slope: DiscriminatorSlope,
    ) -> Result<()> {
        self.send(&format!("DS{},{}", channel.code(), slope.code()))
            .await
    }

    /// Set a discriminator mode.
    pub async fn set_discriminator_mode(
        &mut self,
        channel: DiscriminatorChannel,
        mode: DiscriminatorMode,
    ) -> Result<()> {
        self.send(&format!("DM{},{}", channel.code(), mode.code()))
            .await
    }

    /// Set a gate operating mode.
    pub async fn set_gate_mode(&mut self, channel: GateChannel, mode: GateMode) -> Result<()> {
        self.send(&format!("GM{},{}", channel.code(), mode.code()))
            .await
    }

    /// Set a gate width in seconds.
    pub async fn set_gate_width(&mut self, channel: GateChannel, seconds: f64) -> Result<()> {
        self.send(&format!("GW{},{seconds}", channel.code())).await
    }

    /// Set a gate delay in seconds.
    pub async fn set_gate_delay(&mut self, channel: GateChannel, seconds: f64) -> Result<()> {
        self.send(&format!("GD{},{seconds}", channel.code())).await
    }

    /// Select the input source of a counter.
    pub async fn set_input_source(
        &mut self,
        counter: DiscriminatorChannel,
        source: InputSource,
    ) -> Result<()> {
        self.send(&format!("CI{},{}", counter.code(), source.code()))
            .await
    }

    /// Read the latest count rate of a counter, in Hz.
    pub async fn count_rate(&mut self, counter: CountChannel) -> Result<Option<f64>> {
        self.query_numeric(&format!("X{}", counter.as_str())).await
    }

    /// Start counting.
    pub async fn start_count(&mut self) -> Result<()> {
        self.send("CS").await
    }

    /// Stop counting.
    pub async fn stop_count(&mut self) -> Result<()> {
        self.send("CH").await
    }

    /// Reset the counters.
    pub async fn reset_count(&mut self) -> Result<()> {
        self.send("CR").await
    }

    /// Set the dwell time in seconds.
    pub async fn set_dwell_time(&mut self, seconds: f64) -> Result<()> {
        self.send(&format!("DT{seconds}")).await
    }

    /// Set the number of scan periods.
    ///
    /// Counts outside [`SCAN_PERIOD_RANGE`] are rejected before any
    /// transport I/O.
    pub async fn set_scan_periods(&mut self, periods: u32) -> Result<()> {
        if !SCAN_PERIOD_RANGE.contains(&periods) {
            return Err(Sr400Error::Validation(format!(
                "scan periods {periods} outside [{}, {}]",
                SCAN_PERIOD_RANGE.start(),
                SCAN_PERIOD_RANGE.end()
            )));
        }
        self.send(&format!("NP{periods}")).await
    }

    /// Set the front-panel lockout mode.
    pub async fn set_remote_mode(&mut self, mode: RemoteMode) -> Result<()> {
        self.send(&format!("MI{}", mode.code())).await
    }

    /// Read the current scan position.
    pub async fn scan_position(&mut self) -> Result<Option<i64>> {
        Ok(self.query_numeric("NN").await?.map(|v| v as i64))
    }

    /// Identification query; real hardware may not answer it.
    pub async fn identify(&mut self) -> Result<String> {
        self.query("*IDN?").await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;

    /// Transport spy recording every transmitted line.
    struct SpyTransport {
        open: bool,
        sent: Arc<Mutex<Vec<String>>>,
        replies: Arc<Mutex<VecDeque<String>>>,
    }

    impl SpyTransport {
        fn new() -> (Self, Arc<Mutex<Vec<String>>>, Arc<Mutex<VecDeque<String>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let replies = Arc::new(Mutex::new(VecDeque::new()));
            (
                Self {
                    open: true,
                    sent: sent.clone(),
                    replies: replies.clone(),
                },
                sent,
                replies,
            )
        }
    }

    #[async_trait]
    impl Transport for SpyTransport {
        async fn open(&mut self) -> Result<()> {
            self.open = true;
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.open = false;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }

        async fn write_line(&mut self, line: &str) -> Result<()> {
            self.sent.lock().unwrap().push(line.to_string());
            Ok(())
        }

        async fn read_line(&mut self, _timeout: Duration) -> Result<String> {
            Ok(self.replies.lock().unwrap().pop_front().unwrap_or_default())
        }

        fn info(&self) -> String {
            "SpyTransport".into()
        }
    }

    fn protocol_with_spy() -> (
        Sr400Protocol,
        Arc<Mutex<Vec<String>>>,
        Arc<Mutex<VecDeque<String>>>,
    ) {
        let (spy, sent, replies) = SpyTransport::new();
        let protocol = Sr400Protocol::new(Box::new(spy), EventHub::default())
            .with_command_delay(Duration::ZERO)
            .with_reply_timeout(Duration::from_millis(5));
        (protocol, sent, replies)
    }

    #[tokio::test]
    async fn level_out_of_range_never_reaches_the_wire() {
        let (mut protocol, sent, _) = protocol_with_spy();

        for volts in [-0.301, 0.31, 1.0, -2.0] {
            let err = protocol
                .set_discriminator_level(DiscriminatorChannel::A, volts)
                .await
                .unwrap_err();
            assert!(matches!(err, Sr400Error::Validation(_)));
        }
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn level_is_formatted_with_four_decimals() {
        let (mut protocol, sent, _) = protocol_with_spy();

        protocol
            .set_discriminator_level(DiscriminatorChannel::B, -0.01)
            .await
            .unwrap();
        assert_eq!(sent.lock().unwrap().as_slice(), &["DL2,-0.0100"]);
    }

    #[tokio::test]
    async fn range_endpoints_are_accepted() {
        let (mut protocol, sent, _) = protocol_with_spy();

        protocol
            .set_discriminator_level(DiscriminatorChannel::T, MIN_DISCRIMINATOR_V)
            .await
            .unwrap();
        protocol
            .set_discriminator_level(DiscriminatorChannel::T, MAX_DISCRIMINATOR_V)
            .await
            .unwrap();
        assert_eq!(
            sent.lock().unwrap().as_slice(),
            &["DL3,-0.3000", "DL3,0.3000"]
        );
    }

    #[tokio::test]
    async fn scan_periods_bounds_are_enforced_locally() {
        let (mut protocol, sent, _) = protocol_with_spy();

        assert!(matches!(
            protocol.set_scan_periods(0).await,
            Err(Sr400Error::Validation(_))
        ));
        assert!(matches!(
            protocol.set_scan_periods(2001).await,
            Err(Sr400Error::Validation(_))
        ));
        assert!(sent.lock().unwrap().is_empty());

        protocol.set_scan_periods(2000).await.unwrap();
        assert_eq!(sent.lock().unwrap().as_slice(), &["NP2000"]);
    }

    #[tokio::test]
    async fn command_formatting_matches_the_wire_table() {
        let (mut protocol, sent, _) = protocol_with_spy();

        protocol.set_count_mode(CountMode::AB).await.unwrap();
        protocol
            .set_discriminator_slope(DiscriminatorChannel::A, DiscriminatorSlope::Fall)
            .await
            .unwrap();
        protocol
            .set_gate_mode(GateChannel::B, GateMode::Cw)
            .await
            .unwrap();
        protocol
            .set_input_source(DiscriminatorChannel::T, InputSource::TenMhz)
            .await
            .unwrap();
        protocol.set_remote_mode(RemoteMode::Local).await.unwrap();
        protocol.start_count().await.unwrap();
        protocol.stop_count().await.unwrap();
        protocol.reset_count().await.unwrap();

        assert_eq!(
            sent.lock().unwrap().as_slice(),
            &["CM0", "DS1,1", "GM2,0", "CI3,0", "MI0", "CS", "CH", "CR"]
        );
    }

    #[tokio::test]
    async fn numeric_reply_is_parsed_directly() {
        let (mut protocol, _, replies) = protocol_with_spy();
        replies.lock().unwrap().push_back("1250.5".into());

        let rate = protocol.count_rate(CountChannel::A).await.unwrap();
        assert_eq!(rate, Some(1250.5));
    }

    #[tokio::test]
    async fn padded_reply_falls_back_to_first_numeric_token() {
        let (mut protocol, _, replies) = protocol_with_spy();
        replies.lock().unwrap().push_back("COUNT 1234 HZ".into());

        let rate = protocol.count_rate(CountChannel::B).await.unwrap();
        assert_eq!(rate, Some(1234.0));
    }

    #[tokio::test]
    async fn empty_reply_means_no_value() {
        let (mut protocol, _, _) = protocol_with_spy();

        let level = protocol
            .discriminator_level(DiscriminatorChannel::A)
            .await
            .unwrap();
        assert_eq!(level, None);
    }

    #[tokio::test]
    async fn non_numeric_reply_is_a_protocol_error() {
        let (mut protocol, _, replies) = protocol_with_spy();
        replies.lock().unwrap().push_back("ERROR".into());

        let err = protocol.count_rate(CountChannel::A).await.unwrap_err();
        assert!(matches!(err, Sr400Error::Protocol(_)));
    }

    #[tokio::test]
    async fn wire_traffic_is_mirrored_onto_the_event_channel() {
        let (spy, _, replies) = SpyTransport::new();
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        let mut protocol = Sr400Protocol::new(Box::new(spy), hub)
            .with_command_delay(Duration::ZERO)
            .with_reply_timeout(Duration::from_millis(5));
        replies.lock().unwrap().push_back("-0.0100".into());

        let _ = protocol
            .discriminator_level(DiscriminatorChannel::A)
            .await
            .unwrap();

        assert!(matches!(rx.try_recv(), Ok(Event::CommandSent(c)) if c == "DZ1?"));
        assert!(matches!(rx.try_recv(), Ok(Event::DataReceived(r)) if r == "-0.0100"));
    }

    #[test]
    fn channel_codes_match_the_instrument() {
        assert_eq!(DiscriminatorChannel::A.code(), 1);
        assert_eq!(DiscriminatorChannel::B.code(), 2);
        assert_eq!(DiscriminatorChannel::T.code(), 3);
        assert_eq!(GateChannel::B.code(), 2);
        assert_eq!(CountMode::AForB.code(), 3);
        assert_eq!(InputSource::Trig.code(), 3);
        assert_eq!(RemoteMode::LockedOut.code(), 2);
    }
}
