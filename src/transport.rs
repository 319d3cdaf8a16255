//! Line-oriented transport for RS-232 instruments.
//!
//! [`Transport`] is the byte-level seam between the command protocol layer
//! and whatever carries the bytes: [`SerialTransport`] for real hardware
//! (behind the `instrument_serial` feature), or the simulator in
//! [`crate::sim`] for development without an instrument.
//!
//! The serial implementation wraps the `serialport` crate and executes
//! blocking I/O on Tokio's blocking thread pool so that reads and writes
//! never stall the async runtime.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Byte transport speaking CR-terminated ASCII lines.
///
/// # Contract
/// - `read_line` returns an empty string when nothing arrives within the
///   timeout; it never fails on malformed bytes, only on transport faults.
/// - `close` is idempotent.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying connection, including any hardware warm-up wait.
    async fn open(&mut self) -> Result<()>;

    /// Close the connection; safe to call when already closed.
    async fn close(&mut self) -> Result<()>;

    /// Whether the connection is currently open.
    fn is_open(&self) -> bool;

    /// Send one command line, appending the line terminator if absent.
    async fn write_line(&mut self, line: &str) -> Result<()>;

    /// Read one reply line, waiting at most `timeout`.
    async fn read_line(&mut self, timeout: Duration) -> Result<String>;

    /// Short human-readable description for diagnostics.
    fn info(&self) -> String;
}

#[cfg(feature = "instrument_serial")]
pub use serial::SerialTransport;

#[cfg(feature = "instrument_serial")]
mod serial {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use log::debug;
    use serialport::SerialPort;
    use tokio::sync::Mutex;

    use super::Transport;
    use crate::error::{Result, Sr400Error};

    /// Default read timeout of the OS-level port; the logical timeout is
    /// enforced in [`Transport::read_line`].
    const PORT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

    /// The instrument needs roughly two seconds after the port opens before
    /// it accepts commands. Hardware requirement, not an implementation
    /// artifact.
    const DEFAULT_WARMUP: Duration = Duration::from_secs(2);

    /// Serial transport for the instrument's RS-232 interface (8N1).
    pub struct SerialTransport {
        /// Port name (e.g., "/dev/ttyUSB0", "COM3")
        port_name: String,

        /// Baud rate (9600 for the SR400)
        baud_rate: u32,

        /// Warm-up wait after opening the port
        warmup: Duration,

        /// Terminator appended to outgoing commands
        line_terminator: String,

        /// The actual serial port (behind Arc<Mutex> for async access)
        port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
    }

    impl SerialTransport {
        /// Create a transport for the given port at the given baud rate.
        pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
            Self {
                port_name: port_name.into(),
                baud_rate,
                warmup: DEFAULT_WARMUP,
                line_terminator: "\r".to_string(),
                port: None,
            }
        }

        /// Override the post-open warm-up wait.
        pub fn with_warmup(mut self, warmup: Duration) -> Self {
            self.warmup = warmup;
            self
        }

        /// Override the command line terminator.
        pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
            self.line_terminator = terminator.into();
            self
        }
    }

    #[async_trait]
    impl Transport for SerialTransport {
        async fn open(&mut self) -> Result<()> {
            if self.port.is_some() {
                return Ok(());
            }

            let port = serialport::new(&self.port_name, self.baud_rate)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .timeout(PORT_POLL_TIMEOUT)
                .open()
                .map_err(|e| {
                    Sr400Error::Connection(format!(
                        "failed to open serial port '{}' at {} baud: {e}",
                        self.port_name, self.baud_rate
                    ))
                })?;

            self.port = Some(Arc::new(Mutex::new(port)));
            debug!(
                "serial port '{}' opened at {} baud",
                self.port_name, self.baud_rate
            );

            // Let the instrument finish its power-on handshake before the
            // first command.
            tokio::time::sleep(self.warmup).await;
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            if self.port.take().is_some() {
                debug!("serial port '{}' closed", self.port_name);
            }
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.port.is_some()
        }

        async fn write_line(&mut self, line: &str) -> Result<()> {
            let port = self
                .port
                .as_ref()
                .ok_or_else(|| Sr400Error::Connection("serial port not open".into()))?
                .clone();

            let framed = if line.ends_with(&self.line_terminator) {
                line.to_string()
            } else {
                format!("{line}{}", self.line_terminator)
            };

            tokio::task::spawn_blocking(move || {
                use std::io::Write;

                let mut guard = port.blocking_lock();
                guard
                    .write_all(framed.as_bytes())
                    .map_err(|e| Sr400Error::Connection(format!("serial write failed: {e}")))?;
                guard
                    .flush()
                    .map_err(|e| Sr400Error::Connection(format!("serial flush failed: {e}")))
            })
            .await
            .map_err(|e| Sr400Error::Connection(format!("serial I/O task failed: {e}")))?
        }

        async fn read_line(&mut self, timeout: Duration) -> Result<String> {
            let port = self
                .port
                .as_ref()
                .ok_or_else(|| Sr400Error::Connection("serial port not open".into()))?
                .clone();

            tokio::task::spawn_blocking(move || {
                use std::io::Read;

                let mut guard = port.blocking_lock();
                let mut response = Vec::new();
                let mut buffer = [0u8; 1];
                let start = std::time::Instant::now();

                loop {
                    if start.elapsed() > timeout {
                        // Nothing (or a partial line) within the window; hand
                        // back whatever arrived.
                        break;
                    }

                    match guard.read(&mut buffer) {
                        Ok(1) => {
                            let byte = buffer[0];
                            if byte == b'\r' || byte == b'\n' {
                                // Skip delimiters left over from the previous
                                // reply, stop at the end of this one.
                                if response.is_empty() {
                                    continue;
                                }
                                break;
                            }
                            response.push(byte);
                        }
                        Ok(_) => {
                            return Err(Sr400Error::Connection(
                                "unexpected EOF from serial port".into(),
                            ));
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                            // Port poll timeout is shorter than the logical
                            // timeout; keep waiting.
                            continue;
                        }
                        Err(e) => {
                            return Err(Sr400Error::Connection(format!(
                                "serial read failed: {e}"
                            )));
                        }
                    }
                }

                Ok(String::from_utf8_lossy(&response).trim().to_string())
            })
            .await
            .map_err(|e| Sr400Error::Connection(format!("serial I/O task failed: {e}")))?
        }

        fn info(&self) -> String {
            format!("SerialTransport({} @ {} baud)", self.port_name, self.baud_rate)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn builder_defaults() {
            let transport = SerialTransport::new("/dev/ttyUSB0", 9600);
            assert!(!transport.is_open());
            assert_eq!(transport.line_terminator, "\r");
            assert_eq!(transport.warmup, DEFAULT_WARMUP);
        }

        #[test]
        fn builder_overrides() {
            let transport = SerialTransport::new("COM3", 115_200)
                .with_warmup(Duration::from_millis(10))
                .with_line_terminator("\r\n");
            assert_eq!(transport.warmup, Duration::from_millis(10));
            assert_eq!(transport.line_terminator, "\r\n");
        }

        #[test]
        fn info_names_the_port() {
            let transport = SerialTransport::new("COM3", 115_200);
            let info = transport.info();
            assert!(info.contains("COM3"));
            assert!(info.contains("115200"));
        }

        #[tokio::test]
        async fn write_without_open_port_is_a_connection_error() {
            let mut transport = SerialTransport::new("/dev/null-port", 9600);
            let err = transport.write_line("CS").await.unwrap_err();
            assert!(matches!(err, Sr400Error::Connection(_)));
        }

        #[tokio::test]
        async fn close_is_idempotent() {
            let mut transport = SerialTransport::new("/dev/null-port", 9600);
            transport.close().await.unwrap();
            transport.close().await.unwrap();
            assert!(!transport.is_open());
        }
    }
}
