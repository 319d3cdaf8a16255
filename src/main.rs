//! CLI entry point for sr400-daq.
//!
//! Connects to an SR400 photon counter (or the built-in simulator), applies
//! the standard configuration, runs an S-curve sweep, and reports the
//! optimal discriminator threshold. Ctrl-C during the sweep cancels it
//! cooperatively; partial data is still analyzed.
//!
//! # Usage
//!
//! Sweep against the simulator:
//! ```bash
//! sr400_daq --simulate --steps 50 --dwell 0.05
//! ```
//!
//! Sweep real hardware and export the curve:
//! ```bash
//! sr400_daq --port /dev/ttyUSB0 --export scurve.csv --apply
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};

use sr400_daq::config::Settings;
use sr400_daq::device::Sr400Device;
use sr400_daq::error::Sr400Error;
use sr400_daq::events::Event;
use sr400_daq::protocol::Sr400Protocol;
use sr400_daq::sim::Sr400Simulator;
use sr400_daq::sweep::SweepResult;
use sr400_daq::transport::Transport;

#[derive(Parser)]
#[command(name = "sr400-daq")]
#[command(about = "SR400 photon counter control and S-curve calibration", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<String>,

    /// Serial port of the instrument; overrides the configuration file
    #[arg(long)]
    port: Option<String>,

    /// Run against the built-in simulator instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Sweep start voltage override
    #[arg(long)]
    start: Option<f64>,

    /// Sweep end voltage override
    #[arg(long)]
    end: Option<f64>,

    /// Sweep step count override
    #[arg(long)]
    steps: Option<usize>,

    /// Dwell time per point override, in seconds
    #[arg(long)]
    dwell: Option<f64>,

    /// Apply the optimal threshold to the instrument after the sweep
    #[arg(long)]
    apply: bool,

    /// Export the measured curve to a CSV file
    #[arg(long)]
    export: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref()).context("failed to load settings")?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log_level.as_str()),
    )
    .init();

    let transport = build_transport(&cli, &settings)?;
    let protocol = Sr400Protocol::new(transport, Default::default())
        .with_command_delay(Duration::from_millis(settings.protocol.command_delay_ms))
        .with_reply_timeout(Duration::from_millis(settings.protocol.reply_timeout_ms));
    let device = Sr400Device::from_protocol(protocol);

    spawn_event_logger(&device);

    info!("connecting...");
    device.connect().await?;
    device.apply_default_configuration().await?;

    let mut sweep_config = settings.sweep.clone();
    if let Some(start) = cli.start {
        sweep_config.start_v = start;
    }
    if let Some(end) = cli.end {
        sweep_config.end_v = end;
    }
    if let Some(steps) = cli.steps {
        sweep_config.steps = steps;
    }
    if let Some(dwell) = cli.dwell {
        sweep_config.dwell_time_sec = dwell;
    }

    let channel = sweep_config.channel;
    let tolerance = sweep_config.plateau_tolerance;
    let handle = device.start_sweep(sweep_config)?;
    let cancel = handle.cancel_flag();

    let join = handle.join();
    tokio::pin!(join);
    let outcome = tokio::select! {
        result = &mut join => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("cancellation requested; stopping at the next point");
            cancel.cancel();
            join.await
        }
    };

    let result = match outcome {
        Ok(result) => result,
        Err(Sr400Error::SweepAborted { reason, partial }) if !partial.is_empty() => {
            warn!("sweep aborted ({reason}); keeping {} partial points", partial.len());
            partial
        }
        Err(e) => {
            device.disconnect().await?;
            return Err(e.into());
        }
    };

    println!("measured {} points", result.len());
    match result.optimal_threshold(tolerance) {
        Some(optimal) => {
            println!("optimal threshold: {optimal:.4} V");
            if cli.apply {
                device.set_discriminator_level(channel, optimal).await?;
                println!("applied to channel {channel}");
            }
        }
        None => println!("no data; optimal threshold unavailable"),
    }

    if let Some(path) = cli.export.as_ref() {
        export_csv(&result, path)?;
    }

    device.disconnect().await?;
    Ok(())
}

fn build_transport(cli: &Cli, settings: &Settings) -> Result<Box<dyn Transport>> {
    if cli.simulate {
        info!("using the built-in simulator");
        return Ok(Box::new(Sr400Simulator::new()));
    }

    #[cfg(feature = "instrument_serial")]
    {
        use sr400_daq::transport::SerialTransport;

        let port = cli
            .port
            .clone()
            .unwrap_or_else(|| settings.connection.port.clone());
        Ok(Box::new(
            SerialTransport::new(port, settings.connection.baud_rate)
                .with_warmup(Duration::from_millis(settings.connection.warmup_ms)),
        ))
    }

    #[cfg(not(feature = "instrument_serial"))]
    {
        let _ = settings;
        anyhow::bail!(
            "serial support not enabled; rebuild with --features instrument_serial or pass --simulate"
        )
    }
}

fn spawn_event_logger(device: &Sr400Device) {
    let mut rx = device.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Event::Progress { fraction, message }) => {
                    info!("[{:3.0}%] {message}", fraction * 100.0);
                }
                Ok(Event::Error(message)) => warn!("instrument error: {message}"),
                Ok(Event::ConnectionChanged(state)) => info!("connection: {state}"),
                Ok(Event::CountingChanged(counting)) => debug!("counting: {counting}"),
                Ok(Event::CommandSent(line)) => debug!("-> {line}"),
                Ok(Event::DataReceived(line)) => debug!("<- {line}"),
                Ok(Event::Status(snapshot)) => debug!("status: {snapshot:?}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("event observer lagged by {skipped} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(feature = "storage_csv")]
fn export_csv(result: &SweepResult, path: &std::path::Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    result.write_csv(file)?;
    println!("exported {} points to {}", result.len(), path.display());
    Ok(())
}

#[cfg(not(feature = "storage_csv"))]
fn export_csv(_result: &SweepResult, _path: &std::path::Path) -> Result<()> {
    anyhow::bail!("CSV export requires the storage_csv feature")
}
