//! # SR400 DAQ Library
//!
//! This crate controls an SR400-class photon counter/discriminator over a
//! serial link and automates the S-curve measurement that finds an optimal
//! discriminator threshold. It is the core behind whatever frontend drives
//! the instrument (a GUI, a script, or a test harness); the frontend only
//! needs the device facade's calls plus the event channel for notifications.
//!
//! ## Crate Structure
//!
//! - **`transport`**: the byte-level seam; the `Transport` trait and the
//!   serial implementation over the `serialport` crate.
//! - **`protocol`**: channel/mode enums and typed command wrappers with
//!   local range validation and reply parsing.
//! - **`device`**: the `Sr400Device` facade: connect/disconnect lifecycle,
//!   default configuration, counting control, status snapshots, background
//!   monitoring, and the exclusion between monitoring and sweeping.
//! - **`sweep`**: the S-curve engine: threshold generation, the settle/dwell
//!   measurement loop with progress and cancellation, optimal threshold
//!   derivation, CSV export.
//! - **`sim`**: a protocol-compatible simulator producing sigmoid count-rate
//!   data, for development and test without hardware.
//! - **`events`**: the broadcast notification channel consumed by
//!   observers.
//! - **`config`**: TOML + environment configuration via the `config` crate.
//! - **`error`**: the `Sr400Error` enum for centralized error handling.

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod protocol;
pub mod sim;
pub mod sweep;
pub mod transport;
