//! # radmon
//!
//! Core library for the `radmon` monitoring tool: drivers for consumer
//! radiation and air-quality instruments, plus the plumbing to poll them on
//! a cycle and log readings.
//!
//! ## Crate Structure
//!
//! - **`config`**: TOML-backed [`config::Settings`] for the logging cycle
//!   and per-device options.
//! - **`device`**: the drivers. `device::minimon` reads an encrypted-frame
//!   USB HID CO2/temperature/humidity monitor over hidraw;
//!   `device::radpro` speaks the line-oriented serial protocol of Geiger
//!   counters running the Rad Pro firmware, including datalog downloads.
//! - **`error`**: the central [`error::RadmonError`] enum.
//! - **`sink`**: the [`sink::RecordSink`] output seam and its CSV
//!   implementation.

pub mod config;
pub mod device;
pub mod error;
pub mod sink;
