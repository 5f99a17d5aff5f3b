//! Core library for the antenna chamber data acquisition system.
//!
//! The chamber rotates an antenna under test on a motorized stand while a
//! network analyzer measures the transmission between it and a fixed chamber
//! antenna. This crate drives the four stepper motors over the serial
//! controller protocol, sequences the analyzer, persists run settings and
//! writes the captured traces.
//!
//! Layers, bottom up:
//!
//! - [`adapters`]: byte-level serial and VISA transports.
//! - [`hardware`]: motor protocol, devices and a simulated controller.
//! - [`instrument`]: network analyzer session and a simulated analyzer.
//! - [`store`]: configuration options remembered between runs.
//! - [`data`]: sweep records and result files.
//! - [`experiment`]: sweep, gain, polarization, alignment and calibration procedures.

pub mod adapters;
pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod instrument;
pub mod store;
