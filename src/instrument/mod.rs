//! Network analyzer control.
//!
//! [`VnaSession`] wraps an [`InstrumentTransport`](crate::adapters::InstrumentTransport)
//! and speaks the analyzer's SCPI dialect; [`mock::MockVna`] stands in for the
//! instrument in tests and `--simulate` runs.

pub mod mock;
pub mod vna;

pub use vna::{InstrumentFault, VnaSession, VnaTiming, STATE_FILE};
