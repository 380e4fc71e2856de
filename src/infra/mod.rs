//! Runtime bootstrap shared by the binary: error type and telemetry.

pub mod error;
pub mod telemetry;
