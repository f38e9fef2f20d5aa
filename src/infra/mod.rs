//! Runtime bootstrap: error type and telemetry.

pub mod error;
pub mod telemetry;
