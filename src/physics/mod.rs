//! Geometry of paths over terrain.

pub mod los;

pub use los::{LookAngles, LosOutcome, LosReport, Obstruction, PartialResult, SatelliteLos};
