pub mod geo;
pub mod io;
pub mod terrain;
pub mod physics;
pub mod coverage;
pub mod cache;
pub mod config;
pub mod engine;
pub mod pipeline;
pub mod logging;
