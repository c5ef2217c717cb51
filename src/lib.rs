// Public API - only expose the runner module
pub mod runner;

// Internal modules - organized by subsystem
mod blacklist;
mod config;
mod dates;
mod destination;
mod error;
mod fetch;
mod model;
mod sync;
mod telemetry;
