pub mod config;
pub mod engine;
pub mod targets;
pub mod telemetry;
