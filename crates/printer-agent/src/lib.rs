pub mod camera;
pub mod cli;
pub mod config;
pub mod context;
pub mod controller;
pub mod files;
pub mod gate;
pub mod hub;
pub mod logging;
pub mod scheduler;
pub mod shutdown;
pub mod state;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod test_utils;
