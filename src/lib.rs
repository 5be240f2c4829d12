pub mod actuator;
pub mod clients;
pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod health;
pub mod monitor;
pub mod planner;
pub mod resilience;
pub mod stability;
pub mod state;
pub mod telemetry;
