pub mod brain;
pub mod cli;
pub mod config;
pub mod doctor;
pub mod error;
pub mod events;
pub mod knowledge;
pub mod message;
pub mod model;
pub mod multimodal;
pub mod orchestrator;
pub mod planner;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod tools;

#[cfg(test)]
mod tests;
