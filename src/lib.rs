pub mod agent;
pub mod auth;
pub mod config;
pub mod daemon;
pub mod dependency;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod progress;
pub mod retry;
pub mod state;
pub mod tracker;
pub mod workflow;
pub mod workspace;
