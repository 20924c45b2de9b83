pub mod config;
pub mod data;
pub mod indicators;
pub mod signal;
pub mod risk;
pub mod tracker;
pub mod journal;
pub mod report;
pub mod controller;
pub mod engine;
pub mod dashboard;
pub mod time_sync;
pub mod broker;
pub mod notify;
pub mod relay;
pub mod relay_server;
pub mod discord;

pub use config::AppConfig;
pub use signal::{Signal, SignalEvaluator, SignalKind};
pub use tracker::PositionTracker;
