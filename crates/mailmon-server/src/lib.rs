//! HTTP surface, schedulers and wiring for the mailmon alerting server.

pub mod api;
pub mod app;
pub mod config;
pub mod logging;
pub mod notifier;
pub mod scheduler;
pub mod seed;
pub mod state;
