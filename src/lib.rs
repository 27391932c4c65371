//! ARISE Top Picks Engine library.
//!
//! Exposes the scheduler/engine/monitor/learning planes for use by the
//! `arise` binary and by integration tests. Every subsystem is constructed
//! explicitly in the binary's composition root; nothing here reaches for a
//! global.

pub mod agents;
pub mod config;
pub mod engine;
pub mod events;
pub mod kv;
pub mod learning;
pub mod market_clock;
pub mod models;
pub mod monitor;
pub mod quotes;
pub mod scheduler;
pub mod sentiment;
pub mod store;
pub mod strategy_exit_tracker;
pub mod support_resistance;
pub mod ws;
