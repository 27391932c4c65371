//! Position Monitor Plane — §4.6.
//!
//! Three schedulable monitors sharing one alert engine
//! (`auto_monitoring::evaluate`): scalping positions, Top-Picks-derived
//! non-scalping positions, and broker portfolio/watchlist positions.

pub mod auto_monitoring;
pub mod portfolio;
pub mod positions;
pub mod scalping;
