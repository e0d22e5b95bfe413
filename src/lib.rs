//! # coinrisk
//! Cached crypto market data and risk statistics for web dashboards.
//!
//! Requests from the dashboard endpoints go through a [`cache::CoalescingCache`]
//! in front of the rate-limited CoinGecko API ([`upstream`]) and the local
//! SQLite price history ([`persistence`]); [`analysis::risk`] turns stored
//! price series into volatility, Sharpe ratio, beta and Value-at-Risk.

pub use crate::utils::error::{Error, Result};

pub mod analysis;
pub mod cache;
pub mod config;
pub mod dashboard;
pub mod metrics;
pub mod persistence;
pub mod upstream;
pub mod utils;
