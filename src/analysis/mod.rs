//! Risk analysis over daily price series

pub mod risk;

pub use risk::{MetricsEngine, RiskSnapshot};
