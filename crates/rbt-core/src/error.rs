//! Error types shared by the backtesting crates.

use std::fmt;

/// Configuration loading / validation failures. Raised before the simulation
/// loop starts; every variant carries enough context for a one-line report.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    InvalidInitialCash(f64),
    NoInstruments,
    UnknownTimeframe(String),
    UnknownDataSource(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config io: {e}"),
            Self::Parse(e) => write!(f, "config parse: {e}"),
            Self::InvalidInitialCash(v) => {
                write!(f, "initial_cash must be positive, got {v}")
            }
            Self::NoInstruments => write!(f, "instrument list is empty"),
            Self::UnknownTimeframe(tf) => write!(f, "unknown timeframe: {tf:?}"),
            Self::UnknownDataSource(src) => write!(f, "unknown data source: {src:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e)
    }
}

/// Simulation kernel failures. Numeric degeneracy inside the loop is handled
/// locally (returns forced to zero, vol floors); only unrunnable inputs
/// surface here.
#[derive(Debug)]
pub enum EngineError {
    EmptySeries,
    InvalidInitialEquity(f64),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySeries => write!(f, "no bars to simulate"),
            Self::InvalidInitialEquity(v) => {
                write!(f, "initial equity must be positive, got {v}")
            }
        }
    }
}

impl std::error::Error for EngineError {}
