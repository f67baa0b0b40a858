//! Per-instrument simulation state, closed-trade records and the equity
//! curve sample type.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Classification enums carried on signals, actions and trades
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dir {
    Long,
    Short,
}

impl Dir {
    pub fn from_position(pos: f64) -> Self {
        if pos > 0.0 {
            Dir::Long
        } else {
            Dir::Short
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dir::Long => "long",
            Dir::Short => "short",
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> f64 {
        match self {
            Dir::Long => 1.0,
            Dir::Short => -1.0,
        }
    }
}

/// Market regime label assigned by the strategy's classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Trending,
    Ranging,
    #[default]
    Neutral,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Trending => "trending",
            Regime::Ranging => "ranging",
            Regime::Neutral => "neutral",
        }
    }
}

/// Dominant sub-signal behind a target, used for trade attribution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStrategy {
    Trend,
    Mr,
    Breakout,
    Fallback,
    #[default]
    Unknown,
}

impl SubStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubStrategy::Trend => "trend",
            SubStrategy::Mr => "mr",
            SubStrategy::Breakout => "breakout",
            SubStrategy::Fallback => "fallback",
            SubStrategy::Unknown => "unknown",
        }
    }
}

/// Why a risk stop closed a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    AtrStop,
    AtrTrail,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::AtrStop => "atr_stop",
            StopReason::AtrTrail => "atr_trail",
        }
    }
}

/// Diagnostic payload attached to strategy signals. Copied onto the pending
/// fill so closed trades can report where their exposure came from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalMeta {
    pub trend_component: f64,
    pub mr_component: f64,
    pub breakout_component: f64,
    pub fallback_component: f64,
    pub regime: Regime,
    pub mtf_alignment: f64,
    pub sub_strategy: SubStrategy,
    pub atr: f64,
}

// ---------------------------------------------------------------------------
// Trade and equity records
// ---------------------------------------------------------------------------

/// One closed round trip. Created when a fill crosses or reaches zero;
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub inst_id: String,
    pub dir: Dir,
    pub entry_ts: i64,
    pub entry_price: f64,
    pub exit_ts: i64,
    pub exit_price: f64,
    /// Relative position magnitude held over the round trip.
    pub size: f64,
    /// `sign(dir) * ln(exit/entry) * size`.
    #[serde(rename = "return")]
    pub ret: f64,
    pub sub_strategy: SubStrategy,
    pub regime: Regime,
    pub stop_type: Option<StopReason>,
    pub atr_on_entry: f64,
}

/// One equity-curve sample per bar-group timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: i64,
    pub equity: f64,
    pub ret: f64,
    pub drawdown: f64,
}

// ---------------------------------------------------------------------------
// Kernel-internal per-instrument state
// ---------------------------------------------------------------------------

/// A fill scheduled for `apply_ts`, tagged with the meta of the signal (or
/// stop action) that produced it.
#[derive(Debug, Clone)]
pub struct PendingFill {
    pub target: f64,
    pub apply_ts: i64,
    pub meta: SignalMeta,
    pub stop: Option<StopReason>,
}

/// Kernel-owned state for a single instrument.
///
/// Invariants: `position == 0` implies `entry_price == 0`;
/// `pending.apply_ts` is never before the timestamp that scheduled it.
#[derive(Debug, Clone, Default)]
pub struct InstState {
    pub last_close: f64,
    pub position: f64,
    pub entry_price: f64,
    pub entry_ts: i64,
    pub holding_bars: usize,
    pub pending: Option<PendingFill>,
    /// Meta captured when the current position was opened; feeds the trade
    /// record on close.
    pub entry_meta: SignalMeta,
}
