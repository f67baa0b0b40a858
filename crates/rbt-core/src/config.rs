//! Backtest configuration: JSON schema, defaults, legacy-field folding and
//! fail-fast validation.
//!
//! The on-disk shape follows the historical flat config: a handful of
//! top-level switches plus nested `strategy` / `risk` / `execution` /
//! `portfolio` / `optimization` sections. Zero-valued tunables are treated as
//! "unset" and resolved by [`BacktestConfig::normalize`], which also folds the
//! accepted legacy flat fields (`strategy_*`, `fallback_scale`) into the
//! nested sections.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Timeframes
// ---------------------------------------------------------------------------

/// Milliseconds per bar for a timeframe token, or `None` when unknown.
pub fn timeframe_step_ms(tf: &str) -> Option<i64> {
    match tf.trim().to_ascii_lowercase().as_str() {
        "1m" => Some(60_000),
        "5m" => Some(300_000),
        "15m" => Some(900_000),
        "30m" => Some(1_800_000),
        "1h" => Some(3_600_000),
        "4h" => Some(14_400_000),
        "1d" => Some(86_400_000),
        _ => None,
    }
}

/// Bar length in minutes for a timeframe token.
pub fn timeframe_minutes(tf: &str) -> Option<i64> {
    timeframe_step_ms(tf).map(|ms| ms / 60_000)
}

// ---------------------------------------------------------------------------
// Nested sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub trend_gain: f64,
    pub mr_gain: f64,
    pub breakout_gain: f64,
    /// Price-history cap per instrument (bars kept for rolling windows).
    pub history_cap: usize,
    pub regime: RegimeConfig,
    pub mtf: MtfConfig,
    pub fallback: FallbackConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    pub enable: Option<bool>,
    pub trend_adx_period: usize,
    pub trend_adx_th: f64,
    pub range_bw_period: usize,
    pub range_bw_th: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MtfConfig {
    pub confirm_enable: Option<bool>,
    pub higher_tf: String,
    pub trend_align: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enable: Option<bool>,
    pub scale: f64,
    pub ma_period: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub risk_target: f64,
    pub atr_period: usize,
    pub atr_stop_k: f64,
    pub atr_trail_k: f64,
    pub max_leverage: f64,
    pub max_abs_position: f64,
    pub dd_circuit: DdCircuitConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DdCircuitConfig {
    pub enable: Option<bool>,
    pub threshold: f64,
    pub cooldown_bars: usize,
}

/// Kernel execution model: fill timing, costs and rebalance gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub trade_on_next_bar: bool,
    pub taker_fee_bps: f64,
    pub maker_fee_bps: f64,
    pub slippage_bps: f64,
    pub use_maker: bool,
    pub min_rebalance_step: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            trade_on_next_bar: true,
            taker_fee_bps: 6.0,
            maker_fee_bps: 0.0,
            slippage_bps: 3.0,
            use_maker: false,
            min_rebalance_step: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    pub target_vol_annual: f64,
    pub max_leverage: f64,
    /// Gross exposure cap (sum of |w|). Zero means "equal to max_leverage".
    pub max_gross: f64,
    pub cash_buffer_pct: f64,
    pub use_risk_parity: bool,
    pub use_min_var_approx: bool,
    pub ew_half_life_vol: usize,
    pub ew_half_life_corr: usize,
    pub rebalance_interval_bars: usize,
    pub drift_threshold: f64,
    pub turnover_cap: f64,
    pub vol_floor: f64,
    pub strategy_weights: BTreeMap<String, f64>,
    pub strategy_learn: bool,
    pub per_instrument_max: BTreeMap<String, f64>,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            target_vol_annual: 0.20,
            max_leverage: 2.0,
            max_gross: 2.0,
            cash_buffer_pct: 0.02,
            use_risk_parity: true,
            use_min_var_approx: false,
            ew_half_life_vol: 96,
            ew_half_life_corr: 256,
            rebalance_interval_bars: 24,
            drift_threshold: 0.05,
            turnover_cap: 0.9,
            vol_floor: 1e-4,
            strategy_weights: BTreeMap::new(),
            strategy_learn: false,
            per_instrument_max: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub enable: Option<bool>,
    pub max_samples: usize,
    pub seed: u64,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub start_date: String,
    pub end_date: String,
    pub initial_cash: f64,
    pub bars_limit: usize,
    pub timeframe: String,
    pub instruments: Vec<String>,
    pub data_source: String,
    pub data_path: String,
    pub auto_fetch_if_missing: bool,
    pub use_risk: bool,
    pub use_portfolio: bool,

    // Legacy flat strategy fields. normalize() fills them with the
    // engine-wide defaults and the nested sections fall back to them, so
    // older flat configs keep working and a bare config gets the same
    // effective values either way.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_risk_target: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_max_abs_position: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_max_leverage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_trend_gain: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_mr_gain: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_breakout_gain: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_scale: Option<f64>,

    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub portfolio: PortfolioConfig,
    pub optimization: OptimizationConfig,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            start_date: "2024-01-01".to_string(),
            end_date: "2024-12-01".to_string(),
            initial_cash: 10_000.0,
            bars_limit: 2000,
            timeframe: "15m".to_string(),
            instruments: vec!["BTC-USDT-SWAP".to_string()],
            data_source: "csv".to_string(),
            data_path: "./data/candles".to_string(),
            auto_fetch_if_missing: false,
            use_risk: true,
            use_portfolio: false,
            strategy_risk_target: None,
            strategy_max_abs_position: None,
            strategy_max_leverage: None,
            strategy_trend_gain: None,
            strategy_mr_gain: None,
            strategy_breakout_gain: None,
            fallback_scale: None,
            strategy: StrategyConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            portfolio: PortfolioConfig::default(),
            optimization: OptimizationConfig::default(),
        }
    }
}

fn nonzero_or(x: f64, fallback: f64) -> f64 {
    if x > 0.0 {
        x
    } else {
        fallback
    }
}

fn nonzero_or_usize(x: usize, fallback: usize) -> usize {
    if x > 0 {
        x
    } else {
        fallback
    }
}

impl BacktestConfig {
    /// Resolve every unset (zero / None) tunable to its default. Two-phase:
    /// the legacy flat fields are filled with the engine-wide defaults
    /// first, then every unset nested value falls back to its flat
    /// counterpart, so an explicit JSON value wins at either level.
    /// Idempotent.
    pub fn normalize(&mut self) {
        if self.initial_cash == 0.0 {
            self.initial_cash = 10_000.0;
        }
        self.bars_limit = nonzero_or_usize(self.bars_limit, 2000);
        if self.timeframe.trim().is_empty() {
            self.timeframe = "15m".to_string();
        }

        fn positive_or(v: Option<f64>, fallback: f64) -> f64 {
            v.filter(|x| *x > 0.0).unwrap_or(fallback)
        }
        let risk_target = positive_or(self.strategy_risk_target, 1.0);
        let max_abs_position = positive_or(self.strategy_max_abs_position, 2.0);
        let max_leverage = positive_or(self.strategy_max_leverage, 3.0);
        let trend_gain = positive_or(self.strategy_trend_gain, 3.0);
        let mr_gain = positive_or(self.strategy_mr_gain, 0.30);
        let breakout_gain = positive_or(self.strategy_breakout_gain, 1.0);
        let fallback_scale = positive_or(self.fallback_scale, 1.0);
        self.strategy_risk_target = Some(risk_target);
        self.strategy_max_abs_position = Some(max_abs_position);
        self.strategy_max_leverage = Some(max_leverage);
        self.strategy_trend_gain = Some(trend_gain);
        self.strategy_mr_gain = Some(mr_gain);
        self.strategy_breakout_gain = Some(breakout_gain);
        self.fallback_scale = Some(fallback_scale);

        let s = &mut self.strategy;
        s.trend_gain = nonzero_or(s.trend_gain, trend_gain);
        s.mr_gain = nonzero_or(s.mr_gain, mr_gain);
        s.breakout_gain = nonzero_or(s.breakout_gain, breakout_gain);
        s.history_cap = nonzero_or_usize(s.history_cap, 3000);

        let rg = &mut s.regime;
        rg.enable.get_or_insert(true);
        rg.trend_adx_period = nonzero_or_usize(rg.trend_adx_period, 14);
        rg.trend_adx_th = nonzero_or(rg.trend_adx_th, 20.0);
        rg.range_bw_period = nonzero_or_usize(rg.range_bw_period, 20);
        rg.range_bw_th = nonzero_or(rg.range_bw_th, 0.05);

        let mtf = &mut s.mtf;
        mtf.confirm_enable.get_or_insert(true);
        if mtf.higher_tf.trim().is_empty() {
            mtf.higher_tf = "1h".to_string();
        }
        mtf.trend_align.get_or_insert(true);

        let fb = &mut s.fallback;
        fb.enable.get_or_insert(true);
        fb.scale = nonzero_or(fb.scale, fallback_scale);
        fb.ma_period = nonzero_or_usize(fb.ma_period, 100);

        let r = &mut self.risk;
        r.risk_target = nonzero_or(r.risk_target, risk_target);
        r.atr_period = nonzero_or_usize(r.atr_period, 14);
        r.atr_stop_k = nonzero_or(r.atr_stop_k, 2.5);
        r.atr_trail_k = nonzero_or(r.atr_trail_k, 3.0);
        r.max_abs_position = nonzero_or(r.max_abs_position, max_abs_position);
        r.max_leverage = nonzero_or(r.max_leverage, max_leverage);
        let dd = &mut r.dd_circuit;
        dd.enable.get_or_insert(true);
        dd.threshold = nonzero_or(dd.threshold, 0.15);
        dd.cooldown_bars = nonzero_or_usize(dd.cooldown_bars, 96);

        let o = &mut self.optimization;
        o.enable.get_or_insert(true);
        o.max_samples = nonzero_or_usize(o.max_samples, 60);
        if o.seed == 0 {
            o.seed = 42;
        }
    }

    /// Fail-fast checks run before any data is loaded.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_cash <= 0.0 {
            return Err(ConfigError::InvalidInitialCash(self.initial_cash));
        }
        if self.instruments.is_empty() {
            return Err(ConfigError::NoInstruments);
        }
        if timeframe_step_ms(&self.timeframe).is_none() {
            return Err(ConfigError::UnknownTimeframe(self.timeframe.clone()));
        }
        match self.data_source.trim().to_ascii_lowercase().as_str() {
            "csv" | "api" => {}
            other => return Err(ConfigError::UnknownDataSource(other.to_string())),
        }
        Ok(())
    }

    /// Base bar length in minutes. Only valid after [`Self::validate`].
    pub fn bar_minutes(&self) -> i64 {
        timeframe_minutes(&self.timeframe).unwrap_or(15)
    }

    /// Load a config from `path`, or write a fully-populated default config
    /// there when the file does not exist.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let mut cfg = Self::default();
            cfg.normalize();
            let body = serde_json::to_string_pretty(&cfg)?;
            std::fs::write(path, body)?;
            return Ok(cfg);
        }
        let raw = std::fs::read_to_string(path)?;
        let mut cfg: Self = serde_json::from_str(&raw)?;
        cfg.normalize();
        Ok(cfg)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
