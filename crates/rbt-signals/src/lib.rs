//! Regime-switching strategy adapter.
//!
//! Blends trend, mean-reversion and breakout sub-signals per instrument,
//! reweighted by an ADX / Bollinger-bandwidth regime classifier, gated by a
//! higher-timeframe trend-alignment scaler, with a simple moving-average
//! fallback rule when no regime speaks clearly.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::Serialize;

use rbt_core::candle::Candle;
use rbt_core::config::{timeframe_minutes, RiskConfig, StrategyConfig};
use rbt_core::engine::{Signal, Strategy};
use rbt_core::indicators::rolling::{
    bollinger_bandwidth, ema_last, max_last, min_last, push_capped, sign, sma_last, softsign,
    std_last,
};
use rbt_core::indicators::{AdxTracker, AtrTracker, Ema};
use rbt_core::position::{Regime, SignalMeta, SubStrategy};

const STRATEGY_NAME: &str = "regime_dynamic_v1";
/// Closes required before the first signal.
const WARMUP_CLOSES: usize = 50;
/// Targets below this magnitude are not worth a signal.
const MIN_EMIT: f64 = 1e-4;

// ---------------------------------------------------------------------------
// Per-instrument window state
// ---------------------------------------------------------------------------

struct InstrumentWindow {
    closes: Vec<f64>,
    highs: Vec<f64>,
    lows: Vec<f64>,
    adx: AdxTracker,
    atr: AtrTracker,
    mtf_fast: Ema,
    mtf_slow: Ema,
    last_close: f64,
}

impl InstrumentWindow {
    fn new(adx_period: usize, atr_period: usize, ratio: i64) -> Self {
        let fast_period = (4 * ratio).max(8) as usize;
        let slow_period = (8 * ratio).max(16) as usize;
        Self {
            closes: Vec::with_capacity(1024),
            highs: Vec::with_capacity(1024),
            lows: Vec::with_capacity(1024),
            adx: AdxTracker::new(adx_period),
            atr: AtrTracker::new(atr_period),
            mtf_fast: Ema::new(fast_period),
            mtf_slow: Ema::new(slow_period),
            last_close: 0.0,
        }
    }

    fn update(&mut self, c: &Candle, cap: usize) {
        push_capped(&mut self.closes, c.c, cap);
        push_capped(&mut self.highs, c.h, cap);
        push_capped(&mut self.lows, c.l, cap);
        self.adx.update(c.h, c.l, c.c);
        self.atr.update(c.h, c.l, self.last_close);
        self.mtf_fast.update(c.c);
        self.mtf_slow.update(c.c);
        self.last_close = c.c;
    }
}

struct RegimeWeights {
    trend: f64,
    mr: f64,
    breakout: f64,
}

// ---------------------------------------------------------------------------
// Strategy adapter
// ---------------------------------------------------------------------------

pub struct RegimeStrategy {
    cfg: StrategyConfig,
    risk_cfg: RiskConfig,
    higher_tf_minutes: i64,
    bar_minutes: i64,

    states: FxHashMap<String, InstrumentWindow>,

    mtf_checks: u64,
    mtf_aligned: u64,
    mtf_filtered: u64,
    fallback_used: u64,
    regime_counts: BTreeMap<String, u64>,
}

/// Run counters for the end-of-run report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategySummary {
    pub regime_counts: BTreeMap<String, u64>,
    pub mtf_checks: u64,
    pub mtf_aligned: u64,
    pub mtf_filtered: u64,
    pub fallback_usage: u64,
}

impl RegimeStrategy {
    pub fn new(cfg: StrategyConfig, risk_cfg: RiskConfig, bar_minutes: i64) -> Self {
        let higher = timeframe_minutes(&cfg.mtf.higher_tf)
            .filter(|m| *m > 0)
            .unwrap_or(bar_minutes);
        Self {
            cfg,
            risk_cfg,
            higher_tf_minutes: higher,
            bar_minutes: bar_minutes.max(1),
            states: FxHashMap::default(),
            mtf_checks: 0,
            mtf_aligned: 0,
            mtf_filtered: 0,
            fallback_used: 0,
            regime_counts: BTreeMap::new(),
        }
    }

    pub fn summary(&self) -> StrategySummary {
        StrategySummary {
            regime_counts: self.regime_counts.clone(),
            mtf_checks: self.mtf_checks,
            mtf_aligned: self.mtf_aligned,
            mtf_filtered: self.mtf_filtered,
            fallback_usage: self.fallback_used,
        }
    }

    fn max_abs_position(&self) -> f64 {
        if self.risk_cfg.max_abs_position > 0.0 {
            self.risk_cfg.max_abs_position
        } else {
            1.0
        }
    }

    fn ensure_state(&mut self, inst: &str) -> &mut InstrumentWindow {
        let adx_period = self.cfg.regime.trend_adx_period.max(2);
        let atr_period = self.risk_cfg.atr_period.max(1);
        let ratio = (self.higher_tf_minutes / self.bar_minutes.max(1)).max(1);
        self.states
            .entry(inst.to_string())
            .or_insert_with(|| InstrumentWindow::new(adx_period, atr_period, ratio))
    }

    // -- sub-signals --------------------------------------------------------

    fn trend_signal(st: &InstrumentWindow) -> f64 {
        let fast = ema_last(&st.closes, 8);
        let slow = ema_last(&st.closes, 32);
        if slow == 0.0 {
            return 0.0;
        }
        softsign((fast - slow) / slow)
    }

    fn mean_reversion_signal(&self, st: &InstrumentWindow) -> f64 {
        let period = self.cfg.regime.range_bw_period;
        if period == 0 || st.closes.len() < period {
            return 0.0;
        }
        let mean = sma_last(&st.closes, period);
        let std = std_last(&st.closes, period);
        if std <= 0.0 {
            return 0.0;
        }
        let z = (st.closes[st.closes.len() - 1] - mean) / std;
        -softsign(z)
    }

    fn breakout_signal(&self, st: &InstrumentWindow) -> f64 {
        let lookback = 2 * self.cfg.regime.range_bw_period;
        if lookback == 0 || st.highs.len() < lookback || st.lows.len() < lookback {
            return 0.0;
        }
        let price = st.closes[st.closes.len() - 1];
        let hi = max_last(&st.highs, lookback);
        let lo = min_last(&st.lows, lookback);
        if price >= hi {
            return 1.0;
        }
        if price <= lo {
            return -1.0;
        }
        let mid = (hi + lo) / 2.0;
        if mid == 0.0 {
            return 0.0;
        }
        softsign((price - mid) / (hi - lo + 1e-9))
    }

    // -- regime classification ----------------------------------------------

    fn detect_regime(&mut self, inst: &str) -> Regime {
        let enabled = self.cfg.regime.enable.unwrap_or(true);
        if !enabled {
            return self.record_regime(Regime::Neutral);
        }
        let st = &self.states[inst];
        if st.adx.value() >= self.cfg.regime.trend_adx_th {
            return self.record_regime(Regime::Trending);
        }
        let bw = bollinger_bandwidth(&st.closes, self.cfg.regime.range_bw_period);
        if bw > 0.0 && bw <= self.cfg.regime.range_bw_th {
            return self.record_regime(Regime::Ranging);
        }
        self.record_regime(Regime::Neutral)
    }

    fn record_regime(&mut self, regime: Regime) -> Regime {
        *self
            .regime_counts
            .entry(regime.as_str().to_string())
            .or_insert(0) += 1;
        regime
    }

    fn weights_for(&self, regime: Regime) -> RegimeWeights {
        let mut w = RegimeWeights {
            trend: self.cfg.trend_gain,
            mr: self.cfg.mr_gain,
            breakout: self.cfg.breakout_gain,
        };
        match regime {
            Regime::Trending => {
                w.trend *= 1.35;
                w.breakout *= 1.25;
                w.mr *= 0.65;
            }
            Regime::Ranging => {
                w.mr *= 1.5;
                w.trend *= 0.6;
                w.breakout *= 0.6;
            }
            Regime::Neutral => {}
        }
        w
    }

    // -- multi-timeframe gate -----------------------------------------------

    fn multi_timeframe_scaler(&mut self, trend_signal: f64, inst: &str) -> f64 {
        if !self.cfg.mtf.confirm_enable.unwrap_or(true) {
            return 1.0;
        }
        self.mtf_checks += 1;
        let st = &self.states[inst];
        let fast = st.mtf_fast.value();
        let slow = st.mtf_slow.value();
        if fast == 0.0 || slow == 0.0 {
            return 1.0;
        }
        let diff = fast - slow;
        if diff == 0.0 || trend_signal == 0.0 {
            return 1.0;
        }
        if self.cfg.mtf.trend_align.unwrap_or(true) {
            if diff * trend_signal < 0.0 {
                self.mtf_filtered += 1;
                return 0.6;
            }
            self.mtf_aligned += 1;
            return 1.25;
        }
        1.0
    }

    // -- fallback -----------------------------------------------------------

    fn should_use_fallback(&self, pos: f64, strong_signal: bool) -> bool {
        if !self.cfg.fallback.enable.unwrap_or(true) {
            return false;
        }
        if strong_signal {
            return false;
        }
        pos.abs() < 0.1
    }

    fn fallback_signal(&self, st: &InstrumentWindow) -> f64 {
        let period = self.cfg.fallback.ma_period;
        if period == 0 || st.closes.len() < period {
            return 0.0;
        }
        let ma = sma_last(&st.closes, period);
        let price = st.closes[st.closes.len() - 1];
        self.cfg.fallback.scale * sign(price - ma)
    }
}

fn dominant_component(trend: f64, mr: f64, breakout: f64, fallback: f64) -> SubStrategy {
    if fallback != 0.0 {
        return SubStrategy::Fallback;
    }
    let mut label = SubStrategy::Trend;
    let mut max_val = trend.abs();
    if mr.abs() > max_val {
        max_val = mr.abs();
        label = SubStrategy::Mr;
    }
    if breakout.abs() > max_val {
        label = SubStrategy::Breakout;
    }
    label
}

impl Strategy for RegimeStrategy {
    fn name(&self) -> &str {
        STRATEGY_NAME
    }

    fn on_candle(&mut self, c: &Candle) -> Vec<Signal> {
        let cap = self.cfg.history_cap.max(WARMUP_CLOSES);
        let st = self.ensure_state(&c.inst_id);
        st.update(c, cap);
        if st.closes.len() < WARMUP_CLOSES {
            return Vec::new();
        }

        let st = &self.states[&c.inst_id];
        let trend = Self::trend_signal(st);
        let mr = self.mean_reversion_signal(st);
        let breakout = self.breakout_signal(st);
        let atr = st.atr.value();

        let regime = self.detect_regime(&c.inst_id);
        let weights = self.weights_for(regime);
        let alignment = self.multi_timeframe_scaler(trend, &c.inst_id);

        let trend_component = weights.trend * trend * alignment;
        let mr_component = weights.mr * mr * alignment;
        let breakout_component = weights.breakout * breakout * alignment;
        let mut pos_raw = trend_component + mr_component + breakout_component;

        let mut strong_signal = matches!(regime, Regime::Trending | Regime::Ranging);
        if !self.cfg.fallback.enable.unwrap_or(true) {
            strong_signal = true;
        }
        let mut fallback_component = 0.0;
        if self.should_use_fallback(pos_raw, strong_signal) {
            fallback_component = self.fallback_signal(&self.states[&c.inst_id]);
            if fallback_component != 0.0 {
                pos_raw += fallback_component;
                self.fallback_used += 1;
            }
        }

        let max_abs = self.max_abs_position();
        let pos = pos_raw.clamp(-max_abs, max_abs);
        if pos.abs() < MIN_EMIT {
            return Vec::new();
        }

        let meta = SignalMeta {
            trend_component,
            mr_component,
            breakout_component,
            fallback_component,
            regime,
            mtf_alignment: alignment,
            sub_strategy: dominant_component(
                trend_component,
                mr_component,
                breakout_component,
                fallback_component,
            ),
            atr,
        };
        vec![Signal::from_target(&c.inst_id, pos, c.c, "regime_target", meta)]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rbt_core::engine::SignalKind;

    fn base_cfg() -> (StrategyConfig, RiskConfig) {
        let mut cfg = rbt_core::config::BacktestConfig::default();
        cfg.normalize();
        (cfg.strategy, cfg.risk)
    }

    fn candle(inst: &str, i: i64, o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle {
            inst_id: inst.to_string(),
            t: 1_000_000 + i * 900_000,
            o,
            h,
            l,
            c,
            v: 1.0,
        }
    }

    fn feed_flatish(sa: &mut RegimeStrategy, inst: &str, n: i64) {
        for i in 0..n {
            // Small oscillation around 100 keeps every tracker finite.
            let wobble = if i % 2 == 0 { 0.2 } else { -0.2 };
            let px = 100.0 + wobble;
            sa.on_candle(&candle(inst, i, px, px + 0.3, px - 0.3, px));
        }
    }

    #[test]
    fn regime_weights_shift_with_classification() {
        let (mut scfg, rcfg) = base_cfg();
        scfg.trend_gain = 1.0;
        scfg.mr_gain = 1.0;
        scfg.breakout_gain = 1.0;
        let sa = RegimeStrategy::new(scfg, rcfg, 15);

        let trending = sa.weights_for(Regime::Trending);
        assert!(trending.trend > 1.0);
        assert!(trending.mr < 1.0);
        assert!(trending.breakout > 1.0);

        let ranging = sa.weights_for(Regime::Ranging);
        assert!(ranging.mr > 1.0);
        assert!(ranging.trend < 1.0);
        assert!(ranging.breakout < 1.0);

        let neutral = sa.weights_for(Regime::Neutral);
        assert_eq!(neutral.trend, 1.0);
        assert_eq!(neutral.mr, 1.0);
        assert_eq!(neutral.breakout, 1.0);
    }

    #[test]
    fn fallback_gate_requires_light_weak_exposure() {
        let (scfg, rcfg) = base_cfg();
        let sa = RegimeStrategy::new(scfg, rcfg, 15);
        assert!(sa.should_use_fallback(0.05, false));
        assert!(!sa.should_use_fallback(0.2, false));
        assert!(!sa.should_use_fallback(0.05, true));
    }

    #[test]
    fn fallback_disabled_never_triggers() {
        let (mut scfg, rcfg) = base_cfg();
        scfg.fallback.enable = Some(false);
        let sa = RegimeStrategy::new(scfg, rcfg, 15);
        assert!(!sa.should_use_fallback(0.05, false));
    }

    #[test]
    fn no_signals_before_warmup() {
        let (scfg, rcfg) = base_cfg();
        let mut sa = RegimeStrategy::new(scfg, rcfg, 15);
        for i in 0..(WARMUP_CLOSES as i64 - 1) {
            let px = 100.0 + (i as f64) * 0.1;
            let out = sa.on_candle(&candle("X", i, px, px + 0.5, px - 0.5, px));
            assert!(out.is_empty(), "signal before warmup at bar {i}");
        }
    }

    #[test]
    fn breakout_saturates_at_channel_extremes() {
        let (scfg, rcfg) = base_cfg();
        let mut sa = RegimeStrategy::new(scfg, rcfg, 15);
        feed_flatish(&mut sa, "X", 60);
        // A burst through the 40-bar channel top must read +1.
        sa.on_candle(&candle("X", 60, 100.0, 110.0, 100.0, 110.0));
        let st = &sa.states["X"];
        assert_eq!(sa.breakout_signal(st), 1.0);
        // And a collapse through the bottom reads -1.
        sa.on_candle(&candle("X", 61, 110.0, 110.0, 80.0, 80.0));
        let st = &sa.states["X"];
        assert_eq!(sa.breakout_signal(st), -1.0);
    }

    #[test]
    fn mean_reversion_leans_against_deviation() {
        let (scfg, rcfg) = base_cfg();
        let mut sa = RegimeStrategy::new(scfg, rcfg, 15);
        feed_flatish(&mut sa, "X", 60);
        sa.on_candle(&candle("X", 60, 100.0, 104.0, 100.0, 104.0));
        let st = &sa.states["X"];
        assert!(sa.mean_reversion_signal(st) < 0.0);
        sa.on_candle(&candle("X", 61, 104.0, 104.0, 96.0, 96.0));
        let st = &sa.states["X"];
        assert!(sa.mean_reversion_signal(st) > 0.0);
    }

    #[test]
    fn mtf_misalignment_scales_down_and_counts() {
        let (scfg, rcfg) = base_cfg();
        let mut sa = RegimeStrategy::new(scfg, rcfg, 15);
        // Long downtrend: higher-timeframe fast EMA sits below the slow EMA.
        for i in 0..120 {
            let px = 200.0 - i as f64;
            sa.on_candle(&candle("X", i, px, px + 0.5, px - 0.5, px));
        }
        let st = &sa.states["X"];
        assert!(st.mtf_fast.value() < st.mtf_slow.value());

        let s = sa.multi_timeframe_scaler(0.5, "X");
        assert_eq!(s, 0.6);
        assert_eq!(sa.mtf_filtered, 1);
        assert_eq!(sa.mtf_aligned, 0);

        let s = sa.multi_timeframe_scaler(-0.5, "X");
        assert_eq!(s, 1.25);
        assert_eq!(sa.mtf_aligned, 1);
        assert_eq!(sa.mtf_checks, 2);
    }

    #[test]
    fn mtf_disabled_is_transparent() {
        let (mut scfg, rcfg) = base_cfg();
        scfg.mtf.confirm_enable = Some(false);
        let mut sa = RegimeStrategy::new(scfg, rcfg, 15);
        feed_flatish(&mut sa, "X", 60);
        assert_eq!(sa.multi_timeframe_scaler(0.9, "X"), 1.0);
        assert_eq!(sa.mtf_checks, 0);
    }

    #[test]
    fn uptrend_classifies_trending_and_goes_long() {
        let (scfg, rcfg) = base_cfg();
        let mut sa = RegimeStrategy::new(scfg, rcfg, 15);
        let mut last = Vec::new();
        for i in 0..120 {
            let px = 100.0 * 1.002f64.powi(i as i32);
            last = sa.on_candle(&candle("X", i, px, px * 1.001, px * 0.999, px));
        }
        assert_eq!(last.len(), 1);
        let sig = &last[0];
        match sig.kind {
            SignalKind::BuyTo(size) => assert!(size > 0.0),
            other => panic!("uptrend must target long exposure, got {other:?}"),
        }
        assert_eq!(sig.meta.regime, Regime::Trending);
        assert!(sig.meta.mtf_alignment >= 1.0);
        assert!(sig.meta.atr > 0.0);
        assert!(sa.summary().regime_counts["trending"] > 0);
    }

    #[test]
    fn dominant_component_prefers_fallback_then_magnitude() {
        assert_eq!(dominant_component(0.2, -0.5, 0.1, 0.0), SubStrategy::Mr);
        assert_eq!(dominant_component(0.9, -0.5, 0.1, 0.0), SubStrategy::Trend);
        assert_eq!(dominant_component(0.2, -0.5, 0.8, 0.0), SubStrategy::Breakout);
        assert_eq!(dominant_component(0.9, -0.5, 0.8, 0.3), SubStrategy::Fallback);
    }

    #[test]
    fn regime_disabled_stays_neutral() {
        let (mut scfg, rcfg) = base_cfg();
        scfg.regime.enable = Some(false);
        let mut sa = RegimeStrategy::new(scfg, rcfg, 15);
        for i in 0..80 {
            let px = 100.0 + i as f64; // would otherwise classify trending
            sa.on_candle(&candle("X", i, px, px + 1.0, px - 1.0, px));
        }
        let summary = sa.summary();
        assert!(summary.regime_counts.get("trending").is_none());
        assert!(summary.regime_counts["neutral"] > 0);
    }
}
