//! Risk overlay adapter.
//!
//! Tracks a shadow equity curve from approved positions and applies, in
//! order: ATR initial and trailing stops, volatility-target position scaling
//! (with the drawdown circuit's scaler folded in), then hard position and
//! leverage clamps.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::Serialize;

use rbt_core::candle::Candle;
use rbt_core::config::RiskConfig;
use rbt_core::engine::{Action, ActionKind, Risk};
use rbt_core::indicators::AtrTracker;
use rbt_core::position::StopReason;

// ---------------------------------------------------------------------------
// Per-instrument risk state
// ---------------------------------------------------------------------------

struct InstrumentRisk {
    atr: AtrTracker,
    position: f64,
    entry_price: f64,
    /// Running best price in the position's favor; anchors the trailing stop.
    max_favorable: f64,
    last_close: f64,
}

impl InstrumentRisk {
    fn new(atr_period: usize) -> Self {
        Self {
            atr: AtrTracker::new(atr_period),
            position: 0.0,
            entry_price: 0.0,
            max_favorable: 0.0,
            last_close: 0.0,
        }
    }

    fn reset_position(&mut self) {
        self.position = 0.0;
        self.entry_price = 0.0;
        self.max_favorable = 0.0;
    }
}

/// One drawdown-circuit interval, closed when the cooldown expires (or when
/// the summary is taken while still active).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DdWindow {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskSummary {
    pub stop_counts: BTreeMap<String, u64>,
    pub dd_windows: Vec<DdWindow>,
}

// ---------------------------------------------------------------------------
// Overlay
// ---------------------------------------------------------------------------

pub struct RiskOverlay {
    cfg: RiskConfig,

    states: FxHashMap<String, InstrumentRisk>,

    equity: f64,
    peak_equity: f64,
    dd_cooldown: usize,
    dd_scaler: f64,
    dd_active: bool,
    dd_start: i64,
    dd_events: Vec<DdWindow>,
    stop_counts: BTreeMap<String, u64>,
    last_ts: i64,
}

impl RiskOverlay {
    pub fn new(cfg: RiskConfig) -> Self {
        Self {
            cfg,
            states: FxHashMap::default(),
            equity: 1.0,
            peak_equity: 1.0,
            dd_cooldown: 0,
            dd_scaler: 1.0,
            dd_active: false,
            dd_start: 0,
            dd_events: Vec::new(),
            stop_counts: BTreeMap::new(),
            last_ts: 0,
        }
    }

    /// Effective risk scaler while the drawdown circuit is tripped.
    pub fn dd_scaler(&self) -> f64 {
        self.dd_scaler
    }

    /// Stop counters and drawdown windows. An interval still open when the
    /// summary is taken is flushed with the last seen timestamp as its end.
    pub fn summary(&mut self) -> RiskSummary {
        if self.dd_active {
            let end = if self.last_ts != 0 {
                self.last_ts
            } else {
                self.dd_events.last().map(|w| w.end).unwrap_or(self.dd_start)
            };
            self.dd_events.push(DdWindow {
                start: self.dd_start,
                end,
            });
            self.dd_active = false;
        }
        RiskSummary {
            stop_counts: self.stop_counts.clone(),
            dd_windows: self.dd_events.clone(),
        }
    }

    fn ensure_state(&mut self, inst: &str) -> &mut InstrumentRisk {
        let atr_period = self.cfg.atr_period.max(1);
        self.states
            .entry(inst.to_string())
            .or_insert_with(|| InstrumentRisk::new(atr_period))
    }

    fn vol_target(&self, target: f64, price: f64, atr: f64) -> f64 {
        if atr <= 0.0 || price <= 0.0 {
            return target;
        }
        let risk_target = self.cfg.risk_target * self.dd_scaler;
        let per_bar_vol = atr / price;
        if per_bar_vol <= 0.0 {
            return target;
        }
        let mut scale = risk_target / per_bar_vol.max(1e-6);
        if self.cfg.max_leverage > 0.0 {
            scale = scale.min(self.cfg.max_leverage);
        }
        target * scale
    }

    fn check_stops(&mut self, inst: &str, price: f64) -> Option<Action> {
        let st = self.states.get(inst)?;
        if st.position == 0.0 || price <= 0.0 {
            return None;
        }
        let atr = st.atr.value();
        if atr <= 0.0 || st.entry_price <= 0.0 {
            return None;
        }

        let stop_dist = self.cfg.atr_stop_k * atr;
        let trail_dist = self.cfg.atr_trail_k * atr;
        let stopped_out = if st.position > 0.0 && price <= st.entry_price - stop_dist {
            Some(StopReason::AtrStop)
        } else if st.position < 0.0 && price >= st.entry_price + stop_dist {
            Some(StopReason::AtrStop)
        } else if st.position > 0.0
            && st.max_favorable > 0.0
            && price <= st.max_favorable - trail_dist
        {
            Some(StopReason::AtrTrail)
        } else if st.position < 0.0
            && st.max_favorable > 0.0
            && price >= st.max_favorable + trail_dist
        {
            Some(StopReason::AtrTrail)
        } else {
            None
        };
        let reason = stopped_out?;

        let size = st.position.abs();
        *self
            .stop_counts
            .entry(reason.as_str().to_string())
            .or_insert(0) += 1;
        Some(Action {
            inst_id: inst.to_string(),
            kind: ActionKind::Close,
            reason: Some(reason),
            size,
            price,
        })
    }

    fn evaluate_drawdown(&mut self, ts: i64) {
        if self.peak_equity <= 0.0 {
            self.peak_equity = 1.0;
        }
        let dd = (self.peak_equity - self.equity) / self.peak_equity;
        let circuit_on = self.cfg.dd_circuit.enable.unwrap_or(true);
        if circuit_on && dd >= self.cfg.dd_circuit.threshold && self.dd_cooldown == 0 {
            self.dd_scaler = 0.5;
            self.dd_cooldown = self.cfg.dd_circuit.cooldown_bars.max(1);
            self.dd_active = true;
            self.dd_start = ts;
        }
        if self.dd_cooldown > 0 {
            self.dd_cooldown -= 1;
            if self.dd_cooldown == 0 {
                self.dd_scaler = 1.0;
                if self.dd_active {
                    self.dd_events.push(DdWindow {
                        start: self.dd_start,
                        end: ts,
                    });
                    self.dd_active = false;
                }
            }
        }
    }
}

impl Risk for RiskOverlay {
    fn on_candle(&mut self, c: &Candle) {
        let st = self.ensure_state(&c.inst_id);
        st.atr.update(c.h, c.l, st.last_close);
        if st.position != 0.0 && st.last_close > 0.0 && c.c > 0.0 {
            let ret = (c.c / st.last_close).ln();
            let pos = st.position;
            if st.position > 0.0 {
                if c.h > st.max_favorable {
                    st.max_favorable = c.h;
                }
            } else if st.max_favorable == 0.0 || c.l < st.max_favorable {
                st.max_favorable = c.l;
            }
            st.last_close = c.c;
            self.equity *= (pos * ret).exp();
        } else {
            st.last_close = c.c;
        }
        if self.equity > self.peak_equity {
            self.peak_equity = self.equity;
        }
        self.evaluate_drawdown(c.t);
        self.last_ts = c.t;
    }

    fn approve(
        &mut self,
        inst: &str,
        current: f64,
        target: f64,
        price: f64,
        _holding_bars: usize,
    ) -> (f64, Vec<Action>) {
        self.ensure_state(inst);

        if let Some(action) = self.check_stops(inst, price) {
            if let Some(st) = self.states.get_mut(inst) {
                st.reset_position();
            }
            return (0.0, vec![action]);
        }

        let atr = self.states.get(inst).map(|s| s.atr.value()).unwrap_or(0.0);
        let mut scaled = self.vol_target(target, price, atr);

        let max_abs = if self.cfg.max_abs_position > 0.0 {
            self.cfg.max_abs_position
        } else {
            1.0
        };
        scaled = scaled.clamp(-max_abs, max_abs);
        if self.cfg.max_leverage > 0.0 {
            scaled = scaled.clamp(-self.cfg.max_leverage, self.cfg.max_leverage);
        }

        let st = self.ensure_state(inst);
        if current == 0.0 && scaled != 0.0 && price > 0.0 {
            st.entry_price = price;
            st.max_favorable = price;
        }
        if scaled == 0.0 {
            st.reset_position();
        } else {
            st.position = scaled;
        }
        (scaled, Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RiskConfig {
        let mut full = rbt_core::config::BacktestConfig::default();
        full.normalize();
        full.risk
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

    /// Feed bars with a fixed range so the ATR settles near `range`.
    fn warm_atr(ra: &mut RiskOverlay, inst: &str, px: f64, range: f64, n: i64) {
        for i in 0..n {
            ra.on_candle(&candle(inst, i, px, px + range / 2.0, px - range / 2.0, px));
        }
    }

    #[test]
    fn vol_target_scales_down_hot_instruments() {
        let mut rc = cfg();
        rc.risk_target = 0.3;
        rc.max_leverage = 2.0;
        let mut ra = RiskOverlay::new(rc);
        // ATR ~ 500 on a 1000 price: per-bar vol 0.5, well above target.
        warm_atr(&mut ra, "X", 1000.0, 500.0, 60);
        let (scaled, actions) = ra.approve("X", 0.0, 1.0, 1000.0, 0);
        assert!(actions.is_empty());
        assert!(scaled < 1.0, "expected vol targeting to shrink, got {scaled}");
        assert!(scaled > 0.0);
    }

    #[test]
    fn vol_target_cap_respects_max_leverage() {
        let mut rc = cfg();
        rc.risk_target = 0.5;
        rc.max_leverage = 2.0;
        rc.max_abs_position = 5.0;
        let mut ra = RiskOverlay::new(rc);
        // Tiny ATR: raw scale would explode, leverage caps it at 2.
        warm_atr(&mut ra, "X", 1000.0, 1.0, 60);
        let (scaled, _) = ra.approve("X", 0.0, 1.0, 1000.0, 0);
        assert!((scaled - 2.0).abs() < 1e-9, "scaled = {scaled}");
    }

    #[test]
    fn initial_stop_fires_for_longs_and_counts() {
        let mut rc = cfg();
        rc.atr_stop_k = 2.0;
        rc.max_leverage = 1.0;
        rc.risk_target = 1.0;
        let mut ra = RiskOverlay::new(rc);
        warm_atr(&mut ra, "X", 100.0, 1.0, 60);
        let (pos, _) = ra.approve("X", 0.0, 1.0, 100.0, 0);
        assert!(pos > 0.0);

        // Price collapses well past entry - 2*ATR.
        let (approved, actions) = ra.approve("X", pos, pos, 90.0, 5);
        assert_eq!(approved, 0.0);
        assert_eq!(actions.len(), 1);
        let act = &actions[0];
        assert_eq!(act.kind, ActionKind::Close);
        assert_eq!(act.reason, Some(StopReason::AtrStop));
        assert!((act.size - pos.abs()).abs() < 1e-12);
        let summary = ra.summary();
        assert_eq!(summary.stop_counts["atr_stop"], 1);
    }

    #[test]
    fn initial_stop_fires_for_shorts() {
        let mut rc = cfg();
        rc.atr_stop_k = 2.0;
        rc.max_leverage = 1.0;
        rc.risk_target = 1.0;
        let mut ra = RiskOverlay::new(rc);
        warm_atr(&mut ra, "X", 100.0, 1.0, 60);
        let (pos, _) = ra.approve("X", 0.0, -1.0, 100.0, 0);
        assert!(pos < 0.0);
        let (approved, actions) = ra.approve("X", pos, pos, 110.0, 5);
        assert_eq!(approved, 0.0);
        assert_eq!(actions[0].reason, Some(StopReason::AtrStop));
    }

    #[test]
    fn trailing_stop_tracks_favorable_excursion() {
        let mut rc = cfg();
        rc.atr_stop_k = 50.0; // keep the initial stop out of the way
        rc.atr_trail_k = 3.0;
        rc.max_leverage = 1.0;
        rc.risk_target = 1.0;
        let mut ra = RiskOverlay::new(rc);
        warm_atr(&mut ra, "X", 100.0, 1.0, 60);
        let (pos, _) = ra.approve("X", 0.0, 1.0, 100.0, 0);
        assert!(pos > 0.0);

        // Ride up to ~120: max_favorable follows the highs.
        for i in 0..20 {
            let px = 100.0 + i as f64;
            ra.on_candle(&candle("X", 100 + i, px, px + 0.5, px - 0.5, px));
        }
        // Pull back past max_favorable - 3*ATR.
        let (approved, actions) = ra.approve("X", pos, pos, 110.0, 25);
        assert_eq!(approved, 0.0);
        assert_eq!(actions[0].reason, Some(StopReason::AtrTrail));
        assert_eq!(ra.summary().stop_counts["atr_trail"], 1);
    }

    #[test]
    fn drawdown_circuit_halves_risk_then_recovers() {
        let mut rc = cfg();
        rc.dd_circuit.threshold = 0.15;
        rc.dd_circuit.cooldown_bars = 4;
        rc.max_leverage = 1.0;
        rc.risk_target = 1.0;
        let mut ra = RiskOverlay::new(rc);
        warm_atr(&mut ra, "X", 100.0, 1.0, 60);
        let (pos, _) = ra.approve("X", 0.0, 1.0, 100.0, 0);
        assert!((pos - 1.0).abs() < 1e-9);
        let ts = |i: i64| 1_000_000 + i * 900_000;

        // Walk the shadow equity down 16% while long: trips at bar 103.
        for (k, px) in [96.0, 92.0, 88.0, 84.0].into_iter().enumerate() {
            ra.on_candle(&candle("X", 100 + k as i64, px, px + 0.5, px - 0.5, px));
        }
        assert_eq!(ra.dd_scaler(), 0.5);

        // Recover inside the cooldown so the circuit does not re-trip.
        ra.on_candle(&candle("X", 104, 95.0, 95.5, 94.5, 95.0));
        ra.on_candle(&candle("X", 105, 100.0, 100.5, 99.5, 100.0));
        assert_eq!(ra.dd_scaler(), 0.5, "still inside the cooldown");
        ra.on_candle(&candle("X", 106, 100.0, 100.5, 99.5, 100.0));
        assert_eq!(ra.dd_scaler(), 1.0, "cooldown expired");
        ra.on_candle(&candle("X", 107, 100.0, 100.5, 99.5, 100.0));
        assert_eq!(ra.dd_scaler(), 1.0);

        let summary = ra.summary();
        assert_eq!(summary.dd_windows.len(), 1);
        let w = summary.dd_windows[0];
        assert_eq!(w.start, ts(103));
        assert_eq!(w.end, ts(106));
    }

    #[test]
    fn open_summary_window_is_flushed() {
        let mut rc = cfg();
        rc.dd_circuit.threshold = 0.1;
        rc.dd_circuit.cooldown_bars = 50;
        let mut ra = RiskOverlay::new(rc);
        ra.equity = 0.7;
        ra.peak_equity = 1.0;
        ra.evaluate_drawdown(123);
        ra.last_ts = 123;

        let summary = ra.summary();
        assert_eq!(summary.dd_windows.len(), 1);
        assert_eq!(summary.dd_windows[0], DdWindow { start: 123, end: 123 });
        // Flushing is idempotent.
        assert_eq!(ra.summary().dd_windows.len(), 1);
    }

    #[test]
    fn circuit_disabled_never_trips() {
        let mut rc = cfg();
        rc.dd_circuit.enable = Some(false);
        let mut ra = RiskOverlay::new(rc);
        ra.equity = 0.5;
        ra.peak_equity = 1.0;
        ra.evaluate_drawdown(42);
        assert_eq!(ra.dd_scaler(), 1.0);
        assert!(ra.summary().dd_windows.is_empty());
    }

    #[test]
    fn flat_position_passes_targets_through_clamps() {
        let mut rc = cfg();
        rc.max_abs_position = 1.5;
        rc.max_leverage = 2.0;
        rc.risk_target = 1.0;
        let mut ra = RiskOverlay::new(rc);
        // No ATR yet: vol targeting is a no-op, clamps still apply.
        let (scaled, actions) = ra.approve("X", 0.0, 3.0, 100.0, 0);
        assert!(actions.is_empty());
        assert!((scaled - 1.5).abs() < 1e-12);
    }
}
