//! Multi-strategy portfolio aggregator.
//!
//! Combines per-strategy instrument targets under risk-parity allocation, an
//! annualized volatility target, per-instrument / gross caps, and a
//! drift-threshold + turnover-cap rebalance gate that only opens every
//! `rebalance_interval_bars` ticks. Ticks advance by timestamp
//! de-duplication inside `on_candle`, which also clears the per-bar strategy
//! target cache so stale targets cannot leak into the next timestamp.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::candle::Candle;
use crate::config::PortfolioConfig;
use crate::engine::{Portfolio, ProposeMeta};
use crate::indicators::{alpha_from_half_life, EwCorr, EwVar, SharpeTracker};
use crate::report;

const MIN_LEARN_SAMPLES: usize = 60;

fn softplus(x: f64) -> f64 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

fn safe(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

fn sum_abs(m: &BTreeMap<String, f64>) -> f64 {
    m.values().map(|v| v.abs()).sum()
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a < b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[derive(Debug)]
struct MarketState {
    prev_close: f64,
    last_ret: f64,
    vol: EwVar,
}

impl MarketState {
    fn new(half_life: usize) -> Self {
        Self {
            prev_close: 0.0,
            last_ret: 0.0,
            vol: EwVar::new(alpha_from_half_life(half_life.max(2))),
        }
    }

    fn push_close(&mut self, close: f64) {
        if self.prev_close > 0.0 && close > 0.0 {
            let r = (close / self.prev_close).ln();
            if r.is_finite() {
                self.last_ret = r;
                self.vol.push(r);
            }
        }
        self.prev_close = close;
    }
}

pub struct PortfolioEngine {
    cfg: PortfolioConfig,
    bar_minutes: i64,

    inst: FxHashMap<String, MarketState>,
    corr: FxHashMap<(String, String), EwCorr>,

    /// strategy -> (inst -> target in [-1, 1]); valid for the current bar only.
    strat_targets: BTreeMap<String, BTreeMap<String, f64>>,
    /// Last proposed combined targets, for drift/turnover gating.
    last_targets: BTreeMap<String, f64>,
    /// Strategy exposures frozen at the previous propose, for paper-PnL
    /// weight learning.
    last_expo: BTreeMap<String, BTreeMap<String, f64>>,
    strat_perf: FxHashMap<String, SharpeTracker>,

    last_bar_ts: i64,
    bar_count: usize,
}

impl PortfolioEngine {
    pub fn new(mut cfg: PortfolioConfig, bar_minutes: i64) -> Self {
        if cfg.max_gross <= 0.0 {
            cfg.max_gross = cfg.max_leverage;
        }
        if cfg.vol_floor <= 0.0 {
            cfg.vol_floor = 1e-4;
        }
        Self {
            cfg,
            bar_minutes: bar_minutes.max(1),
            inst: FxHashMap::default(),
            corr: FxHashMap::default(),
            strat_targets: BTreeMap::new(),
            last_targets: BTreeMap::new(),
            last_expo: BTreeMap::new(),
            strat_perf: FxHashMap::default(),
            last_bar_ts: 0,
            bar_count: 0,
        }
    }

    fn tick(&mut self, ts: i64) {
        if ts <= 0 {
            return;
        }
        if self.last_bar_ts != ts {
            self.last_bar_ts = ts;
            self.bar_count += 1;
            self.strat_targets.clear();
        }
    }

    fn vol_of(&self, inst: &str) -> f64 {
        let std = self
            .inst
            .get(inst)
            .map(|s| s.vol.std())
            .unwrap_or(0.0);
        if std.is_nan() || std < self.cfg.vol_floor {
            self.cfg.vol_floor
        } else {
            std
        }
    }

    fn corr_of(&self, a: &str, b: &str) -> f64 {
        match self.corr.get(&pair_key(a, b)) {
            Some(c) => {
                let r = c.corr().clamp(-0.99, 0.99);
                if r.is_finite() {
                    r
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    // -- allocation ---------------------------------------------------------

    fn allocate_risk(&self, agg: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
        let mut strength: BTreeMap<String, f64> = BTreeMap::new();
        let mut sigma: BTreeMap<String, f64> = BTreeMap::new();
        let mut sum_b = 0.0;
        for (inst, s) in agg {
            let b = safe(*s).abs();
            if b < 1e-12 {
                continue;
            }
            strength.insert(inst.clone(), b);
            sigma.insert(inst.clone(), self.vol_of(inst));
            sum_b += b;
        }
        if sum_b == 0.0 {
            return BTreeMap::new();
        }

        let mut w: BTreeMap<String, f64> = BTreeMap::new();
        if self.cfg.use_risk_parity || !self.cfg.use_min_var_approx {
            // Risk parity: |w_i| proportional to strength_i / sigma_i.
            let denom: f64 = strength
                .iter()
                .map(|(inst, b)| b / sigma[inst])
                .sum();
            if denom == 0.0 {
                return BTreeMap::new();
            }
            for (inst, b) in &strength {
                let signed = crate::indicators::rolling::sign(agg[inst]);
                w.insert(inst.clone(), signed * (b / sigma[inst]) / denom);
            }
        } else {
            // Diagonal min-variance approximation: inverse-variance weights
            // bent toward the signal magnitude, then re-normalized.
            let denom: f64 = sigma.values().map(|s| 1.0 / (s * s)).sum();
            if denom == 0.0 {
                return BTreeMap::new();
            }
            for (inst, s) in &sigma {
                w.insert(inst.clone(), (1.0 / (s * s)) / denom);
            }
            for (inst, v) in w.iter_mut() {
                *v *= crate::indicators::rolling::sign(agg[inst]) * strength[inst].max(0.2);
            }
            let gross = sum_abs(&w);
            if gross > 0.0 {
                for v in w.values_mut() {
                    *v /= gross;
                }
            }
        }
        for v in w.values_mut() {
            *v = safe(*v).clamp(-1.0, 1.0);
        }
        w
    }

    fn vol_target_scaler(&self, w: &BTreeMap<String, f64>) -> (f64, f64) {
        let insts: Vec<&String> = w.keys().collect();
        let mut var_p = 0.0;
        for (i, a) in insts.iter().enumerate() {
            let wa = safe(w[*a]);
            let sa = self.vol_of(a);
            for (j, b) in insts.iter().enumerate() {
                let wb = safe(w[*b]);
                let sb = self.vol_of(b);
                let rho = if i == j { 1.0 } else { self.corr_of(a, b) };
                var_p += wa * wb * sa * sb * rho;
            }
        }
        if !(var_p > 0.0) || !var_p.is_finite() {
            return (1.0, 0.0);
        }
        let sigma_ann = var_p.sqrt() * report::annualization_factor(self.bar_minutes);
        if sigma_ann <= 0.0 {
            return (1.0, 0.0);
        }
        let scaler = self.cfg.target_vol_annual / sigma_ann;
        if scaler.is_finite() {
            (scaler, sigma_ann)
        } else {
            (1.0, sigma_ann)
        }
    }

    fn apply_limits(&self, mut w: BTreeMap<String, f64>) -> BTreeMap<String, f64> {
        for (inst, v) in w.iter_mut() {
            let lim = self
                .cfg
                .per_instrument_max
                .get(inst)
                .copied()
                .filter(|x| *x > 0.0)
                .unwrap_or(1.0);
            *v = safe(*v).clamp(-lim, lim);
        }
        let target_gross =
            self.cfg.max_gross.min(self.cfg.max_leverage) * (1.0 - self.cfg.cash_buffer_pct);
        if target_gross <= 0.0 {
            return w;
        }
        let gross = sum_abs(&w);
        if gross > target_gross {
            let scale = target_gross / (gross + 1e-12);
            for v in w.values_mut() {
                *v = safe(*v * scale);
            }
        }
        w
    }

    fn rebalance_gate(&mut self, w: BTreeMap<String, f64>) -> (BTreeMap<String, f64>, f64) {
        if self.cfg.rebalance_interval_bars > 0
            && self.bar_count % self.cfg.rebalance_interval_bars != 0
        {
            return (self.last_targets.clone(), 0.0);
        }

        let mut fin: BTreeMap<String, f64> = BTreeMap::new();
        for (inst, v) in &w {
            let prev = self.last_targets.get(inst).copied().unwrap_or(0.0);
            if (v - prev).abs() < self.cfg.drift_threshold {
                fin.insert(inst.clone(), prev);
            } else {
                fin.insert(inst.clone(), *v);
            }
        }

        let mut keys: Vec<String> = fin.keys().cloned().collect();
        for k in self.last_targets.keys() {
            if !fin.contains_key(k) {
                keys.push(k.clone());
            }
        }
        let mut turnover = 0.0;
        for k in &keys {
            let a = safe(fin.get(k).copied().unwrap_or(0.0));
            let b = safe(self.last_targets.get(k).copied().unwrap_or(0.0));
            turnover += (a - b).abs();
        }
        if self.cfg.turnover_cap > 0.0 && turnover > self.cfg.turnover_cap {
            let s = self.cfg.turnover_cap / (turnover + 1e-12);
            for k in &keys {
                let prev = self.last_targets.get(k).copied().unwrap_or(0.0);
                let want = fin.get(k).copied().unwrap_or(0.0);
                fin.insert(k.clone(), prev + s * (want - prev));
            }
            turnover = self.cfg.turnover_cap;
        }
        self.last_targets = fin.clone();
        (fin, turnover)
    }

    // -- strategy weighting -------------------------------------------------

    fn strategy_weights(&mut self) -> BTreeMap<String, f64> {
        let mut w: BTreeMap<String, f64> = BTreeMap::new();
        if !self.cfg.strategy_learn {
            let mut sum = 0.0;
            for name in self.strat_targets.keys() {
                let v = self
                    .cfg
                    .strategy_weights
                    .get(name)
                    .copied()
                    .filter(|x| *x > 0.0)
                    .unwrap_or(1.0);
                w.insert(name.clone(), v);
                sum += v;
            }
            if sum > 0.0 {
                for v in w.values_mut() {
                    *v /= sum;
                }
            }
            return w;
        }

        let mut sum = 0.0;
        for name in self.strat_targets.keys() {
            let prior = self
                .cfg
                .strategy_weights
                .get(name)
                .copied()
                .filter(|x| *x > 0.0)
                .unwrap_or(1.0);
            let tracker = self
                .strat_perf
                .entry(name.clone())
                .or_insert_with(|| SharpeTracker::new(alpha_from_half_life(256)));
            let val = if tracker.count() >= MIN_LEARN_SAMPLES {
                prior * softplus(tracker.sharpe())
            } else {
                prior
            };
            w.insert(name.clone(), val);
            sum += val;
        }
        if sum == 0.0 {
            let n = self.strat_targets.len().max(1);
            for v in w.values_mut() {
                *v = 1.0 / n as f64;
            }
        } else {
            for v in w.values_mut() {
                *v /= sum;
            }
        }
        w
    }
}

impl Portfolio for PortfolioEngine {
    fn on_candle(&mut self, c: &Candle) {
        self.tick(c.t);

        let half_life = self.cfg.ew_half_life_vol;
        let st = self
            .inst
            .entry(c.inst_id.clone())
            .or_insert_with(|| MarketState::new(half_life));
        st.push_close(c.c);
        let this_ret = st.last_ret;

        let others: Vec<(String, f64)> = self
            .inst
            .iter()
            .filter(|(id, _)| id.as_str() != c.inst_id)
            .map(|(id, s)| (id.clone(), s.last_ret))
            .collect();
        let corr_alpha = alpha_from_half_life(self.cfg.ew_half_life_corr);
        for (id, other_ret) in others {
            let key = pair_key(&c.inst_id, &id);
            self.corr
                .entry(key)
                .or_insert_with(|| EwCorr::new(corr_alpha))
                .push(this_ret, other_ret);
        }

        // Paper PnL of the exposures frozen at the last propose, for
        // strategy-weight learning.
        if self.cfg.strategy_learn && !self.last_expo.is_empty() {
            let mut rets: Vec<(String, f64)> = Vec::new();
            for (name, expo) in &self.last_expo {
                let mut ret = 0.0;
                for (inst, weight) in expo {
                    if let Some(ms) = self.inst.get(inst) {
                        ret += weight * ms.last_ret;
                    }
                }
                rets.push((name.clone(), ret));
            }
            for (name, ret) in rets {
                self.strat_perf
                    .entry(name)
                    .or_insert_with(|| SharpeTracker::new(alpha_from_half_life(256)))
                    .push(ret);
            }
        }
    }

    fn set_strategy_targets(&mut self, strategy: &str, targets: &BTreeMap<String, f64>) {
        let clamped: BTreeMap<String, f64> = targets
            .iter()
            .map(|(k, v)| (k.clone(), v.clamp(-1.0, 1.0)))
            .collect();
        self.strat_targets.insert(strategy.to_string(), clamped);
    }

    fn propose(&mut self, _mark: &BTreeMap<String, f64>) -> (BTreeMap<String, f64>, ProposeMeta) {
        if self.strat_targets.is_empty() {
            return (BTreeMap::new(), ProposeMeta::default());
        }

        let sw = self.strategy_weights();

        let mut agg: BTreeMap<String, f64> = BTreeMap::new();
        for (name, targets) in &self.strat_targets {
            let ws = sw.get(name).copied().unwrap_or(0.0);
            for (inst, v) in targets {
                *agg.entry(inst.clone()).or_insert(0.0) += ws * v;
            }
        }
        for v in agg.values_mut() {
            *v = safe(*v).clamp(-1.0, 1.0);
        }
        if agg.is_empty() {
            return (BTreeMap::new(), ProposeMeta::default());
        }

        let mut w = self.allocate_risk(&agg);
        if w.is_empty() {
            return (BTreeMap::new(), ProposeMeta::default());
        }

        let (scaler, sigma_ann) = self.vol_target_scaler(&w);
        for v in w.values_mut() {
            *v = safe(*v * scaler);
        }

        let w = self.apply_limits(w);
        let (fin, turnover) = self.rebalance_gate(w);

        if self.cfg.strategy_learn {
            self.last_expo.clear();
            for (name, targets) in &self.strat_targets {
                let ws = sw.get(name).copied().unwrap_or(0.0);
                let expo: BTreeMap<String, f64> = targets
                    .iter()
                    .map(|(inst, v)| (inst.clone(), ws * v))
                    .collect();
                self.last_expo.insert(name.clone(), expo);
            }
        }

        let meta = ProposeMeta {
            strategy_weights: sw,
            portfolio_vol_annual: sigma_ann * scaler,
            gross: sum_abs(&fin),
            turnover,
            scaler,
        };
        (fin, meta)
    }
}
