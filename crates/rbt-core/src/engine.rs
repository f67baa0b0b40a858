//! Bar-time simulation kernel.
//!
//! Drives the component chain Strategy -> Portfolio -> Risk -> fills over a
//! multi-instrument series, one timestamp group at a time. Fills produced at
//! a timestamp are applied at that close or deferred to the next bar open, so
//! no decision can consume information that was not available when it was
//! made.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::accounting::{self, CostModel, MIN_FILL_DELTA};
use crate::candle::{Candle, Series, Ticker};
use crate::error::EngineError;
use crate::position::{EquityPoint, InstState, PendingFill, SignalMeta, StopReason, Trade};
use crate::report;

// ---------------------------------------------------------------------------
// Signals and actions
// ---------------------------------------------------------------------------

/// Strategy output with the target made explicit: `BuyTo`/`SellTo` carry the
/// absolute relative-position magnitude, `Close` flattens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalKind {
    BuyTo(f64),
    SellTo(f64),
    Close,
}

impl SignalKind {
    /// Signed relative-position target.
    pub fn target(&self) -> f64 {
        match self {
            SignalKind::BuyTo(s) => s.abs(),
            SignalKind::SellTo(s) => -s.abs(),
            SignalKind::Close => 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Signal {
    pub inst_id: String,
    pub kind: SignalKind,
    /// Reference price at signal time (diagnostic only; fills use bar prices).
    pub price: f64,
    pub tag: String,
    pub meta: SignalMeta,
}

impl Signal {
    /// Build a signal from a signed target.
    pub fn from_target(inst_id: &str, target: f64, price: f64, tag: &str, meta: SignalMeta) -> Self {
        let kind = if target > 0.0 {
            SignalKind::BuyTo(target)
        } else if target < 0.0 {
            SignalKind::SellTo(-target)
        } else {
            SignalKind::Close
        };
        Self {
            inst_id: inst_id.to_string(),
            kind,
            price,
            tag: tag.to_string(),
            meta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Close,
    Reduce,
    Halt,
}

/// Risk overlay verdict accompanying an approved target.
#[derive(Debug, Clone)]
pub struct Action {
    pub inst_id: String,
    pub kind: ActionKind,
    pub reason: Option<StopReason>,
    pub size: f64,
    pub price: f64,
}

/// Portfolio diagnostics returned alongside proposed weights.
#[derive(Debug, Clone, Default)]
pub struct ProposeMeta {
    pub strategy_weights: BTreeMap<String, f64>,
    pub portfolio_vol_annual: f64,
    pub gross: f64,
    pub turnover: f64,
    pub scaler: f64,
}

// ---------------------------------------------------------------------------
// Component capabilities
// ---------------------------------------------------------------------------

pub trait Strategy {
    fn name(&self) -> &str;
    fn on_candle(&mut self, c: &Candle) -> Vec<Signal>;
    fn on_ticker(&mut self, _t: &Ticker) -> Vec<Signal> {
        Vec::new()
    }
}

pub trait Risk {
    fn on_candle(&mut self, c: &Candle);
    fn on_ticker(&mut self, _t: &Ticker) {}
    /// Turn a proposed target into an approved one, possibly emitting
    /// immediate actions (stops).
    fn approve(
        &mut self,
        inst: &str,
        current: f64,
        target: f64,
        price: f64,
        holding_bars: usize,
    ) -> (f64, Vec<Action>);
}

pub trait Portfolio {
    fn on_candle(&mut self, c: &Candle);
    fn set_strategy_targets(&mut self, strategy: &str, targets: &BTreeMap<String, f64>);
    fn propose(&mut self, mark: &BTreeMap<String, f64>) -> (BTreeMap<String, f64>, ProposeMeta);
}

// ---------------------------------------------------------------------------
// Fill hooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }

    fn of_delta(delta: f64) -> Self {
        if delta >= 0.0 {
            TradeSide::Buy
        } else {
            TradeSide::Sell
        }
    }
}

/// Hook return: optional fill-price override plus extra cost in bps of
/// turnover.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookOutcome {
    pub fill_price: Option<f64>,
    pub extra_cost_bps: f64,
}

pub type FillHook = Box<dyn Fn(&str, TradeSide, f64, f64) -> HookOutcome>;

// ---------------------------------------------------------------------------
// Engine configuration and result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub initial_equity: f64,
    pub bar_minutes: i64,
    /// Decide on this bar, fill at the next bar's open.
    pub trade_on_next_bar: bool,
    pub taker_fee_bps: f64,
    pub maker_fee_bps: f64,
    pub slippage_bps: f64,
    pub use_maker: bool,
    /// Target deltas below this are ignored entirely.
    pub min_rebalance_step: f64,
    pub max_abs_position: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_equity: 1.0,
            bar_minutes: 5,
            trade_on_next_bar: false,
            taker_fee_bps: 6.0,
            maker_fee_bps: 0.0,
            slippage_bps: 3.0,
            use_maker: false,
            min_rebalance_step: 0.05,
            max_abs_position: 1.0,
        }
    }
}

impl EngineConfig {
    fn cost_model(&self) -> CostModel {
        CostModel {
            taker_fee_bps: self.taker_fee_bps,
            maker_fee_bps: self.maker_fee_bps,
            slippage_bps: self.slippage_bps,
            use_maker: self.use_maker,
        }
    }
}

/// Complete output of one simulation run.
#[derive(Debug, Clone)]
pub struct SimResult {
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Trade>,
    pub final_equity: f64,
    pub total_return: f64,
    pub cagr: f64,
    pub sharpe: f64,
    pub max_dd: f64,
    pub win_rate: f64,
    pub num_trades: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    cfg: EngineConfig,
    before_fill: Option<FillHook>,
    after_fill: Option<FillHook>,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            cfg,
            before_fill: None,
            after_fill: None,
        }
    }

    pub fn set_before_fill(&mut self, hook: FillHook) {
        self.before_fill = Some(hook);
    }

    pub fn set_after_fill(&mut self, hook: FillHook) {
        self.after_fill = Some(hook);
    }

    /// Run the full simulation over `series`. Components are borrowed for
    /// the duration of the run so the caller can read their summaries
    /// afterwards.
    pub fn run(
        &self,
        series: &Series,
        strategy: &mut dyn Strategy,
        mut risk: Option<&mut dyn Risk>,
        mut portfolio: Option<&mut dyn Portfolio>,
    ) -> Result<SimResult, EngineError> {
        if self.cfg.initial_equity <= 0.0 {
            return Err(EngineError::InvalidInitialEquity(self.cfg.initial_equity));
        }
        let all = flatten(series);
        if all.is_empty() {
            return Err(EngineError::EmptySeries);
        }

        let cfg = &self.cfg;
        let cost = cfg.cost_model();
        let before_fill = self.before_fill.as_deref();
        let after_fill = self.after_fill.as_deref();

        let mut equity = cfg.initial_equity;
        let mut peak = equity;
        let mut max_dd = 0.0f64;

        let mut states: FxHashMap<String, InstState> = FxHashMap::default();
        for inst in series.keys() {
            states.insert(inst.clone(), InstState::default());
        }

        let mut curve: Vec<EquityPoint> = Vec::new();
        let mut trades: Vec<Trade> = Vec::new();
        let mut agg_rets: Vec<f64> = Vec::new();

        let mut i = 0;
        while i < all.len() {
            let ts = all[i].t;
            let mut j = i;
            while j < all.len() && all[j].t == ts {
                j += 1;
            }
            let group = &all[i..j];

            // 1) Aggregate return from positions held coming into this bar.
            let mut sum_ret = 0.0;
            for bar in group {
                if let Some(st) = states.get(&bar.inst_id) {
                    if st.last_close > 0.0 && st.position != 0.0 && bar.c > 0.0 {
                        sum_ret += st.position * (bar.c / st.last_close).ln();
                    }
                }
            }

            // 2) Advance collaborator state.
            for bar in group {
                if let Some(r) = risk.as_mut() {
                    r.on_candle(bar);
                }
                if let Some(p) = portfolio.as_mut() {
                    p.on_candle(bar);
                }
            }

            // 3) Collect strategy signals for this timestamp.
            let mut signals: Vec<Signal> = Vec::new();
            for bar in group {
                signals.extend(strategy.on_candle(bar));
            }

            // 4) Resolve signed targets; remember each signal's meta so trades
            //    can report their origin.
            let mut signal_meta: BTreeMap<String, SignalMeta> = BTreeMap::new();
            let mut want: BTreeMap<String, f64> = BTreeMap::new();
            for sig in &signals {
                let target = sig
                    .kind
                    .target()
                    .clamp(-cfg.max_abs_position, cfg.max_abs_position);
                want.insert(sig.inst_id.clone(), target);
                signal_meta.insert(sig.inst_id.clone(), sig.meta.clone());
            }
            let targets: BTreeMap<String, f64> = if let Some(p) = portfolio.as_mut() {
                let mut mark = BTreeMap::new();
                for bar in group {
                    mark.insert(bar.inst_id.clone(), bar.c);
                }
                p.set_strategy_targets(strategy.name(), &want);
                let (agg, _meta) = p.propose(&mark);
                agg
            } else {
                want
            };

            // 5) Risk approval and fill scheduling (lexicographic by inst).
            for (inst, tgt) in &targets {
                let st = states.entry(inst.clone()).or_default();
                if (tgt - st.position).abs() < cfg.min_rebalance_step {
                    continue;
                }
                let mut approved = *tgt;
                let mut actions: Vec<Action> = Vec::new();
                if let Some(r) = risk.as_mut() {
                    let mut ref_price = st.last_close;
                    if ref_price == 0.0 {
                        if let Some(bar) = find_in_group(group, inst) {
                            ref_price = bar.c;
                        }
                    }
                    let (a, acts) =
                        r.approve(inst, st.position, *tgt, ref_price, st.holding_bars);
                    approved = a;
                    actions = acts;
                }
                let apply_ts = decide_apply_ts(ts, cfg.trade_on_next_bar, cfg.bar_minutes);
                let meta = signal_meta.get(inst).cloned().unwrap_or_default();
                // A stop overrides anything already queued; a regular target
                // only schedules when the slot is free.
                for act in &actions {
                    if matches!(act.kind, ActionKind::Close | ActionKind::Halt) {
                        st.pending = Some(PendingFill {
                            target: 0.0,
                            apply_ts,
                            meta: meta.clone(),
                            stop: act.reason,
                        });
                    }
                }
                if st.pending.is_none() {
                    st.pending = Some(PendingFill {
                        target: approved,
                        apply_ts,
                        meta,
                        stop: None,
                    });
                }
            }

            // 6) Book the aggregate return for this timestamp.
            if sum_ret != 0.0 {
                equity *= sum_ret.exp();
            }
            agg_rets.push(sum_ret);

            // 7) Apply every pending fill that is due at this timestamp.
            for bar in group {
                let Some(st) = states.get_mut(&bar.inst_id) else {
                    continue;
                };
                let due = matches!(&st.pending, Some(p) if ts >= p.apply_ts);
                if !due {
                    continue;
                }
                let Some(pending) = st.pending.take() else {
                    continue;
                };
                let ref_price = if cfg.trade_on_next_bar { bar.o } else { bar.c };
                execute_fill(
                    st,
                    &bar.inst_id,
                    &pending,
                    ref_price,
                    ts,
                    &cost,
                    before_fill,
                    after_fill,
                    &mut equity,
                    &mut trades,
                );
            }

            // 8) Roll per-instrument price and holding state.
            for bar in group {
                let st = states.entry(bar.inst_id.clone()).or_default();
                st.last_close = bar.c;
                if st.position != 0.0 {
                    st.holding_bars += 1;
                } else {
                    st.holding_bars = 0;
                }
            }

            // 9) Drawdown tracking and the equity-curve sample.
            if equity > peak {
                peak = equity;
            }
            let dd = (peak - equity) / (peak + 1e-12);
            if dd > max_dd {
                max_dd = dd;
            }
            curve.push(EquityPoint {
                ts,
                equity,
                ret: sum_ret,
                drawdown: dd,
            });

            i = j;
        }

        let total_return = equity / cfg.initial_equity - 1.0;
        let wins = trades.iter().filter(|t| t.ret > 0.0).count();
        let win_rate = if trades.is_empty() {
            0.0
        } else {
            wins as f64 / trades.len() as f64
        };
        Ok(SimResult {
            final_equity: equity,
            total_return,
            cagr: report::cagr(equity, cfg.initial_equity, curve.len(), cfg.bar_minutes),
            sharpe: report::sharpe(&agg_rets, cfg.bar_minutes),
            max_dd,
            win_rate,
            num_trades: trades.len(),
            equity_curve: curve,
            trades,
        })
    }
}

// ---------------------------------------------------------------------------
// Fill execution
// ---------------------------------------------------------------------------

type HookRef<'a> = &'a (dyn Fn(&str, TradeSide, f64, f64) -> HookOutcome);

#[allow(clippy::too_many_arguments)]
fn execute_fill(
    st: &mut InstState,
    inst: &str,
    pending: &PendingFill,
    mut ref_price: f64,
    ts: i64,
    cost: &CostModel,
    before: Option<HookRef<'_>>,
    after: Option<HookRef<'_>>,
    equity: &mut f64,
    trades: &mut Vec<Trade>,
) {
    let delta = pending.target - st.position;
    if delta.abs() < MIN_FILL_DELTA {
        return;
    }
    let side = TradeSide::of_delta(delta);
    let turnover = delta.abs();

    let mut cost_bps = cost.base_bps();
    if let Some(hook) = before {
        let out = hook(inst, side, turnover, ref_price);
        if let Some(px) = out.fill_price {
            if px > 0.0 {
                ref_price = px;
            }
        }
        cost_bps += out.extra_cost_bps;
    }
    *equity *= CostModel::equity_factor(turnover, cost_bps);

    if let Some(trade) = accounting::apply_position_change(
        st,
        inst,
        pending.target,
        ref_price,
        ts,
        &pending.meta,
        pending.stop,
    ) {
        trades.push(trade);
    }

    if let Some(hook) = after {
        let out = hook(inst, side, turnover, ref_price);
        if out.extra_cost_bps != 0.0 {
            *equity *= CostModel::equity_factor(turnover, out.extra_cost_bps);
        }
    }
}

// ---------------------------------------------------------------------------
// Bar-sequence helpers
// ---------------------------------------------------------------------------

/// Flatten the series into one globally ordered sequence, stable-sorted by
/// `(ts, inst_id)`. Candles with an empty instrument id inherit the map key.
fn flatten(series: &Series) -> Vec<Candle> {
    let mut all: Vec<Candle> = Vec::new();
    for (inst, bars) in series {
        for bar in bars {
            let mut bar = bar.clone();
            if bar.inst_id.is_empty() {
                bar.inst_id = inst.clone();
            }
            all.push(bar);
        }
    }
    all.sort_by(|a, b| a.t.cmp(&b.t).then_with(|| a.inst_id.cmp(&b.inst_id)));
    all
}

fn find_in_group<'a>(group: &'a [Candle], inst: &str) -> Option<&'a Candle> {
    group.iter().find(|c| c.inst_id == inst)
}

fn next_bar_ts(ts: i64, bar_minutes: i64) -> i64 {
    ts + bar_minutes * 60_000
}

fn decide_apply_ts(ts: i64, next_bar: bool, bar_minutes: i64) -> i64 {
    if next_bar {
        next_bar_ts(ts, bar_minutes)
    } else {
        ts
    }
}
