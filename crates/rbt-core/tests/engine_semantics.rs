//! Kernel semantics: fill timing, trade bookkeeping, equity accounting and
//! determinism, exercised with a scripted strategy so every expectation is
//! exact.

use std::collections::BTreeMap;

use rbt_core::candle::{Candle, Series};
use rbt_core::engine::{Engine, EngineConfig, Signal, Strategy};
use rbt_core::position::{Dir, SignalMeta};

const BAR_MS: i64 = 900_000; // 15m
const T0: i64 = 1_700_000_000_000;

fn bar(inst: &str, i: i64, o: f64, h: f64, l: f64, c: f64) -> Candle {
    Candle {
        inst_id: inst.to_string(),
        t: T0 + i * BAR_MS,
        o,
        h,
        l,
        c,
        v: 1.0,
    }
}

/// Ramp bars with distinct open/close so fill-price assertions can tell the
/// two apart: open = 100 + i, close = 100.5 + i.
fn ramp_series(inst: &str, n: i64) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let base = 100.0 + i as f64;
            bar(inst, i, base, base + 1.0, base - 1.0, base + 0.5)
        })
        .collect()
}

fn flat_series(inst: &str, n: i64, px: f64) -> Vec<Candle> {
    (0..n).map(|i| bar(inst, i, px, px, px, px)).collect()
}

/// Emits a fixed signed target at scheduled timestamps, nothing otherwise.
struct Scripted {
    plan: BTreeMap<i64, f64>,
}

impl Scripted {
    fn at_bars(steps: &[(i64, f64)]) -> Self {
        Self {
            plan: steps
                .iter()
                .map(|(i, target)| (T0 + i * BAR_MS, *target))
                .collect(),
        }
    }
}

impl Strategy for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn on_candle(&mut self, c: &Candle) -> Vec<Signal> {
        match self.plan.get(&c.t) {
            Some(target) => vec![Signal::from_target(
                &c.inst_id,
                *target,
                c.c,
                "scripted",
                SignalMeta::default(),
            )],
            None => Vec::new(),
        }
    }
}

fn frictionless(bar_minutes: i64, next_bar: bool) -> EngineConfig {
    EngineConfig {
        initial_equity: 1.0,
        bar_minutes,
        trade_on_next_bar: next_bar,
        taker_fee_bps: 0.0,
        maker_fee_bps: 0.0,
        slippage_bps: 0.0,
        use_maker: false,
        min_rebalance_step: 0.0,
        max_abs_position: 1.0,
    }
}

fn run(
    cfg: EngineConfig,
    series: &Series,
    plan: &[(i64, f64)],
) -> rbt_core::engine::SimResult {
    let engine = Engine::new(cfg);
    let mut strategy = Scripted::at_bars(plan);
    engine
        .run(series, &mut strategy, None, None)
        .expect("simulation must run")
}

#[test]
fn flat_price_series_stays_flat() {
    let mut series = Series::default();
    series.insert("FLAT".to_string(), flat_series("FLAT", 200, 100.0));

    let res = run(frictionless(15, true), &series, &[]);
    assert_eq!(res.num_trades, 0);
    assert!((res.final_equity - 1.0).abs() < 1e-12);
    assert_eq!(res.max_dd, 0.0);
    assert_eq!(res.sharpe, 0.0);
    assert_eq!(res.equity_curve.len(), 200);
    for p in &res.equity_curve {
        assert!((p.equity - 1.0).abs() < 1e-12);
        assert_eq!(p.ret, 0.0);
        assert_eq!(p.drawdown, 0.0);
    }
}

#[test]
fn next_bar_mode_fills_at_next_open() {
    let mut series = Series::default();
    series.insert("X".to_string(), ramp_series("X", 20));

    let res = run(frictionless(15, true), &series, &[(5, 1.0), (10, 0.0)]);
    assert_eq!(res.num_trades, 1);
    let tr = &res.trades[0];
    // Signal at bar 5 fills at bar 6's open, never at bar 5's close.
    assert_eq!(tr.entry_ts, T0 + 6 * BAR_MS);
    assert!((tr.entry_price - 106.0).abs() < 1e-12);
    assert_eq!(tr.exit_ts, T0 + 11 * BAR_MS);
    assert!((tr.exit_price - 111.0).abs() < 1e-12);
    assert_eq!(tr.dir, Dir::Long);
    // Entry is never before the signal.
    assert!(tr.entry_ts > T0 + 5 * BAR_MS);
}

#[test]
fn same_bar_mode_fills_at_close() {
    let mut series = Series::default();
    series.insert("X".to_string(), ramp_series("X", 20));

    let res = run(frictionless(15, false), &series, &[(5, 1.0), (10, 0.0)]);
    assert_eq!(res.num_trades, 1);
    let tr = &res.trades[0];
    assert_eq!(tr.entry_ts, T0 + 5 * BAR_MS);
    assert!((tr.entry_price - 105.5).abs() < 1e-12);
    assert!((tr.exit_price - 110.5).abs() < 1e-12);
}

#[test]
fn trade_return_matches_log_identity() {
    let mut series = Series::default();
    series.insert("X".to_string(), ramp_series("X", 30));

    let res = run(
        frictionless(15, true),
        &series,
        &[(3, 0.7), (12, -0.7), (20, 0.0)],
    );
    assert_eq!(res.num_trades, 2);
    for tr in &res.trades {
        let expect = tr.dir.sign() * (tr.exit_price / tr.entry_price).ln() * tr.size;
        assert!(
            (tr.ret - expect).abs() < 1e-12,
            "trade return identity violated: {tr:?}"
        );
    }
    // The sign flip closes the long and opens the short at the same fill.
    assert_eq!(res.trades[0].dir, Dir::Long);
    assert_eq!(res.trades[1].dir, Dir::Short);
    assert_eq!(res.trades[0].exit_ts, res.trades[1].entry_ts);
}

#[test]
fn equity_is_constant_while_flat() {
    let mut series = Series::default();
    // Price keeps moving after the close; flat equity must not.
    series.insert("X".to_string(), ramp_series("X", 40));

    let res = run(frictionless(15, true), &series, &[(5, 1.0), (10, 0.0)]);
    // Position is flat from the bar-11 fill onward.
    let after: Vec<f64> = res
        .equity_curve
        .iter()
        .filter(|p| p.ts > T0 + 11 * BAR_MS)
        .map(|p| p.equity)
        .collect();
    assert!(after.len() > 20);
    for w in after.windows(2) {
        assert!((w[0] - w[1]).abs() < 1e-12);
    }
    assert!((res.final_equity - after[0]).abs() < 1e-12);
}

#[test]
fn equity_uses_position_coming_into_the_bar() {
    let mut series = Series::default();
    series.insert("X".to_string(), ramp_series("X", 12));

    let res = run(frictionless(15, true), &series, &[(4, 1.0)]);
    // Fill lands at bar 5; the first non-zero aggregate return appears at
    // bar 6 (close-over-close with the position held into the bar).
    for p in &res.equity_curve {
        if p.ts <= T0 + 5 * BAR_MS {
            assert_eq!(p.ret, 0.0, "return booked before the fill at {}", p.ts);
        }
    }
    let first_move = res
        .equity_curve
        .iter()
        .find(|p| p.ret != 0.0)
        .expect("position must earn returns");
    assert_eq!(first_move.ts, T0 + 6 * BAR_MS);
    let expect = (106.5f64 / 105.5).ln();
    assert!((first_move.ret - expect).abs() < 1e-12);
}

#[test]
fn oversized_targets_clamp_to_max_abs_position() {
    let mut series = Series::default();
    series.insert("X".to_string(), ramp_series("X", 20));

    let res = run(frictionless(15, true), &series, &[(5, 5.0), (10, 0.0)]);
    assert_eq!(res.num_trades, 1);
    assert!((res.trades[0].size - 1.0).abs() < 1e-12);
}

#[test]
fn fill_costs_haircut_equity() {
    let mut series = Series::default();
    series.insert("X".to_string(), flat_series("X", 10, 100.0));

    let mut cfg = frictionless(15, true);
    cfg.taker_fee_bps = 6.0;
    cfg.slippage_bps = 4.0;
    let res = run(cfg, &series, &[(2, 1.0), (5, 0.0)]);
    // Two fills of turnover 1.0 at 10 bps each on an otherwise flat price.
    let expect = (1.0 - 0.001) * (1.0 - 0.001);
    assert!((res.final_equity - expect).abs() < 1e-12);
    assert_eq!(res.num_trades, 1);
    assert!(res.trades[0].ret.abs() < 1e-12);
}

#[test]
fn identical_runs_are_identical() {
    let mut series = Series::default();
    series.insert("AAA".to_string(), ramp_series("AAA", 60));
    series.insert(
        "BBB".to_string(),
        (0..60)
            .map(|i| {
                let base = 200.0 - 0.5 * i as f64;
                bar("BBB", i, base, base + 2.0, base - 2.0, base - 0.25)
            })
            .collect(),
    );

    let plan = [(7, 1.0), (19, -0.5), (33, 0.0), (41, 0.8)];
    let a = run(frictionless(15, true), &series, &plan);
    let b = run(frictionless(15, true), &series, &plan);
    assert_eq!(a.equity_curve, b.equity_curve);
    assert_eq!(a.trades, b.trades);
    assert_eq!(a.final_equity, b.final_equity);
    assert_eq!(a.sharpe, b.sharpe);
    assert_eq!(a.max_dd, b.max_dd);
}

#[test]
fn drawdown_stays_within_bounds() {
    let mut series = Series::default();
    // Up then down so the run has a real drawdown.
    let mut bars = Vec::new();
    for i in 0..60 {
        let px = if i < 30 {
            100.0 + i as f64
        } else {
            130.0 - 1.5 * (i - 30) as f64
        };
        bars.push(bar("X", i, px, px + 0.5, px - 0.5, px));
    }
    series.insert("X".to_string(), bars);

    let res = run(frictionless(15, true), &series, &[(2, 1.0)]);
    let mut running_max = 0.0f64;
    for p in &res.equity_curve {
        assert!((0.0..=1.0).contains(&p.drawdown), "dd out of bounds: {p:?}");
        running_max = running_max.max(p.drawdown);
    }
    assert!((res.max_dd - running_max).abs() < 1e-12);
    assert!(res.max_dd > 0.0);
}

#[test]
fn empty_series_is_an_error() {
    let series = Series::default();
    let engine = Engine::new(frictionless(15, true));
    let mut strategy = Scripted::at_bars(&[]);
    assert!(engine.run(&series, &mut strategy, None, None).is_err());
}

#[test]
fn bad_initial_equity_is_an_error() {
    let mut series = Series::default();
    series.insert("X".to_string(), flat_series("X", 5, 100.0));
    let mut cfg = frictionless(15, true);
    cfg.initial_equity = 0.0;
    let engine = Engine::new(cfg);
    let mut strategy = Scripted::at_bars(&[]);
    assert!(engine.run(&series, &mut strategy, None, None).is_err());
}
