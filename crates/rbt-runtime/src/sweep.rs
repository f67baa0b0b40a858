//! Randomized grid search over the strategy and risk tuning parameters.
//!
//! Enumerates the full cartesian product, shuffles it with a seeded RNG,
//! samples the head, and replays every candidate through a fresh engine +
//! strategy + risk stack in parallel. Results are re-sorted deterministically
//! afterwards so the leaderboard does not depend on worker scheduling.

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;

use rbt_core::candle::Series;
use rbt_core::config::BacktestConfig;
use rbt_core::engine::SimResult;
use rbt_core::report;

use crate::build_engine;
use rbt_risk::RiskOverlay;
use rbt_signals::RegimeStrategy;

// ---------------------------------------------------------------------------
// Parameter grid
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSet {
    pub trend_gain: f64,
    pub mr_gain: f64,
    pub breakout_gain: f64,
    pub risk_target: f64,
    pub atr_stop_k: f64,
    pub atr_trail_k: f64,
    pub regime_multiplier: f64,
}

impl ParamSet {
    fn key(&self) -> [f64; 7] {
        [
            self.trend_gain,
            self.mr_gain,
            self.breakout_gain,
            self.risk_target,
            self.atr_stop_k,
            self.atr_trail_k,
            self.regime_multiplier,
        ]
    }

    fn cmp_key(&self, other: &Self) -> Ordering {
        for (a, b) in self.key().iter().zip(other.key().iter()) {
            match a.total_cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

/// Full cartesian product of the tuning choices.
pub fn generate_param_sets() -> Vec<ParamSet> {
    let trend = [1.2, 1.5, 1.8, 2.0];
    let mr = [0.5, 0.7, 1.0];
    let breakout = [0.8, 1.0, 1.2];
    let risk_targets = [0.45, 0.55, 0.65];
    let atr_stops = [2.0, 2.5, 3.0];
    let atr_trails = [2.5, 3.0, 3.5];
    let regime_mul = [0.9, 1.0, 1.1];

    let mut sets = Vec::with_capacity(
        trend.len()
            * mr.len()
            * breakout.len()
            * risk_targets.len()
            * atr_stops.len()
            * atr_trails.len()
            * regime_mul.len(),
    );
    for tg in trend {
        for mg in mr {
            for bg in breakout {
                for rt in risk_targets {
                    for stop in atr_stops {
                        for trail in atr_trails {
                            for mul in regime_mul {
                                sets.push(ParamSet {
                                    trend_gain: tg,
                                    mr_gain: mg,
                                    breakout_gain: bg,
                                    risk_target: rt,
                                    atr_stop_k: stop,
                                    atr_trail_k: trail,
                                    regime_multiplier: mul,
                                });
                            }
                        }
                    }
                }
            }
        }
    }
    sets
}

/// Clone the base config with one candidate's overrides applied. The regime
/// multiplier scales both classification thresholds.
fn apply_params(base: &BacktestConfig, params: &ParamSet) -> BacktestConfig {
    let mut cfg = base.clone();
    cfg.strategy.trend_gain = params.trend_gain;
    cfg.strategy.mr_gain = params.mr_gain;
    cfg.strategy.breakout_gain = params.breakout_gain;
    cfg.risk.risk_target = params.risk_target;
    cfg.risk.atr_stop_k = params.atr_stop_k;
    cfg.risk.atr_trail_k = params.atr_trail_k;
    cfg.strategy.regime.trend_adx_th = base.strategy.regime.trend_adx_th * params.regime_multiplier;
    cfg.strategy.regime.range_bw_th = base.strategy.regime.range_bw_th * params.regime_multiplier;
    cfg.normalize();
    cfg
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct GridEntry {
    pub trend_gain: f64,
    pub mr_gain: f64,
    pub breakout_gain: f64,
    pub risk_target: f64,
    pub atr_stop_k: f64,
    pub atr_trail_k: f64,
    pub regime_multiplier: f64,
    pub cagr: f64,
    pub max_dd: f64,
    pub sharpe: f64,
    pub calmar: f64,
    pub final_equity: f64,
}

impl GridEntry {
    fn params(&self) -> ParamSet {
        ParamSet {
            trend_gain: self.trend_gain,
            mr_gain: self.mr_gain,
            breakout_gain: self.breakout_gain,
            risk_target: self.risk_target,
            atr_stop_k: self.atr_stop_k,
            atr_trail_k: self.atr_trail_k,
            regime_multiplier: self.regime_multiplier,
        }
    }
}

pub struct GridOutcome {
    /// Ranked leaderboard, best first.
    pub entries: Vec<GridEntry>,
    pub report: String,
    pub sampled: usize,
    pub total: usize,
    pub failures: usize,
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Run the randomized grid search. Returns `None` when optimization is
/// disabled in the config.
pub fn run_grid_search(
    base: &BacktestConfig,
    bar_minutes: i64,
    series: &Series,
    baseline: &SimResult,
) -> Option<GridOutcome> {
    if !base.optimization.enable.unwrap_or(true) {
        return None;
    }
    let mut sets = generate_param_sets();
    if sets.is_empty() {
        return None;
    }
    let total = sets.len();

    let mut rng = StdRng::seed_from_u64(base.optimization.seed);
    sets.shuffle(&mut rng);
    let sampled = if base.optimization.max_samples > 0 {
        base.optimization.max_samples.min(total)
    } else {
        total
    };
    sets.truncate(sampled);
    eprintln!("[sweep] sampling {sampled} of {total} parameter combinations");

    // Each worker owns a fresh engine + component stack; the series is
    // shared read-only. Candidates that fail to simulate are discarded.
    let outcomes: Vec<Option<GridEntry>> = sets
        .par_iter()
        .map(|params| {
            let cfg = apply_params(base, params);
            let engine = build_engine(&cfg, bar_minutes);
            let mut strategy =
                RegimeStrategy::new(cfg.strategy.clone(), cfg.risk.clone(), bar_minutes);
            let mut risk = cfg.use_risk.then(|| RiskOverlay::new(cfg.risk.clone()));
            let res = engine.run(
                series,
                &mut strategy,
                risk.as_mut().map(|r| r as &mut dyn rbt_core::engine::Risk),
                None,
            );
            match res {
                Ok(res) => Some(GridEntry {
                    trend_gain: params.trend_gain,
                    mr_gain: params.mr_gain,
                    breakout_gain: params.breakout_gain,
                    risk_target: params.risk_target,
                    atr_stop_k: params.atr_stop_k,
                    atr_trail_k: params.atr_trail_k,
                    regime_multiplier: params.regime_multiplier,
                    cagr: res.cagr,
                    max_dd: res.max_dd,
                    sharpe: res.sharpe,
                    calmar: report::calmar(res.cagr, res.max_dd),
                    final_equity: res.final_equity,
                }),
                Err(e) => {
                    eprintln!("[sweep] candidate failed: {e}");
                    None
                }
            }
        })
        .collect();

    let failures = outcomes.iter().filter(|o| o.is_none()).count();
    let mut entries: Vec<GridEntry> = outcomes.into_iter().flatten().collect();
    entries.sort_by(|a, b| {
        b.calmar
            .total_cmp(&a.calmar)
            .then_with(|| b.sharpe.total_cmp(&a.sharpe))
            .then_with(|| a.params().cmp_key(&b.params()))
    });

    let report = entries
        .first()
        .map(|best| compose_report(baseline, best, sampled, total, failures))
        .unwrap_or_default();

    Some(GridOutcome {
        entries,
        report,
        sampled,
        total,
        failures,
    })
}

fn compose_report(
    baseline: &SimResult,
    best: &GridEntry,
    sampled: usize,
    total: usize,
    failures: usize,
) -> String {
    let dd_improvement = if baseline.max_dd > 0.0 {
        (baseline.max_dd - best.max_dd) / baseline.max_dd
    } else {
        0.0
    };
    let failure_line = if failures > 0 {
        format!("\nDiscarded {failures} failed configurations.\n")
    } else {
        String::new()
    };
    format!(
        "# Backtest Optimization Report\n\
         \n\
         Tested {sampled} of {total} parameter combinations (randomized grid).\n\
         {failure_line}\n\
         ## Baseline\n\
         - Final equity: {:.2}\n\
         - CAGR: {:.2}%\n\
         - Sharpe: {:.2}\n\
         - Max DD: {:.2}%\n\
         - Calmar: {:.2}\n\
         \n\
         ## Best Candidate\n\
         - Params: trend={:.2}, mr={:.2}, breakout={:.2}, risk_target={:.2}, \
         atr_stop={:.2}, atr_trail={:.2}, regime_mul={:.2}\n\
         - Final equity: {:.2}\n\
         - CAGR: {:.2}%\n\
         - Sharpe: {:.2}\n\
         - Max DD: {:.2}%\n\
         - Calmar: {:.2}\n\
         - Max DD improvement vs baseline: {:.2}%\n",
        baseline.final_equity,
        baseline.cagr * 100.0,
        baseline.sharpe,
        baseline.max_dd * 100.0,
        report::calmar(baseline.cagr, baseline.max_dd),
        best.trend_gain,
        best.mr_gain,
        best.breakout_gain,
        best.risk_target,
        best.atr_stop_k,
        best.atr_trail_k,
        best.regime_multiplier,
        best.final_equity,
        best.cagr * 100.0,
        best.sharpe,
        best.max_dd * 100.0,
        best.calmar,
        dd_improvement * 100.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_is_the_full_cartesian_product() {
        let sets = generate_param_sets();
        assert_eq!(sets.len(), 4 * 3 * 3 * 3 * 3 * 3 * 3);
        // No duplicates.
        for (i, a) in sets.iter().enumerate() {
            for b in sets.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn shuffle_is_deterministic_per_seed() {
        let mut a = generate_param_sets();
        let mut b = generate_param_sets();
        let mut c = generate_param_sets();
        a.shuffle(&mut StdRng::seed_from_u64(42));
        b.shuffle(&mut StdRng::seed_from_u64(42));
        c.shuffle(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn regime_multiplier_scales_both_thresholds() {
        let mut base = BacktestConfig::default();
        base.normalize();
        let params = ParamSet {
            trend_gain: 1.5,
            mr_gain: 0.7,
            breakout_gain: 1.0,
            risk_target: 0.55,
            atr_stop_k: 2.5,
            atr_trail_k: 3.0,
            regime_multiplier: 1.1,
        };
        let cfg = apply_params(&base, &params);
        assert!((cfg.strategy.regime.trend_adx_th - base.strategy.regime.trend_adx_th * 1.1).abs() < 1e-9);
        assert!((cfg.strategy.regime.range_bw_th - base.strategy.regime.range_bw_th * 1.1).abs() < 1e-9);
        assert!((cfg.strategy.trend_gain - 1.5).abs() < 1e-12);
        assert!((cfg.risk.atr_stop_k - 2.5).abs() < 1e-12);
    }

    #[test]
    fn ranking_prefers_calmar_then_sharpe_then_params() {
        let entry = |calmar: f64, sharpe: f64, trend: f64| GridEntry {
            trend_gain: trend,
            mr_gain: 0.7,
            breakout_gain: 1.0,
            risk_target: 0.55,
            atr_stop_k: 2.5,
            atr_trail_k: 3.0,
            regime_multiplier: 1.0,
            cagr: 0.1,
            max_dd: 0.1,
            sharpe,
            calmar,
            final_equity: 1.0,
        };
        let mut entries = vec![
            entry(1.0, 2.0, 1.8),
            entry(2.0, 0.5, 1.2),
            entry(1.0, 2.0, 1.5),
            entry(1.0, 3.0, 2.0),
        ];
        entries.sort_by(|a, b| {
            b.calmar
                .total_cmp(&a.calmar)
                .then_with(|| b.sharpe.total_cmp(&a.sharpe))
                .then_with(|| a.params().cmp_key(&b.params()))
        });
        assert_eq!(entries[0].calmar, 2.0);
        assert_eq!(entries[1].sharpe, 3.0);
        // Calmar/sharpe tie broken by the lexicographically smaller tuple.
        assert_eq!(entries[2].trend_gain, 1.5);
        assert_eq!(entries[3].trend_gain, 1.8);
    }
}
