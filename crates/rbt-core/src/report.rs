//! Performance statistics and trade attribution.
//!
//! Everything annualizes with `sqrt(525600 / bar_minutes)` so the same factor
//! feeds Sharpe, CAGR horizon math and realized-volatility reporting.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::position::{EquityPoint, Trade};

/// Minutes per year over the bar length.
pub fn bars_per_year(bar_minutes: i64) -> f64 {
    525_600.0 / bar_minutes.max(1) as f64
}

pub fn annualization_factor(bar_minutes: i64) -> f64 {
    bars_per_year(bar_minutes).sqrt()
}

fn mean(vals: &[f64]) -> f64 {
    if vals.is_empty() {
        return 0.0;
    }
    vals.iter().sum::<f64>() / vals.len() as f64
}

/// Sample standard deviation (n - 1).
pub fn std_dev(vals: &[f64]) -> f64 {
    if vals.len() <= 1 {
        return 0.0;
    }
    let m = mean(vals);
    let acc = vals.iter().map(|v| (v - m) * (v - m)).sum::<f64>();
    (acc / (vals.len() - 1) as f64).sqrt()
}

/// Annualized Sharpe over per-group aggregate returns. Zero below 30 samples
/// or with degenerate variance.
pub fn sharpe(rets: &[f64], bar_minutes: i64) -> f64 {
    if rets.len() < 30 {
        return 0.0;
    }
    let sd = std_dev(rets);
    if sd <= 0.0 {
        return 0.0;
    }
    (mean(rets) / sd) * annualization_factor(bar_minutes)
}

/// Compound annual growth rate over `n_points` equity samples.
pub fn cagr(final_equity: f64, initial_equity: f64, n_points: usize, bar_minutes: i64) -> f64 {
    if initial_equity <= 0.0 || final_equity <= 0.0 || n_points == 0 {
        return 0.0;
    }
    let years = n_points as f64 / bars_per_year(bar_minutes);
    if years <= 0.0 {
        return 0.0;
    }
    (final_equity / initial_equity).powf(1.0 / years) - 1.0
}

pub fn annualize_vol(per_bar_std: f64, bar_minutes: i64) -> f64 {
    if per_bar_std <= 0.0 {
        return 0.0;
    }
    per_bar_std * annualization_factor(bar_minutes)
}

/// CAGR over max drawdown, with a drawdown floor so flat runs stay finite.
pub fn calmar(cagr: f64, max_dd: f64) -> f64 {
    cagr / max_dd.max(1e-6)
}

// ---------------------------------------------------------------------------
// Attribution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct AttributionStats {
    pub trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub total_return: f64,
}

/// Bucket closed trades by dominant sub-strategy. The four canonical buckets
/// are always present (zeroed when unused); any other label shows up on
/// demand.
pub fn summarize_attribution(trades: &[Trade]) -> BTreeMap<String, AttributionStats> {
    #[derive(Default)]
    struct Acc {
        trades: usize,
        wins: usize,
        win_sum: f64,
        losses: usize,
        loss_sum: f64,
        total: f64,
    }

    let mut acc: BTreeMap<String, Acc> = BTreeMap::new();
    for key in ["trend", "mr", "breakout", "fallback"] {
        acc.insert(key.to_string(), Acc::default());
    }
    for tr in trades {
        let bucket = acc.entry(tr.sub_strategy.as_str().to_string()).or_default();
        bucket.trades += 1;
        bucket.total += tr.ret;
        if tr.ret > 0.0 {
            bucket.wins += 1;
            bucket.win_sum += tr.ret;
        } else if tr.ret < 0.0 {
            bucket.losses += 1;
            bucket.loss_sum += tr.ret;
        }
    }

    acc.into_iter()
        .map(|(key, a)| {
            let stats = AttributionStats {
                trades: a.trades,
                wins: a.wins,
                win_rate: if a.trades > 0 {
                    a.wins as f64 / a.trades as f64
                } else {
                    0.0
                },
                avg_win: if a.wins > 0 {
                    a.win_sum / a.wins as f64
                } else {
                    0.0
                },
                avg_loss: if a.losses > 0 {
                    a.loss_sum / a.losses as f64
                } else {
                    0.0
                },
                total_return: a.total,
            };
            (key, stats)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Realized volatility vs target
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct VolTargetStats {
    pub target: f64,
    pub actual: f64,
}

/// Annualized standard deviation of the per-group aggregate returns against
/// the configured risk target.
pub fn vol_target_stats(curve: &[EquityPoint], bar_minutes: i64, target: f64) -> VolTargetStats {
    let mut stats = VolTargetStats {
        target,
        actual: 0.0,
    };
    if curve.is_empty() {
        return stats;
    }
    let rets: Vec<f64> = curve.iter().map(|p| p.ret).collect();
    stats.actual = annualize_vol(std_dev(&rets), bar_minutes);
    stats
}
