//! Run orchestration: wire config into components, drive the kernel, build
//! analytics, emit artifacts and hand off to the grid search.

pub mod artifacts;
pub mod sweep;

use std::collections::BTreeMap;
use std::error::Error;
use std::path::Path;

use serde::Serialize;

use rbt_core::candle::Series;
use rbt_core::config::BacktestConfig;
use rbt_core::engine::{Engine, EngineConfig, HookOutcome, SimResult};
use rbt_core::error::{ConfigError, EngineError};
use rbt_core::portfolio::PortfolioEngine;
use rbt_core::report::{self, AttributionStats, VolTargetStats};
use rbt_risk::{RiskOverlay, RiskSummary};
use rbt_signals::{RegimeStrategy, StrategySummary};
use sweep::GridOutcome;

/// Translate the backtest config into kernel settings.
pub fn build_engine(cfg: &BacktestConfig, bar_minutes: i64) -> Engine {
    let max_abs = if cfg.risk.max_abs_position > 0.0 {
        cfg.risk.max_abs_position
    } else {
        1.0
    };
    Engine::new(EngineConfig {
        initial_equity: cfg.initial_cash,
        bar_minutes,
        trade_on_next_bar: cfg.execution.trade_on_next_bar,
        taker_fee_bps: cfg.execution.taker_fee_bps,
        maker_fee_bps: cfg.execution.maker_fee_bps,
        slippage_bps: cfg.execution.slippage_bps,
        use_maker: cfg.execution.use_maker,
        min_rebalance_step: cfg.execution.min_rebalance_step,
        max_abs_position: max_abs,
    })
}

/// Per-run analytics beyond the kernel's own statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunAnalytics {
    pub strategy_attribution: BTreeMap<String, AttributionStats>,
    pub strategy_summary: StrategySummary,
    pub risk_summary: RiskSummary,
    pub vol_target: VolTargetStats,
}

/// Everything a caller needs after `Runner::run`.
pub struct RunSummary {
    pub result: SimResult,
    pub analytics: RunAnalytics,
    pub grid: Option<GridOutcome>,
}

pub struct Runner {
    config: BacktestConfig,
    bar_minutes: i64,
}

impl Runner {
    pub fn from_config_path(path: &Path) -> Result<Self, ConfigError> {
        let cfg = BacktestConfig::load_or_init(path)?;
        Self::with_config(cfg)
    }

    pub fn with_config(mut cfg: BacktestConfig) -> Result<Self, ConfigError> {
        cfg.normalize();
        cfg.validate()?;
        let bar_minutes = cfg.bar_minutes();
        Ok(Self {
            config: cfg,
            bar_minutes,
        })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn bar_minutes(&self) -> i64 {
        self.bar_minutes
    }

    /// Simulate the configured component stack over an in-memory series.
    pub fn simulate(&self, series: &Series) -> Result<(SimResult, RunAnalytics), EngineError> {
        let cfg = &self.config;
        let mut engine = build_engine(cfg, self.bar_minutes);
        engine.set_after_fill(Box::new(|inst, side, turnover, ref_price| {
            eprintln!(
                "[fill] {:<4} {:<16} turnover={:.4} @ref={:.2}",
                side.as_str().to_uppercase(),
                inst,
                turnover,
                ref_price
            );
            HookOutcome::default()
        }));

        let mut strategy =
            RegimeStrategy::new(cfg.strategy.clone(), cfg.risk.clone(), self.bar_minutes);
        let mut risk = cfg.use_risk.then(|| RiskOverlay::new(cfg.risk.clone()));
        let mut portfolio = cfg
            .use_portfolio
            .then(|| PortfolioEngine::new(cfg.portfolio.clone(), self.bar_minutes));

        let result = engine.run(
            series,
            &mut strategy,
            risk.as_mut().map(|r| r as &mut dyn rbt_core::engine::Risk),
            portfolio
                .as_mut()
                .map(|p| p as &mut dyn rbt_core::engine::Portfolio),
        )?;

        let analytics = RunAnalytics {
            strategy_attribution: report::summarize_attribution(&result.trades),
            strategy_summary: strategy.summary(),
            risk_summary: risk.as_mut().map(|r| r.summary()).unwrap_or_default(),
            vol_target: report::vol_target_stats(
                &result.equity_curve,
                self.bar_minutes,
                cfg.risk.risk_target,
            ),
        };
        Ok((result, analytics))
    }

    /// Full run: load data, simulate, report, write artifacts, then grid
    /// search when enabled (and not suppressed by the caller).
    pub fn run(&self, output_dir: &Path, optimize: bool) -> Result<RunSummary, Box<dyn Error>> {
        let cfg = &self.config;
        eprintln!(
            "[run] timeframe={}({}min) source={} data_path={} risk={} portfolio={}",
            cfg.timeframe.trim(),
            self.bar_minutes,
            cfg.data_source.to_ascii_lowercase(),
            cfg.data_path,
            cfg.use_risk,
            cfg.use_portfolio
        );

        let series = rbt_data::load_series(cfg)?;
        let (result, analytics) = self.simulate(&series)?;
        print_results(&result, &analytics);
        save_all(output_dir, &result, &analytics)?;

        let mut grid = None;
        if optimize {
            if let Some(outcome) =
                sweep::run_grid_search(cfg, self.bar_minutes, &series, &result)
            {
                artifacts::save_leaderboard(&output_dir.join("leaderboard.csv"), &outcome.entries)?;
                artifacts::save_report(&output_dir.join("report.md"), &outcome.report)?;
                eprintln!(
                    "[sweep] leaderboard written: {} entries ({} failed)",
                    outcome.entries.len(),
                    outcome.failures
                );
                grid = Some(outcome);
            }
        }

        Ok(RunSummary {
            result,
            analytics,
            grid,
        })
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

fn print_results(r: &SimResult, a: &RunAnalytics) {
    eprintln!("============================================================");
    eprintln!("Backtest Summary");
    eprintln!("============================================================");
    eprintln!("Final Equity        : {:.2}", r.final_equity);
    eprintln!("Total Return        : {:.2}%", r.total_return * 100.0);
    eprintln!("CAGR                : {:.2}%", r.cagr * 100.0);
    eprintln!("Sharpe              : {:.2}", r.sharpe);
    eprintln!("Max Drawdown        : {:.2}%", r.max_dd * 100.0);
    eprintln!("Win Rate            : {:.2}%", r.win_rate * 100.0);
    eprintln!("Number of Trades    : {}", r.num_trades);
    eprintln!(
        "Actual Volatility   : {:.2}% (target {:.2}%)",
        a.vol_target.actual * 100.0,
        a.vol_target.target * 100.0
    );
    let s = &a.strategy_summary;
    let hit_rate = if s.mtf_checks > 0 {
        s.mtf_aligned as f64 / s.mtf_checks as f64
    } else {
        0.0
    };
    eprintln!(
        "MTF Hit Rate        : {:.2}% ({}/{})",
        hit_rate * 100.0,
        s.mtf_aligned,
        s.mtf_checks
    );
    eprintln!("Fallback Usage      : {}", s.fallback_usage);
    eprintln!("Stop Counts         : {:?}", a.risk_summary.stop_counts);
    eprintln!("DD Circuit Windows  : {}", a.risk_summary.dd_windows.len());
    eprintln!("Strategy Attribution:");
    for (key, stats) in &a.strategy_attribution {
        eprintln!(
            "  - {:<10} trades={:3} win_rate={:.2}% total={:.2}%",
            key,
            stats.trades,
            stats.win_rate * 100.0,
            stats.total_return * 100.0
        );
    }
    eprintln!("============================================================");
}

fn save_all(
    output_dir: &Path,
    r: &SimResult,
    a: &RunAnalytics,
) -> Result<(), Box<dyn Error>> {
    std::fs::create_dir_all(output_dir)?;
    let stats = serde_json::json!({
        "final_equity": r.final_equity,
        "total_return": r.total_return,
        "cagr": r.cagr,
        "sharpe": r.sharpe,
        "max_dd": r.max_dd,
        "win_rate": r.win_rate,
        "num_trades": r.num_trades,
        "actual_vol": a.vol_target.actual,
        "vol_target": a.vol_target.target,
        "strategy_attribution": a.strategy_attribution,
        "strategy_summary": a.strategy_summary,
        "risk_summary": a.risk_summary,
    });
    artifacts::save_json(&output_dir.join("stats.json"), &stats)?;
    artifacts::save_equity_curve(&output_dir.join("equity_curve.csv"), &r.equity_curve)?;
    artifacts::save_json(&output_dir.join("trades.json"), &r.trades)?;
    artifacts::save_trade_details(&output_dir.join("trades_detailed.csv"), &r.trades)?;
    Ok(())
}
