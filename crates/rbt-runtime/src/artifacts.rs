//! Result artifacts written after a run completes: stats JSON, equity curve
//! and trade CSVs, the sweep leaderboard and the optimization report.

use std::error::Error;
use std::path::Path;

use chrono::{TimeZone, Utc};
use serde::Serialize;

use rbt_core::position::{EquityPoint, Trade};

use crate::sweep::GridEntry;

/// Render a millisecond timestamp as a UTC minute string, `-` when unset.
pub fn format_timestamp(ts: i64) -> String {
    if ts <= 0 {
        return "-".to_string();
    }
    match Utc.timestamp_millis_opt(ts).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        None => "-".to_string(),
    }
}

/// Simple price return of a closed trade, signed by direction. Falls back to
/// the stored log-return contribution when prices are missing.
pub fn trade_price_return(tr: &Trade) -> f64 {
    if tr.entry_price > 0.0 && tr.exit_price > 0.0 {
        let gross = tr.exit_price / tr.entry_price - 1.0;
        gross * tr.dir.sign()
    } else {
        tr.ret
    }
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(value)?;
    std::fs::write(path, body)?;
    Ok(())
}

pub fn save_equity_curve(path: &Path, curve: &[EquityPoint]) -> Result<(), Box<dyn Error>> {
    let mut w = csv::Writer::from_path(path)?;
    w.write_record(["timestamp", "equity", "return", "drawdown"])?;
    for p in curve {
        w.write_record([
            p.ts.to_string(),
            format!("{:.6}", p.equity),
            format!("{:.6}", p.ret),
            format!("{:.6}", p.drawdown),
        ])?;
    }
    w.flush()?;
    Ok(())
}

pub fn save_trade_details(path: &Path, trades: &[Trade]) -> Result<(), Box<dyn Error>> {
    let mut w = csv::Writer::from_path(path)?;
    w.write_record([
        "idx",
        "instrument",
        "dir",
        "entry_ts",
        "entry_utc",
        "entry_price",
        "exit_ts",
        "exit_utc",
        "exit_price",
        "size",
        "return_pct",
        "holding_minutes",
        "sub_strategy",
        "regime",
        "stop_type",
        "atr_on_entry",
    ])?;
    for (i, tr) in trades.iter().enumerate() {
        let holding_minutes = if tr.entry_ts > 0 && tr.exit_ts > 0 {
            format!("{:.2}", (tr.exit_ts - tr.entry_ts) as f64 / 60_000.0)
        } else {
            String::new()
        };
        w.write_record([
            (i + 1).to_string(),
            tr.inst_id.clone(),
            tr.dir.as_str().to_string(),
            tr.entry_ts.to_string(),
            format_timestamp(tr.entry_ts),
            format!("{:.6}", tr.entry_price),
            tr.exit_ts.to_string(),
            format_timestamp(tr.exit_ts),
            format!("{:.6}", tr.exit_price),
            format!("{:.6}", tr.size),
            format!("{:.4}", trade_price_return(tr) * 100.0),
            holding_minutes,
            tr.sub_strategy.as_str().to_string(),
            tr.regime.as_str().to_string(),
            tr.stop_type.map(|s| s.as_str()).unwrap_or("").to_string(),
            format!("{:.6}", tr.atr_on_entry),
        ])?;
    }
    w.flush()?;
    Ok(())
}

pub fn save_leaderboard(path: &Path, entries: &[GridEntry]) -> Result<(), Box<dyn Error>> {
    if entries.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut w = csv::Writer::from_path(path)?;
    w.write_record([
        "rank",
        "trend_gain",
        "mr_gain",
        "breakout_gain",
        "risk_target",
        "atr_stop_k",
        "atr_trail_k",
        "regime_multiplier",
        "cagr",
        "max_dd",
        "sharpe",
        "calmar",
        "final_equity",
    ])?;
    for (i, e) in entries.iter().enumerate() {
        w.write_record([
            (i + 1).to_string(),
            format!("{:.2}", e.trend_gain),
            format!("{:.2}", e.mr_gain),
            format!("{:.2}", e.breakout_gain),
            format!("{:.2}", e.risk_target),
            format!("{:.2}", e.atr_stop_k),
            format!("{:.2}", e.atr_trail_k),
            format!("{:.2}", e.regime_multiplier),
            format!("{:.4}", e.cagr),
            format!("{:.4}", e.max_dd),
            format!("{:.4}", e.sharpe),
            format!("{:.4}", e.calmar),
            format!("{:.4}", e.final_equity),
        ])?;
    }
    w.flush()?;
    Ok(())
}

pub fn save_report(path: &Path, body: &str) -> Result<(), Box<dyn Error>> {
    if body.trim().is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbt_core::position::{Dir, Regime, StopReason, SubStrategy};

    #[test]
    fn timestamps_render_utc_minutes() {
        assert_eq!(format_timestamp(0), "-");
        assert_eq!(format_timestamp(-5), "-");
        // 2024-01-01T00:00:00Z
        assert_eq!(format_timestamp(1_704_067_200_000), "2024-01-01 00:00");
    }

    #[test]
    fn price_return_signs_by_direction() {
        let mut tr = Trade {
            inst_id: "X".into(),
            dir: Dir::Long,
            entry_ts: 1,
            entry_price: 100.0,
            exit_ts: 2,
            exit_price: 110.0,
            size: 1.0,
            ret: 0.0953,
            sub_strategy: SubStrategy::Trend,
            regime: Regime::Trending,
            stop_type: Some(StopReason::AtrStop),
            atr_on_entry: 1.0,
        };
        assert!((trade_price_return(&tr) - 0.10).abs() < 1e-12);
        tr.dir = Dir::Short;
        assert!((trade_price_return(&tr) + 0.10).abs() < 1e-12);
        tr.entry_price = 0.0;
        assert!((trade_price_return(&tr) - tr.ret).abs() < 1e-12);
    }
}
