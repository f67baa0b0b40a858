//! Historical candle loading.
//!
//! One CSV per instrument (`{data_path}/{inst}.csv`) with the header
//! `timestamp,open,high,low,close,volume`, timestamps in integer
//! milliseconds. Rows are sanitized, stable-sorted ascending and
//! de-duplicated (last row wins for a repeated timestamp) before the kernel
//! ever sees them.

use std::fmt;
use std::path::{Path, PathBuf};

use rbt_core::candle::{Candle, Series};
use rbt_core::config::BacktestConfig;

#[derive(Debug)]
pub enum DataError {
    Io(PathBuf, std::io::Error),
    Csv(PathBuf, csv::Error),
    /// Every configured instrument failed to load.
    NoInstruments,
    /// The `api` source needs a market-data fetcher, which this offline
    /// build does not ship.
    ApiUnavailable,
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(path, e) => write!(f, "read {}: {e}", path.display()),
            Self::Csv(path, e) => write!(f, "parse {}: {e}", path.display()),
            Self::NoInstruments => write!(f, "no instruments loaded"),
            Self::ApiUnavailable => {
                write!(f, "data_source=\"api\" requires a market-data fetcher; use csv")
            }
        }
    }
}

impl std::error::Error for DataError {}

/// Load the full series for a backtest config. Instruments that fail to load
/// are skipped with a stderr warning; the load only fails when nothing
/// survives.
pub fn load_series(cfg: &BacktestConfig) -> Result<Series, DataError> {
    if cfg.data_source.trim().eq_ignore_ascii_case("api") {
        return Err(DataError::ApiUnavailable);
    }
    let mut series = Series::default();
    for inst in &cfg.instruments {
        let path = Path::new(&cfg.data_path).join(format!("{inst}.csv"));
        match load_instrument_csv(&path, inst) {
            Ok(mut bars) => {
                if bars.is_empty() {
                    eprintln!("[data] {inst}: no usable rows, skipping");
                    continue;
                }
                if cfg.bars_limit > 0 && bars.len() > cfg.bars_limit {
                    let excess = bars.len() - cfg.bars_limit;
                    bars.drain(..excess);
                }
                eprintln!("[data] loaded {inst}: {} bars", bars.len());
                series.insert(inst.clone(), bars);
            }
            Err(e) => {
                if cfg.auto_fetch_if_missing {
                    eprintln!(
                        "[data] {inst}: {e}; auto_fetch_if_missing set but no fetcher is wired in, skipping"
                    );
                } else {
                    eprintln!("[data] {inst}: {e}, skipping");
                }
            }
        }
    }
    if series.is_empty() {
        return Err(DataError::NoInstruments);
    }
    Ok(series)
}

/// Read one instrument CSV: skip malformed or non-finite rows, sort
/// ascending, collapse duplicate timestamps to the last occurrence.
pub fn load_instrument_csv(path: &Path, inst: &str) -> Result<Vec<Candle>, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| {
            if matches!(e.kind(), csv::ErrorKind::Io(_)) {
                DataError::Io(path.to_path_buf(), std::io::Error::other(e.to_string()))
            } else {
                DataError::Csv(path.to_path_buf(), e)
            }
        })?;

    let mut out: Vec<Candle> = Vec::new();
    let mut dropped = 0usize;
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(_) => {
                dropped += 1;
                continue;
            }
        };
        match parse_row(&record, inst) {
            Some(candle) => out.push(candle),
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        eprintln!("[data] {inst}: dropped {dropped} malformed rows");
    }
    Ok(ensure_asc_unique(out))
}

fn parse_row(record: &csv::StringRecord, inst: &str) -> Option<Candle> {
    if record.len() < 6 {
        return None;
    }
    let t: i64 = record.get(0)?.trim().parse().ok()?;
    let o: f64 = record.get(1)?.trim().parse().ok()?;
    let h: f64 = record.get(2)?.trim().parse().ok()?;
    let l: f64 = record.get(3)?.trim().parse().ok()?;
    let c: f64 = record.get(4)?.trim().parse().ok()?;
    let v: f64 = record.get(5)?.trim().parse().ok()?;
    let finite = [o, h, l, c, v].iter().all(|x| x.is_finite());
    if !finite || t <= 0 || v < 0.0 {
        return None;
    }
    // Bar shape invariant: h >= max(o, c) >= min(o, c) >= l.
    if h < o.max(c) || l > o.min(c) {
        return None;
    }
    Some(Candle {
        inst_id: inst.to_string(),
        t,
        o,
        h,
        l,
        c,
        v,
    })
}

/// Stable-sort ascending by timestamp and collapse duplicates, keeping the
/// last row seen for each timestamp.
fn ensure_asc_unique(mut bars: Vec<Candle>) -> Vec<Candle> {
    bars.sort_by_key(|b| b.t);
    let mut out: Vec<Candle> = Vec::with_capacity(bars.len());
    for bar in bars {
        match out.last_mut() {
            Some(prev) if prev.t == bar.t => *prev = bar,
            _ => out.push(bar),
        }
    }
    out
}
