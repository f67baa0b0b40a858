/// OHLCV bar for one instrument. Timestamps are milliseconds since epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub inst_id: String,
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

/// Top-of-book snapshot. Reserved for live adapters; the bar-time kernel
/// never produces tickers, but the component traits accept them so the same
/// strategy and risk implementations can be reused outside the backtest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ticker {
    pub inst_id: String,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub last: f64,
}

/// All bar data keyed by instrument id.
pub type Series = rustc_hash::FxHashMap<String, Vec<Candle>>;
