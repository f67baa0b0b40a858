//! Fill accounting: trading-cost model and the position transition that
//! opens, flips and closes round trips.

use crate::position::{Dir, InstState, SignalMeta, StopReason, Trade};

/// Minimum position delta that counts as a fill at all.
pub const MIN_FILL_DELTA: f64 = 1e-9;

/// Fee and slippage model in basis points of turnover.
#[derive(Debug, Clone, Copy)]
pub struct CostModel {
    pub taker_fee_bps: f64,
    pub maker_fee_bps: f64,
    pub slippage_bps: f64,
    pub use_maker: bool,
}

impl CostModel {
    /// Fee plus slippage, before any hook surcharges.
    pub fn base_bps(&self) -> f64 {
        let fee = if self.use_maker {
            self.maker_fee_bps
        } else {
            self.taker_fee_bps
        };
        fee + self.slippage_bps
    }

    /// Multiplicative equity haircut for trading `turnover` relative units
    /// at `bps` basis points.
    pub fn equity_factor(turnover: f64, bps: f64) -> f64 {
        1.0 - turnover * bps / 10_000.0
    }
}

/// Apply a position change to `st` at `ref_price`/`ts` and return the closed
/// trade when the change crosses or reaches zero.
///
/// The caller has already charged trading costs; this only handles the state
/// transition and trade bookkeeping. Tags for a newly opened position come
/// from `meta`; a closing stop reason is stamped on the emitted trade.
pub fn apply_position_change(
    st: &mut InstState,
    inst: &str,
    target: f64,
    ref_price: f64,
    ts: i64,
    meta: &SignalMeta,
    stop: Option<StopReason>,
) -> Option<Trade> {
    let current = st.position;
    if (target - current).abs() < MIN_FILL_DELTA {
        return None;
    }

    let closing = current != 0.0 && (target == 0.0 || target.signum() != current.signum());
    let opening = current == 0.0 && target != 0.0;

    st.position = target;

    let mut closed = None;
    if closing {
        let dir = Dir::from_position(current);
        let ret = dir.sign() * (ref_price / (st.entry_price + 1e-12)).ln() * current.abs();
        closed = Some(Trade {
            inst_id: inst.to_string(),
            dir,
            entry_ts: st.entry_ts,
            entry_price: st.entry_price,
            exit_ts: ts,
            exit_price: ref_price,
            size: current.abs(),
            ret,
            sub_strategy: st.entry_meta.sub_strategy,
            regime: st.entry_meta.regime,
            stop_type: stop,
            atr_on_entry: st.entry_meta.atr,
        });

        if target != 0.0 {
            // Sign flip: the new leg opens at the same fill.
            st.entry_price = ref_price;
            st.entry_ts = ts;
            st.entry_meta = meta.clone();
        } else {
            st.entry_price = 0.0;
            st.entry_ts = 0;
            st.entry_meta = SignalMeta::default();
        }
    } else if opening {
        st.entry_price = ref_price;
        st.entry_ts = ts;
        st.entry_meta = meta.clone();
    }

    closed
}
