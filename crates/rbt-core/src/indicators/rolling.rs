//! Suffix-window statistics over plain price histories.
//!
//! The strategy layer keeps bounded `Vec<f64>` windows per instrument and
//! evaluates several lookbacks against the same history, so these helpers
//! operate on the trailing `n` elements of a slice instead of owning state.

/// EMA over the trailing `period` elements, seeded with the oldest of them.
pub fn ema_last(vals: &[f64], period: usize) -> f64 {
    if vals.is_empty() {
        return 0.0;
    }
    if period <= 1 {
        return vals[vals.len() - 1];
    }
    let period = period.min(vals.len());
    let alpha = 2.0 / (period as f64 + 1.0);
    let start = vals.len() - period;
    let mut ema = vals[start];
    for &v in &vals[start + 1..] {
        ema = alpha * v + (1.0 - alpha) * ema;
    }
    ema
}

/// Simple moving average over the trailing `n` elements. Falls back to the
/// latest value when fewer than `n` are available.
pub fn sma_last(vals: &[f64], n: usize) -> f64 {
    if vals.is_empty() {
        return 0.0;
    }
    if n == 0 || vals.len() < n {
        return vals[vals.len() - 1];
    }
    vals[vals.len() - n..].iter().sum::<f64>() / n as f64
}

/// Sample standard deviation over the trailing `n` elements; zero when the
/// window is not yet filled.
pub fn std_last(vals: &[f64], n: usize) -> f64 {
    if n <= 1 || vals.len() < n {
        return 0.0;
    }
    let tail = &vals[vals.len() - n..];
    let mean = tail.iter().sum::<f64>() / n as f64;
    let acc = tail.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>();
    (acc / (n - 1) as f64).sqrt()
}

pub fn max_last(vals: &[f64], n: usize) -> f64 {
    if vals.is_empty() {
        return 0.0;
    }
    let n = n.min(vals.len()).max(1);
    vals[vals.len() - n..]
        .iter()
        .fold(f64::NEG_INFINITY, |a, &b| a.max(b))
}

pub fn min_last(vals: &[f64], n: usize) -> f64 {
    if vals.is_empty() {
        return 0.0;
    }
    let n = n.min(vals.len()).max(1);
    vals[vals.len() - n..]
        .iter()
        .fold(f64::INFINITY, |a, &b| a.min(b))
}

/// Bollinger bands over the trailing `period` closes: middle = SMA,
/// bands at +/- 2 sample standard deviations.
#[derive(Debug, Clone, Copy)]
pub struct BollingerOutput {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

pub fn bollinger(vals: &[f64], period: usize) -> Option<BollingerOutput> {
    if period == 0 || vals.len() < period {
        return None;
    }
    let middle = sma_last(vals, period);
    let std = std_last(vals, period);
    Some(BollingerOutput {
        upper: middle + 2.0 * std,
        middle,
        lower: middle - 2.0 * std,
    })
}

/// Relative Bollinger bandwidth `(upper - lower) / middle`; zero when the
/// window is short, the middle is non-positive, or the band has no width.
pub fn bollinger_bandwidth(vals: &[f64], period: usize) -> f64 {
    let Some(bb) = bollinger(vals, period) else {
        return 0.0;
    };
    if bb.middle <= 0.0 || bb.upper <= bb.lower {
        return 0.0;
    }
    (bb.upper - bb.lower) / bb.middle
}

/// `x / (1 + |x|)`: squashes to (-1, +1) while keeping the sign and slope.
pub fn softsign(x: f64) -> f64 {
    if x == 0.0 {
        0.0
    } else {
        x / (1.0 + x.abs())
    }
}

/// Sign with a true zero branch (`f64::signum` maps 0.0 to 1.0).
pub fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Append with a trailing-window cap: keeps at most `limit` elements.
pub fn push_capped(win: &mut Vec<f64>, v: f64, limit: usize) {
    win.push(v);
    if limit > 0 && win.len() > limit {
        let excess = win.len() - limit;
        win.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_and_std_over_tail() {
        let vals = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((sma_last(&vals, 3) - 4.0).abs() < 1e-12);
        // tail [3,4,5]: sample var = 1
        assert!((std_last(&vals, 3) - 1.0).abs() < 1e-12);
        // short window falls back to last value / zero
        assert!((sma_last(&vals[..2], 3) - 2.0).abs() < 1e-12);
        assert_eq!(std_last(&vals[..2], 3), 0.0);
    }

    #[test]
    fn ema_last_matches_incremental() {
        let vals = [10.0, 11.0, 12.0, 13.0];
        // period 3 over [11,12,13], alpha 0.5: 11 -> 11.5 -> 12.25
        assert!((ema_last(&vals, 3) - 12.25).abs() < 1e-12);
        assert!((ema_last(&vals, 1) - 13.0).abs() < 1e-12);
    }

    #[test]
    fn extremes_over_tail() {
        let vals = [5.0, 9.0, 1.0, 7.0];
        assert_eq!(max_last(&vals, 2), 7.0);
        assert_eq!(min_last(&vals, 2), 1.0);
        assert_eq!(max_last(&vals, 10), 9.0);
    }

    #[test]
    fn bollinger_bandwidth_zero_until_filled() {
        let mut vals = vec![100.0; 5];
        assert_eq!(bollinger_bandwidth(&vals, 10), 0.0);
        vals.extend([101.0, 99.0, 102.0, 98.0, 100.0]);
        let bw = bollinger_bandwidth(&vals, 10);
        assert!(bw > 0.0);
        let bb = bollinger(&vals, 10).unwrap();
        assert!(bb.upper > bb.middle && bb.middle > bb.lower);
    }

    #[test]
    fn softsign_squashes() {
        assert_eq!(softsign(0.0), 0.0);
        assert!((softsign(1.0) - 0.5).abs() < 1e-12);
        assert!((softsign(-3.0) + 0.75).abs() < 1e-12);
        assert!(softsign(1e9) < 1.0);
    }

    #[test]
    fn push_capped_trims_front() {
        let mut w = Vec::new();
        for i in 0..10 {
            push_capped(&mut w, i as f64, 4);
        }
        assert_eq!(w, vec![6.0, 7.0, 8.0, 9.0]);
    }
}
