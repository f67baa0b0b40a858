//! Streaming numerics shared by the strategy, risk and portfolio layers.

pub mod adx;
pub mod atr;
pub mod ema;
pub mod ew;
pub mod rolling;

pub use adx::AdxTracker;
pub use atr::AtrTracker;
pub use ema::Ema;
pub use ew::{alpha_from_half_life, EwCorr, EwVar, SharpeTracker};

/// Fixed-capacity ring buffer for rolling-window computations.
#[derive(Debug, Clone)]
pub struct RingBuf {
    buf: Vec<f64>,
    pos: usize,
    len: usize,
    cap: usize,
}

impl RingBuf {
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(1);
        Self {
            buf: vec![0.0; cap],
            pos: 0,
            len: 0,
            cap,
        }
    }

    pub fn push(&mut self, val: f64) {
        self.buf[self.pos] = val;
        self.pos = (self.pos + 1) % self.cap;
        if self.len < self.cap {
            self.len += 1;
        }
    }

    pub fn full(&self) -> bool {
        self.len == self.cap
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate oldest-first.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        let start = if self.len < self.cap { 0 } else { self.pos };
        (0..self.len).map(move |i| self.buf[(start + i) % self.cap])
    }

    pub fn mean(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        self.iter().sum::<f64>() / self.len as f64
    }

    /// Sample standard deviation (n - 1 in the denominator).
    pub fn std_sample(&self) -> f64 {
        if self.len <= 1 {
            return 0.0;
        }
        let mean = self.mean();
        let acc = self.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>();
        (acc / (self.len - 1) as f64).sqrt()
    }

    pub fn min(&self) -> f64 {
        self.iter().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.iter().fold(f64::NEG_INFINITY, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_wraps_and_keeps_order() {
        let mut r = RingBuf::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            r.push(v);
        }
        assert!(r.full());
        let vals: Vec<f64> = r.iter().collect();
        assert_eq!(vals, vec![2.0, 3.0, 4.0]);
        assert!((r.mean() - 3.0).abs() < 1e-12);
        assert_eq!(r.min(), 2.0);
        assert_eq!(r.max(), 4.0);
    }

    #[test]
    fn std_sample_matches_hand_computation() {
        let mut r = RingBuf::new(4);
        for v in [2.0, 4.0, 4.0, 6.0] {
            r.push(v);
        }
        // mean 4, sum sq dev 8, sample var 8/3
        assert!((r.std_sample() - (8.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn partial_buffer_stats() {
        let mut r = RingBuf::new(10);
        r.push(5.0);
        assert_eq!(r.len(), 1);
        assert!(!r.full());
        assert_eq!(r.std_sample(), 0.0);
        assert!((r.mean() - 5.0).abs() < 1e-12);
    }
}
