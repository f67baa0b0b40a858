/// Average True Range as an EMA of the True Range, alpha = 2/(period+1).
///
/// Callers pass the previous close explicitly so the same tracker can be fed
/// from state that already carries `last_close`. A non-positive previous
/// close degrades the True Range to the plain high-low span.
#[derive(Debug, Clone)]
pub struct AtrTracker {
    period: usize,
    value: f64,
    ready: bool,
}

/// True Range: `max(h - l, |h - prev_close|, |l - prev_close|)`.
pub fn true_range(high: f64, low: f64, prev_close: f64) -> f64 {
    let range_hl = (high - low).max(0.0);
    if prev_close <= 0.0 {
        return range_hl;
    }
    range_hl
        .max((high - prev_close).abs())
        .max((low - prev_close).abs())
}

impl AtrTracker {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            value: 0.0,
            ready: false,
        }
    }

    pub fn update(&mut self, high: f64, low: f64, prev_close: f64) -> f64 {
        if !high.is_finite() || !low.is_finite() || !prev_close.is_finite() {
            return self.value;
        }
        let tr = true_range(high, low, prev_close);
        if !self.ready {
            self.value = tr;
            self.ready = true;
        } else {
            let alpha = 2.0 / (self.period as f64 + 1.0);
            self.value = alpha * tr + (1.0 - alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}
