/// Incremental exponential moving average, alpha = 2/(window+1).
/// The first observation seeds the value.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f64,
    value: f64,
    window: usize,
    count: usize,
}

impl Ema {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            alpha: 2.0 / (window as f64 + 1.0),
            value: 0.0,
            window,
            count: 0,
        }
    }

    pub fn update(&mut self, price: f64) -> f64 {
        if self.count == 0 {
            self.value = price;
        } else {
            self.value = self.alpha * price + (1.0 - self.alpha) * self.value;
        }
        self.count += 1;
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_warm(&self) -> bool {
        self.count >= self.window
    }
}
