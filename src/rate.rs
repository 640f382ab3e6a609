use serde::Deserialize;

/// Rate options from the query wire form. `counter_max` bounds a rolling
/// counter; `drop_resets` suppresses the synthesized rollover sample.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateOptions {
    pub counter: bool,
    pub counter_max: f64,
    pub drop_resets: bool,
}

impl Default for RateOptions {
    fn default() -> Self {
        Self {
            counter: false,
            counter_max: f64::MAX,
            drop_resets: false,
        }
    }
}

/// Per-series first-difference converter. The query window is widened by one
/// hour upstream so the first in-range point has a predecessor; emission is
/// therefore gated on `t >= query_start`.
#[derive(Debug)]
pub struct RateConverter {
    options: RateOptions,
    query_start_secs: f64,
    prev: Option<(f64, f64)>,
}

impl RateConverter {
    pub fn new(options: RateOptions, query_start_secs: f64) -> Self {
        Self {
            options,
            query_start_secs,
            prev: None,
        }
    }

    /// Feed the next `(seconds, value)` sample; returns the rate to emit, if
    /// any. Samples must arrive time-ascending within a series.
    pub fn try_calc(&mut self, t: f64, v: f64) -> Option<f64> {
        let prev = self.prev.replace((t, v));
        let (t_prev, v_prev) = prev?;
        let dt = t - t_prev;
        if dt <= 0.0 || t < self.query_start_secs {
            return None;
        }
        if self.options.counter && v < v_prev {
            if self.options.drop_resets {
                return None;
            }
            return Some((self.options.counter_max - v_prev + v) / dt);
        }
        Some((v - v_prev) / dt)
    }

    /// Forget the previous sample at a series boundary.
    pub fn reset(&mut self) {
        self.prev = None;
    }
}
