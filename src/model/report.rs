use std::collections::BTreeMap;

pub const LOSS_GEN: &str = "loss_gen";
pub const LOSS_DIS: &str = "loss_dis";
pub const LOSS_GP: &str = "loss_gp";
/// Mean input-gradient norm on the interpolated samples.
pub const GRAD_NORM: &str = "g";

pub const REPORT_KEYS: [&str; 4] = [LOSS_DIS, LOSS_GEN, LOSS_GP, GRAD_NORM];

/// Sink for named scalar metrics.
pub trait Reporter {
    fn report(&mut self, name: &str, value: f32);
}

/// Running means per metric over a reporting window.
#[derive(Debug, Default, Clone)]
pub struct MetricAccumulator {
    totals: BTreeMap<String, (f64, usize)>,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.totals.get(name).map_or(0, |(_, n)| *n)
    }

    /// Means of everything reported since the last call; clears the window.
    pub fn summarize(&mut self) -> BTreeMap<String, f32> {
        let means = self
            .totals
            .iter()
            .map(|(name, (sum, n))| (name.clone(), (*sum / *n as f64) as f32))
            .collect();
        self.totals.clear();
        means
    }
}

impl Reporter for MetricAccumulator {
    fn report(&mut self, name: &str, value: f32) {
        let entry = self.totals.entry(name.to_string()).or_insert((0.0, 0));
        entry.0 += value as f64;
        entry.1 += 1;
    }
}
