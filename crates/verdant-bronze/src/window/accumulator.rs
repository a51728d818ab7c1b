use serde::{Deserialize, Serialize};

use crate::config::MetricFunction;

/// Running totals for one window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
    /// Records in the window.
    pub count: u64,
    /// Records that carried a numeric metric value.
    #[serde(default)]
    pub observed: u64,
    #[serde(default)]
    pub sum: f64,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl Accumulator {
    pub fn add(&mut self, value: Option<f64>) {
        self.count += 1;
        if let Some(value) = value {
            self.observed += 1;
            self.sum += value;
            self.min = Some(self.min.map_or(value, |min| min.min(value)));
            self.max = Some(self.max.map_or(value, |max| max.max(value)));
        }
    }

    pub fn value(&self, function: MetricFunction) -> Option<f64> {
        if function == MetricFunction::Count {
            return Some(self.count as f64);
        }
        if self.observed == 0 {
            return None;
        }
        match function {
            MetricFunction::Count => Some(self.count as f64),
            MetricFunction::Sum => Some(self.sum),
            MetricFunction::Mean => Some(self.sum / self.observed as f64),
            MetricFunction::Min => self.min,
            MetricFunction::Max => self.max,
        }
    }
}
