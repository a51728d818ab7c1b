//! Event-time windowing and per-window aggregation.
//!
//! Windows are aligned to the epoch: a window starts at every multiple of the
//! slide and spans `size`. A record belongs to every window whose
//! `[start, start + size)` contains its event time, so tumbling windows
//! (`slide == size`) assign exactly one window and sliding windows assign
//! `size / slide`.
//!
//! A window is final once the watermark reaches its end. Window state is
//! serializable so it can travel inside the engine checkpoint.

mod accumulator;

pub use accumulator::Accumulator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use verdant_core::envelope::Reading;

use crate::config::MetricSpec;

/// Window geometry and lateness, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    pub size_ms: i64,
    pub slide_ms: i64,
    pub allowed_lateness_ms: i64,
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl WindowSpec {
    pub fn new(size: Duration, slide: Duration, allowed_lateness: Duration) -> Self {
        Self {
            size_ms: millis(size).max(1),
            slide_ms: millis(slide).max(1),
            allowed_lateness_ms: millis(allowed_lateness),
        }
    }

    /// Starts of every window containing `event_ms`, latest first.
    pub fn assign(&self, event_ms: i64) -> impl Iterator<Item = i64> + use<> {
        let size = self.size_ms;
        let slide = self.slide_ms;
        let latest = event_ms.div_euclid(slide) * slide;
        std::iter::successors(Some(latest), move |start| Some(start - slide))
            .take_while(move |start| start + size > event_ms)
    }

    pub fn end_of(&self, window_start_ms: i64) -> i64 {
        window_start_ms.saturating_add(self.size_ms)
    }

    /// Watermark implied by the maximum observed event time.
    pub fn watermark(&self, max_event_time_ms: Option<i64>) -> Option<i64> {
        max_event_time_ms.map(|max| max.saturating_sub(self.allowed_lateness_ms))
    }
}

/// A finalized window for one source. Immutable once emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowAggregate {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub source_id: String,
    pub device_type: String,
    /// Label of the aggregate, e.g. `count` or `mean(moisture)`.
    pub metric: String,
    /// `None` when the metric field never appeared in the window.
    pub metric_value: Option<f64>,
    pub record_count: u64,
}

/// An open window as stored in the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenWindow {
    pub device_type: String,
    pub source_id: String,
    pub window_start_ms: i64,
    pub accumulator: Accumulator,
}

fn timestamp(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Open windows of one device type, keyed by (window start, source).
///
/// Owned by exactly one aggregation task at a time.
#[derive(Debug, Clone)]
pub struct TypeWindows {
    device_type: String,
    metric: MetricSpec,
    spec: WindowSpec,
    windows: BTreeMap<(i64, String), Accumulator>,
}

impl TypeWindows {
    pub fn new(device_type: impl Into<String>, metric: MetricSpec, spec: WindowSpec) -> Self {
        Self {
            device_type: device_type.into(),
            metric,
            spec,
            windows: BTreeMap::new(),
        }
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Restore a window from the checkpoint.
    pub fn restore(&mut self, window: OpenWindow) {
        self.windows
            .insert((window.window_start_ms, window.source_id), window.accumulator);
    }

    /// Add a reading to every window it falls in.
    pub fn add(&mut self, reading: &Reading) {
        let value = self
            .metric
            .field
            .as_deref()
            .and_then(|field| reading.field_values.get(field))
            .and_then(|value| value.as_f64());
        for start in self.spec.assign(reading.event_time_ms()) {
            self.windows
                .entry((start, reading.source_id.clone()))
                .or_default()
                .add(value);
        }
    }

    /// Remove and emit every window whose end is at or below `watermark_ms`.
    pub fn finalize(&mut self, watermark_ms: i64) -> Vec<WindowAggregate> {
        let mut finished = Vec::new();
        while let Some(entry) = self.windows.first_entry() {
            let start = entry.key().0;
            if self.spec.end_of(start) > watermark_ms {
                break;
            }
            let ((start, source_id), accumulator) = entry.remove_entry();
            finished.push(WindowAggregate {
                window_start: timestamp(start),
                window_end: timestamp(self.spec.end_of(start)),
                source_id,
                device_type: self.device_type.clone(),
                metric: self.metric.to_string(),
                metric_value: accumulator.value(self.metric.function),
                record_count: accumulator.count,
            });
        }
        finished
    }

    /// Open windows in checkpoint form.
    pub fn snapshot(&self) -> impl Iterator<Item = OpenWindow> + '_ {
        self.windows
            .iter()
            .map(|((start, source_id), accumulator)| OpenWindow {
                device_type: self.device_type.clone(),
                source_id: source_id.clone(),
                window_start_ms: *start,
                accumulator: accumulator.clone(),
            })
    }
}
