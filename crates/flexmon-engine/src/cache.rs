use chrono::{DateTime, Utc};
use flexmon_common::types::MetricSample;
use std::collections::HashMap;

/// Latest-value cache keyed by `<quantity>@<asset>`.
///
/// Samples are replaced wholesale on every upsert and evicted by the
/// sweep at the start of each evaluation tick, so a successful read is
/// always fresh.
pub struct MetricCache {
    samples: HashMap<String, MetricSample>,
}

impl MetricCache {
    pub fn new() -> MetricCache {
        MetricCache {
            samples: HashMap::new(),
        }
    }

    pub fn upsert(&mut self, sample: MetricSample) {
        self.samples.insert(sample.topic(), sample);
    }

    pub fn get(&self, quantity: &str, asset: &str) -> Option<&MetricSample> {
        self.samples.get(&format!("{quantity}@{asset}"))
    }

    /// Drops every sample whose `time + ttl` lies before `now`. Sweeping
    /// is idempotent: a second sweep at the same instant removes nothing.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.samples.len();
        self.samples.retain(|topic, sample| {
            let keep = !sample.is_expired(now);
            if !keep {
                tracing::debug!(topic = %topic, "Dropping expired metric");
            }
            keep
        });
        before - self.samples.len()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for MetricCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncates the published quantity of a sensor connected to another
/// sensor: `status.<PORT>.<INDEX>` becomes `status.<PORT>`. Returns `None`
/// for a malformed quantity without any `.` separator.
pub fn truncate_sensor_quantity(quantity: &str) -> Option<&str> {
    let first = quantity.find('.')?;
    match quantity[first + 1..].find('.') {
        Some(second) => Some(&quantity[..first + 1 + second]),
        None => Some(quantity),
    }
}
