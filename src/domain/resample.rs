// Temporal resampling of raw samples into fixed time buckets
use super::telemetry::Sample;
use chrono::{DateTime, Utc};

/// The samples that fell into one time slot. An empty bucket is a gap, not a zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bucket<'a> {
    samples: Vec<&'a Sample>,
}

impl<'a> Bucket<'a> {
    pub fn samples(&self) -> &[&'a Sample] {
        &self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self.samples.iter().map(|s| s.value).sum();
        Some(sum / self.samples.len() as f64)
    }

    /// Value of the most recently timestamped sample
    pub fn last(&self) -> Option<f64> {
        self.samples
            .iter()
            .max_by_key(|s| s.timestamp)
            .map(|s| s.value)
    }

    /// `(mean, last)` for buckets holding data
    pub fn aggregates(&self) -> Option<(f64, f64)> {
        Some((self.mean()?, self.last()?))
    }

    fn push(&mut self, sample: &'a Sample) {
        self.samples.push(sample);
    }
}

/// Upper bound on the number of slots a single pass will allocate
pub const MAX_BUCKETS: usize = 10_000;

/// Number of slots for a look-back at a given resolution (buckets per hour), capped at `MAX_BUCKETS`
pub fn bucket_count(lookback_hours: f64, resolution: f64) -> usize {
    let slots = (lookback_hours * resolution).ceil();
    if slots.is_finite() && slots > 0.0 {
        (slots as usize).min(MAX_BUCKETS)
    } else {
        0
    }
}

/// Slot for a sample, 0 being the most recent.
///
/// Samples older than the look-back (the window's boundary anchor) fold into
/// the oldest slot. Samples stamped after `now` have no slot.
pub fn slot_index(
    sample: &Sample,
    lookback_hours: f64,
    resolution: f64,
    now: DateTime<Utc>,
    count: usize,
) -> Option<usize> {
    let hours_ago = sample.hours_ago(now);
    if count == 0 || hours_ago < 0.0 {
        return None;
    }
    if hours_ago > lookback_hours {
        return Some(count - 1);
    }
    let index = (hours_ago * resolution).floor() as usize;
    Some(index.min(count - 1))
}

/// Group samples into `ceil(lookback_hours * resolution)` buckets, index 0 most recent.
///
/// Returns an empty vector when no bucket received data. `now` must be captured
/// once by the caller so repeated passes over the same buffer agree.
pub fn bucket<'a>(
    samples: &'a [Sample],
    lookback_hours: f64,
    resolution: f64,
    now: DateTime<Utc>,
) -> Vec<Bucket<'a>> {
    let count = bucket_count(lookback_hours, resolution);
    if count == 0 {
        return Vec::new();
    }

    let mut buckets = vec![Bucket::default(); count];
    let mut assigned = 0usize;

    for sample in samples.iter().filter(|s| Sample::is_plottable(s.value)) {
        if let Some(index) = slot_index(sample, lookback_hours, resolution, now, count) {
            buckets[index].push(sample);
            assigned += 1;
        }
    }

    if assigned == 0 {
        return Vec::new();
    }
    buckets
}
