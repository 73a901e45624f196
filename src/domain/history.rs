// Sliding history window for one entity
use super::telemetry::Sample;
use chrono::{DateTime, Duration, Utc};

/// In-memory buffer of raw samples covering the look-back duration.
///
/// Samples are kept in ascending timestamp order. Everything retained lies
/// inside the window except, at most, the single most recent sample that fell
/// out of it; that one anchors the left edge of the graph so the line does not
/// start abruptly when fetches are range limited.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    entity_id: String,
    lookback_hours: f64,
    samples: Vec<Sample>,
}

impl HistoryWindow {
    pub fn new(entity_id: impl Into<String>, lookback_hours: f64) -> Self {
        Self {
            entity_id: entity_id.into(),
            lookback_hours,
            samples: Vec::new(),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn lookback_hours(&self) -> f64 {
        self.lookback_hours
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Clear the buffer
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    /// Point the window at another entity. Returns true (and clears the buffer) when the identity changed.
    pub fn retarget(&mut self, entity_id: &str) -> bool {
        if self.entity_id == entity_id {
            return false;
        }
        self.entity_id = entity_id.to_string();
        self.reset();
        true
    }

    /// Merge a freshly fetched batch and prune samples that left the window.
    pub fn refresh(&mut self, new_batch: Vec<Sample>, lookback_hours: f64, now: DateTime<Utc>) {
        self.lookback_hours = lookback_hours;

        for sample in new_batch
            .into_iter()
            .filter(|s| Sample::is_plottable(s.value))
        {
            self.merge(sample);
        }

        self.prune(now);
    }

    /// Insert in timestamp order; a timestamp we already hold is a re-delivery and is skipped.
    fn merge(&mut self, sample: Sample) {
        match self.samples.last() {
            None => self.samples.push(sample),
            Some(last) if last.timestamp < sample.timestamp => self.samples.push(sample),
            Some(_) => {
                if let Err(pos) = self
                    .samples
                    .binary_search_by(|s| s.timestamp.cmp(&sample.timestamp))
                {
                    self.samples.insert(pos, sample);
                }
            }
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = window_span(self.lookback_hours);
        // Ascending order puts every outside sample in a prefix.
        let outside = self
            .samples
            .partition_point(|s| now - s.timestamp > horizon);

        if outside > 1 {
            let dropped = outside - 1;
            self.samples.drain(..dropped);
            tracing::debug!(
                "Pruned {} samples for {}, kept boundary sample",
                dropped,
                self.entity_id
            );
        }
    }
}

/// Look-back as a duration, saturating at the largest representable span
pub fn window_span(lookback_hours: f64) -> Duration {
    Duration::try_milliseconds((lookback_hours * 3_600_000.0) as i64).unwrap_or(Duration::MAX)
}

/// Earliest instant covered by the look-back, clamped to the calendar range
pub fn window_start(now: DateTime<Utc>, lookback_hours: f64) -> DateTime<Utc> {
    now.checked_sub_signed(window_span(lookback_hours))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
