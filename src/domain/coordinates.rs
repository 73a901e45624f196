// Projection of bucketed values into pixel coordinates
use super::resample::{Bucket, MAX_BUCKETS};
use super::telemetry::ProjectedPoint;

/// Stroke width of the rendered line; half of it is kept as bottom padding.
pub const STROKE_WIDTH: f64 = 5.0;

/// Project buckets (index 0 most recent) into a left-to-right polyline.
///
/// Buckets are walked oldest first. A gap repeats the last value of the
/// previous non-empty bucket, so the line holds its level instead of dropping.
/// The last point is always pinned to `x == width`. Degenerate input yields an
/// empty polyline.
pub fn project(
    buckets: &[Bucket<'_>],
    total_hours: f64,
    width: f64,
    height: f64,
    resolution: f64,
) -> Vec<ProjectedPoint> {
    if !(width.is_finite() && width > 0.0 && height.is_finite() && height > 0.0) {
        return Vec::new();
    }
    let Some((min, max)) = value_range(buckets) else {
        return Vec::new();
    };

    let y_ratio = match (max - min) / height {
        r if r == 0.0 => height,
        r => r,
    };
    let slots = (resolution * total_hours).ceil().min(MAX_BUCKETS as f64);
    let x_ratio = match width / (slots - 1.0) {
        r if r.is_finite() => r,
        _ => width,
    };

    let Some(mut last) = buckets.iter().rev().find_map(Bucket::aggregates) else {
        return Vec::new();
    };

    let mut points = Vec::with_capacity(buckets.len() + 2);
    for (position, bucket) in buckets.iter().rev().enumerate() {
        let level = match bucket.aggregates() {
            Some(aggregates) => {
                last = aggregates;
                aggregates.0
            }
            None => last.1,
        };
        let x = (x_ratio * position as f64).min(width);
        let y = height + STROKE_WIDTH / 2.0 - (level - min) / y_ratio;
        points.push(ProjectedPoint::new(x, y));
    }

    if let [only] = points.as_slice() {
        let y = only.y;
        points.push(ProjectedPoint::new(width, y));
    }
    if let Some(tail) = points.last().copied() {
        points.push(ProjectedPoint::new(width, tail.y));
    }

    points
}

/// Min and max over bucket means, skipping gaps
fn value_range(buckets: &[Bucket<'_>]) -> Option<(f64, f64)> {
    buckets
        .iter()
        .filter_map(Bucket::mean)
        .fold(None, |range, mean| match range {
            None => Some((mean, mean)),
            Some((min, max)) => Some((f64::min(min, mean), f64::max(max, mean))),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::resample::bucket;
    use crate::domain::telemetry::Sample;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    const WIDTH: f64 = 500.0;
    const HEIGHT: f64 = 80.0;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn aged(hours: f64, value: f64) -> Sample {
        Sample::new(
            value,
            now() - Duration::milliseconds((hours * 3_600_000.0) as i64),
        )
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_two_hour_scenario_polyline() {
        let samples = vec![aged(1.9, 30.0), aged(0.6, 20.0), aged(0.1, 10.0)];
        let buckets = bucket(&samples, 2.0, 2.0, now());
        let points = project(&buckets, 2.0, WIDTH, HEIGHT, 2.0);

        assert_eq!(points.len(), 5);

        // Oldest bucket (30) sits on the top edge; the gap carries it forward.
        assert_close(points[0].x, 0.0);
        assert_close(points[0].y, 2.5);
        assert_close(points[1].x, WIDTH / 3.0);
        assert_close(points[1].y, points[0].y);
        assert_close(points[2].y, 42.5);
        assert_close(points[3].x, WIDTH);
        assert_close(points[3].y, 82.5);

        let pinned = points[4];
        assert_close(pinned.x, WIDTH);
        assert_close(pinned.y, points[3].y);
    }

    #[test]
    fn test_x_is_non_decreasing_and_pinned() {
        let samples: Vec<Sample> = (0..40)
            .map(|i| aged(i as f64 * 0.61, (i * 7 % 11) as f64))
            .collect();
        let buckets = bucket(&samples, 24.0, 2.0, now());
        let points = project(&buckets, 24.0, WIDTH, HEIGHT, 2.0);

        assert_eq!(points.len(), 49);
        assert!(points.windows(2).all(|w| w[0].x <= w[1].x));
        assert_eq!(points.last().map(|p| p.x), Some(WIDTH));
    }

    #[test]
    fn test_fractional_slot_count_keeps_x_within_width() {
        let samples = vec![aged(1.2, 4.0), aged(0.1, 8.0)];
        let buckets = bucket(&samples, 1.5, 1.0, now());
        let points = project(&buckets, 1.5, WIDTH, HEIGHT, 1.0);

        assert!(points.windows(2).all(|w| w[0].x <= w[1].x));
        assert!(points.iter().all(|p| p.x <= WIDTH));
        assert_eq!(points.last().map(|p| p.x), Some(WIDTH));
    }

    #[test]
    fn test_single_bucket_draws_a_segment() {
        let samples = vec![aged(0.5, 12.0)];
        let buckets = bucket(&samples, 1.0, 1.0, now());
        let points = project(&buckets, 1.0, WIDTH, HEIGHT, 1.0);

        assert!(points.len() >= 2);
        assert!(points.iter().all(|p| p.y == points[0].y));
        assert_eq!(points[0].x, 0.0);
        assert_eq!(points[1].x, WIDTH);
    }

    #[test]
    fn test_flat_series_does_not_divide_by_zero() {
        let samples = vec![aged(0.1, 5.0), aged(0.7, 5.0), aged(1.6, 5.0)];
        let buckets = bucket(&samples, 2.0, 2.0, now());
        let points = project(&buckets, 2.0, WIDTH, HEIGHT, 2.0);

        assert!(!points.is_empty());
        for point in &points {
            assert!(point.y.is_finite());
            assert_close(point.y, HEIGHT + STROKE_WIDTH / 2.0);
        }
    }

    #[test]
    fn test_leading_gaps_take_first_observation() {
        // Only the two most recent buckets hold data.
        let samples = vec![aged(0.7, 4.0), aged(0.2, 2.0)];
        let buckets = bucket(&samples, 2.0, 2.0, now());
        let points = project(&buckets, 2.0, WIDTH, HEIGHT, 2.0);

        assert_eq!(points.len(), 5);
        assert_close(points[0].y, points[2].y);
        assert_close(points[1].y, points[2].y);
    }

    #[test]
    fn test_empty_input_projects_nothing() {
        assert!(project(&[], 2.0, WIDTH, HEIGHT, 2.0).is_empty());

        let gaps = vec![Bucket::default(); 4];
        assert!(project(&gaps, 2.0, WIDTH, HEIGHT, 2.0).is_empty());

        let samples = vec![aged(0.5, 1.0)];
        let buckets = bucket(&samples, 1.0, 1.0, now());
        assert!(project(&buckets, 1.0, 0.0, HEIGHT, 1.0).is_empty());
    }

    #[test]
    fn test_capped_slot_count_spans_the_width() {
        let samples = vec![aged(0.0001, 3.0), aged(999_000.0, 9.0)];
        let buckets = bucket(&samples, 1e6, 1e3, now());
        let points = project(&buckets, 1e6, WIDTH, HEIGHT, 1e3);

        assert_eq!(points.len(), MAX_BUCKETS + 1);
        assert_close(points[MAX_BUCKETS - 1].x, WIDTH);
        assert!(points.iter().all(|p| p.x <= WIDTH && p.y.is_finite()));
    }

    #[test]
    fn test_projection_is_pure() {
        let samples = vec![aged(0.3, 3.0), aged(1.3, 9.0)];
        let buckets = bucket(&samples, 2.0, 2.0, now());
        let first = project(&buckets, 2.0, WIDTH, HEIGHT, 2.0);
        let second = project(&buckets, 2.0, WIDTH, HEIGHT, 2.0);
        assert_eq!(first, second);
    }
}
