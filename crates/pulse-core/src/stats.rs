//! Single-pass running statistics.
//!
//! Welford's update keeps mean and variance numerically stable over long
//! series; `merge` combines two partial aggregates (Chan et al.) so rollup
//! buckets can be stitched together without revisiting raw points.

use crate::types::{MetricStats, RollupBucket};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatsAccumulator {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    sum: f64,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn merge(&mut self, other: &StatsAccumulator) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let total = self.count + other.count;
        let delta = other.mean - self.mean;
        self.m2 += other.m2 + delta * delta * (self.count as f64 * other.count as f64) / total as f64;
        self.mean += delta * other.count as f64 / total as f64;
        self.count = total;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Rebuild an accumulator from a stored rollup bucket.
    pub fn from_rollup(bucket: &RollupBucket) -> Self {
        Self {
            count: bucket.count,
            mean: bucket.avg,
            m2: bucket.m2,
            min: bucket.min,
            max: bucket.max,
            sum: bucket.sum,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn m2(&self) -> f64 {
        self.m2
    }

    /// Sample standard deviation (n − 1 denominator).
    pub fn stddev(&self) -> Option<f64> {
        (self.count > 1).then(|| (self.m2 / (self.count - 1) as f64).max(0.0).sqrt())
    }

    /// Summary without the `latest` field, which the caller fills in.
    pub fn to_stats(&self) -> MetricStats {
        MetricStats {
            count: self.count,
            min: self.min(),
            max: self.max(),
            avg: self.mean(),
            stddev: self.stddev(),
            latest: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn empty_accumulator() {
        let acc = StatsAccumulator::new();
        assert!(acc.is_empty());
        assert_eq!(acc.min(), None);
        assert_eq!(acc.mean(), None);
        assert_eq!(acc.stddev(), None);
    }

    #[test]
    fn single_value_has_no_stddev() {
        let mut acc = StatsAccumulator::new();
        acc.push(4.0);
        assert_eq!(acc.count(), 1);
        assert_eq!(acc.min(), Some(4.0));
        assert_eq!(acc.max(), Some(4.0));
        assert_eq!(acc.stddev(), None);
    }

    #[test]
    fn matches_two_pass_computation() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mut acc = StatsAccumulator::new();
        for v in values {
            acc.push(v);
        }
        assert_eq!(acc.count(), 8);
        assert!(approx(acc.mean().unwrap(), 5.0));
        // Sample variance of this set is 32 / 7.
        assert!(approx(acc.stddev().unwrap(), (32.0f64 / 7.0).sqrt()));
        assert_eq!(acc.min(), Some(2.0));
        assert_eq!(acc.max(), Some(9.0));
        assert!(approx(acc.sum(), 40.0));
    }

    #[test]
    fn merge_equals_sequential() {
        let values: Vec<f64> = (1..=20).map(|i| (i as f64).sin() * 10.0).collect();
        let mut whole = StatsAccumulator::new();
        values.iter().for_each(|v| whole.push(*v));

        let mut left = StatsAccumulator::new();
        let mut right = StatsAccumulator::new();
        values[..7].iter().for_each(|v| left.push(*v));
        values[7..].iter().for_each(|v| right.push(*v));
        left.merge(&right);

        assert_eq!(left.count(), whole.count());
        assert!(approx(left.mean().unwrap(), whole.mean().unwrap()));
        assert!(approx(left.stddev().unwrap(), whole.stddev().unwrap()));
        assert_eq!(left.min(), whole.min());
        assert_eq!(left.max(), whole.max());
    }

    #[test]
    fn merge_into_empty() {
        let mut a = StatsAccumulator::new();
        let mut b = StatsAccumulator::new();
        b.push(1.0);
        b.push(3.0);
        a.merge(&b);
        assert_eq!(a, b);
    }
}
