/// Execution durations of one test case, held in ascending order so every
/// aggregate is independent of the order records were fetched in.
pub struct DurationSeries {
    values: Vec<f64>,
}

impl DurationSeries {
    pub fn new(mut values: Vec<f64>) -> Self {
        values.sort_by(f64::total_cmp);
        Self { values }
    }

    pub fn from_millis(millis: impl IntoIterator<Item = u64>) -> Self {
        Self::new(millis.into_iter().map(|ms| ms as f64).collect())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population variance (divisor N).
    pub fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self
            .values
            .iter()
            .map(|&x| (x - mean).powi(2))
            .sum();
        sum_sq_diff / self.values.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Coefficient of variation as a percentage.
    /// A zero mean carries no timing signal and yields 0 rather than NaN.
    pub fn coefficient_of_variation(&self) -> f64 {
        let mean = self.mean();
        if mean <= 0.0 {
            return 0.0;
        }
        self.std_dev() / mean * 100.0
    }

    pub fn min(&self) -> Option<f64> {
        self.values.first().copied()
    }

    pub fn max(&self) -> Option<f64> {
        self.values.last().copied()
    }

    /// Ratio of slowest to fastest run. `None` when the fastest run took 0ms.
    pub fn spread_ratio(&self) -> Option<f64> {
        match (self.min(), self.max()) {
            (Some(min), Some(max)) if min > 0.0 => Some(max / min),
            _ => None,
        }
    }
}
