use std::fmt::Display;

/// Running minimum, maximum and mean of integer samples.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleSummary {
    pub count: usize,
    pub min: usize,
    pub max: usize,
    pub mean: f32,
}

impl SampleSummary {
    pub fn add_sample(&mut self, value: usize) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.mean += (value as f32 - self.mean) / (self.count as f32);
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for SampleSummary {
    fn default() -> Self {
        SampleSummary {
            count: 0,
            min: usize::MAX,
            max: 0,
            mean: 0.0,
        }
    }
}

impl Extend<usize> for SampleSummary {
    fn extend<I: IntoIterator<Item = usize>>(&mut self, iter: I) {
        for value in iter {
            self.add_sample(value);
        }
    }
}

impl FromIterator<usize> for SampleSummary {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut summary = SampleSummary::default();
        summary.extend(iter);
        summary
    }
}

impl Display for SampleSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "no samples");
        }
        write!(
            f,
            "{} - {}; avg {:.1}; {} samples",
            self.min, self.max, self.mean, self.count
        )
    }
}
