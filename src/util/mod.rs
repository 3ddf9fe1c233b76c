mod stats;

pub use stats::SampleSummary;
