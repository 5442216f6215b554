//! Measurement data types produced by a sweep.
//!
//! A [`Sample`] is one accepted reading at one test frequency. A
//! [`SweepResult`] is the ordered collection of samples for a complete
//! sweep. Both are plain values: the engine hands them to the caller and to
//! the sample sink, it never keeps them as shared state.

use serde::{Deserialize, Serialize};

/// One accepted, successfully parsed reading.
///
/// `measurement_a` is the real part of the impedance (function `R`) and
/// `measurement_b` the phase angle (function `THR`), both exactly as the
/// instrument reported them.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Test frequency in hertz
    pub frequency: f64,
    /// Primary measured quantity (resistance / real part)
    pub measurement_a: f64,
    /// Secondary measured quantity (theta)
    pub measurement_b: f64,
}

impl Sample {
    /// Create a sample from its three components.
    pub fn new(frequency: f64, measurement_a: f64, measurement_b: f64) -> Self {
        Self {
            frequency,
            measurement_a,
            measurement_b,
        }
    }
}

/// Ordered, append-only sequence of samples for one sweep.
///
/// On successful completion it holds exactly one sample per configured
/// frequency, in configuration order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    samples: Vec<Sample>,
}

impl SweepResult {
    /// Create an empty result with room for `capacity` samples.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    /// Number of accepted samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when no sample has been accepted.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples in acquisition order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Iterate over samples in acquisition order.
    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    /// Frequencies of all samples, in order.
    pub fn frequencies(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.frequency).collect()
    }

    /// Consume the result and return the samples.
    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }
}

impl<'a> IntoIterator for &'a SweepResult {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}
