//! Sample sinks: where accepted samples go while a sweep is running.
//!
//! The sweep engine pushes every accepted [`Sample`] into a [`SampleSink`]
//! the moment it is parsed, so a front-end can render progress live. The
//! final [`SweepResult`](crate::sample::SweepResult) is returned separately;
//! sinks never see partial results being discarded.

use crate::sample::Sample;
use tokio::sync::mpsc;

/// Consumer of accepted samples, in acquisition order.
pub trait SampleSink: Send {
    /// Receive one accepted sample.
    fn accept(&mut self, sample: &Sample);
}

impl SampleSink for Vec<Sample> {
    fn accept(&mut self, sample: &Sample) {
        self.push(*sample);
    }
}

/// Streams samples to another task. A dropped receiver is not an error: the
/// sweep still completes and still restores the instrument.
impl SampleSink for mpsc::UnboundedSender<Sample> {
    fn accept(&mut self, sample: &Sample) {
        if self.send(*sample).is_err() {
            tracing::debug!(frequency = sample.frequency, "Sample receiver dropped");
        }
    }
}

/// Discards every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl SampleSink for NullSink {
    fn accept(&mut self, _sample: &Sample) {}
}

/// Logs every sample at INFO level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl SampleSink for LogSink {
    fn accept(&mut self, sample: &Sample) {
        tracing::info!(
            frequency = sample.frequency,
            measurement_a = sample.measurement_a,
            measurement_b = sample.measurement_b,
            "Sample accepted"
        );
    }
}
