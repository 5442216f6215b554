//! Frequency sweep engine.
//!
//! For each target frequency the engine sets the frequency, waits one settle
//! delay, then fetches until the instrument returns a valid `"<a>,<b>"` pair.
//! Empty replies, `cmd err` and malformed lines are transient: they are
//! logged and the same frequency is fetched again. The engine only moves on
//! once a sample has been accepted, so samples are produced exactly once per
//! frequency, in order.
//!
//! By default a frequency is retried forever. A [`RetryPolicy`] can bound the attempts
//! or the elapsed time per frequency; hitting the bound ends the sweep with
//! [`SessionError::FrequencyTimeout`].

use crate::error::SessionError;
use crate::protocol::{commands, CommandChannel};
use crate::response::{needs_fallback, Reply};
use crate::sample::{Sample, SweepResult};
use crate::sink::SampleSink;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Per-frequency retry bound. Both limits absent means retry forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum fetch attempts per frequency
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Maximum time spent fetching one frequency
    #[serde(default, with = "humantime_serde")]
    pub budget: Option<Duration>,
}

impl RetryPolicy {
    /// True when neither limit is set.
    pub fn is_unbounded(&self) -> bool {
        self.max_attempts.is_none() && self.budget.is_none()
    }

    fn exhausted(&self, attempts: u32, started: Instant) -> bool {
        if self.max_attempts.is_some_and(|max| attempts >= max) {
            return true;
        }
        self.budget.is_some_and(|budget| started.elapsed() >= budget)
    }
}

/// Two-step fetch: a primary query, and a fallback used when the primary
/// reply reports no new data or a command error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchStrategy {
    /// Query tried first on every attempt
    pub primary: &'static str,
    /// Query used when the primary reply calls for it
    pub fallback: &'static str,
}

impl Default for FetchStrategy {
    fn default() -> Self {
        Self {
            primary: commands::FETCH,
            fallback: commands::MEASURE_IMPEDANCE,
        }
    }
}

impl FetchStrategy {
    /// Run one attempt and return the reply that should be classified.
    ///
    /// # Errors
    /// Propagates link failures from the channel.
    pub async fn fetch<C>(&self, channel: &mut C) -> Result<String, SessionError>
    where
        C: CommandChannel + ?Sized,
    {
        let response = channel.query(self.primary).await?;
        if needs_fallback(&response) {
            tracing::debug!(primary = %response, fallback = self.fallback, "Falling back");
            return channel.query(self.fallback).await;
        }
        Ok(response)
    }
}

/// Drives a frequency list and accumulates validated samples.
#[derive(Debug, Clone, Default)]
pub struct SweepEngine {
    policy: RetryPolicy,
    strategy: FetchStrategy,
}

impl SweepEngine {
    /// Create an engine with the given retry policy and the default fetch strategy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            strategy: FetchStrategy::default(),
        }
    }

    /// Sweep `frequencies` in order over an already configured channel.
    ///
    /// Each accepted sample is handed to `sink` before the next frequency
    /// is set.
    ///
    /// # Errors
    /// - [`SessionError::Io`] / [`SessionError::TransportNotOpen`] if the link
    ///   fails while setting a frequency or fetching a reading
    /// - [`SessionError::FrequencyTimeout`] if the retry policy is exhausted
    pub async fn sweep<C, S>(
        &self,
        channel: &mut C,
        frequencies: &[f64],
        sink: &mut S,
    ) -> Result<SweepResult, SessionError>
    where
        C: CommandChannel + ?Sized,
        S: SampleSink + ?Sized,
    {
        let mut result = SweepResult::with_capacity(frequencies.len());
        tracing::debug!(
            frequencies = frequencies.len(),
            unbounded = self.policy.is_unbounded(),
            "Sweep started"
        );

        for (index, &frequency) in frequencies.iter().enumerate() {
            channel.write(&commands::frequency(frequency)).await?;
            channel.settle().await;
            tracing::info!(frequency, index, total = frequencies.len(), "Frequency set");

            let sample = self.acquire(channel, frequency).await?;
            sink.accept(&sample);
            result.push(sample);
        }

        Ok(result)
    }

    /// Fetch until a valid reading arrives for `frequency`.
    async fn acquire<C>(&self, channel: &mut C, frequency: f64) -> Result<Sample, SessionError>
    where
        C: CommandChannel + ?Sized,
    {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);
            let response = self.strategy.fetch(channel).await?;

            match Reply::classify(&response) {
                Reply::Reading { a, b } => {
                    tracing::debug!(frequency, attempts, a, b, "Reading accepted");
                    return Ok(Sample::new(frequency, a, b));
                }
                Reply::Empty | Reply::CommandError => {
                    tracing::warn!(
                        frequency,
                        attempt = attempts,
                        response = %response,
                        "No valid response, retrying"
                    );
                }
                Reply::Malformed(line) => {
                    tracing::warn!(
                        frequency,
                        attempt = attempts,
                        response = %line,
                        "Could not parse reading, retrying"
                    );
                }
            }

            if self.policy.exhausted(attempts, started) {
                tracing::error!(frequency, attempts, "Retry policy exhausted");
                return Err(SessionError::FrequencyTimeout {
                    frequency,
                    attempts,
                });
            }
        }
    }
}
