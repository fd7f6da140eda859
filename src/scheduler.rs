// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The background rotation through a fixed list of collectors.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time::Instant;

use crate::{
    artifact::ArtifactRef,
    collector::{CaptureError, Collector},
    gate::{ProfilingError, ProfilingGate},
    sink::ArtifactSink,
};

/// Default pause between two steps.
pub const DEFAULT_STEP_DELAY: Duration = Duration::from_secs(1);

// stand-in for intervals too large to add to an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Why a [`Rotation`] could not be built.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum BuildError {
    /// A rotation needs at least one collector.
    #[error("a rotation needs at least one collector")]
    NoCollectors,
    /// No sink was set.
    #[error("a rotation needs an artifact sink")]
    NoSink,
    /// No gate was set.
    #[error("a rotation needs a profiling gate")]
    NoGate,
}

#[derive(Debug)]
struct Step {
    collector: Box<dyn Collector>,
    min_interval: Duration,
}

/// Builds a [`Rotation`].
#[derive(Debug, Default)]
pub struct RotationBuilder {
    steps: Vec<Step>,
    step_delay: Option<Duration>,
    capture_timeout: Option<Duration>,
    sink: Option<Arc<dyn ArtifactSink + Send + Sync>>,
    gate: Option<ProfilingGate>,
}

impl RotationBuilder {
    /// Appends a collector, spaced by its own
    /// [`min_interval`](Collector::min_interval).
    pub fn with_collector(self, collector: impl Collector + 'static) -> RotationBuilder {
        self.with_boxed_collector(Box::new(collector))
    }

    /// Appends an already boxed collector.
    pub fn with_boxed_collector(mut self, collector: Box<dyn Collector>) -> RotationBuilder {
        let min_interval = collector.min_interval();
        self.steps.push(Step {
            collector,
            min_interval,
        });
        self
    }

    /// Appends a collector that starts at most once per `min_interval`,
    /// overriding its own minimum.
    pub fn with_collector_interval(
        mut self,
        collector: impl Collector + 'static,
        min_interval: Duration,
    ) -> RotationBuilder {
        self.steps.push(Step {
            collector: Box::new(collector),
            min_interval,
        });
        self
    }

    /// Sets the pause after every step. Defaults to [`DEFAULT_STEP_DELAY`].
    pub fn with_step_delay(mut self, delay: Duration) -> RotationBuilder {
        self.step_delay = Some(delay);
        self
    }

    /// Gives up on a capture that runs longer than `timeout`. Unbounded by
    /// default.
    pub fn with_capture_timeout(mut self, timeout: Duration) -> RotationBuilder {
        self.capture_timeout = Some(timeout);
        self
    }

    /// Sets where artifacts are written.
    pub fn with_sink(mut self, sink: impl ArtifactSink + Send + Sync + 'static) -> RotationBuilder {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Sets the gate shared with the endpoint.
    pub fn with_gate(mut self, gate: ProfilingGate) -> RotationBuilder {
        self.gate = Some(gate);
        self
    }

    /// Turn this builder into a rotation!
    pub fn build(self) -> Result<Rotation, BuildError> {
        if self.steps.is_empty() {
            return Err(BuildError::NoCollectors);
        }
        Ok(Rotation {
            steps: self.steps,
            step_delay: self.step_delay.unwrap_or(DEFAULT_STEP_DELAY),
            capture_timeout: self.capture_timeout,
            sink: self.sink.ok_or(BuildError::NoSink)?,
            gate: self.gate.ok_or(BuildError::NoGate)?,
        })
    }
}

/// Drives a fixed list of collectors round-robin, forever.
///
/// Each step acquires the gate for the collector's kind, captures into the
/// sink, releases, and sleeps the step delay. A failed capture is logged and
/// skipped. A broken gate halts it and ends the rotation.
#[derive(Debug)]
pub struct Rotation {
    steps: Vec<Step>,
    step_delay: Duration,
    capture_timeout: Option<Duration>,
    sink: Arc<dyn ArtifactSink + Send + Sync>,
    gate: ProfilingGate,
}

impl Rotation {
    /// Start building a rotation.
    pub fn builder() -> RotationBuilder {
        RotationBuilder::default()
    }

    /// The gate this rotation acquires.
    pub fn gate(&self) -> &ProfilingGate {
        &self.gate
    }

    /// Start rotating in a tokio task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Rotates in the current task. Only returns once the gate is halted.
    pub async fn run(self) {
        tracing::info!(
            collectors = self.steps.len(),
            step_delay = ?self.step_delay,
            "starting profiling rotation"
        );
        let mut last_start: Vec<Option<Instant>> = vec![None; self.steps.len()];

        for (step, index) in (0..self.steps.len()).cycle().enumerate() {
            let Step {
                collector,
                min_interval,
            } = &self.steps[index];
            if let Some(previous) = last_start[index] {
                let due = previous
                    .checked_add(*min_interval)
                    .unwrap_or_else(|| previous + FAR_FUTURE);
                if due > Instant::now() {
                    tracing::debug!(
                        step,
                        collector = collector.identity(),
                        "waiting for minimum interval"
                    );
                    tokio::time::sleep_until(due).await;
                }
            }
            last_start[index] = Some(Instant::now());

            match self.capture(&**collector).await {
                Ok(written) => tracing::info!(
                    step,
                    collector = collector.identity(),
                    kind = %collector.kind(),
                    location = %written.location,
                    size = written.size,
                    "captured profile"
                ),
                Err(ProfilingError::Capture(err)) => {
                    // no retry, the next chance is the next rotation
                    tracing::warn!(
                        step,
                        collector = collector.identity(),
                        kind = %collector.kind(),
                        %err,
                        "capture failed, skipping step"
                    );
                }
                Err(ProfilingError::Gate(err)) => {
                    tracing::error!(
                        step,
                        collector = collector.identity(),
                        kind = %collector.kind(),
                        %err,
                        "profiling gate failed, stopping"
                    );
                    self.gate.halt(&err.to_string());
                    break;
                }
            }

            if self.step_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.step_delay).await;
            }
        }

        tracing::info!("profiling task finished");
    }

    async fn capture(&self, collector: &dyn Collector) -> Result<ArtifactRef, ProfilingError> {
        let mut session = self.gate.acquire(collector.kind()).await?;
        let capture = collector.capture(&mut session, &*self.sink);
        let written = match self.capture_timeout {
            Some(timeout) => tokio::time::timeout(timeout, capture)
                .await
                .map_err(|_| CaptureError::Timeout(timeout))??,
            None => capture.await?,
        };
        session.release();
        Ok(written)
    }
}
