// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The process-global profiling machinery, behind one trait.
//!
//! Nothing outside this module touches the CPU profiler, jemalloc's
//! profiling controls, or the contention rate directly. The
//! [`ProfilingGate`](crate::gate::ProfilingGate) owns an
//! `Arc<dyn ProfilingFacility>` and is the only caller in production.

use std::{io, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

pub mod contention;
mod runtime;
mod threads;

#[cfg(test)]
pub(crate) mod mock;

pub use runtime::RuntimeFacility;

/// Errors reported by a [`ProfilingFacility`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FacilityError {
    /// The host or build cannot produce this profile.
    #[error("not supported on this host: {0}")]
    Unsupported(String),
    /// A CPU sampling session is already running somewhere in the process.
    #[error("a cpu sampling session is already running")]
    SessionActive,
    /// The capture was started but the facility gave up.
    #[error("{0}")]
    Failed(String),
    /// I/O while reading or writing profile data.
    #[error("profiling i/o error: {0}")]
    Io(#[from] io::Error),
}

/// A running CPU sampling session.
///
/// Dropping it stops sampling and throws the samples away.
pub trait CpuSampling: Send + Sync {
    /// Stops sampling and encodes the samples as a gzip-compressed pprof
    /// profile. May be slow (symbolization); call it off the async executor.
    fn finish(self: Box<Self>) -> Result<Vec<u8>, FacilityError>;
}

/// Access to the process-wide profiling state.
///
/// Implementations are not expected to be safe under concurrent use of the
/// same profile family; callers serialize through the gate.
#[async_trait]
pub trait ProfilingFacility: Send + Sync + 'static {
    /// Starts the process's single CPU sampling session.
    ///
    /// Returns [`FacilityError::SessionActive`] if one is already running.
    fn start_cpu_sampling(&self, frequency: i32) -> Result<Box<dyn CpuSampling>, FacilityError>;

    /// Snapshot of live heap allocations, gzip-compressed pprof.
    async fn heap_profile(&self) -> Result<Vec<u8>, FacilityError>;

    /// Switches heap sampling on or off and returns the previous state.
    fn set_heap_profiling_active(&self, active: bool) -> Result<bool, FacilityError>;

    /// Text listing of live threads and runtime task counts.
    async fn task_dump(&self) -> Result<Vec<u8>, FacilityError>;

    /// Snapshot of recorded contention, gzip-compressed pprof.
    async fn block_profile(&self) -> Result<Vec<u8>, FacilityError>;

    /// Sets the contention sampling rate in nanoseconds and returns the
    /// previous one. See [`contention::ContentionRecorder::set_rate`].
    fn set_block_profile_rate(&self, rate: u64) -> u64;

    /// Records an execution trace for `duration`.
    async fn execution_trace(&self, _duration: Duration) -> Result<Vec<u8>, FacilityError> {
        Err(FacilityError::Unsupported(
            "execution traces are not available in this runtime".into(),
        ))
    }
}

#[cfg(target_os = "linux")]
pub(crate) fn gzip(data: &[u8]) -> Result<Vec<u8>, io::Error> {
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    let mut gz = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    gz.write_all(data)?;
    gz.finish()
}
