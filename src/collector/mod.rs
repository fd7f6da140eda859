// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The kinds of capture the rotation and the endpoint can run.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    artifact::{Artifact, ArtifactRef, ProfileKind},
    facility::FacilityError,
    gate::SessionToken,
    sink::{ArtifactSink, SinkError},
};

mod allocation;
mod block;
mod cpu;
mod task_dump;
mod trace;

pub use allocation::{AllocationCollector, BallastConfig};
pub use block::BlockCollector;
pub use cpu::CpuSampleCollector;
pub use task_dump::TaskDumpCollector;
pub use trace::ExecutionTraceCollector;

/// Why a single capture failed. Never fatal: the rotation skips the step
/// and the endpoint answers with a 5xx.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CaptureError {
    /// The profile was captured but could not be written.
    #[error("writing artifact failed: {0}")]
    SinkWriteFailed(#[from] SinkError),
    /// This host or build cannot produce the profile.
    #[error("{kind} profiles are not supported on this host: {reason}")]
    UnsupportedOnHost {
        /// The requested kind.
        kind: ProfileKind,
        /// What the facility said.
        reason: String,
    },
    /// The CPU profiler was already running. Means something samples the CPU
    /// without going through the gate.
    #[error("a cpu sampling session is already active")]
    SessionConflict,
    /// The capture did not finish in time.
    #[error("capture timed out after {0:?}")]
    Timeout(Duration),
    /// The facility aborted the capture.
    #[error("capture aborted: {0}")]
    Facility(String),
    /// The collector was handed a session for another kind.
    #[error("{expected} collector given a {actual} session")]
    WrongSession {
        /// The collector's kind.
        expected: ProfileKind,
        /// The session's kind.
        actual: ProfileKind,
    },
}

impl CaptureError {
    pub(crate) fn from_facility(kind: ProfileKind, err: FacilityError) -> Self {
        match err {
            FacilityError::Unsupported(reason) => CaptureError::UnsupportedOnHost { kind, reason },
            FacilityError::SessionActive => CaptureError::SessionConflict,
            err => CaptureError::Facility(err.to_string()),
        }
    }
}

/// One kind of capture.
///
/// Collectors do not take the gate themselves: the caller acquires a
/// [`SessionToken`] for [`kind`](Self::kind) and hands it in.
#[async_trait]
pub trait Collector: fmt::Debug + Send + Sync {
    /// Stable name, used in artifact names and logs.
    fn identity(&self) -> &str;

    /// The kind of session this collector needs.
    fn kind(&self) -> ProfileKind;

    /// Minimum time between two starts of this collector in a rotation.
    fn min_interval(&self) -> Duration {
        Duration::ZERO
    }

    /// Runs the capture and returns the artifact.
    async fn collect(&self, session: &mut SessionToken) -> Result<Artifact, CaptureError>;

    /// Runs the capture and writes the artifact through `sink`.
    async fn capture(
        &self,
        session: &mut SessionToken,
        sink: &(dyn ArtifactSink + Send + Sync),
    ) -> Result<ArtifactRef, CaptureError> {
        let artifact = self.collect(session).await?;
        Ok(sink.write(&artifact).await?)
    }
}

fn check_session(session: &SessionToken, expected: ProfileKind) -> Result<(), CaptureError> {
    let actual = session.kind();
    if actual == expected {
        Ok(())
    } else {
        Err(CaptureError::WrongSession { expected, actual })
    }
}
