// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use super::{check_session, CaptureError, Collector};
use crate::{
    artifact::{Artifact, ArtifactFormat, ProfileKind},
    gate::SessionToken,
};

/// Samples CPU stacks for a fixed duration.
///
/// The gate starts sampling when the session is acquired; the collector
/// waits out the duration and then stops it. Since the gate is held the
/// whole time, nothing else is captured meanwhile. To stop back-to-back
/// rotations from sampling the CPU all the time, [`min_interval`] is twice
/// the duration, so sampling is on at most half of the time.
///
/// [`min_interval`]: Collector::min_interval
#[derive(Debug)]
pub struct CpuSampleCollector {
    identity: String,
    duration: Duration,
}

impl CpuSampleCollector {
    /// Default sampling window.
    pub const DEFAULT_DURATION: Duration = Duration::from_secs(10);

    /// A collector named `profile` that samples for `duration`.
    pub fn new(duration: Duration) -> Self {
        CpuSampleCollector {
            identity: ProfileKind::CpuSample.name().into(),
            duration,
        }
    }

    /// Renames the collector.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// The sampling window.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl Default for CpuSampleCollector {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DURATION)
    }
}

#[async_trait]
impl Collector for CpuSampleCollector {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn kind(&self) -> ProfileKind {
        ProfileKind::CpuSample
    }

    fn min_interval(&self) -> Duration {
        self.duration.saturating_mul(2)
    }

    async fn collect(&self, session: &mut SessionToken) -> Result<Artifact, CaptureError> {
        check_session(session, ProfileKind::CpuSample)?;
        let started = SystemTime::now();
        tokio::time::sleep(self.duration).await;
        let data = session.finish_cpu_sampling().await?;
        tracing::debug!(collector = %self.identity, bytes = data.len(), "cpu sampling finished");
        Ok(Artifact::new(
            ProfileKind::CpuSample,
            self.identity.clone(),
            ArtifactFormat::PprofGzip,
            data,
        )
        .with_timing(started, self.duration))
    }
}
