// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use super::{check_session, CaptureError, Collector};
use crate::{
    artifact::{Artifact, ArtifactFormat, ProfileKind},
    gate::SessionToken,
};

/// Records an execution trace, if the facility can produce one.
///
/// [`RuntimeFacility`](crate::facility::RuntimeFacility) cannot, so this is
/// only offered on demand by the endpoint and never scheduled.
#[derive(Debug)]
pub struct ExecutionTraceCollector {
    identity: String,
    duration: Duration,
}

impl ExecutionTraceCollector {
    /// A collector named `trace` that records for `duration`.
    pub fn new(duration: Duration) -> Self {
        ExecutionTraceCollector {
            identity: ProfileKind::ExecutionTrace.name().into(),
            duration,
        }
    }

    /// How long each trace records for.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[async_trait]
impl Collector for ExecutionTraceCollector {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn kind(&self) -> ProfileKind {
        ProfileKind::ExecutionTrace
    }

    async fn collect(&self, session: &mut SessionToken) -> Result<Artifact, CaptureError> {
        check_session(session, ProfileKind::ExecutionTrace)?;
        let started = SystemTime::now();
        let facility = session.facility().clone();
        let data = facility
            .execution_trace(self.duration)
            .await
            .map_err(|e| CaptureError::from_facility(ProfileKind::ExecutionTrace, e))?;
        Ok(Artifact::new(
            ProfileKind::ExecutionTrace,
            self.identity.clone(),
            ArtifactFormat::Text,
            data,
        )
        .with_timing(started, self.duration))
    }
}
