// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use super::{check_session, CaptureError, Collector};
use crate::{
    artifact::{Artifact, ArtifactFormat, ProfileKind},
    gate::SessionToken,
};

/// Lists the process's threads and the runtime's task counts, as text.
#[derive(Debug)]
pub struct TaskDumpCollector {
    identity: String,
}

impl Default for TaskDumpCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskDumpCollector {
    /// A collector named `goroutine`.
    pub fn new() -> Self {
        TaskDumpCollector {
            identity: ProfileKind::TaskDump.name().into(),
        }
    }

    /// Renames the collector.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }
}

#[async_trait]
impl Collector for TaskDumpCollector {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn kind(&self) -> ProfileKind {
        ProfileKind::TaskDump
    }

    async fn collect(&self, session: &mut SessionToken) -> Result<Artifact, CaptureError> {
        check_session(session, ProfileKind::TaskDump)?;
        let facility = session.facility().clone();
        let data = facility
            .task_dump()
            .await
            .map_err(|e| CaptureError::from_facility(ProfileKind::TaskDump, e))?;
        Ok(Artifact::new(
            ProfileKind::TaskDump,
            self.identity.clone(),
            ArtifactFormat::Text,
            data,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test::mock_gate;

    #[tokio::test]
    async fn test_collects_text_dump() {
        let (gate, _) = mock_gate();
        let mut session = gate.acquire(ProfileKind::TaskDump).await.unwrap();
        let artifact = TaskDumpCollector::new()
            .with_identity("tasks")
            .collect(&mut session)
            .await
            .unwrap();
        assert_eq!(artifact.collector, "tasks");
        assert_eq!(artifact.format, ArtifactFormat::Text);
        assert!(artifact.data.starts_with(b"threads: "));
    }
}
