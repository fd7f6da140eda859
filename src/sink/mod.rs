// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Where captured artifacts go.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::artifact::{Artifact, ArtifactRef};

pub mod local;
pub mod multi;

/// Errors writing an artifact.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SinkError {
    /// Creating, writing or pruning files failed.
    #[error("artifact i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Moving the finished temporary file into place failed.
    #[error("unable to move artifact into place: {0}")]
    Persist(#[from] tempfile::PersistError),
    /// The blocking write task panicked or was cancelled.
    #[error("artifact write task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// A fan-out sink had nowhere to write.
    #[error("no artifact destinations configured")]
    NoDestination,
    /// Any other sink-specific failure.
    #[error("{0}")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A destination for captured profiles.
#[async_trait]
pub trait ArtifactSink: fmt::Debug {
    /// Persists `artifact` and says where it went. Readers never observe a
    /// partially written artifact.
    async fn write(&self, artifact: &Artifact) -> Result<ArtifactRef, SinkError>;
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Keeps every artifact in memory.
    #[derive(Debug, Default)]
    pub(crate) struct MemorySink {
        pub(crate) artifacts: Mutex<Vec<Artifact>>,
    }

    impl MemorySink {
        pub(crate) fn collectors(&self) -> Vec<String> {
            self.artifacts
                .lock()
                .unwrap()
                .iter()
                .map(|a| a.collector.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ArtifactSink for MemorySink {
        async fn write(&self, artifact: &Artifact) -> Result<ArtifactRef, SinkError> {
            let mut artifacts = self.artifacts.lock().unwrap();
            artifacts.push(artifact.clone());
            Ok(ArtifactRef {
                location: format!("memory:{}", artifacts.len() - 1),
                size: artifact.data.len(),
            })
        }
    }

    #[derive(Debug, Error)]
    #[error("sink is broken")]
    pub(crate) struct Broken;

    /// Fails every write.
    #[derive(Debug)]
    pub(crate) struct FailingSink;

    #[async_trait]
    impl ArtifactSink for FailingSink {
        async fn write(&self, _artifact: &Artifact) -> Result<ArtifactRef, SinkError> {
            Err(SinkError::Other(Box::new(Broken)))
        }
    }
}
