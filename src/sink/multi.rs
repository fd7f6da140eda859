// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use super::{ArtifactSink, SinkError};
use crate::artifact::{Artifact, ArtifactRef};

#[derive(Debug)]
/// A sink that writes every artifact to several destinations.
///
/// If one of the destinations errors, it still writes to the other ones.
pub struct MultiSink {
    sinks: Vec<Box<dyn ArtifactSink + Send + Sync>>,
}

impl MultiSink {
    /// Create a new MultiSink from a set of sinks
    pub fn new(sinks: Vec<Box<dyn ArtifactSink + Send + Sync>>) -> Self {
        MultiSink { sinks }
    }
}

#[async_trait]
impl ArtifactSink for MultiSink {
    async fn write(&self, artifact: &Artifact) -> Result<ArtifactRef, SinkError> {
        let results =
            futures::future::join_all(self.sinks.iter().map(|sink| sink.write(artifact))).await;
        // return the first error, else the first location
        let refs: Vec<ArtifactRef> = results.into_iter().collect::<Result<_, _>>()?;
        refs.into_iter().next().ok_or(SinkError::NoDestination)
    }
}
