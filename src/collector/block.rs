// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use super::{check_session, CaptureError, Collector};
use crate::{
    artifact::{Artifact, ArtifactFormat, ProfileKind},
    gate::SessionToken,
};

/// Snapshots recorded contention: where tasks waited, how often, and for how
/// long.
///
/// Only waits reported through
/// [`contention::record_contention`](crate::facility::contention::record_contention)
/// show up, and only as far as the sampling rate lets them.
#[derive(Debug)]
pub struct BlockCollector {
    identity: String,
}

impl Default for BlockCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCollector {
    /// A collector named `block`.
    pub fn new() -> Self {
        BlockCollector {
            identity: ProfileKind::Block.name().into(),
        }
    }

    /// Renames the collector.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }
}

#[async_trait]
impl Collector for BlockCollector {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn kind(&self) -> ProfileKind {
        ProfileKind::Block
    }

    async fn collect(&self, session: &mut SessionToken) -> Result<Artifact, CaptureError> {
        check_session(session, ProfileKind::Block)?;
        let facility = session.facility().clone();
        let data = facility
            .block_profile()
            .await
            .map_err(|e| CaptureError::from_facility(ProfileKind::Block, e))?;
        Ok(Artifact::new(
            ProfileKind::Block,
            self.identity.clone(),
            ArtifactFormat::PprofGzip,
            data,
        ))
    }
}
