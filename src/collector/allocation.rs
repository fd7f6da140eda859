// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;

use super::{check_session, CaptureError, Collector};
use crate::{
    artifact::{Artifact, ArtifactFormat, ProfileKind},
    gate::SessionToken,
};

/// Sizing of the allocation collector's ballast.
///
/// Each capture appends one `chunk_bytes` chunk; once `max_chunks` are held
/// the ballast is emptied and starts over, so it never holds more than
/// `chunk_bytes * max_chunks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BallastConfig {
    /// Bytes allocated per capture.
    pub chunk_bytes: usize,
    /// Chunks held before the ballast is cleared.
    pub max_chunks: usize,
}

impl Default for BallastConfig {
    fn default() -> Self {
        BallastConfig {
            chunk_bytes: 1 << 20,
            max_chunks: 16,
        }
    }
}

#[derive(Debug)]
struct Ballast {
    config: BallastConfig,
    chunks: Mutex<Vec<Vec<u8>>>,
}

impl Ballast {
    fn grow(&self) -> usize {
        let BallastConfig {
            chunk_bytes,
            max_chunks,
        } = self.config;
        if chunk_bytes == 0 || max_chunks == 0 {
            return 0;
        }
        let mut chunks = self.chunks.lock().unwrap_or_else(PoisonError::into_inner);
        if chunks.len() >= max_chunks {
            chunks.clear();
        }
        chunks.push(vec![0xa5; chunk_bytes]);
        chunks.len() * chunk_bytes
    }

    fn held(&self) -> usize {
        let chunks = self.chunks.lock().unwrap_or_else(PoisonError::into_inner);
        chunks.iter().map(Vec::len).sum()
    }
}

/// Snapshots live heap allocations.
///
/// With a ballast configured, every capture first allocates a chunk, so the
/// profile always has something in it. Useful for demos and smoke tests.
#[derive(Debug)]
pub struct AllocationCollector {
    identity: String,
    ballast: Option<Ballast>,
}

impl Default for AllocationCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationCollector {
    /// A collector named `allocs` with no ballast.
    pub fn new() -> Self {
        AllocationCollector {
            identity: ProfileKind::Allocation.name().into(),
            ballast: None,
        }
    }

    /// Renames the collector.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Grows a capped ballast before each capture.
    pub fn with_ballast(mut self, config: BallastConfig) -> Self {
        self.ballast = Some(Ballast {
            config,
            chunks: Mutex::new(vec![]),
        });
        self
    }

    /// Bytes currently held by the ballast.
    pub fn ballast_bytes(&self) -> usize {
        self.ballast.as_ref().map_or(0, Ballast::held)
    }
}

#[async_trait]
impl Collector for AllocationCollector {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn kind(&self) -> ProfileKind {
        ProfileKind::Allocation
    }

    async fn collect(&self, session: &mut SessionToken) -> Result<Artifact, CaptureError> {
        check_session(session, ProfileKind::Allocation)?;
        if let Some(ballast) = &self.ballast {
            let held = ballast.grow();
            tracing::debug!(collector = %self.identity, held, "grew allocation ballast");
        }
        let facility = session.facility().clone();
        let data = facility
            .heap_profile()
            .await
            .map_err(|e| CaptureError::from_facility(ProfileKind::Allocation, e))?;
        Ok(Artifact::new(
            ProfileKind::Allocation,
            self.identity.clone(),
            ArtifactFormat::PprofGzip,
            data,
        ))
    }
}
