// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Profile kinds and the artifacts captures produce.

use std::{
    fmt,
    str::FromStr,
    time::{Duration, SystemTime},
};

use serde::Deserialize;
use thiserror::Error;

/// The families of profiles this crate knows how to capture.
///
/// The serialized names match the `/debug/pprof/<name>` routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum ProfileKind {
    /// Live heap allocations sampled by jemalloc.
    #[serde(rename = "allocs", alias = "heap")]
    Allocation,
    /// Every live thread plus tokio runtime task counts.
    #[serde(rename = "goroutine", alias = "tasks")]
    TaskDump,
    /// Time-bounded CPU sampling.
    #[serde(rename = "profile", alias = "cpu")]
    CpuSample,
    /// Recorded lock and channel contention.
    #[serde(rename = "block")]
    Block,
    /// An execution trace. Served by the endpoint under the same gate
    /// discipline, but no runtime back end produces one today.
    #[serde(rename = "trace")]
    ExecutionTrace,
}

impl ProfileKind {
    /// Every kind, in the order the index page lists them.
    pub const ALL: [ProfileKind; 5] = [
        ProfileKind::Allocation,
        ProfileKind::Block,
        ProfileKind::TaskDump,
        ProfileKind::CpuSample,
        ProfileKind::ExecutionTrace,
    ];

    /// Stable lowercase name, used in routes, file names and logs.
    pub fn name(self) -> &'static str {
        match self {
            ProfileKind::Allocation => "allocs",
            ProfileKind::TaskDump => "goroutine",
            ProfileKind::CpuSample => "profile",
            ProfileKind::Block => "block",
            ProfileKind::ExecutionTrace => "trace",
        }
    }

    /// One-line description shown on the index page.
    pub fn description(self) -> &'static str {
        match self {
            ProfileKind::Allocation => "A sampling of live memory allocations.",
            ProfileKind::TaskDump => "Every live thread and the tokio runtime's task counts.",
            ProfileKind::CpuSample => {
                "CPU profile. Specify the duration in the seconds GET parameter."
            }
            ProfileKind::Block => "Stack traces that led to blocking on synchronization primitives.",
            ProfileKind::ExecutionTrace => {
                "A trace of execution of the current program. Not available in this runtime."
            }
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when a string does not name a [`ProfileKind`].
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown profile kind {0:?}")]
pub struct UnknownProfileKind(pub String);

impl FromStr for ProfileKind {
    type Err = UnknownProfileKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocs" | "heap" => Ok(ProfileKind::Allocation),
            "goroutine" | "tasks" => Ok(ProfileKind::TaskDump),
            "profile" | "cpu" => Ok(ProfileKind::CpuSample),
            "block" => Ok(ProfileKind::Block),
            "trace" => Ok(ProfileKind::ExecutionTrace),
            other => Err(UnknownProfileKind(other.to_owned())),
        }
    }
}

/// How the bytes of an [`Artifact`] are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    /// A gzip-compressed pprof protobuf, readable by `go tool pprof`.
    PprofGzip,
    /// UTF-8 text.
    Text,
}

impl ArtifactFormat {
    /// File extension, without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactFormat::PprofGzip => "pb.gz",
            ArtifactFormat::Text => "txt",
        }
    }

    /// HTTP content type.
    pub fn content_type(self) -> &'static str {
        match self {
            ArtifactFormat::PprofGzip => "application/octet-stream",
            ArtifactFormat::Text => "text/plain; charset=utf-8",
        }
    }
}

/// The output of one capture: an opaque, kind-tagged blob.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Which kind of capture produced this.
    pub kind: ProfileKind,
    /// Identity of the collector that produced this.
    pub collector: String,
    /// Encoding of `data`.
    pub format: ArtifactFormat,
    /// When the capture started.
    pub captured_at: SystemTime,
    /// How long the capture ran. Zero for snapshots.
    pub duration: Duration,
    /// The profile itself.
    pub data: Vec<u8>,
}

impl Artifact {
    /// A snapshot taken now.
    pub fn new(
        kind: ProfileKind,
        collector: impl Into<String>,
        format: ArtifactFormat,
        data: Vec<u8>,
    ) -> Self {
        Artifact {
            kind,
            collector: collector.into(),
            format,
            captured_at: SystemTime::now(),
            duration: Duration::ZERO,
            data,
        }
    }

    /// Marks this as a capture that started at `started` and ran for `duration`.
    pub fn with_timing(mut self, started: SystemTime, duration: Duration) -> Self {
        self.captured_at = started;
        self.duration = duration;
        self
    }

    /// The file name offered to HTTP clients, e.g. `profile.pb.gz`.
    pub fn file_name_hint(&self) -> String {
        format!("{}.{}", self.kind.name(), self.format.extension())
    }
}

/// Where a sink put an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    /// A path, URL or stream label, depending on the sink.
    pub location: String,
    /// Number of bytes written.
    pub size: usize,
}
