// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! ## rotaprof
//! Continuous, in-process profiling for long-running servers.
//!
//! A background [`Rotation`] cycles through a fixed list of collectors
//! (heap allocations, a thread/task dump, CPU samples, and lock contention),
//! writing one artifact per step through an [`ArtifactSink`]. At the same
//! time [`endpoint::router`] serves the familiar `/debug/pprof/*` routes so
//! `go tool pprof` and friends can pull the same profiles on demand.
//!
//! ### The profiling gate
//!
//! The machinery behind those profiles is process-global: there is exactly
//! one CPU profiler (building a second [pprof] guard while one runs fails),
//! jemalloc's heap-profiling switches are global, and so is the contention
//! sampling rate. Every capture, whether it comes from the rotation or from
//! an HTTP request, first takes a [`SessionToken`] from the shared
//! [`ProfilingGate`]. The gate admits one holder at a time in FIFO order, turns
//! the kind-specific machinery on, and restores it when the token drops.
//!
//! [pprof]: https://docs.rs/pprof
//!
//! ### Usage
//!
//! ```no_run
//! # use std::time::Duration;
//! # use rotaprof::{
//! #     collector::{AllocationCollector, BlockCollector, CpuSampleCollector, TaskDumpCollector},
//! #     endpoint::{self, DiagnosticsState},
//! #     facility::RuntimeFacility,
//! #     gate::{GateConfig, ProfilingGate},
//! #     scheduler::Rotation,
//! #     sink::local::LocalSink,
//! # };
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let gate = ProfilingGate::new(RuntimeFacility::default(), GateConfig::default());
//!
//! let rotation = Rotation::builder()
//!     .with_gate(gate.clone())
//!     .with_sink(LocalSink::new("./profiles").with_retention(32))
//!     .with_collector(AllocationCollector::new())
//!     .with_collector(TaskDumpCollector::new())
//!     .with_collector(CpuSampleCollector::new(Duration::from_secs(10)))
//!     .with_collector(BlockCollector::new())
//!     .build()?;
//! rotation.spawn();
//!
//! let app = endpoint::router(DiagnosticsState::new(gate));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8882").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Heap profiles
//!
//! Heap profiles come from jemalloc through [jemalloc_pprof]. The embedding
//! binary must use `tikv-jemallocator` as its global allocator and enable
//! profiling in `malloc_conf` (see the `rotaprofd` binary). Without that,
//! allocation captures fail with [`CaptureError::UnsupportedOnHost`].
//!
//! [jemalloc_pprof]: https://docs.rs/jemalloc_pprof
//!
//! ### Contention profiles
//!
//! Rust has no runtime-wide block profiler, so contention is recorded
//! explicitly with [`facility::contention::record_contention`]. The gate
//! records its own admission waits.

pub mod artifact;
pub mod collector;
pub mod config;
pub mod endpoint;
pub mod facility;
pub mod gate;
pub mod scheduler;
pub mod sink;

pub use artifact::{Artifact, ArtifactFormat, ArtifactRef, ProfileKind};
pub use collector::{CaptureError, Collector};
pub use gate::{GateError, ProfilingError, ProfilingGate, SessionToken};
pub use scheduler::Rotation;
pub use sink::ArtifactSink;
