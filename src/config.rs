// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! JSON configuration for an embedded profiler or the `rotaprofd` daemon.
//!
//! Every field is optional:
//!
//! ```json
//! {
//!     "listen": "0.0.0.0:8882",
//!     "output_dir": "./profiles",
//!     "step_delay": "1s",
//!     "cpu_duration": "10s",
//!     "cpu_frequency": 99,
//!     "retain_per_collector": 32,
//!     "collectors": ["allocs", "goroutine", "profile", "block"],
//!     "allocation_ballast": { "chunk_bytes": 1048576, "max_chunks": 16 },
//!     "block_rate": 1,
//!     "max_cpu_seconds": 300,
//!     "capture_timeout": "1m"
//! }
//! ```

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::{
    artifact::ProfileKind,
    collector::{
        AllocationCollector, BallastConfig, BlockCollector, Collector, CpuSampleCollector,
        TaskDumpCollector,
    },
    endpoint::DiagnosticsState,
    gate::{GateConfig, ProfilingGate, DEFAULT_CPU_FREQUENCY},
    scheduler::{BuildError, Rotation, DEFAULT_STEP_DELAY},
    sink::local::LocalSink,
};

/// Errors loading an [`AgentConfig`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading {path}: {source}")]
    Io {
        /// The file.
        path: PathBuf,
        /// Why.
        #[source]
        source: std::io::Error,
    },
    /// The file is not a valid configuration.
    #[error("parsing config: {0}")]
    Parse(#[from] serde_json::Error),
    /// The values do not make sense together.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Rotation, sink, gate and endpoint settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Address the diagnostics endpoint listens on.
    pub listen: SocketAddr,
    /// Directory rotation artifacts are written to.
    pub output_dir: PathBuf,
    /// Pause after each rotation step.
    #[serde(deserialize_with = "duration")]
    pub step_delay: Duration,
    /// CPU sampling window of the rotation's CPU collector.
    #[serde(deserialize_with = "duration")]
    pub cpu_duration: Duration,
    /// CPU sampling frequency in Hz.
    pub cpu_frequency: i32,
    /// Artifacts kept per collector. `null` keeps everything.
    pub retain_per_collector: Option<usize>,
    /// The rotation, in order.
    pub collectors: Vec<ProfileKind>,
    /// Ballast for the allocation collector. Off when absent.
    pub allocation_ballast: Option<BallastConfig>,
    /// Contention sampling rate in nanoseconds, applied at startup.
    pub block_rate: u64,
    /// Longest CPU profile the endpoint will take.
    pub max_cpu_seconds: u64,
    /// Gives up on rotation captures running longer than this.
    #[serde(deserialize_with = "optional_duration")]
    pub capture_timeout: Option<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            listen: SocketAddr::from(([0, 0, 0, 0], 8882)),
            output_dir: PathBuf::from("./profiles"),
            step_delay: DEFAULT_STEP_DELAY,
            cpu_duration: CpuSampleCollector::DEFAULT_DURATION,
            cpu_frequency: DEFAULT_CPU_FREQUENCY,
            retain_per_collector: Some(32),
            collectors: vec![
                ProfileKind::Allocation,
                ProfileKind::TaskDump,
                ProfileKind::CpuSample,
                ProfileKind::Block,
            ],
            allocation_ballast: None,
            block_rate: 1,
            max_cpu_seconds: 300,
            capture_timeout: None,
        }
    }
}

fn duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

fn optional_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    Option::<String>::deserialize(deserializer)?
        .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

impl AgentConfig {
    /// Reads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Parses and validates a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values make sense together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |what: &str| Err(ConfigError::Invalid(what.into()));
        if self.collectors.is_empty() {
            return invalid("collectors must not be empty");
        }
        if self.collectors.contains(&ProfileKind::ExecutionTrace) {
            return invalid("trace can only be captured on demand, not in the rotation");
        }
        if self.cpu_duration.is_zero() {
            return invalid("cpu_duration must be positive");
        }
        if self.cpu_frequency <= 0 {
            return invalid("cpu_frequency must be positive");
        }
        if self.max_cpu_seconds == 0 {
            return invalid("max_cpu_seconds must be positive");
        }
        if self.retain_per_collector == Some(0) {
            return invalid("retain_per_collector must be positive or null");
        }
        Ok(())
    }

    /// The rotation's collectors, in order.
    pub fn build_collectors(&self) -> Vec<Box<dyn Collector>> {
        self.collectors
            .iter()
            .filter_map(|kind| -> Option<Box<dyn Collector>> {
                Some(match kind {
                    ProfileKind::Allocation => {
                        let collector = AllocationCollector::new();
                        Box::new(match self.allocation_ballast {
                            Some(ballast) => collector.with_ballast(ballast),
                            None => collector,
                        })
                    }
                    ProfileKind::TaskDump => Box::new(TaskDumpCollector::new()),
                    ProfileKind::CpuSample => Box::new(CpuSampleCollector::new(self.cpu_duration)),
                    ProfileKind::Block => Box::new(BlockCollector::new()),
                    // rejected by validate
                    ProfileKind::ExecutionTrace => return None,
                })
            })
            .collect()
    }

    /// How the gate drives the global machinery.
    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            cpu_frequency: self.cpu_frequency,
            activate_heap_profiling: true,
            ..GateConfig::default()
        }
    }

    /// The directory sink for rotation artifacts.
    pub fn sink(&self) -> LocalSink {
        let sink = LocalSink::new(&self.output_dir);
        match self.retain_per_collector {
            Some(keep) => sink.with_retention(keep),
            None => sink,
        }
    }

    /// The rotation described by this config, over `gate`.
    pub fn rotation(&self, gate: ProfilingGate) -> Result<Rotation, BuildError> {
        let mut builder = Rotation::builder()
            .with_gate(gate)
            .with_sink(self.sink())
            .with_step_delay(self.step_delay);
        if let Some(timeout) = self.capture_timeout {
            builder = builder.with_capture_timeout(timeout);
        }
        for collector in self.build_collectors() {
            builder = builder.with_boxed_collector(collector);
        }
        builder.build()
    }

    /// Endpoint state over `gate`.
    pub fn diagnostics_state(&self, gate: ProfilingGate) -> DiagnosticsState {
        DiagnosticsState::new(gate)
            .with_max_cpu_duration(Duration::from_secs(self.max_cpu_seconds))
    }
}
