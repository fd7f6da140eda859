// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use super::{contention, threads, CpuSampling, FacilityError, ProfilingFacility};

const DEFAULT_BLOCKLIST: &[&str] = &["libc", "libgcc", "pthread", "vdso"];

/// The real profiling machinery of this process.
///
/// CPU samples come from the `pprof` crate, heap profiles from jemalloc via
/// `jemalloc_pprof`, contention from the [`contention`] recorder, and task
/// dumps from `/proc/self/task` plus tokio's runtime metrics. On hosts other
/// than Linux only the task dump is available.
#[derive(Debug, Clone)]
pub struct RuntimeFacility {
    blocklist: Vec<String>,
}

impl Default for RuntimeFacility {
    fn default() -> Self {
        RuntimeFacility {
            blocklist: DEFAULT_BLOCKLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RuntimeFacility {
    /// Shared objects whose frames the CPU profiler should not unwind through.
    pub fn with_blocklist(mut self, blocklist: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.blocklist = blocklist.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(target_os = "linux")]
struct PprofSession(pprof::ProfilerGuard<'static>);

#[cfg(target_os = "linux")]
impl CpuSampling for PprofSession {
    fn finish(self: Box<Self>) -> Result<Vec<u8>, FacilityError> {
        use pprof::protos::Message;

        let report = self
            .0
            .report()
            .build()
            .map_err(|e| FacilityError::Failed(format!("building cpu report: {e}")))?;
        // stop sampling before the (slow) encoding
        drop(self);
        let profile = report
            .pprof()
            .map_err(|e| FacilityError::Failed(format!("converting cpu report: {e}")))?;
        Ok(super::gzip(&profile.encode_to_vec())?)
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl ProfilingFacility for RuntimeFacility {
    fn start_cpu_sampling(&self, frequency: i32) -> Result<Box<dyn CpuSampling>, FacilityError> {
        tracing::debug!(frequency, "starting cpu profiler");
        match pprof::ProfilerGuardBuilder::default()
            .frequency(frequency)
            .blocklist(self.blocklist.as_slice())
            .build()
        {
            Ok(guard) => Ok(Box::new(PprofSession(guard))),
            Err(pprof::Error::Running) => Err(FacilityError::SessionActive),
            Err(e) => Err(FacilityError::Failed(format!("starting cpu profiler: {e}"))),
        }
    }

    async fn heap_profile(&self) -> Result<Vec<u8>, FacilityError> {
        let prof_ctl = jemalloc_pprof::PROF_CTL.as_ref().ok_or_else(|| {
            FacilityError::Unsupported(
                "jemalloc heap profiling is not enabled; use tikv-jemallocator with prof:true".into(),
            )
        })?;
        // dumping walks every sampled allocation and gzips the result
        tokio::task::spawn_blocking(move || prof_ctl.blocking_lock().dump_pprof())
            .await
            .map_err(|e| FacilityError::Failed(format!("heap profile task: {e}")))?
            .map_err(|e| FacilityError::Failed(format!("dumping heap profile: {e}")))
    }

    fn set_heap_profiling_active(&self, active: bool) -> Result<bool, FacilityError> {
        const PROF_ACTIVE: &[u8] = b"prof.active\0";
        // SAFETY: prof.active is a bool mallctl and the name is NUL terminated
        let prior = unsafe { tikv_jemalloc_ctl::raw::read::<bool>(PROF_ACTIVE) }
            .map_err(|e| FacilityError::Unsupported(format!("reading prof.active: {e}")))?;
        if prior != active {
            // SAFETY: as above
            unsafe { tikv_jemalloc_ctl::raw::write(PROF_ACTIVE, active) }
                .map_err(|e| FacilityError::Failed(format!("writing prof.active: {e}")))?;
            tracing::debug!(active, "toggled jemalloc heap profiling");
        }
        Ok(prior)
    }

    async fn task_dump(&self) -> Result<Vec<u8>, FacilityError> {
        let threads = tokio::task::spawn_blocking(threads::list_threads)
            .await
            .map_err(|e| FacilityError::Failed(format!("listing threads: {e}")))??;
        Ok(threads::render_task_dump(&threads).into_bytes())
    }

    async fn block_profile(&self) -> Result<Vec<u8>, FacilityError> {
        use pprof::protos::Message;

        let profile = contention::global().to_pprof();
        Ok(super::gzip(&profile.encode_to_vec())?)
    }

    fn set_block_profile_rate(&self, rate: u64) -> u64 {
        contention::global().set_rate(rate)
    }
}

#[cfg(not(target_os = "linux"))]
#[async_trait]
impl ProfilingFacility for RuntimeFacility {
    fn start_cpu_sampling(&self, _frequency: i32) -> Result<Box<dyn CpuSampling>, FacilityError> {
        Err(unsupported("cpu profiling"))
    }

    async fn heap_profile(&self) -> Result<Vec<u8>, FacilityError> {
        Err(unsupported("heap profiling"))
    }

    fn set_heap_profiling_active(&self, _active: bool) -> Result<bool, FacilityError> {
        Err(unsupported("heap profiling"))
    }

    async fn task_dump(&self) -> Result<Vec<u8>, FacilityError> {
        Ok(threads::render_task_dump(&threads::list_threads()?).into_bytes())
    }

    async fn block_profile(&self) -> Result<Vec<u8>, FacilityError> {
        Err(unsupported("block profiles"))
    }

    fn set_block_profile_rate(&self, rate: u64) -> u64 {
        contention::global().set_rate(rate)
    }
}

#[cfg(not(target_os = "linux"))]
fn unsupported(what: &str) -> FacilityError {
    FacilityError::Unsupported(format!(
        "{what} is only supported on Linux, not {}",
        std::env::consts::OS
    ))
}
