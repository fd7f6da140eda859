// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::HashSet,
    sync::{
        atomic::{self, AtomicBool, AtomicU64, AtomicUsize},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use super::{CpuSampling, FacilityError, ProfilingFacility};
use crate::artifact::ProfileKind;

/// A facility that fakes every profile and records how it was used.
#[derive(Debug, Default)]
pub(crate) struct MockFacility {
    pub(crate) cpu_running: Arc<AtomicBool>,
    pub(crate) cpu_sessions: AtomicUsize,
    pub(crate) block_rate: AtomicU64,
    pub(crate) heap_active: AtomicBool,
    pub(crate) failing: Mutex<HashSet<ProfileKind>>,
    /// How long building a cpu report blocks.
    pub(crate) cpu_finish_delay: Mutex<Duration>,
    in_capture: AtomicUsize,
    pub(crate) peak_in_capture: AtomicUsize,
}

impl MockFacility {
    pub(crate) fn fail(&self, kind: ProfileKind) {
        self.failing.lock().unwrap().insert(kind);
    }

    fn snapshot(&self, kind: ProfileKind, data: &[u8]) -> Result<Vec<u8>, FacilityError> {
        if self.failing.lock().unwrap().contains(&kind) {
            return Err(FacilityError::Failed(format!("{kind} capture aborted")));
        }
        Ok(data.to_vec())
    }

    async fn observed<T>(&self, f: impl FnOnce() -> T) -> T {
        let now = self.in_capture.fetch_add(1, atomic::Ordering::SeqCst) + 1;
        self.peak_in_capture
            .fetch_max(now, atomic::Ordering::SeqCst);
        tokio::task::yield_now().await;
        let res = f();
        self.in_capture.fetch_sub(1, atomic::Ordering::SeqCst);
        res
    }
}

struct MockCpuSession {
    running: Arc<AtomicBool>,
    fail: bool,
    finish_delay: Duration,
}

impl CpuSampling for MockCpuSession {
    fn finish(self: Box<Self>) -> Result<Vec<u8>, FacilityError> {
        if !self.finish_delay.is_zero() {
            std::thread::sleep(self.finish_delay);
        }
        if self.fail {
            return Err(FacilityError::Failed("cpu capture aborted".into()));
        }
        Ok(b"cpu-profile".to_vec())
    }
}

impl Drop for MockCpuSession {
    fn drop(&mut self) {
        self.running.store(false, atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl ProfilingFacility for MockFacility {
    fn start_cpu_sampling(&self, _frequency: i32) -> Result<Box<dyn CpuSampling>, FacilityError> {
        if self.cpu_running.swap(true, atomic::Ordering::SeqCst) {
            return Err(FacilityError::SessionActive);
        }
        self.cpu_sessions.fetch_add(1, atomic::Ordering::SeqCst);
        Ok(Box::new(MockCpuSession {
            running: self.cpu_running.clone(),
            fail: self
                .failing
                .lock()
                .unwrap()
                .contains(&ProfileKind::CpuSample),
            finish_delay: *self.cpu_finish_delay.lock().unwrap(),
        }))
    }

    async fn heap_profile(&self) -> Result<Vec<u8>, FacilityError> {
        self.observed(|| self.snapshot(ProfileKind::Allocation, b"heap-profile"))
            .await
    }

    fn set_heap_profiling_active(&self, active: bool) -> Result<bool, FacilityError> {
        Ok(self.heap_active.swap(active, atomic::Ordering::SeqCst))
    }

    async fn task_dump(&self) -> Result<Vec<u8>, FacilityError> {
        self.observed(|| self.snapshot(ProfileKind::TaskDump, b"threads: 1\n"))
            .await
    }

    async fn block_profile(&self) -> Result<Vec<u8>, FacilityError> {
        self.observed(|| self.snapshot(ProfileKind::Block, b"block-profile"))
            .await
    }

    fn set_block_profile_rate(&self, rate: u64) -> u64 {
        self.block_rate.swap(rate, atomic::Ordering::SeqCst)
    }
}
