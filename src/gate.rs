// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Exclusive, FIFO access to the process-global profiling machinery.

use std::{
    fmt,
    sync::{
        atomic::{self, AtomicBool, AtomicU64, AtomicUsize},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    artifact::ProfileKind,
    collector::CaptureError,
    facility::{contention, CpuSampling, FacilityError, ProfilingFacility},
};

/// Default CPU sampling frequency, in Hz. 99 rather than 100 to avoid
/// sampling in lock-step with other timers.
pub const DEFAULT_CPU_FREQUENCY: i32 = 99;

/// How the gate configures the global machinery for each capture.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// CPU sampling frequency in Hz.
    pub cpu_frequency: i32,
    /// Contention sampling rate (ns) to apply while a block capture holds the
    /// gate. `None` leaves the rate alone.
    pub block_rate_during_capture: Option<u64>,
    /// Force jemalloc heap sampling on while an allocation capture holds the
    /// gate.
    pub activate_heap_profiling: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        GateConfig {
            cpu_frequency: DEFAULT_CPU_FREQUENCY,
            block_rate_during_capture: None,
            activate_heap_profiling: false,
        }
    }
}

/// Errors that make the gate, and therefore all profiling, unusable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GateError {
    /// Acquire/release nesting was broken. The gate halts permanently.
    #[error("profiling gate invariant violated: {0}")]
    InvariantViolation(String),
    /// The gate was halted earlier.
    #[error("profiling unavailable: the profiling gate has been halted")]
    Halted,
}

/// Why a session could not be opened.
#[derive(Debug, Error)]
pub enum ProfilingError {
    /// The gate itself is broken.
    #[error(transparent)]
    Gate(#[from] GateError),
    /// The gate was fine but the capture failed.
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Counters for instrumentation and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    /// Sessions handed out so far.
    pub acquisitions: u64,
    /// Highest number of simultaneous holders ever observed. Anything above
    /// 1 is a bug.
    pub peak_holders: usize,
    /// Whether the gate has been halted.
    pub halted: bool,
}

struct Shared {
    facility: Arc<dyn ProfilingFacility>,
    config: GateConfig,
    admission: Arc<Mutex<()>>,
    holder_task: StdMutex<Option<tokio::task::Id>>,
    holders: AtomicUsize,
    peak_holders: AtomicUsize,
    acquisitions: AtomicU64,
    halted: AtomicBool,
}

/// The one door to the process-wide profiling machinery.
///
/// Cloning is cheap and every clone is the same gate. Admission is FIFO
/// (tokio's `Mutex` is fair), and at most one [`SessionToken`] exists at a
/// time.
#[derive(Clone)]
pub struct ProfilingGate {
    shared: Arc<Shared>,
}

impl fmt::Debug for ProfilingGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfilingGate")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ProfilingGate {
    /// A gate over `facility`.
    pub fn new(facility: impl ProfilingFacility, config: GateConfig) -> Self {
        Self::from_arc(Arc::new(facility), config)
    }

    /// A gate over an already shared facility.
    pub fn from_arc(facility: Arc<dyn ProfilingFacility>, config: GateConfig) -> Self {
        ProfilingGate {
            shared: Arc::new(Shared {
                facility,
                config,
                admission: Arc::new(Mutex::new(())),
                holder_task: StdMutex::new(None),
                holders: AtomicUsize::new(0),
                peak_holders: AtomicUsize::new(0),
                acquisitions: AtomicU64::new(0),
                halted: AtomicBool::new(false),
            }),
        }
    }

    /// Waits for exclusive access and switches on the machinery for `kind`.
    ///
    /// For [`ProfileKind::CpuSample`] this starts CPU sampling; the
    /// collector finishes it with [`SessionToken::finish_cpu_sampling`].
    pub async fn acquire(&self, kind: ProfileKind) -> Result<SessionToken, ProfilingError> {
        self.check_halted()?;
        let task = tokio::task::try_id();
        if task.is_some() && *self.holder_task() == task {
            return Err(self
                .violation(format!(
                    "{kind} session requested by a task that already holds the gate"
                ))
                .into());
        }

        let guard = match self.shared.admission.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                let waiting = Instant::now();
                tracing::debug!(%kind, "waiting for the profiling gate");
                let guard = self.shared.admission.clone().lock_owned().await;
                contention::record_contention(contention::GATE_SITE, waiting.elapsed());
                guard
            }
        };
        // halted while we were queued
        self.check_halted()?;

        let holders = self.shared.holders.fetch_add(1, atomic::Ordering::SeqCst) + 1;
        self.shared
            .peak_holders
            .fetch_max(holders, atomic::Ordering::SeqCst);
        self.shared
            .acquisitions
            .fetch_add(1, atomic::Ordering::Relaxed);
        *self.holder_task() = task;

        let mut token = SessionToken {
            gate: self.clone(),
            kind,
            admission: Some(Admission {
                gate: self.clone(),
                _guard: guard,
            }),
            cpu: None,
            prior_block_rate: None,
            prior_heap_active: None,
            acquired_at: Instant::now(),
        };
        if holders != 1 {
            return Err(self
                .violation(format!("{holders} simultaneous holders"))
                .into());
        }
        token.activate()?;
        tracing::debug!(%kind, "acquired profiling gate");
        Ok(token)
    }

    /// Permanently disables the gate. Queued and future `acquire` calls fail
    /// with [`GateError::Halted`].
    pub fn halt(&self, reason: &str) {
        if !self.shared.halted.swap(true, atomic::Ordering::SeqCst) {
            tracing::error!(reason, "profiling gate halted, profiling is now unavailable");
        }
    }

    /// Whether [`halt`](Self::halt) has been called.
    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(atomic::Ordering::SeqCst)
    }

    /// Current counters.
    pub fn stats(&self) -> GateStats {
        GateStats {
            acquisitions: self.shared.acquisitions.load(atomic::Ordering::Relaxed),
            peak_holders: self.shared.peak_holders.load(atomic::Ordering::SeqCst),
            halted: self.is_halted(),
        }
    }

    /// The facility behind this gate.
    pub fn facility(&self) -> &Arc<dyn ProfilingFacility> {
        &self.shared.facility
    }

    fn check_halted(&self) -> Result<(), GateError> {
        if self.is_halted() {
            Err(GateError::Halted)
        } else {
            Ok(())
        }
    }

    fn violation(&self, what: String) -> GateError {
        let err = GateError::InvariantViolation(what);
        self.halt(&err.to_string());
        err
    }

    fn holder_task(&self) -> std::sync::MutexGuard<'_, Option<tokio::task::Id>> {
        self.shared
            .holder_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// The admitted holder's place in the gate. Dropping it admits the next
/// waiter.
struct Admission {
    gate: ProfilingGate,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        *self.gate.holder_task() = None;
        self.gate
            .shared
            .holders
            .fetch_sub(1, atomic::Ordering::SeqCst);
    }
}

/// Exclusive possession of the [`ProfilingGate`] for one capture.
///
/// Dropping the token, or calling [`release`](Self::release), stops any
/// unfinished CPU session, restores the knobs the gate changed, and admits
/// the next waiter. This happens on every exit path, including errors and
/// cancellation. A CPU session whose report is still being built keeps the
/// gate until the report is done, even if the token is dropped first.
pub struct SessionToken {
    gate: ProfilingGate,
    kind: ProfileKind,
    admission: Option<Admission>,
    cpu: Option<Box<dyn CpuSampling>>,
    prior_block_rate: Option<u64>,
    prior_heap_active: Option<bool>,
    acquired_at: Instant,
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("kind", &self.kind)
            .field("cpu_sampling", &self.cpu.is_some())
            .field("held_for", &self.held_for())
            .finish()
    }
}

impl SessionToken {
    /// The kind this session was opened for.
    pub fn kind(&self) -> ProfileKind {
        self.kind
    }

    /// The facility to capture from.
    pub fn facility(&self) -> &Arc<dyn ProfilingFacility> {
        self.gate.facility()
    }

    /// How long the gate has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Stops CPU sampling and returns the encoded profile.
    ///
    /// Fails if this is not a CPU session or it was already finished.
    pub async fn finish_cpu_sampling(&mut self) -> Result<Vec<u8>, CaptureError> {
        let session = self.cpu.take().ok_or_else(|| {
            CaptureError::Facility("no cpu sampling session is running".into())
        })?;
        // the blocking task owns the admission until the profiler has stopped,
        // so a cancelled caller cannot let the next session start early
        let admission = self.admission.take();
        let (report, admission) =
            tokio::task::spawn_blocking(move || (session.finish(), admission))
                .await
                .map_err(|e| CaptureError::Facility(format!("cpu report task: {e}")))?;
        self.admission = admission;
        report.map_err(|e| CaptureError::from_facility(ProfileKind::CpuSample, e))
    }

    /// Gives the gate back.
    pub fn release(self) {}

    fn activate(&mut self) -> Result<(), CaptureError> {
        let shared = &self.gate.shared;
        match self.kind {
            ProfileKind::CpuSample => {
                match shared
                    .facility
                    .start_cpu_sampling(shared.config.cpu_frequency)
                {
                    Ok(session) => self.cpu = Some(session),
                    Err(FacilityError::SessionActive) => {
                        // unreachable while every cpu capture goes through the gate
                        tracing::error!(
                            "cpu profiler already running while holding the profiling gate; \
                             something is profiling outside the gate"
                        );
                        return Err(CaptureError::SessionConflict);
                    }
                    Err(err) => return Err(CaptureError::from_facility(self.kind, err)),
                }
            }
            ProfileKind::Block => {
                if let Some(rate) = shared.config.block_rate_during_capture {
                    self.prior_block_rate = Some(shared.facility.set_block_profile_rate(rate));
                }
            }
            ProfileKind::Allocation => {
                if shared.config.activate_heap_profiling {
                    match shared.facility.set_heap_profiling_active(true) {
                        Ok(prior) => self.prior_heap_active = Some(prior),
                        // the capture itself will report why
                        Err(err) => tracing::debug!(%err, "unable to activate heap profiling"),
                    }
                }
            }
            ProfileKind::TaskDump | ProfileKind::ExecutionTrace => {}
        }
        Ok(())
    }
}

impl Drop for SessionToken {
    fn drop(&mut self) {
        let facility = self.gate.facility().clone();
        if self.cpu.take().is_some() {
            tracing::debug!("discarded unfinished cpu sampling session");
        }
        if let Some(rate) = self.prior_block_rate.take() {
            facility.set_block_profile_rate(rate);
        }
        if let Some(active) = self.prior_heap_active.take() {
            if let Err(err) = facility.set_heap_profiling_active(active) {
                tracing::warn!(%err, "unable to restore heap profiling state");
            }
        }
        match self.admission.take() {
            Some(admission) => {
                tracing::debug!(kind = %self.kind, held_for = ?self.held_for(), "released profiling gate");
                drop(admission);
            }
            None => {
                // the report task holds admission now, not this task
                *self.gate.holder_task() = None;
                tracing::debug!(
                    kind = %self.kind,
                    "profiling gate stays held until the cpu report is built"
                );
            }
        }
    }
}
