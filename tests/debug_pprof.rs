// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::{
        atomic::{self, AtomicBool, AtomicUsize},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use rotaprof::{
    collector::TaskDumpCollector,
    endpoint::{self, DiagnosticsState},
    facility::{CpuSampling, FacilityError, ProfilingFacility},
    gate::{GateConfig, ProfilingGate},
    scheduler::Rotation,
    sink::local::LocalSink,
};
use tokio::time::Instant;
use tower::ServiceExt;

/// Hands out numbered profiles and remembers when each cpu session ran.
#[derive(Debug, Default)]
struct CountingFacility {
    cpu_running: Arc<AtomicBool>,
    cpu_windows: Arc<Mutex<Vec<(Instant, Instant)>>>,
    captures: AtomicUsize,
}

struct Session {
    running: Arc<AtomicBool>,
    windows: Arc<Mutex<Vec<(Instant, Instant)>>>,
    started: Instant,
}

impl CpuSampling for Session {
    fn finish(self: Box<Self>) -> Result<Vec<u8>, FacilityError> {
        self.windows
            .lock()
            .unwrap()
            .push((self.started, Instant::now()));
        Ok(b"cpu".to_vec())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.running.store(false, atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl ProfilingFacility for CountingFacility {
    fn start_cpu_sampling(&self, _frequency: i32) -> Result<Box<dyn CpuSampling>, FacilityError> {
        if self.cpu_running.swap(true, atomic::Ordering::SeqCst) {
            return Err(FacilityError::SessionActive);
        }
        Ok(Box::new(Session {
            running: self.cpu_running.clone(),
            windows: self.cpu_windows.clone(),
            started: Instant::now(),
        }))
    }

    async fn heap_profile(&self) -> Result<Vec<u8>, FacilityError> {
        Err(FacilityError::Unsupported("no jemalloc here".into()))
    }

    fn set_heap_profiling_active(&self, _active: bool) -> Result<bool, FacilityError> {
        Err(FacilityError::Unsupported("no jemalloc here".into()))
    }

    async fn task_dump(&self) -> Result<Vec<u8>, FacilityError> {
        let n = self.captures.fetch_add(1, atomic::Ordering::SeqCst);
        Ok(format!("threads: 1\ncapture {n}\n").into_bytes())
    }

    async fn block_profile(&self) -> Result<Vec<u8>, FacilityError> {
        Ok(b"block".to_vec())
    }

    fn set_block_profile_rate(&self, rate: u64) -> u64 {
        rate
    }
}

fn app() -> (Router, ProfilingGate, Arc<CountingFacility>) {
    let facility = Arc::new(CountingFacility::default());
    let gate = ProfilingGate::from_arc(facility.clone(), GateConfig::default());
    (
        endpoint::router(DiagnosticsState::new(gate.clone())),
        gate,
        facility,
    )
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_goroutine_dump() {
    let (app, _, _) = app();
    let (status, body) = get(app, "/debug/pprof/goroutine").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"threads: 1\ncapture 0\n");
}

#[tokio::test]
async fn test_unsupported_heap_is_not_implemented() {
    let (app, _, _) = app();
    let (status, body) = get(app, "/debug/pprof/heap").await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert!(String::from_utf8(body).unwrap().contains("no jemalloc here"));
}

#[tokio::test]
async fn test_halted_gate_fails_every_capture() {
    let (app, gate, _) = app();
    gate.halt("test");
    for uri in [
        "/debug/pprof/goroutine",
        "/debug/pprof/block",
        "/debug/pprof/profile?seconds=1",
        "/debug/pprof/trace",
    ] {
        let (status, _) = get(app.clone(), uri).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{uri}");
    }
    // routes that do not capture still work
    let (status, _) = get(app, "/debug/pprof/cmdline").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_cpu_profiles_are_serialized() {
    let (app, _, facility) = app();
    let start = Instant::now();
    let (first, second) = tokio::join!(
        get(app.clone(), "/debug/pprof/profile?seconds=3"),
        get(app, "/debug/pprof/profile?seconds=3"),
    );
    assert_eq!(first, (StatusCode::OK, b"cpu".to_vec()));
    assert_eq!(second, (StatusCode::OK, b"cpu".to_vec()));
    assert!(start.elapsed() >= Duration::from_secs(6));

    let mut windows = facility.cpu_windows.lock().unwrap().clone();
    windows.sort();
    assert_eq!(windows.len(), 2);
    // the second session started only after the first one finished
    assert!(windows[1].0 >= windows[0].1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_client_does_not_abort_capture() {
    let (app, gate, facility) = app();
    let request = tokio::spawn(get(app.clone(), "/debug/pprof/profile?seconds=5"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    request.abort();
    assert!(request.await.unwrap_err().is_cancelled());

    // the capture still owns the gate and finishes on its own
    assert!(facility.cpu_running.load(atomic::Ordering::SeqCst));
    let (status, _) = get(app, "/debug/pprof/goroutine").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(facility.cpu_windows.lock().unwrap().len(), 1);
    assert!(!facility.cpu_running.load(atomic::Ordering::SeqCst));
    assert_eq!(gate.stats().peak_holders, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rotation_and_endpoint_share_the_gate() {
    let (app, gate, facility) = app();
    let dir = tempfile::tempdir().unwrap();
    let rotation = Rotation::builder()
        .with_gate(gate.clone())
        .with_sink(LocalSink::new(dir.path()).with_retention(3))
        .with_step_delay(Duration::from_millis(300))
        .with_collector(TaskDumpCollector::new())
        .build()
        .unwrap()
        .spawn();

    let requests: Vec<_> = (0..10)
        .map(|_| tokio::spawn(get(app.clone(), "/debug/pprof/goroutine")))
        .collect();
    let mut bodies = vec![];
    for request in requests {
        let (status, body) = request.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        bodies.push(String::from_utf8(body).unwrap());
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
    rotation.abort();

    // every capture got its own, whole dump
    bodies.sort();
    bodies.dedup();
    assert_eq!(bodies.len(), 10);
    assert!(bodies.iter().all(|b| b.starts_with("threads: 1\ncapture ")));
    assert!(facility.captures.load(atomic::Ordering::SeqCst) > 10);
    assert_eq!(gate.stats().peak_holders, 1);

    let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(files.len(), 3);
}

#[cfg(target_os = "linux")]
mod runtime {
    use std::io::Read;

    use flate2::read::GzDecoder;
    use pprof::protos::{Message, Profile};
    use rotaprof::facility::{contention, RuntimeFacility};

    use super::*;

    fn decode(data: &[u8]) -> Profile {
        let mut raw = vec![];
        GzDecoder::new(data).read_to_end(&mut raw).unwrap();
        Profile::decode(&raw[..]).unwrap()
    }

    #[tokio::test]
    async fn test_block_profile_is_valid_pprof() {
        contention::record_contention("debug_pprof::test", Duration::from_millis(5));
        let gate = ProfilingGate::new(RuntimeFacility::default(), GateConfig::default());
        let app = endpoint::router(DiagnosticsState::new(gate));
        let (status, body) = get(app, "/debug/pprof/block").await;
        assert_eq!(status, StatusCode::OK);
        let profile = decode(&body);
        let types: Vec<_> = profile
            .sample_type
            .iter()
            .map(|t| {
                (
                    profile.string_table[t.ty as usize].as_str(),
                    profile.string_table[t.unit as usize].as_str(),
                )
            })
            .collect();
        assert_eq!(types, [("contentions", "count"), ("delay", "nanoseconds")]);
        assert!(!profile.sample.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cpu_profile_is_valid_pprof() {
        let gate = ProfilingGate::new(RuntimeFacility::default(), GateConfig::default());
        let app = endpoint::router(DiagnosticsState::new(gate.clone()));
        let (status, body) = get(app, "/debug/pprof/profile?seconds=1").await;
        assert_eq!(status, StatusCode::OK);
        let profile = decode(&body);
        assert!(!profile.sample_type.is_empty());
        assert_eq!(gate.stats().acquisitions, 1);
    }

    #[tokio::test]
    async fn test_task_dump_lists_this_thread() {
        let gate = ProfilingGate::new(RuntimeFacility::default(), GateConfig::default());
        let app = endpoint::router(DiagnosticsState::new(gate));
        let (status, body) = get(app, "/debug/pprof/goroutine").await;
        assert_eq!(status, StatusCode::OK);
        let body = String::from_utf8(body).unwrap();
        assert!(body.starts_with("threads: "), "{body}");
    }
}
