// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The `/debug/pprof/*` HTTP routes.
//!
//! Every capture goes through the same [`ProfilingGate`] as the rotation, so
//! a request may wait for a rotation step (or another request) to finish.
//! The capture itself runs in its own task: if the client goes away, the
//! capture still completes, releases the gate, and its artifact is dropped.

use std::{fmt::Write as _, time::Duration};

use axum::{
    extract::{Query, RawQuery, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::{
    artifact::{Artifact, ProfileKind},
    collector::{
        AllocationCollector, BlockCollector, CaptureError, Collector, CpuSampleCollector,
        ExecutionTraceCollector, TaskDumpCollector,
    },
    gate::{ProfilingError, ProfilingGate},
};

/// Default CPU profile length when `seconds` is not given.
pub const DEFAULT_CPU_DURATION: Duration = Duration::from_secs(30);
/// Longest CPU profile a request may ask for.
pub const DEFAULT_MAX_CPU_DURATION: Duration = Duration::from_secs(300);
/// Default execution trace length when `seconds` is not given.
pub const DEFAULT_TRACE_DURATION: Duration = Duration::from_secs(1);

/// Shared state of the diagnostics routes.
#[derive(Debug, Clone)]
pub struct DiagnosticsState {
    gate: ProfilingGate,
    default_cpu_duration: Duration,
    max_cpu_duration: Duration,
}

impl DiagnosticsState {
    /// Routes capturing through `gate`.
    pub fn new(gate: ProfilingGate) -> Self {
        DiagnosticsState {
            gate,
            default_cpu_duration: DEFAULT_CPU_DURATION,
            max_cpu_duration: DEFAULT_MAX_CPU_DURATION,
        }
    }

    /// CPU profile length when the request does not say.
    pub fn with_default_cpu_duration(mut self, duration: Duration) -> Self {
        self.default_cpu_duration = duration;
        self
    }

    /// Upper bound for `seconds` on `/debug/pprof/profile`.
    pub fn with_max_cpu_duration(mut self, duration: Duration) -> Self {
        self.max_cpu_duration = duration;
        self
    }
}

/// The diagnostics routes, ready to be served or nested into an app.
pub fn router(state: DiagnosticsState) -> Router {
    Router::new()
        .route(
            "/debug/pprof",
            get(|| async { Redirect::permanent("/debug/pprof/") }),
        )
        .route("/debug/pprof/", get(index))
        .route("/debug/pprof/cmdline", get(cmdline))
        .route("/debug/pprof/profile", get(cpu_profile))
        .route("/debug/pprof/symbol", get(symbol_count).post(symbol_lookup))
        .route("/debug/pprof/trace", get(execution_trace))
        .route("/debug/pprof/allocs", get(allocs))
        .route("/debug/pprof/heap", get(allocs))
        .route("/debug/pprof/goroutine", get(task_dump))
        .route("/debug/pprof/block", get(block))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SecondsParam {
    seconds: Option<String>,
}

impl SecondsParam {
    fn duration(&self, default: Duration, max: Duration) -> Result<Duration, Response> {
        let Some(seconds) = self.seconds.as_deref() else {
            return Ok(default);
        };
        let seconds: u64 = seconds.trim().parse().map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                format!("invalid seconds parameter {seconds:?}\n"),
            )
                .into_response()
        })?;
        let max = max.as_secs().max(1);
        Ok(Duration::from_secs(seconds.clamp(1, max)))
    }
}

async fn index() -> Html<String> {
    let mut body = String::from(
        "<html>\n<head><title>/debug/pprof/</title></head>\n<body>\n/debug/pprof/<br>\n<br>\n\
         Types of profiles available:\n<table>\n",
    );
    for kind in ProfileKind::ALL {
        let _ = writeln!(
            body,
            "<tr><td><a href=\"{name}\">{name}</a></td><td>{desc}</td></tr>",
            name = kind.name(),
            desc = kind.description(),
        );
    }
    body.push_str(
        "<tr><td><a href=\"cmdline\">cmdline</a></td>\
         <td>The command line invocation of the current program.</td></tr>\n\
         <tr><td><a href=\"symbol\">symbol</a></td>\
         <td>Maps program counters to function names.</td></tr>\n\
         </table>\n</body>\n</html>\n",
    );
    Html(body)
}

async fn cmdline() -> impl IntoResponse {
    let args: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        args.join("\0"),
    )
}

async fn cpu_profile(
    State(state): State<DiagnosticsState>,
    Query(params): Query<SecondsParam>,
) -> Response {
    let duration = match params.duration(state.default_cpu_duration, state.max_cpu_duration) {
        Ok(duration) => duration,
        Err(response) => return response,
    };
    capture(state.gate, CpuSampleCollector::new(duration)).await
}

async fn execution_trace(
    State(state): State<DiagnosticsState>,
    Query(params): Query<SecondsParam>,
) -> Response {
    let duration = match params.duration(DEFAULT_TRACE_DURATION, state.max_cpu_duration) {
        Ok(duration) => duration,
        Err(response) => return response,
    };
    capture(state.gate, ExecutionTraceCollector::new(duration)).await
}

async fn allocs(State(state): State<DiagnosticsState>) -> Response {
    capture(state.gate, AllocationCollector::new()).await
}

async fn task_dump(State(state): State<DiagnosticsState>) -> Response {
    capture(state.gate, TaskDumpCollector::new()).await
}

async fn block(State(state): State<DiagnosticsState>) -> Response {
    capture(state.gate, BlockCollector::new()).await
}

async fn capture(gate: ProfilingGate, collector: impl Collector + 'static) -> Response {
    let kind = collector.kind();
    // dropping the handle detaches the task, it is never aborted
    let task = tokio::spawn(async move {
        let mut session = gate.acquire(collector.kind()).await?;
        let artifact = collector.collect(&mut session).await?;
        session.release();
        Ok::<Artifact, ProfilingError>(artifact)
    });
    match task.await {
        Ok(Ok(artifact)) => artifact_response(artifact),
        Ok(Err(err)) => error_response(kind, err),
        Err(err) => {
            tracing::error!(%kind, %err, "capture task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("capture task failed: {err}\n"),
            )
                .into_response()
        }
    }
}

fn artifact_response(artifact: Artifact) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", artifact.file_name_hint());
    (
        [
            (header::CONTENT_TYPE, artifact.format.content_type().to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff".to_owned()),
        ],
        artifact.data,
    )
        .into_response()
}

fn error_response(kind: ProfileKind, err: ProfilingError) -> Response {
    let status = match &err {
        ProfilingError::Gate(_) => StatusCode::SERVICE_UNAVAILABLE,
        ProfilingError::Capture(CaptureError::UnsupportedOnHost { .. }) => {
            StatusCode::NOT_IMPLEMENTED
        }
        ProfilingError::Capture(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::warn!(%kind, %err, "on-demand capture failed");
    } else {
        tracing::debug!(%kind, %err, %status, "on-demand capture refused");
    }
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("{err}\n"),
    )
        .into_response()
}

async fn symbol_count(RawQuery(query): RawQuery) -> Response {
    match query {
        Some(query) if !query.is_empty() => symbol_lookup(query).await,
        _ => "num_symbols: 1\n".into_response(),
    }
}

async fn symbol_lookup(words: String) -> Response {
    let addresses: Vec<u64> = words.split('+').filter_map(parse_address).collect();
    let resolved = tokio::task::spawn_blocking(move || {
        let mut out = String::from("num_symbols: 1\n");
        for address in addresses {
            if let Some(name) = resolve_symbol(address) {
                let _ = writeln!(out, "{address:#x} {name}");
            }
        }
        out
    })
    .await;
    match resolved {
        Ok(out) => ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], out).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("symbol lookup failed: {err}\n"),
        )
            .into_response(),
    }
}

fn parse_address(word: &str) -> Option<u64> {
    let word = word.trim();
    let hex = word
        .strip_prefix("0x")
        .or_else(|| word.strip_prefix("0X"))
        .unwrap_or(word);
    match u64::from_str_radix(hex, 16) {
        Ok(0) | Err(_) => None,
        Ok(address) => Some(address),
    }
}

#[cfg(target_os = "linux")]
fn resolve_symbol(address: u64) -> Option<String> {
    let mut name = None;
    backtrace::resolve(address as usize as *mut std::ffi::c_void, |symbol| {
        if name.is_none() {
            name = symbol.name().map(|n| n.to_string());
        }
    });
    name
}

#[cfg(not(target_os = "linux"))]
fn resolve_symbol(_address: u64) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use test_case::test_case;
    use tower::ServiceExt;

    use super::*;
    use crate::collector::test::mock_gate;

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[test_case("/debug/pprof/goroutine", "threads: 1\n")]
    #[test_case("/debug/pprof/allocs", "heap-profile")]
    #[test_case("/debug/pprof/heap", "heap-profile")]
    #[test_case("/debug/pprof/block", "block-profile")]
    #[tokio::test]
    async fn test_snapshot_routes(uri: &str, body: &str) {
        let (gate, _) = mock_gate();
        let (status, got) = get(router(DiagnosticsState::new(gate)), uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(got, body);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cpu_profile() {
        let (gate, facility) = mock_gate();
        let app = router(DiagnosticsState::new(gate));
        let start = tokio::time::Instant::now();
        let response = app
            .oneshot(
                Request::get("/debug/pprof/profile?seconds=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"profile.pb.gz\""
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"cpu-profile");
        assert_eq!(
            facility
                .cpu_sessions
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[test_case(None, 30; "default")]
    #[test_case(Some("5"), 5; "given")]
    #[test_case(Some("0"), 1; "clamped up")]
    #[test_case(Some("100000"), 300; "clamped down")]
    fn test_seconds_param(seconds: Option<&str>, expected: u64) {
        let param = SecondsParam {
            seconds: seconds.map(Into::into),
        };
        assert_eq!(
            param
                .duration(DEFAULT_CPU_DURATION, DEFAULT_MAX_CPU_DURATION)
                .unwrap(),
            Duration::from_secs(expected)
        );
    }

    #[tokio::test]
    async fn test_invalid_seconds_is_bad_request() {
        let (gate, facility) = mock_gate();
        let (status, _) = get(
            router(DiagnosticsState::new(gate)),
            "/debug/pprof/profile?seconds=soon",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            facility
                .cpu_sessions
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn test_trace_not_implemented() {
        let (gate, _) = mock_gate();
        let (status, body) = get(router(DiagnosticsState::new(gate)), "/debug/pprof/trace").await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert!(body.contains("not supported"), "{body}");
    }

    #[tokio::test]
    async fn test_halted_gate_unavailable() {
        let (gate, _) = mock_gate();
        gate.halt("test");
        let (status, body) = get(router(DiagnosticsState::new(gate)), "/debug/pprof/goroutine").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.starts_with("profiling unavailable"), "{body}");
    }

    #[tokio::test]
    async fn test_capture_failure_is_server_error() {
        let (gate, facility) = mock_gate();
        facility.fail(ProfileKind::Block);
        let app = router(DiagnosticsState::new(gate.clone()));
        let (status, body) = get(app.clone(), "/debug/pprof/block").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("block capture aborted"), "{body}");
        // the gate was released
        let (status, _) = get(app, "/debug/pprof/goroutine").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!gate.is_halted());
    }

    #[tokio::test]
    async fn test_index_lists_profiles() {
        let (gate, _) = mock_gate();
        let app = router(DiagnosticsState::new(gate));
        let (status, body) = get(app.clone(), "/debug/pprof/").await;
        assert_eq!(status, StatusCode::OK);
        for kind in ProfileKind::ALL {
            assert!(body.contains(&format!("href=\"{kind}\"")), "{body}");
        }
        let (status, _) = get(app, "/debug/pprof").await;
        assert_eq!(status, StatusCode::PERMANENT_REDIRECT);
    }

    #[tokio::test]
    async fn test_cmdline() {
        let (gate, _) = mock_gate();
        let (status, body) = get(router(DiagnosticsState::new(gate)), "/debug/pprof/cmdline").await;
        assert_eq!(status, StatusCode::OK);
        let program = std::env::args().next().unwrap();
        assert!(body.starts_with(&program));
    }

    #[tokio::test]
    async fn test_symbol_count() {
        let (gate, _) = mock_gate();
        let (status, body) = get(router(DiagnosticsState::new(gate)), "/debug/pprof/symbol").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "num_symbols: 1\n");
    }

    #[test_case("0x1f", Some(0x1f))]
    #[test_case(" 0X400\n", Some(0x400))]
    #[test_case("deadbeef", Some(0xdead_beef))]
    #[test_case("0x0", None)]
    #[test_case("zzz", None)]
    #[test_case("", None)]
    fn test_parse_address(word: &str, expected: Option<u64>) {
        assert_eq!(parse_address(word), expected);
    }

    #[inline(never)]
    fn symbol_marker() -> u32 {
        std::hint::black_box(7)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_symbol_lookup() {
        let (gate, _) = mock_gate();
        // anywhere inside the function resolves to it
        let address = symbol_marker as fn() -> u32 as usize + 1;
        assert_eq!(symbol_marker(), 7);
        let response = router(DiagnosticsState::new(gate))
            .oneshot(
                Request::post("/debug/pprof/symbol")
                    .body(Body::from(format!("{address:#x}+0x0")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        let mut lines = body.lines();
        assert_eq!(lines.next(), Some("num_symbols: 1"));
        let line = lines.next().unwrap();
        assert!(line.starts_with(&format!("{address:#x} ")), "{line}");
        assert!(line.contains("symbol_marker"), "{line}");
        assert_eq!(lines.next(), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_symbol_lookup_from_query() {
        let (gate, _) = mock_gate();
        let address = symbol_marker as fn() -> u32 as usize + 1;
        assert_eq!(symbol_marker(), 7);
        let (status, body) = get(
            router(DiagnosticsState::new(gate)),
            &format!("/debug/pprof/symbol?{address:#x}"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let mut lines = body.lines();
        assert_eq!(lines.next(), Some("num_symbols: 1"));
        let line = lines.next().unwrap();
        assert!(line.starts_with(&format!("{address:#x} ")), "{line}");
        assert!(line.contains("symbol_marker"), "{line}");
    }
}
