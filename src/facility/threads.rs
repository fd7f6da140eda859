// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ThreadInfo {
    pub(crate) tid: u32,
    pub(crate) name: String,
    pub(crate) state: char,
}

#[cfg(target_os = "linux")]
pub(crate) fn list_threads() -> std::io::Result<Vec<ThreadInfo>> {
    let mut threads = vec![];
    for entry in std::fs::read_dir("/proc/self/task")? {
        let entry = entry?;
        let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) else {
            continue;
        };
        // threads can exit between read_dir and here
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        let Some((name, state)) = parse_stat(&stat) else {
            continue;
        };
        threads.push(ThreadInfo { tid, name, state });
    }
    threads.sort_by_key(|t| t.tid);
    Ok(threads)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn list_threads() -> std::io::Result<Vec<ThreadInfo>> {
    Ok(vec![])
}

/// Parses `tid (comm) S ...`. `comm` may itself contain spaces and parens.
fn parse_stat(stat: &str) -> Option<(String, char)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat.get(open + 1..close)?.to_owned();
    let state = stat.get(close + 1..)?.trim_start().chars().next()?;
    Some((name, state))
}

pub(crate) fn render_task_dump(threads: &[ThreadInfo]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "threads: {}", threads.len());
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let metrics = handle.metrics();
        let _ = writeln!(
            out,
            "tokio runtime: flavor={:?} workers={} alive_tasks={} global_queue_depth={}",
            handle.runtime_flavor(),
            metrics.num_workers(),
            metrics.num_alive_tasks(),
            metrics.global_queue_depth(),
        );
    }
    for thread in threads {
        let _ = write!(
            out,
            "\nthread {} [{}]: state {}\n",
            thread.tid, thread.name, thread.state
        );
    }
    out
}
