// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide record of time spent blocked on contended resources.
//!
//! Call [`record_contention`] after waiting on a lock, channel, or any other
//! shared resource. Events are aggregated per call site and exported by the
//! block profile.
//!
//! The sampling rate works like a runtime block-profile rate: `0` disables
//! recording, and otherwise an event that blocked for `rate` nanoseconds or
//! longer is always recorded while a shorter one is recorded with probability
//! `waited / rate`.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        LazyLock, Mutex, PoisonError,
    },
    time::Duration,
};

/// Call site under which the profiling gate records its own admission waits.
pub const GATE_SITE: &str = "rotaprof::gate::acquire";

static RECORDER: LazyLock<ContentionRecorder> = LazyLock::new(|| ContentionRecorder::new(1));

/// The recorder behind [`record_contention`].
pub fn global() -> &'static ContentionRecorder {
    &RECORDER
}

/// Records that `site` was blocked for `waited` in the global recorder.
pub fn record_contention(site: &'static str, waited: Duration) {
    RECORDER.record(site, waited)
}

/// Aggregated contention for one call site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiteStats {
    /// Estimated number of blocking events.
    pub contentions: u64,
    /// Estimated total time spent blocked.
    pub delay: Duration,
}

/// Aggregates blocking events per call site.
#[derive(Debug)]
pub struct ContentionRecorder {
    rate: AtomicU64,
    sites: Mutex<HashMap<&'static str, Estimate>>,
}

// Weighted totals. Sampled short waits carry fractional weights, so these
// stay in floating point until exported.
#[derive(Debug, Clone, Copy, Default)]
struct Estimate {
    contentions: f64,
    delay_ns: f64,
}

impl Estimate {
    fn stats(&self) -> SiteStats {
        SiteStats {
            contentions: self.contentions.round() as u64,
            delay: Duration::from_nanos(self.delay_ns.round() as u64),
        }
    }
}

impl ContentionRecorder {
    /// A recorder with the given sampling rate, in nanoseconds.
    pub fn new(rate: u64) -> Self {
        ContentionRecorder {
            rate: AtomicU64::new(rate),
            sites: Mutex::new(HashMap::new()),
        }
    }

    /// Current sampling rate in nanoseconds. `0` means disabled.
    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Sets the sampling rate and returns the previous one.
    pub fn set_rate(&self, rate: u64) -> u64 {
        self.rate.swap(rate, Ordering::Relaxed)
    }

    /// Records one blocking event, subject to sampling.
    pub fn record(&self, site: &'static str, waited: Duration) {
        let rate = self.rate();
        if rate == 0 {
            return;
        }
        let waited_ns = (waited.as_nanos() as f64).max(1.0);
        let rate = rate as f64;
        let weight = if waited_ns >= rate {
            1.0
        } else if rand::random::<f64>() < waited_ns / rate {
            // a wait kept with probability p stands for 1/p waits
            rate / waited_ns
        } else {
            return;
        };
        let mut sites = self.sites.lock().unwrap_or_else(PoisonError::into_inner);
        let estimate = sites.entry(site).or_default();
        estimate.contentions += weight;
        estimate.delay_ns += weight * waited_ns;
    }

    /// Current totals, sorted by call site.
    pub fn snapshot(&self) -> Vec<(&'static str, SiteStats)> {
        let sites = self.sites.lock().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot: Vec<_> = sites
            .iter()
            .map(|(site, estimate)| (*site, estimate.stats()))
            .collect();
        snapshot.sort_by_key(|(site, _)| *site);
        snapshot
    }

    /// Encodes the current totals as an uncompressed pprof profile with the
    /// sample types `contentions/count` and `delay/nanoseconds`.
    #[cfg(target_os = "linux")]
    pub fn to_pprof(&self) -> pprof::protos::Profile {
        use pprof::protos::{Function, Line, Location, Profile, Sample, ValueType};

        let mut strings = StringTable::default();
        let contentions = ValueType {
            ty: strings.intern("contentions"),
            unit: strings.intern("count"),
        };
        let delay = ValueType {
            ty: strings.intern("delay"),
            unit: strings.intern("nanoseconds"),
        };

        let mut profile = Profile {
            sample_type: vec![contentions.clone(), delay],
            period_type: Some(contentions),
            period: self.rate() as i64,
            time_nanos: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as i64)
                .unwrap_or_default(),
            ..Default::default()
        };
        for (id, (site, stats)) in (1u64..).zip(self.snapshot()) {
            let name = strings.intern(site);
            profile.function.push(Function {
                id,
                name,
                system_name: name,
                ..Default::default()
            });
            profile.location.push(Location {
                id,
                line: vec![Line {
                    function_id: id,
                    ..Default::default()
                }],
                ..Default::default()
            });
            profile.sample.push(Sample {
                location_id: vec![id],
                value: vec![
                    stats.contentions as i64,
                    stats.delay.as_nanos() as i64,
                ],
                ..Default::default()
            });
        }
        profile.string_table = strings.into_inner();
        profile
    }
}

#[cfg(target_os = "linux")]
struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, i64>,
}

#[cfg(target_os = "linux")]
impl Default for StringTable {
    fn default() -> Self {
        // pprof requires string 0 to be empty
        StringTable {
            strings: vec![String::new()],
            index: HashMap::from([(String::new(), 0)]),
        }
    }
}

#[cfg(target_os = "linux")]
impl StringTable {
    fn intern(&mut self, s: &str) -> i64 {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.strings.len() as i64;
        self.strings.push(s.to_owned());
        self.index.insert(s.to_owned(), i);
        i
    }

    fn into_inner(self) -> Vec<String> {
        self.strings
    }
}
