// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::{HashMap, HashSet},
    ffi::OsString,
    io::Read,
};

use clap::{Parser, Subcommand};
use flate2::read::GzDecoder;
use pprof::protos::{Message, Profile};

#[derive(Debug, Parser)]
#[command(name = "pprof-inspect")]
#[command(about = "Inspect pprof artifacts written by rotaprof")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the sample types and their totals
    Summary {
        /// Profile to read, gzipped or not
        profile: OsString,
    },
    /// Print the functions with the most samples
    Top {
        /// Profile to read, gzipped or not
        profile: OsString,
        /// Which sample type to rank by
        #[arg(long, default_value = "0")]
        sample_index: usize,
        /// Number of functions to print
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt::init();
    match cli.command {
        Commands::Summary { profile } => {
            let profile = read_profile(&std::fs::read(profile)?)?;
            for (ty, unit, total) in summarize(&profile) {
                println!("{ty}/{unit}: {total}");
            }
            println!("{} samples", profile.sample.len());
            Ok(())
        }
        Commands::Top {
            profile,
            sample_index,
            limit,
        } => {
            let profile = read_profile(&std::fs::read(profile)?)?;
            if sample_index >= profile.sample_type.len() {
                anyhow::bail!(
                    "sample index {sample_index} out of range, the profile has {} sample types",
                    profile.sample_type.len()
                );
            }
            println!("{:>14} {:>14}  function", "flat", "cum");
            for entry in top_functions(&profile, sample_index, limit) {
                println!("{:>14} {:>14}  {}", entry.flat, entry.cum, entry.name);
            }
            Ok(())
        }
    }
}

fn read_profile(data: &[u8]) -> anyhow::Result<Profile> {
    let raw = if data.starts_with(&[0x1f, 0x8b]) {
        let mut raw = vec![];
        GzDecoder::new(data).read_to_end(&mut raw)?;
        tracing::debug!(compressed = data.len(), raw = raw.len(), "decompressed profile");
        raw
    } else {
        data.to_vec()
    };
    Ok(Profile::decode(&raw[..])?)
}

fn string(profile: &Profile, index: i64) -> &str {
    usize::try_from(index)
        .ok()
        .and_then(|i| profile.string_table.get(i))
        .map_or("<unknown>", |s| s.as_str())
}

/// `(type, unit, total)` for every sample type.
fn summarize(profile: &Profile) -> Vec<(&str, &str, i64)> {
    profile
        .sample_type
        .iter()
        .enumerate()
        .map(|(i, ty)| {
            let total = profile
                .sample
                .iter()
                .filter_map(|s| s.value.get(i))
                .sum();
            (string(profile, ty.ty), string(profile, ty.unit), total)
        })
        .collect()
}

#[derive(Debug, PartialEq, Eq)]
struct TopEntry {
    name: String,
    flat: i64,
    cum: i64,
}

fn top_functions(profile: &Profile, sample_index: usize, limit: usize) -> Vec<TopEntry> {
    let locations: HashMap<u64, Vec<&str>> = {
        let functions: HashMap<u64, &str> = profile
            .function
            .iter()
            .map(|f| (f.id, string(profile, f.name)))
            .collect();
        profile
            .location
            .iter()
            .map(|loc| {
                // innermost inlined frame first
                let names = loc
                    .line
                    .iter()
                    .map(|line| functions.get(&line.function_id).copied().unwrap_or("<unknown>"))
                    .collect();
                (loc.id, names)
            })
            .collect()
    };

    let mut totals: HashMap<&str, (i64, i64)> = HashMap::new();
    for sample in &profile.sample {
        let Some(&value) = sample.value.get(sample_index) else {
            continue;
        };
        let mut stack = sample
            .location_id
            .iter()
            .flat_map(|id| locations.get(id).into_iter().flatten().copied());
        if let Some(leaf) = stack.next() {
            totals.entry(leaf).or_default().0 += value;
            let mut seen = HashSet::from([leaf]);
            totals.entry(leaf).or_default().1 += value;
            for name in stack {
                // recursion counts once
                if seen.insert(name) {
                    totals.entry(name).or_default().1 += value;
                }
            }
        }
    }

    let mut entries: Vec<TopEntry> = totals
        .into_iter()
        .map(|(name, (flat, cum))| TopEntry {
            name: name.to_owned(),
            flat,
            cum,
        })
        .collect();
    entries.sort_by(|a, b| {
        b.flat
            .cmp(&a.flat)
            .then(b.cum.cmp(&a.cum))
            .then_with(|| a.name.cmp(&b.name))
    });
    entries.truncate(limit);
    entries
}
