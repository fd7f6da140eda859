// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A sink that writes into a directory.

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{self, AtomicU64},
};

use async_trait::async_trait;
use chrono::SecondsFormat;

use super::{ArtifactSink, SinkError};
use crate::artifact::{Artifact, ArtifactRef};

/// A sink that writes into a directory.
///
/// Files are named `<identity>_<yyyy-mm-ddTHH-MM-SS.mmmZ>_<seq>.<ext>`, so a
/// plain sort lists them in capture order. Each file is written under a
/// temporary name in the same directory and renamed into place.
#[derive(Debug)]
pub struct LocalSink {
    directory: PathBuf,
    retention: Option<usize>,
    seq: AtomicU64,
}

impl LocalSink {
    /// A sink writing into `directory`, which is created on first write.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        LocalSink {
            directory: directory.into(),
            retention: None,
            seq: AtomicU64::new(0),
        }
    }

    /// Keeps at most `keep` artifacts per collector, deleting the oldest.
    pub fn with_retention(mut self, keep: usize) -> Self {
        self.retention = Some(keep.max(1));
        self
    }

    /// The output directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_name(&self, artifact: &Artifact) -> String {
        let time: chrono::DateTime<chrono::Utc> = artifact.captured_at.into();
        let time = time
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .replace(':', "-");
        let seq = self.seq.fetch_add(1, atomic::Ordering::Relaxed);
        format!(
            "{}_{time}_{seq:06}.{}",
            file_prefix(&artifact.collector),
            artifact.format.extension()
        )
    }
}

/// Collector identities become file name prefixes. `_` separates the name
/// parts, so it is replaced along with anything unsafe in a path.
fn file_prefix(identity: &str) -> String {
    let prefix: String = identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if prefix.is_empty() || prefix.starts_with('.') {
        format!("x{prefix}")
    } else {
        prefix
    }
}

fn write_atomic(directory: &Path, file_name: &str, data: &[u8]) -> Result<PathBuf, SinkError> {
    std::fs::create_dir_all(directory)?;
    let mut tmp = tempfile::NamedTempFile::new_in(directory)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    let path = directory.join(file_name);
    tmp.persist(&path)?;
    Ok(path)
}

fn prune(directory: &Path, identity: &str, keep: usize) -> Result<usize, SinkError> {
    let prefix = format!("{}_", file_prefix(identity));
    let mut names: Vec<_> = std::fs::read_dir(directory)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with(&prefix))
        .collect();
    if names.len() <= keep {
        return Ok(0);
    }
    names.sort();
    let excess = names.len() - keep;
    for name in &names[..excess] {
        match std::fs::remove_file(directory.join(name)) {
            Ok(()) => {}
            // someone else got there first
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(excess)
}

#[async_trait]
impl ArtifactSink for LocalSink {
    async fn write(&self, artifact: &Artifact) -> Result<ArtifactRef, SinkError> {
        let file_name = self.file_name(artifact);
        tracing::debug!(collector = %artifact.collector, file_name, "writing artifact");
        let directory = self.directory.clone();
        let identity = artifact.collector.clone();
        let data = artifact.data.clone();
        let retention = self.retention;
        tokio::task::spawn_blocking(move || {
            let path = write_atomic(&directory, &file_name, &data)?;
            if let Some(keep) = retention {
                let pruned = prune(&directory, &identity, keep)?;
                if pruned > 0 {
                    tracing::debug!(collector = %identity, pruned, "pruned old artifacts");
                }
            }
            Ok(ArtifactRef {
                location: path.display().to_string(),
                size: data.len(),
            })
        })
        .await?
    }
}
