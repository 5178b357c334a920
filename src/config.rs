use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BuildError, InputError};

/// Immutable build configuration, assembled once and threaded by reference
/// through the `Coordinator` and every component it constructs.
///
/// This replaces the source tool's process-global options manager: nothing
/// in this crate reads ambient global state, and every derived, per-partition
/// value lives in a scoped context owned by that partition's pipeline run.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub block_size: u64,
    /// Patch-size ceiling expressed in blocks; `LIMIT = chunk_limit * block_size`.
    pub chunk_limit: u64,
    pub differ_path: PathBuf,
    pub map_generator_path: PathBuf,
    pub differ_timeout: Duration,
    pub no_zip: bool,
    pub full_img_list: BTreeSet<String>,
    pub incremental_img_list: BTreeSet<String>,
    pub target_version: Option<String>,
    pub source_version: Option<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            block_size: 4096,
            chunk_limit: 256, // 1 MiB at the default block size
            differ_path: PathBuf::from("imgdiff"),
            map_generator_path: PathBuf::from("e2fsdroid"),
            differ_timeout: Duration::from_secs(300),
            no_zip: false,
            full_img_list: BTreeSet::new(),
            incremental_img_list: BTreeSet::new(),
            target_version: None,
            source_version: None,
        }
    }
}

impl BuildOptions {
    /// Build options from the plain key/value map the XML-ingestion
    /// collaborator is specified to hand over. Absent keys fall back to
    /// `Default::default()`; a present-but-malformed value is a hard
    /// `InputError::InvalidConfig`, never a silent fallback.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, BuildError> {
        let mut opts = BuildOptions::default();

        if let Some(v) = map.get("block_size") {
            opts.block_size = parse_field(v, "block_size")?;
        }
        if let Some(v) = map.get("chunk_limit") {
            opts.chunk_limit = parse_field(v, "chunk_limit")?;
        }
        if let Some(v) = map.get("differ_path") {
            opts.differ_path = PathBuf::from(v);
        }
        if let Some(v) = map.get("map_generator_path") {
            opts.map_generator_path = PathBuf::from(v);
        }
        if let Some(v) = map.get("differ_timeout_secs") {
            let secs: u64 = parse_field(v, "differ_timeout_secs")?;
            opts.differ_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = map.get("no_zip") {
            opts.no_zip = parse_field(v, "no_zip")?;
        }
        if let Some(v) = map.get("full_img_list") {
            opts.full_img_list = split_list(v);
        }
        if let Some(v) = map.get("incremental_img_list") {
            opts.incremental_img_list = split_list(v);
        }
        opts.target_version = map.get("target_version").cloned();
        opts.source_version = map.get("source_version").cloned();

        Ok(opts)
    }

    /// Byte ceiling for a single emitted patch fragment.
    pub fn limit_bytes(&self) -> u64 {
        self.chunk_limit * self.block_size
    }

    pub fn is_full(&self, partition: &str) -> bool {
        self.full_img_list.contains(partition)
    }

    pub fn is_incremental(&self, partition: &str) -> bool {
        self.incremental_img_list.contains(partition)
    }
}

fn split_list(v: &str) -> BTreeSet<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_field<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, BuildError> {
    value.trim().parse::<T>().map_err(|_| {
        BuildError::Input(InputError::InvalidConfig {
            key: key.to_string(),
            value: value.to_string(),
        })
    })
}
