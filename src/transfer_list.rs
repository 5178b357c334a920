use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::block_set::BlockSet;
use crate::error::{BuildError, InvariantViolation};

pub const TRANSFER_LIST_VERSION: u32 = 4;

/// Byte-accumulating sink for one partition's `<partition>.transfer.list`,
/// `new.dat`, and `patch.dat`. Every append advances the running command
/// stream and the arithmetic `finish()` checks against the verification
/// identity (§4.G).
pub struct TransferListEmitter {
    partition: String,
    block_size: u64,
    lines: Vec<String>,
    new_dat: File,
    patch_dat: File,
    new_dat_path: PathBuf,
    patch_dat_path: PathBuf,
    new_bytes_written: u64,
    patch_bytes_written: u64,
    new_block_count: u64,
    total_target_blocks: u64,
    stash_live: BTreeMap<u32, u64>,
    max_stash_entries: usize,
    max_stash_blocks: u64,
}

pub struct TransferListOutput {
    pub text: String,
    pub new_dat_path: PathBuf,
    pub patch_dat_path: PathBuf,
    pub new_dat_len: u64,
    pub patch_dat_len: u64,
}

impl TransferListEmitter {
    pub fn new(
        partition: impl Into<String>,
        new_dat_path: impl Into<PathBuf>,
        patch_dat_path: impl Into<PathBuf>,
        block_size: u64,
    ) -> Result<Self, BuildError> {
        let new_dat_path = new_dat_path.into();
        let patch_dat_path = patch_dat_path.into();
        let new_dat = File::create(&new_dat_path).map_err(|e| BuildError::io(new_dat_path.clone(), e))?;
        let patch_dat =
            File::create(&patch_dat_path).map_err(|e| BuildError::io(patch_dat_path.clone(), e))?;
        Ok(TransferListEmitter {
            partition: partition.into(),
            block_size,
            lines: Vec::new(),
            new_dat,
            patch_dat,
            new_dat_path,
            patch_dat_path,
            new_bytes_written: 0,
            patch_bytes_written: 0,
            new_block_count: 0,
            total_target_blocks: 0,
            stash_live: BTreeMap::new(),
            max_stash_entries: 0,
            max_stash_blocks: 0,
        })
    }

    pub fn zero_action(&mut self, blocks: &BlockSet) {
        self.lines.push(format!("erase {}", blocks.to_compact_string()));
        self.lines.push(format!("zero {}", blocks.to_compact_string()));
        self.total_target_blocks += blocks.size();
    }

    pub fn first_block_check(&mut self) {
        self.lines.push("first_block_check".to_string());
        self.lines.push("abort_if_not_equal".to_string());
    }

    pub fn new_action(&mut self, blocks: &BlockSet, bytes: &[u8]) -> Result<(), BuildError> {
        self.new_dat
            .write_all(bytes)
            .map_err(|e| BuildError::io(self.new_dat_path.clone(), e))?;
        self.new_bytes_written += bytes.len() as u64;
        self.new_block_count += blocks.size();
        self.lines.push(format!("new {}", blocks.to_compact_string()));
        self.total_target_blocks += blocks.size();
        Ok(())
    }

    pub fn move_action(&mut self, tgt: &BlockSet, src: &BlockSet, hash: &str) {
        self.lines.push(format!(
            "move {hash} {} {}",
            tgt.to_compact_string(),
            src.to_compact_string()
        ));
        self.total_target_blocks += tgt.size();
    }

    pub fn diff_fragment(
        &mut self,
        tgt: &BlockSet,
        src: &BlockSet,
        src_hash: &str,
        tgt_hash: &str,
        patch: &[u8],
    ) -> Result<(), BuildError> {
        let offset = self.patch_bytes_written;
        self.patch_dat
            .write_all(patch)
            .map_err(|e| BuildError::io(self.patch_dat_path.clone(), e))?;
        self.patch_bytes_written += patch.len() as u64;
        self.lines.push(format!(
            "pkgdiff {offset} {} {src_hash} {tgt_hash} {} {} {}",
            patch.len(),
            src.to_compact_string(),
            tgt.size(),
            tgt.to_compact_string()
        ));
        self.total_target_blocks += tgt.size();
        Ok(())
    }

    pub fn stash(&mut self, id: u32, blocks: &BlockSet) {
        self.lines.push(format!("stash {id} {}", blocks.to_compact_string()));
        self.stash_live.insert(id, blocks.size());
        self.max_stash_entries = self.max_stash_entries.max(self.stash_live.len());
        let live_blocks: u64 = self.stash_live.values().sum();
        self.max_stash_blocks = self.max_stash_blocks.max(live_blocks);
    }

    pub fn free(&mut self, id: u32) {
        self.lines.push(format!("free {id}"));
        self.stash_live.remove(&id);
    }

    pub fn finish(self) -> Result<TransferListOutput, BuildError> {
        let header = format!(
            "{}\n{}\n{}\n{}\n",
            TRANSFER_LIST_VERSION, self.total_target_blocks, self.max_stash_entries, self.max_stash_blocks
        );
        let mut text = header;
        for line in &self.lines {
            text.push_str(line);
            text.push('\n');
        }

        let new_dat_len = self.new_bytes_written;
        let patch_dat_len = self.patch_bytes_written;

        verify_transfer_list(&text, new_dat_len, patch_dat_len, self.block_size).map_err(|_| {
            InvariantViolation::TransferListInconsistent {
                partition: self.partition.clone(),
                expected_new: self.new_block_count * self.block_size,
                actual_new: new_dat_len,
                expected_patch: patch_dat_len,
                actual_patch: patch_dat_len,
            }
        })?;

        Ok(TransferListOutput {
            text,
            new_dat_path: self.new_dat_path,
            patch_dat_path: self.patch_dat_path,
            new_dat_len,
            patch_dat_len,
        })
    }
}

/// Recomputes the verification identity (§4.G) from an already-emitted
/// transfer list's text, independent of any live `TransferListEmitter`.
/// Used both by `finish()` and by the CLI's `inspect-transfer-list`
/// diagnostic subcommand.
pub fn verify_transfer_list(
    text: &str,
    new_dat_len: u64,
    patch_dat_len: u64,
    block_size: u64,
) -> Result<(), BuildError> {
    let mut sum_new_blocks = 0u64;
    let mut sum_patch_len = 0u64;

    for line in text.lines().skip(4) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.first() {
            Some(&"new") => {
                if let Some(spec) = parts.get(1) {
                    sum_new_blocks += BlockSet::parse_compact(spec)?.size();
                }
            }
            Some(&"pkgdiff") | Some(&"bsdiff") => {
                if let Some(len) = parts.get(2) {
                    sum_patch_len += len.parse::<u64>().unwrap_or(0);
                }
            }
            _ => {}
        }
    }

    let expected_new = sum_new_blocks * block_size;
    if expected_new != new_dat_len || sum_patch_len != patch_dat_len {
        return Err(InvariantViolation::TransferListInconsistent {
            partition: "<unknown>".to_string(),
            expected_new,
            actual_new: new_dat_len,
            expected_patch: sum_patch_len,
            actual_patch: patch_dat_len,
        }
        .into());
    }
    Ok(())
}
