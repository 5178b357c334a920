use std::collections::VecDeque;

use crate::action::Action;
use crate::block_set::BlockSet;
use crate::differ::DiffTool;
use crate::error::{BuildError, ExternalFailure, SchedulingError};
use crate::image::Image;
use crate::patch_engine::{PatchEngine, PatchOutcome};

const PATCH_HEADER_MAGIC_LEN: usize = 8;
const PATCH_DESCRIPTOR_LEN: usize = 28;
/// The source tool's constant granularity for the coarse probe patch: each
/// probe sub-patch corresponds to this many bytes of the uncapped patch.
const PROBE_GRANULARITY: u64 = 10240;
const MAX_SPLIT_ATTEMPTS: u32 = 20;

/// One accepted, size-bounded DIFF fragment ready for `TransferListEmitter`.
pub struct ChunkGroup {
    pub tgt_blocks: BlockSet,
    pub src_blocks: BlockSet,
    pub patch: Vec<u8>,
}

/// Breaks a single oversized DIFF action into fragments that each fit
/// `limit` bytes, via a coarse probe patch, greedy packing, and bisection.
pub struct ChunkedPatcher<'a> {
    partition: &'a str,
    engine: PatchEngine<'a>,
    block_size: u64,
    limit: u64,
}

impl<'a> ChunkedPatcher<'a> {
    pub fn new(partition: &'a str, differ: &'a dyn DiffTool, block_size: u64, limit: u64) -> Self {
        ChunkedPatcher {
            partition,
            engine: PatchEngine::new(differ),
            block_size,
            limit,
        }
    }

    pub fn split(
        &self,
        source: &Image,
        target: &Image,
        action: &Action,
    ) -> Result<Vec<ChunkGroup>, BuildError> {
        let total_blocks = action.tgt_blocks.size();

        let probe_limit = (self.limit / PROBE_GRANULARITY).max(1);
        let probe_patch = self.run_via_engine(source, target, action, probe_limit)?;
        let offsets = parse_patch_header(&probe_patch)?;

        let file_limit_size = (self.limit / PROBE_GRANULARITY / self.block_size).max(1);

        let boundaries = self.pack_groups(&offsets, file_limit_size, total_blocks);

        let mut pending: VecDeque<(u64, u64)> = boundaries.into_iter().collect();
        let mut accepted: Vec<ChunkGroup> = Vec::new();
        let mut attempts = 0u32;

        while let Some((start, end)) = pending.pop_front() {
            let group_tgt = action.tgt_blocks.skip(start).first(end - start);
            let group_src = action.src_blocks.skip(start).first(end - start);
            let group_action = Action::diff(
                action.tgt_name.clone(),
                group_tgt.clone(),
                action.src_name.clone(),
                group_src.clone(),
            );
            let patch = self.run_via_engine(source, target, &group_action, self.block_size)?;

            if (patch.len() as u64) <= self.limit {
                accepted.push(ChunkGroup {
                    tgt_blocks: group_tgt,
                    src_blocks: group_src,
                    patch,
                });
                continue;
            }

            attempts += 1;
            if attempts > MAX_SPLIT_ATTEMPTS {
                return Err(SchedulingError::ChunkingFailed {
                    partition: self.partition.to_string(),
                    attempts,
                }
                .into());
            }

            let n = end - start;
            let (part1, part2) = split_into_closest_multiples_of_ten(n)?;
            log::debug!(
                "{}: bisecting a {n}-block chunk into {part1}+{part2} (attempt {attempts})",
                self.partition
            );
            pending.push_front((start + part1, end));
            pending.push_front((start, start + part1));
            let _ = part2;
        }

        accepted.sort_by_key(|g| g.tgt_blocks.iter_pairs().next().map(|(a, _)| a).unwrap_or(0));

        let covered: u64 = accepted.iter().map(|g| g.tgt_blocks.size()).sum();
        if covered != total_blocks {
            return Err(SchedulingError::ChunkingFailed {
                partition: self.partition.to_string(),
                attempts,
            }
            .into());
        }

        Ok(accepted)
    }

    fn pack_groups(&self, offsets: &[u64], file_limit_size: u64, total_blocks: u64) -> Vec<(u64, u64)> {
        let mut groups = Vec::new();
        let mut group_start = 0u64;
        let mut running_total = 0u64;

        let slot_count = offsets.len().saturating_sub(1);
        for i in 0..slot_count {
            let size = offsets[i + 1] - offsets[i];
            let slot_start = (i as u64) * file_limit_size;
            running_total += size;

            if running_total > self.limit {
                if slot_start > group_start {
                    groups.push((group_start, slot_start.min(total_blocks)));
                }
                group_start = slot_start;
                running_total = size;
            }
        }

        if group_start < total_blocks {
            groups.push((group_start, total_blocks));
        }
        if groups.is_empty() {
            groups.push((0, total_blocks));
        }
        groups
    }

    /// Runs one probe/group diff through `PatchEngine`, so the coarse probe
    /// and every per-group diff share its one-retry-with-wider-limit
    /// handling of `DifferFailed` instead of surfacing it immediately.
    fn run_via_engine(
        &self,
        source: &Image,
        target: &Image,
        action: &Action,
        limit: u64,
    ) -> Result<Vec<u8>, BuildError> {
        match self.engine.diff(source, target, action, limit)? {
            PatchOutcome::Patch(bytes) => Ok(bytes),
            PatchOutcome::PromotedToNew(bytes) => Ok(bytes),
        }
    }
}

/// Parses a probe patch's header into a list of cumulative byte offsets,
/// with a trailing sentinel equal to the patch's total length so adjacent
/// differences give each descriptor's byte size.
fn parse_patch_header(patch: &[u8]) -> Result<Vec<u64>, BuildError> {
    if patch.len() < PATCH_HEADER_MAGIC_LEN + 4 {
        return Err(ExternalFailure::DifferFailed {
            status: -1,
            message: "patch header shorter than the magic+count prefix".to_string(),
        }
        .into());
    }
    let count = u32::from_le_bytes(
        patch[PATCH_HEADER_MAGIC_LEN..PATCH_HEADER_MAGIC_LEN + 4]
            .try_into()
            .unwrap(),
    ) as usize;

    let descriptors_start = PATCH_HEADER_MAGIC_LEN + 4;
    let descriptors_end = descriptors_start + count * PATCH_DESCRIPTOR_LEN;
    if patch.len() < descriptors_end {
        return Err(ExternalFailure::DifferFailed {
            status: -1,
            message: "patch header shorter than its declared descriptor count".to_string(),
        }
        .into());
    }

    let mut offsets = Vec::with_capacity(count + 1);
    for i in 0..count {
        let start = descriptors_start + i * PATCH_DESCRIPTOR_LEN + 20;
        let offset = u64::from_le_bytes(patch[start..start + 8].try_into().unwrap());
        offsets.push(offset);
    }
    offsets.push(patch.len() as u64);
    Ok(offsets)
}

/// Splits `n` into two halves that are each a multiple of ten, as close to
/// even as possible. Fatal (`SplitImpossible`) when `n` is not itself a
/// multiple of ten — no silent rounding.
fn split_into_closest_multiples_of_ten(n: u64) -> Result<(u64, u64), BuildError> {
    if n == 0 || n % 10 != 0 {
        return Err(SchedulingError::SplitImpossible { blocks: n }.into());
    }
    let mut part1 = (n / 2 / 10) * 10;
    if part1 == 0 {
        part1 = 10;
    }
    let part2 = n - part1;
    if part2 == 0 || part2 % 10 != 0 {
        return Err(SchedulingError::SplitImpossible { blocks: n }.into());
    }
    Ok((part1, part2))
}
