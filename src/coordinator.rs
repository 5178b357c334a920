use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::action::ActionType;
use crate::chunked_patch::ChunkedPatcher;
use crate::config::BuildOptions;
use crate::differ::{DiffTool, MapGenerator};
use crate::error::{BuildError, ExternalFailure, InputError};
use crate::graph::{DependencyGraph, ScheduleItem};
use crate::image::Image;
use crate::transfer_list::TransferListEmitter;
use crate::transfers::TransfersManager;

/// One partition's inputs as resolved by the (external) package-ingestion
/// layer: image paths plus whatever map files already exist on disk.
#[derive(Debug, Clone)]
pub struct PartitionInput {
    pub name: String,
    pub target_image: PathBuf,
    pub target_map: Option<PathBuf>,
    pub source_image: Option<PathBuf>,
    pub source_map: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PartitionMode {
    Identical,
    Incremental,
    ImagePatchFallback,
    Full,
}

#[derive(Debug, Serialize)]
pub struct PartitionSummary {
    pub name: String,
    pub mode: PartitionMode,
    pub transfer_list_path: Option<PathBuf>,
    pub new_dat_path: Option<PathBuf>,
    pub patch_dat_path: Option<PathBuf>,
    pub full_image_path: Option<PathBuf>,
    pub full_image_len: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct BuildManifest {
    pub partitions: Vec<PartitionSummary>,
}

/// Top-level pipeline over a partition set (§4.I). Owns no mutable state
/// beyond the config/differ/map-generator references it was built with;
/// every partition's pipeline run owns only its own temp directory.
pub struct Coordinator<'a> {
    options: &'a BuildOptions,
    differ: &'a dyn DiffTool,
    map_generator: &'a dyn MapGenerator,
}

impl<'a> Coordinator<'a> {
    pub fn new(options: &'a BuildOptions, differ: &'a dyn DiffTool, map_generator: &'a dyn MapGenerator) -> Self {
        Coordinator {
            options,
            differ,
            map_generator,
        }
    }

    pub fn run(&self, partitions: &[PartitionInput], source_is_zip: bool) -> Result<BuildManifest, BuildError> {
        if self.options.no_zip && !source_is_zip {
            return Err(InputError::SourceNotZip(PathBuf::from("<source package>")).into());
        }
        if let (Some(src_ver), Some(tgt_ver)) = (&self.options.source_version, &self.options.target_version) {
            check_not_downgrade(src_ver, tgt_ver)?;
        }
        for p in partitions {
            if p.name == "userdata" {
                return Err(InputError::UserdataRejected.into());
            }
            if p.name == "boot" && self.options.is_incremental("boot") {
                return Err(InputError::BootIncremental.into());
            }
        }

        let results: Vec<Result<PartitionSummary, BuildError>> =
            partitions.par_iter().map(|p| self.process_partition(p)).collect();

        let mut summaries = Vec::with_capacity(results.len());
        for r in results {
            summaries.push(r?);
        }
        Ok(BuildManifest { partitions: summaries })
    }

    fn process_partition(&self, p: &PartitionInput) -> Result<PartitionSummary, BuildError> {
        log::info!("{}: starting pipeline", p.name);
        let temp_dir = TempDir::new().map_err(|e| BuildError::io(&p.target_image, e))?;

        if let Some(src_image) = &p.source_image {
            if files_byte_identical(src_image, &p.target_image)? {
                log::info!("{}: source and target are byte-identical", p.name);
                return self.finish_identical(p, temp_dir);
            }
        }

        if self.options.is_full(&p.name) || p.source_image.is_none() {
            let out = crate::full_image::FullImageBuilder::build_one(&p.name, &p.target_image, temp_dir.path())?;
            persist(temp_dir)?;
            return Ok(PartitionSummary {
                name: p.name.clone(),
                mode: PartitionMode::Full,
                transfer_list_path: None,
                new_dat_path: None,
                patch_dat_path: None,
                full_image_path: Some(out.temp_path),
                full_image_len: Some(out.byte_len),
            });
        }

        let source_image = p.source_image.as_ref().unwrap();
        let target_map = self.resolve_map(&p.target_image, &p.name, p.target_map.clone(), temp_dir.path(), "tgt")?;
        let source_map = self.resolve_map(source_image, &p.name, p.source_map.clone(), temp_dir.path(), "src")?;

        match (target_map, source_map) {
            (Some(tgt_map), Some(src_map)) => {
                self.run_incremental(p, &tgt_map, &src_map, temp_dir)
            }
            _ => self.run_image_patch_fallback(p, source_image, temp_dir),
        }
    }

    fn resolve_map(
        &self,
        image_path: &Path,
        partition: &str,
        existing: Option<PathBuf>,
        temp_dir: &Path,
        tag: &str,
    ) -> Result<Option<PathBuf>, BuildError> {
        if existing.is_some() {
            return Ok(existing);
        }
        let generated = temp_dir.join(format!("{partition}.{tag}.map"));
        match self.map_generator.run(image_path, &generated, partition) {
            Ok(()) => Ok(Some(generated)),
            Err(BuildError::External(ExternalFailure::MissingBinary(_))) => {
                log::warn!("{partition}: map generator unavailable, falling back to whole-image patch");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn finish_identical(&self, p: &PartitionInput, temp_dir: TempDir) -> Result<PartitionSummary, BuildError> {
        let mut emitter = TransferListEmitter::new(
            &p.name,
            temp_dir.path().join("new.dat"),
            temp_dir.path().join("patch.dat"),
            self.options.block_size,
        )?;
        emitter.first_block_check();
        let out = emitter.finish()?;
        let list_path = temp_dir.path().join(format!("{}.transfer.list", p.name));
        std::fs::write(&list_path, &out.text).map_err(|e| BuildError::io(&list_path, e))?;

        let dir = persist(temp_dir)?;
        Ok(PartitionSummary {
            name: p.name.clone(),
            mode: PartitionMode::Identical,
            transfer_list_path: Some(dir.join(format!("{}.transfer.list", p.name))),
            new_dat_path: Some(dir.join("new.dat")),
            patch_dat_path: Some(dir.join("patch.dat")),
            full_image_path: None,
            full_image_len: None,
        })
    }

    fn run_incremental(
        &self,
        p: &PartitionInput,
        target_map: &Path,
        source_map: &Path,
        temp_dir: TempDir,
    ) -> Result<PartitionSummary, BuildError> {
        let block_size = self.options.block_size;
        let target = Image::open(&p.target_image, Some(target_map), block_size)?;
        let source = Image::open(p.source_image.as_ref().unwrap(), Some(source_map), block_size)?;

        let actions = TransfersManager::new(&p.name, &target, Some(&source)).classify()?;
        let schedule = DependencyGraph::new(&p.name, &actions).schedule()?;

        let mut emitter = TransferListEmitter::new(
            &p.name,
            temp_dir.path().join("new.dat"),
            temp_dir.path().join("patch.dat"),
            block_size,
        )?;

        let limit = self.options.limit_bytes();

        for item in &schedule.items {
            match item {
                ScheduleItem::Stash { id, blocks } => emitter.stash(*id, blocks),
                ScheduleItem::Free { id } => emitter.free(*id),
                ScheduleItem::Action(idx) => {
                    let action = &actions[*idx];
                    match action.action_type {
                        ActionType::Zero => emitter.zero_action(&action.tgt_blocks),
                        ActionType::New => {
                            let bytes = target.read_range(&action.tgt_blocks)?;
                            emitter.new_action(&action.tgt_blocks, &bytes)?;
                        }
                        ActionType::Move => {
                            let hash = target.range_sha256(&action.tgt_blocks)?;
                            emitter.move_action(&action.tgt_blocks, &action.src_blocks, &hash);
                        }
                        ActionType::Diff => {
                            if action.src_blocks.is_empty() {
                                let bytes = target.read_range(&action.tgt_blocks)?;
                                emitter.new_action(&action.tgt_blocks, &bytes)?;
                                continue;
                            }
                            let chunker = ChunkedPatcher::new(&p.name, self.differ, block_size, limit);
                            let groups = chunker.split(&source, &target, action)?;
                            for g in groups {
                                let src_hash = source.range_sha256(&g.src_blocks)?;
                                let tgt_hash = target.range_sha256(&g.tgt_blocks)?;
                                emitter.diff_fragment(&g.tgt_blocks, &g.src_blocks, &src_hash, &tgt_hash, &g.patch)?;
                            }
                        }
                    }
                }
            }
        }

        let out = emitter.finish()?;
        let list_path = temp_dir.path().join(format!("{}.transfer.list", p.name));
        std::fs::write(&list_path, &out.text).map_err(|e| BuildError::io(&list_path, e))?;

        let dir = persist(temp_dir)?;
        Ok(PartitionSummary {
            name: p.name.clone(),
            mode: PartitionMode::Incremental,
            transfer_list_path: Some(dir.join(format!("{}.transfer.list", p.name))),
            new_dat_path: Some(dir.join("new.dat")),
            patch_dat_path: Some(dir.join("patch.dat")),
            full_image_path: None,
            full_image_len: None,
        })
    }

    fn run_image_patch_fallback(
        &self,
        p: &PartitionInput,
        source_image: &Path,
        temp_dir: TempDir,
    ) -> Result<PartitionSummary, BuildError> {
        crate::image::reject_sparse(&p.target_image)?;
        crate::image::reject_sparse(source_image)?;

        let src_bytes = std::fs::read(source_image).map_err(|e| BuildError::io(source_image, e))?;
        let tgt_bytes = std::fs::read(&p.target_image).map_err(|e| BuildError::io(&p.target_image, e))?;
        let src_hash = hex::encode_upper(Sha256::digest(&src_bytes));
        let tgt_hash = hex::encode_upper(Sha256::digest(&tgt_bytes));

        let patch_path = temp_dir.path().join(format!("{}.patch", p.name));
        self.differ.run(
            source_image,
            &p.target_image,
            &patch_path,
            self.options.limit_bytes(),
            true,
        )?;
        let patch = std::fs::read(&patch_path).map_err(|e| BuildError::io(&patch_path, e))?;

        std::fs::copy(&patch_path, temp_dir.path().join("patch.dat"))
            .map_err(|e| BuildError::io(&patch_path, e))?;

        let text = format!(
            "{}\nimage_patch 0 {} {} {} {} {}\n",
            crate::transfer_list::TRANSFER_LIST_VERSION,
            patch.len(),
            src_bytes.len(),
            src_hash,
            tgt_bytes.len(),
            tgt_hash
        );
        let list_path = temp_dir.path().join(format!("{}.transfer.list", p.name));
        std::fs::write(&list_path, &text).map_err(|e| BuildError::io(&list_path, e))?;

        let dir = persist(temp_dir)?;
        Ok(PartitionSummary {
            name: p.name.clone(),
            mode: PartitionMode::ImagePatchFallback,
            transfer_list_path: Some(dir.join(format!("{}.transfer.list", p.name))),
            new_dat_path: None,
            patch_dat_path: Some(dir.join("patch.dat")),
            full_image_path: None,
            full_image_len: None,
        })
    }
}

fn persist(temp_dir: TempDir) -> Result<PathBuf, BuildError> {
    Ok(temp_dir.into_path())
}

fn files_byte_identical(a: &Path, b: &Path) -> Result<bool, BuildError> {
    let meta_a = std::fs::metadata(a).map_err(|e| BuildError::io(a, e))?;
    let meta_b = std::fs::metadata(b).map_err(|e| BuildError::io(b, e))?;
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    let mut ra = BufReader::new(std::fs::File::open(a).map_err(|e| BuildError::io(a, e))?);
    let mut rb = BufReader::new(std::fs::File::open(b).map_err(|e| BuildError::io(b, e))?);
    let mut bufa = [0u8; 65536];
    let mut bufb = [0u8; 65536];
    loop {
        let na = ra.read(&mut bufa).map_err(|e| BuildError::io(a, e))?;
        let nb = rb.read(&mut bufb).map_err(|e| BuildError::io(b, e))?;
        if na != nb || bufa[..na] != bufb[..nb] {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
    }
}

/// Parses the last whitespace-separated token's digit run (e.g.
/// `"1.2.3 v5"` -> `5`, `"1.2.3"` -> `123`) and rejects the build unless the
/// target's number is strictly greater than the source's — a same-version
/// rebuild is a no-op update, not a valid one.
fn check_not_downgrade(source_version: &str, target_version: &str) -> Result<(), BuildError> {
    let src_num = trailing_version_number(source_version);
    let tgt_num = trailing_version_number(target_version);
    if let (Some(s), Some(t)) = (src_num, tgt_num) {
        if t <= s {
            return Err(InputError::Downgrade {
                target: target_version.to_string(),
                source: source_version.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

/// Mirrors `check_package_version`'s `target_ver.split(' ')[-1].replace('.', '')`:
/// the last whitespace-separated token, with every non-digit character
/// (dots included) stripped before parsing.
fn trailing_version_number(version: &str) -> Option<u64> {
    let token = version.split_whitespace().last()?;
    let digits: String = token.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
