use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use blockdelta::coordinator::{BuildManifest, Coordinator, PartitionInput, PartitionSummary};
use blockdelta::differ::{DiffTool, ProcessDiffTool, ProcessMapGenerator};
use blockdelta::transfer_list::verify_transfer_list;
use blockdelta::{BuildError, BuildOptions};

#[derive(Parser)]
#[command(name = "blockdelta", about = "Block-diff OTA update-package builder core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline over a target (and optional source) directory.
    Build {
        #[arg(long)]
        target_dir: PathBuf,
        #[arg(long)]
        source_dir: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        output_dir: PathBuf,
        #[arg(long)]
        source_is_zip: bool,
    },
    /// Invoke the differ directly on two images; diagnostic, bypasses the
    /// classifier/scheduler entirely.
    DiffImage {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 1_048_576)]
        limit: u64,
        #[arg(long, default_value = "imgdiff")]
        differ_path: PathBuf,
    },
    /// Re-run the transfer list verification identity for an already-emitted
    /// partition's output; diagnostic use.
    InspectTransferList {
        #[arg(long)]
        transfer_list: PathBuf,
        #[arg(long)]
        new_dat: PathBuf,
        #[arg(long)]
        patch_dat: PathBuf,
        #[arg(long, default_value_t = 4096)]
        block_size: u64,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            match e {
                BuildError::Input(_) => ExitCode::from(1),
                _ => ExitCode::from(2),
            }
        }
    }
}

fn run(cli: Cli) -> Result<(), BuildError> {
    match cli.command {
        Command::Build {
            target_dir,
            source_dir,
            config,
            output_dir,
            source_is_zip,
        } => run_build(&target_dir, source_dir.as_deref(), config.as_deref(), &output_dir, source_is_zip),
        Command::DiffImage {
            source,
            target,
            out,
            limit,
            differ_path,
        } => {
            let differ = ProcessDiffTool::new(differ_path, Duration::from_secs(300));
            differ.run(&source, &target, &out, limit, true)
        }
        Command::InspectTransferList {
            transfer_list,
            new_dat,
            patch_dat,
            block_size,
        } => {
            let text = std::fs::read_to_string(&transfer_list).map_err(|e| BuildError::io(&transfer_list, e))?;
            let new_len = std::fs::metadata(&new_dat).map_err(|e| BuildError::io(&new_dat, e))?.len();
            let patch_len = std::fs::metadata(&patch_dat).map_err(|e| BuildError::io(&patch_dat, e))?.len();
            verify_transfer_list(&text, new_len, patch_len, block_size)?;
            println!("transfer list is internally consistent");
            Ok(())
        }
    }
}

fn run_build(
    target_dir: &Path,
    source_dir: Option<&Path>,
    config: Option<&Path>,
    output_dir: &Path,
    source_is_zip: bool,
) -> Result<(), BuildError> {
    let config_map = match config {
        Some(path) => read_config_file(path)?,
        None => BTreeMap::new(),
    };
    let options = BuildOptions::from_map(&config_map)?;

    let partitions = discover_partitions(target_dir, source_dir)?;

    let differ = ProcessDiffTool::new(options.differ_path.clone(), options.differ_timeout);
    let map_generator = ProcessMapGenerator::new(options.map_generator_path.clone(), options.differ_timeout);

    let coordinator = Coordinator::new(&options, &differ, &map_generator);
    let manifest = coordinator.run(&partitions, source_is_zip)?;

    let manifest = relocate_outputs(manifest, output_dir)?;

    std::fs::create_dir_all(output_dir).map_err(|e| BuildError::io(output_dir, e))?;
    let manifest_path = output_dir.join("manifest.json");
    let json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| BuildError::io(&manifest_path, std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    std::fs::write(&manifest_path, json).map_err(|e| BuildError::io(&manifest_path, e))?;

    log::info!(
        "wrote manifest for {} partitions to {}",
        manifest.partitions.len(),
        manifest_path.display()
    );
    Ok(())
}

/// Plain `key=value` config reader. The XML-ingestion collaborator that
/// produces these values in a full release tool is external to this crate;
/// this is the minimal ambient stand-in the CLI ships with.
fn read_config_file(path: &Path) -> Result<BTreeMap<String, String>, BuildError> {
    let text = std::fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
    let mut map = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(map)
}

fn discover_partitions(target_dir: &Path, source_dir: Option<&Path>) -> Result<Vec<PartitionInput>, BuildError> {
    let mut partitions = Vec::new();
    for entry in std::fs::read_dir(target_dir).map_err(|e| BuildError::io(target_dir, e))? {
        let entry = entry.map_err(|e| BuildError::io(target_dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("img") {
            continue;
        }
        let name = path.file_stem().unwrap().to_string_lossy().to_string();
        let target_map = target_dir.join(format!("{name}.map"));
        let source_image = source_dir.map(|d| d.join(format!("{name}.img")));
        let source_map = source_dir.map(|d| d.join(format!("{name}.map")));

        partitions.push(PartitionInput {
            name,
            target_image: path,
            target_map: target_map.exists().then_some(target_map),
            source_image: source_image.filter(|p| p.exists()),
            source_map: source_map.filter(|p| p.exists()),
        });
    }
    partitions.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(partitions)
}

fn relocate_outputs(manifest: BuildManifest, output_dir: &Path) -> Result<BuildManifest, BuildError> {
    let mut relocated = Vec::with_capacity(manifest.partitions.len());
    for summary in manifest.partitions {
        relocated.push(relocate_one(summary, output_dir)?);
    }
    Ok(BuildManifest { partitions: relocated })
}

fn relocate_one(summary: PartitionSummary, output_dir: &Path) -> Result<PartitionSummary, BuildError> {
    let partition_dir = output_dir.join(&summary.name);
    std::fs::create_dir_all(&partition_dir).map_err(|e| BuildError::io(&partition_dir, e))?;

    let move_into = |src: &Path, dir: &Path| -> Result<PathBuf, BuildError> {
        let dest = dir.join(src.file_name().unwrap());
        std::fs::rename(src, &dest).map_err(|e| BuildError::io(src, e))?;
        Ok(dest)
    };

    Ok(PartitionSummary {
        name: summary.name,
        mode: summary.mode,
        transfer_list_path: summary
            .transfer_list_path
            .as_deref()
            .map(|p| move_into(p, &partition_dir))
            .transpose()?,
        new_dat_path: summary
            .new_dat_path
            .as_deref()
            .map(|p| move_into(p, &partition_dir))
            .transpose()?,
        patch_dat_path: summary
            .patch_dat_path
            .as_deref()
            .map(|p| move_into(p, &partition_dir))
            .transpose()?,
        full_image_path: summary
            .full_image_path
            .as_deref()
            .map(|p| move_into(p, &partition_dir))
            .transpose()?,
        full_image_len: summary.full_image_len,
    })
}
