use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use blockdelta::coordinator::{Coordinator, PartitionInput, PartitionMode};
use blockdelta::differ::{DiffTool, MapGenerator};
use blockdelta::error::BuildError;
use blockdelta::BuildOptions;

/// Writes a patch blob with a header `ChunkedPatcher` can parse: one
/// descriptor spanning the whole blob. Content is irrelevant to these
/// tests, only the declared length matters for the verification identity.
struct FakeDiffTool {
    patch: Vec<u8>,
}

impl FakeDiffTool {
    fn new(len: usize) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"PATCH001");
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(&0u64.to_le_bytes());
        let body = len.saturating_sub(buf.len());
        buf.extend(std::iter::repeat(0xABu8).take(body));
        FakeDiffTool { patch: buf }
    }
}

impl DiffTool for FakeDiffTool {
    fn run(&self, _src: &Path, _tgt: &Path, out: &Path, _limit: u64, _pkg_diff: bool) -> Result<(), BuildError> {
        std::fs::write(out, &self.patch).map_err(|e| BuildError::io(out.to_path_buf(), e))
    }
}

/// A map generator that must never be invoked: every test supplies map
/// files explicitly, so any call here is a bug in the pipeline's fallback
/// wiring.
struct NeverCalledMapGenerator {
    calls: Mutex<u32>,
}

impl NeverCalledMapGenerator {
    fn new() -> Self {
        NeverCalledMapGenerator { calls: Mutex::new(0) }
    }
}

impl MapGenerator for NeverCalledMapGenerator {
    fn run(&self, _image: &Path, _map_out: &Path, _mount_point: &str) -> Result<(), BuildError> {
        *self.calls.lock().unwrap() += 1;
        panic!("map generator should not have been invoked when maps are already supplied");
    }
}

fn write_blocks(path: &Path, blocks: &[&[u8]]) {
    let mut data = Vec::new();
    for b in blocks {
        data.extend_from_slice(b);
    }
    std::fs::write(path, data).unwrap();
}

#[test]
fn incremental_partition_emits_zero_move_and_diff_entries() {
    let dir = tempfile::tempdir().unwrap();
    let block = |byte: u8| vec![byte; 4096];

    let target_path = dir.path().join("system_target.img");
    write_blocks(
        &target_path,
        &[&block(0xFF), &block(0x00), &block(0xAA), &block(0x11), &block(0x11)],
    );
    let source_path = dir.path().join("system_source.img");
    write_blocks(
        &source_path,
        &[&block(0xEE), &block(0x00), &block(0xAA), &block(0x22), &block(0x22)],
    );

    let map_text = "app.bin 2,2,3\nlib.bin 2,3,5\n";
    let target_map = dir.path().join("target.map");
    let source_map = dir.path().join("source.map");
    std::fs::write(&target_map, map_text).unwrap();
    std::fs::write(&source_map, map_text).unwrap();

    let options = BuildOptions::from_map(&BTreeMap::new()).unwrap();
    let differ = FakeDiffTool::new(64);
    let map_generator = NeverCalledMapGenerator::new();
    let coordinator = Coordinator::new(&options, &differ, &map_generator);

    let partitions = vec![PartitionInput {
        name: "system".to_string(),
        target_image: target_path,
        target_map: Some(target_map),
        source_image: Some(source_path),
        source_map: Some(source_map),
    }];

    let manifest = coordinator.run(&partitions, true).unwrap();
    assert_eq!(manifest.partitions.len(), 1);
    let summary = &manifest.partitions[0];
    assert_eq!(summary.mode, PartitionMode::Incremental);

    let text = std::fs::read_to_string(summary.transfer_list_path.as_ref().unwrap()).unwrap();
    assert!(text.contains("erase 2,1,2"), "expected erase line for the zero block:\n{text}");
    assert!(text.contains("zero 2,1,2"), "expected zero line for the zero block:\n{text}");
    assert!(text.contains("new 2,0,1"), "expected the reserved block to land in new.dat:\n{text}");
    assert!(text.lines().any(|l| l.starts_with("move ")), "expected a move line:\n{text}");
    assert!(text.lines().any(|l| l.starts_with("pkgdiff ")), "expected a pkgdiff line:\n{text}");

    let new_dat_len = std::fs::metadata(summary.new_dat_path.as_ref().unwrap()).unwrap().len();
    assert_eq!(new_dat_len, 4096); // just the reserved block

    let patch_dat_len = std::fs::metadata(summary.patch_dat_path.as_ref().unwrap()).unwrap().len();
    assert!(patch_dat_len > 0);

    assert_eq!(*map_generator_calls(&map_generator), 0);
}

fn map_generator_calls(m: &NeverCalledMapGenerator) -> std::sync::MutexGuard<'_, u32> {
    m.calls.lock().unwrap()
}

#[test]
fn byte_identical_source_and_target_short_circuits_to_identical_mode() {
    let dir = tempfile::tempdir().unwrap();
    let data = vec![0x77u8; 4096 * 3];
    let target_path = dir.path().join("vendor_target.img");
    let source_path = dir.path().join("vendor_source.img");
    std::fs::write(&target_path, &data).unwrap();
    std::fs::write(&source_path, &data).unwrap();

    let options = BuildOptions::from_map(&BTreeMap::new()).unwrap();
    let differ = FakeDiffTool::new(16);
    let map_generator = NeverCalledMapGenerator::new();
    let coordinator = Coordinator::new(&options, &differ, &map_generator);

    let partitions = vec![PartitionInput {
        name: "vendor".to_string(),
        target_image: target_path,
        target_map: None,
        source_image: Some(source_path),
        source_map: None,
    }];

    let manifest = coordinator.run(&partitions, true).unwrap();
    let summary = &manifest.partitions[0];
    assert_eq!(summary.mode, PartitionMode::Identical);

    let text = std::fs::read_to_string(summary.transfer_list_path.as_ref().unwrap()).unwrap();
    assert!(text.contains("first_block_check"));
    assert_eq!(std::fs::metadata(summary.new_dat_path.as_ref().unwrap()).unwrap().len(), 0);
}

#[test]
fn partition_with_no_source_falls_back_to_full_image() {
    let dir = tempfile::tempdir().unwrap();
    let target_path = dir.path().join("odm_target.img");
    std::fs::write(&target_path, vec![0x33u8; 4096 * 2]).unwrap();

    let options = BuildOptions::from_map(&BTreeMap::new()).unwrap();
    let differ = FakeDiffTool::new(16);
    let map_generator = NeverCalledMapGenerator::new();
    let coordinator = Coordinator::new(&options, &differ, &map_generator);

    let partitions = vec![PartitionInput {
        name: "odm".to_string(),
        target_image: target_path,
        target_map: None,
        source_image: None,
        source_map: None,
    }];

    let manifest = coordinator.run(&partitions, true).unwrap();
    let summary = &manifest.partitions[0];
    assert_eq!(summary.mode, PartitionMode::Full);
    assert_eq!(summary.full_image_len, Some(8192));
    assert!(summary.transfer_list_path.is_none());
}

#[test]
fn downgrade_is_rejected_before_any_partition_runs() {
    let mut map = BTreeMap::new();
    map.insert("source_version".to_string(), "1.0.0 v10".to_string());
    map.insert("target_version".to_string(), "1.0.0 v9".to_string());
    let options = BuildOptions::from_map(&map).unwrap();

    let differ = FakeDiffTool::new(16);
    let map_generator = NeverCalledMapGenerator::new();
    let coordinator = Coordinator::new(&options, &differ, &map_generator);

    let partitions = vec![PartitionInput {
        name: "system".to_string(),
        target_image: "/nonexistent/target.img".into(),
        target_map: None,
        source_image: None,
        source_map: None,
    }];

    let err = coordinator.run(&partitions, true).unwrap_err();
    assert!(matches!(
        err,
        BuildError::Input(blockdelta::error::InputError::Downgrade { .. })
    ));
}

#[test]
fn userdata_partition_is_always_rejected() {
    let options = BuildOptions::from_map(&BTreeMap::new()).unwrap();
    let differ = FakeDiffTool::new(16);
    let map_generator = NeverCalledMapGenerator::new();
    let coordinator = Coordinator::new(&options, &differ, &map_generator);

    let partitions = vec![PartitionInput {
        name: "userdata".to_string(),
        target_image: "/nonexistent/userdata.img".into(),
        target_map: None,
        source_image: None,
        source_map: None,
    }];

    let err = coordinator.run(&partitions, true).unwrap_err();
    assert!(matches!(
        err,
        BuildError::Input(blockdelta::error::InputError::UserdataRejected)
    ));
}

#[test]
fn boot_partition_cannot_be_configured_incremental() {
    let mut map = BTreeMap::new();
    map.insert("incremental_img_list".to_string(), "boot".to_string());
    let options = BuildOptions::from_map(&map).unwrap();
    let differ = FakeDiffTool::new(16);
    let map_generator = NeverCalledMapGenerator::new();
    let coordinator = Coordinator::new(&options, &differ, &map_generator);

    let partitions = vec![PartitionInput {
        name: "boot".to_string(),
        target_image: "/nonexistent/boot.img".into(),
        target_map: None,
        source_image: None,
        source_map: None,
    }];

    let err = coordinator.run(&partitions, true).unwrap_err();
    assert!(matches!(
        err,
        BuildError::Input(blockdelta::error::InputError::BootIncremental)
    ));
}
