use std::path::{Path, PathBuf};

use crate::error::BuildError;
use crate::image::reject_sparse;

/// One partition processed by the trivial passthrough path: the target
/// image is copied verbatim, no differ/classifier involved.
pub struct FullImageOutput {
    pub partition: String,
    pub temp_path: PathBuf,
    pub byte_len: u64,
    pub script_line: String,
}

/// Copies a target image into the build's temp directory for partitions
/// with no source to diff against, or explicitly configured as full.
/// Independent per partition — callers farm these out across the shared
/// `rayon` pool (§4.H).
pub struct FullImageBuilder;

impl FullImageBuilder {
    pub fn build_one(
        partition: &str,
        target_image_path: &Path,
        temp_dir: &Path,
    ) -> Result<FullImageOutput, BuildError> {
        reject_sparse(target_image_path)?;

        let temp_path = temp_dir.join(format!("{partition}.img"));
        let byte_len = std::fs::copy(target_image_path, &temp_path)
            .map_err(|e| BuildError::io(target_image_path.to_path_buf(), e))?;

        log::info!("{partition}: full image copy, {byte_len} bytes");

        Ok(FullImageOutput {
            partition: partition.to_string(),
            temp_path,
            byte_len,
            script_line: format!("raw_write {partition}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InputError;
    use std::io::Write;

    #[test]
    fn copies_image_and_records_length() {
        let dir = tempfile::tempdir().unwrap();
        let img_path = dir.path().join("vendor.img");
        let data = vec![0x99u8; 8192];
        std::fs::File::create(&img_path).unwrap().write_all(&data).unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let out = FullImageBuilder::build_one("vendor", &img_path, out_dir.path()).unwrap();
        assert_eq!(out.byte_len, 8192);
        assert_eq!(out.script_line, "raw_write vendor");
        assert_eq!(std::fs::read(&out.temp_path).unwrap(), data);
    }

    #[test]
    fn rejects_sparse_image() {
        let dir = tempfile::tempdir().unwrap();
        let img_path = dir.path().join("sparse.img");
        let mut header = vec![0u8; 32];
        header[0..4].copy_from_slice(&0xED26_FF3Au32.to_le_bytes());
        header[4..6].copy_from_slice(&1u16.to_le_bytes());
        header[6..8].copy_from_slice(&0u16.to_le_bytes());
        header[8..10].copy_from_slice(&28u16.to_le_bytes());
        header[10..12].copy_from_slice(&12u16.to_le_bytes());
        std::fs::File::create(&img_path).unwrap().write_all(&header).unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let err = FullImageBuilder::build_one("vendor", &img_path, out_dir.path()).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Input(InputError::SparseUnsupported(_))
        ));
    }
}
