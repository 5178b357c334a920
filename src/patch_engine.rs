use std::io::Read;

use tempfile::NamedTempFile;

use crate::action::Action;
use crate::differ::DiffTool;
use crate::error::{BuildError, ExternalFailure};
use crate::image::Image;

/// Outcome of running the differ over one DIFF action.
pub enum PatchOutcome {
    /// Patch bytes to append to `patch.dat`.
    Patch(Vec<u8>),
    /// The source side was empty; bytes are the verbatim target content to
    /// append to `new.dat` instead.
    PromotedToNew(Vec<u8>),
}

/// Invokes the external differ for a single DIFF action, materializing the
/// source/target byte ranges to scoped temp files first.
pub struct PatchEngine<'a> {
    differ: &'a dyn DiffTool,
}

impl<'a> PatchEngine<'a> {
    pub fn new(differ: &'a dyn DiffTool) -> Self {
        PatchEngine { differ }
    }

    pub fn diff(
        &self,
        source: &Image,
        target: &Image,
        action: &Action,
        limit: u64,
    ) -> Result<PatchOutcome, BuildError> {
        if action.src_blocks.is_empty() {
            log::warn!(
                "{}: empty source range for a DIFF action, promoting to NEW",
                action.tgt_name
            );
            let bytes = target.read_range(&action.tgt_blocks)?;
            return Ok(PatchOutcome::PromotedToNew(bytes));
        }

        let src_bytes = source.read_range(&action.src_blocks)?;
        let tgt_bytes = target.read_range(&action.tgt_blocks)?;

        match self.run_differ(&src_bytes, &tgt_bytes, limit) {
            Ok(patch) => Ok(PatchOutcome::Patch(patch)),
            Err(BuildError::External(ExternalFailure::DifferFailed { .. })) => {
                log::warn!(
                    "{}: differ failed at limit {limit}, retrying with a wider limit",
                    action.tgt_name
                );
                let patch = self.run_differ(&src_bytes, &tgt_bytes, limit * 2)?;
                Ok(PatchOutcome::Patch(patch))
            }
            Err(e) => Err(e),
        }
    }

    fn run_differ(&self, src_bytes: &[u8], tgt_bytes: &[u8], limit: u64) -> Result<Vec<u8>, BuildError> {
        let mut src_file = NamedTempFile::new().map_err(|e| BuildError::io("patch-src", e))?;
        let mut tgt_file = NamedTempFile::new().map_err(|e| BuildError::io("patch-tgt", e))?;
        let out_file = NamedTempFile::new().map_err(|e| BuildError::io("patch-out", e))?;

        std::io::Write::write_all(&mut src_file, src_bytes).map_err(|e| BuildError::io("patch-src", e))?;
        std::io::Write::write_all(&mut tgt_file, tgt_bytes).map_err(|e| BuildError::io("patch-tgt", e))?;

        self.differ
            .run(src_file.path(), tgt_file.path(), out_file.path(), limit, true)?;

        let mut patch = Vec::new();
        std::fs::File::open(out_file.path())
            .map_err(|e| BuildError::io(out_file.path(), e))?
            .read_to_end(&mut patch)
            .map_err(|e| BuildError::io(out_file.path(), e))?;
        Ok(patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_set::BlockSet;
    use crate::differ::fakes::{FailingDiffTool, FakeDiffTool};
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    fn write_image(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        File::create(&path).unwrap().write_all(data).unwrap();
        path
    }

    #[test]
    fn empty_source_promotes_to_new() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![0x55u8; 4096];
        let tgt_path = write_image(dir.path(), "tgt.img", &data);
        let src_path = write_image(dir.path(), "src.img", &[0u8; 4096]);
        let target = Image::open(&tgt_path, None::<&Path>, 4096).unwrap();
        let source = Image::open(&src_path, None::<&Path>, 4096).unwrap();

        let action = Action::diff("tgt", BlockSet::single_range(0, 1), "src", BlockSet::empty());
        let differ = FakeDiffTool::new(vec![1, 2, 3]);
        let engine = PatchEngine::new(&differ);
        match engine.diff(&source, &target, &action, 4096).unwrap() {
            PatchOutcome::PromotedToNew(bytes) => assert_eq!(bytes, data),
            PatchOutcome::Patch(_) => panic!("expected promotion to NEW"),
        }
    }

    #[test]
    fn successful_diff_returns_patch_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let tgt_path = write_image(dir.path(), "tgt.img", &[0x11u8; 4096]);
        let src_path = write_image(dir.path(), "src.img", &[0x22u8; 4096]);
        let target = Image::open(&tgt_path, None::<&Path>, 4096).unwrap();
        let source = Image::open(&src_path, None::<&Path>, 4096).unwrap();

        let action = Action::diff(
            "tgt",
            BlockSet::single_range(0, 1),
            "src",
            BlockSet::single_range(0, 1),
        );
        let differ = FakeDiffTool::new(vec![9, 9, 9]);
        let engine = PatchEngine::new(&differ);
        match engine.diff(&source, &target, &action, 4096).unwrap() {
            PatchOutcome::Patch(bytes) => assert_eq!(bytes, vec![9, 9, 9]),
            PatchOutcome::PromotedToNew(_) => panic!("expected a patch"),
        }
    }

    #[test]
    fn differ_failure_propagates_after_retry() {
        let dir = tempfile::tempdir().unwrap();
        let tgt_path = write_image(dir.path(), "tgt.img", &[0x11u8; 4096]);
        let src_path = write_image(dir.path(), "src.img", &[0x22u8; 4096]);
        let target = Image::open(&tgt_path, None::<&Path>, 4096).unwrap();
        let source = Image::open(&src_path, None::<&Path>, 4096).unwrap();

        let action = Action::diff(
            "tgt",
            BlockSet::single_range(0, 1),
            "src",
            BlockSet::single_range(0, 1),
        );
        let differ = FailingDiffTool;
        let engine = PatchEngine::new(&differ);
        let err = engine.diff(&source, &target, &action, 4096).unwrap_err();
        assert!(matches!(
            err,
            BuildError::External(ExternalFailure::DifferFailed { .. })
        ));
    }
}
