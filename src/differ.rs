use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{BuildError, ExternalFailure};

/// Seam between `PatchEngine`/`ChunkedPatcher` and the external binary
/// differ. Production code talks to a real executable through
/// `ProcessDiffTool`; tests inject a fake that never shells out.
pub trait DiffTool: Send + Sync {
    fn run(&self, src: &Path, tgt: &Path, out: &Path, limit: u64, pkg_diff: bool) -> Result<(), BuildError>;
}

/// Seam for the external per-partition map-file generator
/// (`e2fsdroid`-equivalent). Its absence is not fatal: callers fall back to
/// the whole-image patch path (`Coordinator`, §4.I).
pub trait MapGenerator: Send + Sync {
    fn run(&self, image: &Path, map_out: &Path, mount_point: &str) -> Result<(), BuildError>;
}

pub struct ProcessDiffTool {
    pub binary: PathBuf,
    pub timeout: Duration,
}

impl ProcessDiffTool {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        ProcessDiffTool { binary, timeout }
    }
}

impl DiffTool for ProcessDiffTool {
    fn run(&self, src: &Path, tgt: &Path, out: &Path, limit: u64, pkg_diff: bool) -> Result<(), BuildError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| BuildError::io(self.binary.clone(), e))?;
        rt.block_on(self.run_async(src, tgt, out, limit, pkg_diff))
    }
}

impl ProcessDiffTool {
    async fn run_async(
        &self,
        src: &Path,
        tgt: &Path,
        out: &Path,
        limit: u64,
        pkg_diff: bool,
    ) -> Result<(), BuildError> {
        let mut cmd = Command::new(&self.binary);
        if !pkg_diff {
            cmd.arg("-b").arg("1");
        }
        cmd.arg("-s")
            .arg(src)
            .arg("-d")
            .arg(tgt)
            .arg("-p")
            .arg(out)
            .arg("-l")
            .arg(limit.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BuildError::from(ExternalFailure::MissingBinary(self.binary.clone()))
            } else {
                BuildError::io(self.binary.clone(), e)
            }
        })?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| BuildError::io(self.binary.clone(), e))?,
            Err(_elapsed) => return Err(ExternalFailure::DifferTimeout(self.timeout).into()),
        };

        if !output.status.success() {
            let mut message = String::from_utf8_lossy(&output.stderr).into_owned();
            if message.trim().is_empty() {
                message = String::from_utf8_lossy(&output.stdout).into_owned();
            }
            return Err(ExternalFailure::DifferFailed {
                status: output.status.code().unwrap_or(-1),
                message,
            }
            .into());
        }

        log::debug!("differ produced {}", out.display());
        Ok(())
    }
}

pub struct ProcessMapGenerator {
    pub binary: PathBuf,
    pub timeout: Duration,
}

impl ProcessMapGenerator {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        ProcessMapGenerator { binary, timeout }
    }
}

impl MapGenerator for ProcessMapGenerator {
    fn run(&self, image: &Path, map_out: &Path, mount_point: &str) -> Result<(), BuildError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| BuildError::io(self.binary.clone(), e))?;
        rt.block_on(self.run_async(image, map_out, mount_point))
    }
}

impl ProcessMapGenerator {
    async fn run_async(&self, image: &Path, map_out: &Path, mount_point: &str) -> Result<(), BuildError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-B")
            .arg(map_out)
            .arg("-a")
            .arg(format!("/{mount_point}"))
            .arg(image)
            .arg("-e")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BuildError::from(ExternalFailure::MissingBinary(self.binary.clone()))
            } else {
                BuildError::io(self.binary.clone(), e)
            }
        })?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| BuildError::io(self.binary.clone(), e))?,
            Err(_elapsed) => return Err(ExternalFailure::DifferTimeout(self.timeout).into()),
        };

        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(ExternalFailure::DifferFailed {
                status: output.status.code().unwrap_or(-1),
                message,
            }
            .into());
        }
        Ok(())
    }
}
