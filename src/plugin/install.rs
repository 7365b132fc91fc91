//! Package install/uninstall seam.
//!
//! Installation delegates to an external package tool spawned as a child
//! process; its output is streamed line by line back to the caller so the
//! control plane can forward progress to the front-end. Uploaded packages
//! arrive as gzip tarballs and are extracted into a staging directory
//! before the manifest is validated.

use crate::error::{BridgeError, Result};
use crate::plugin::PluginManifest;
use flate2::read::GzDecoder;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// External package tool wrapper.
pub struct PackageTool {
    program: String,
    global: bool,
}

impl Default for PackageTool {
    fn default() -> Self {
        Self {
            program: "npm".to_string(),
            global: true,
        }
    }
}

impl PackageTool {
    pub fn new(program: impl Into<String>, global: bool) -> Self {
        Self {
            program: program.into(),
            global,
        }
    }

    /// Install a package, streaming tool output to `progress`.
    pub async fn install(&self, package: &str, progress: impl FnMut(String)) -> Result<()> {
        self.run("install", package, progress).await
    }

    /// Uninstall a package, streaming tool output to `progress`.
    pub async fn uninstall(&self, package: &str, progress: impl FnMut(String)) -> Result<()> {
        self.run("uninstall", package, progress).await
    }

    async fn run(
        &self,
        verb: &str,
        package: &str,
        mut progress: impl FnMut(String),
    ) -> Result<()> {
        info!("[Plugin] {} {verb} {package}", self.program);
        let mut command = Command::new(&self.program);
        command.arg(verb);
        if self.global {
            command.arg("-g");
        }
        command
            .arg(package)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            BridgeError::plugin(package, format!("failed to spawn {}: {e}", self.program))
        })?;

        let stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut stdout = stdout.ok_or_else(|| BridgeError::plugin(package, "no stdout"))?;
        let mut stderr = stderr.ok_or_else(|| BridgeError::plugin(package, "no stderr"))?;

        let (mut out_done, mut err_done) = (false, false);
        while !(out_done && err_done) {
            tokio::select! {
                line = stdout.next_line(), if !out_done => match line? {
                    Some(line) => progress(line),
                    None => out_done = true,
                },
                line = stderr.next_line(), if !err_done => match line? {
                    Some(line) => progress(line),
                    None => err_done = true,
                },
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(BridgeError::plugin(
                package,
                format!("{} {verb} exited with {status}", self.program),
            ));
        }
        info!("[Plugin] {verb} of {package} finished");
        Ok(())
    }
}

/// Extract an uploaded gzip tarball into `staging_root` and locate its
/// manifest. Returns the package directory and the parsed manifest.
pub async fn extract_package(
    archive: &Path,
    staging_root: &Path,
) -> Result<(PathBuf, PluginManifest)> {
    let archive = archive.to_path_buf();
    let staging = staging_root.join(format!("upload-{}", uuid::Uuid::new_v4()));

    let unpack_dir = staging.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&unpack_dir)?;
        let file = std::fs::File::open(&archive)?;
        let mut tarball = tar::Archive::new(GzDecoder::new(file));
        // unpack rejects entries that would escape the destination
        tarball.unpack(&unpack_dir)?;
        Ok(())
    })
    .await
    .map_err(|e| BridgeError::Engine(format!("extract task failed: {e}")))??;

    // npm-style tarballs nest the payload one directory deep
    let package_dir = if staging.join(PluginManifest::FILE_NAME).exists() {
        staging.clone()
    } else {
        std::fs::read_dir(&staging)?
            .flatten()
            .map(|entry| entry.path())
            .find(|path| path.join(PluginManifest::FILE_NAME).exists())
            .ok_or_else(|| {
                BridgeError::NotFound(format!(
                    "{} in uploaded package",
                    PluginManifest::FILE_NAME
                ))
            })?
    };

    let manifest = PluginManifest::read(&package_dir)?;
    debug!(
        "[Plugin] Extracted {} {} to {}",
        manifest.name,
        manifest.version,
        package_dir.display()
    );
    Ok((package_dir, manifest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::TempDir;

    fn make_tarball(dir: &Path, nested: bool) -> PathBuf {
        let archive_path = dir.join("upload.tgz");
        let file = std::fs::File::create(&archive_path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let manifest = br#"{"name":"matterbridge-uploaded","version":"2.1.0"}"#;
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        let entry_path = if nested {
            "package/plugin.json"
        } else {
            "plugin.json"
        };
        builder
            .append_data(&mut header, entry_path, manifest.as_slice())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        archive_path
    }

    #[tokio::test]
    async fn test_extract_flat_package() {
        let dir = TempDir::new().unwrap();
        let archive = make_tarball(dir.path(), false);
        let (package_dir, manifest) = extract_package(&archive, dir.path()).await.unwrap();
        assert_eq!(manifest.name, "matterbridge-uploaded");
        assert!(package_dir.join(PluginManifest::FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_extract_nested_package() {
        let dir = TempDir::new().unwrap();
        let archive = make_tarball(dir.path(), true);
        let (_package_dir, manifest) = extract_package(&archive, dir.path()).await.unwrap();
        assert_eq!(manifest.version, "2.1.0");
    }

    #[tokio::test]
    async fn test_missing_manifest_is_not_found() {
        let dir = TempDir::new().unwrap();
        let archive_path = dir.path().join("empty.tgz");
        let file = std::fs::File::create(&archive_path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let builder = tar::Builder::new(encoder);
        builder.into_inner().unwrap().finish().unwrap();

        let result = extract_package(&archive_path, dir.path()).await;
        assert!(matches!(result, Err(BridgeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_tool_failure_reports_error() {
        let tool = PackageTool::new("false", false);
        let mut lines = Vec::new();
        let result = tool.install("anything", |l| lines.push(l)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tool_streams_output() {
        let tool = PackageTool::new("echo", false);
        let mut lines = Vec::new();
        tool.install("matterbridge-mock", |l| lines.push(l)).await.unwrap();
        assert!(lines.iter().any(|l| l.contains("matterbridge-mock")));
    }
}
