//! Built-in server resources.

use crate::{Resource, ResourceError, ResourceProvider, ServerSnapshot, StartupContext};
use async_trait::async_trait;
use fs2::FileExt;
use kiln_fetch::{digests_match, sha256_file};
use kiln_jobs::ReportStore;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Exclusive lock on the data directory.
///
/// Holds an advisory lock on `<data_dir>/kiln.lock` and records the server
/// PID in it, so a second server on the same data directory fails to start.
/// The file itself is never removed: on release the PID is cleared and the
/// lock dropped, so every server contends on the same inode.
#[derive(Debug, Default)]
pub struct DataDirLock;

#[async_trait]
impl ResourceProvider for DataDirLock {
    fn name(&self) -> &str {
        "data-dir-lock"
    }

    async fn acquire(&self, ctx: &StartupContext) -> Result<Box<dyn Resource>, ResourceError> {
        let data_dir = ctx.config.data_dir();
        fs::create_dir_all(data_dir)
            .map_err(|e| ResourceError::io("failed to create data directory", data_dir, e))?;

        let path = ctx.config.lock_file();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| ResourceError::io("failed to open lock file", &path, e))?;

        if file.try_lock_exclusive().is_err() {
            let mut content = String::new();
            let holder = file
                .read_to_string(&mut content)
                .ok()
                .and_then(|_| content.trim().parse().ok());
            return Err(ResourceError::Locked { path, holder });
        }

        write_pid(&mut file)
            .map_err(|e| ResourceError::io("failed to write lock file", &path, e))?;
        info!(path = %path.display(), "locked data directory");

        Ok(Box::new(HeldLock { file, path }))
    }
}

fn write_pid(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()
}

struct HeldLock {
    file: File,
    path: PathBuf,
}

#[async_trait]
impl Resource for HeldLock {
    fn name(&self) -> &str {
        "data-dir-lock"
    }

    async fn release(self: Box<Self>) -> Result<(), ResourceError> {
        self.release_now()
    }

    fn release_now(self: Box<Self>) -> Result<(), ResourceError> {
        if let Err(e) = self.file.set_len(0) {
            warn!(path = %self.path.display(), error = %e, "failed to clear lock file");
        }
        FileExt::unlock(&self.file)
            .map_err(|e| ResourceError::io("failed to unlock", &self.path, e))
    }
}

/// Verifies that the required artifacts of the latest download are present.
///
/// Fails startup if no download report exists, if a required item did not
/// succeed, or if a required file is missing or no longer matches its
/// recorded checksum.
#[derive(Debug, Default)]
pub struct ArtifactCheck;

#[async_trait]
impl ResourceProvider for ArtifactCheck {
    fn name(&self) -> &str {
        "artifacts"
    }

    async fn acquire(&self, ctx: &StartupContext) -> Result<Box<dyn Resource>, ResourceError> {
        let reports_dir = ctx.config.reports_dir();
        let store = ReportStore::open(&reports_dir);
        let report = store
            .load_latest()?
            .ok_or(ResourceError::NoReport(reports_dir))?;

        let mut verified = 0;
        for item in report.items.iter().filter(|i| i.required) {
            let unusable = |reason: String| ResourceError::Artifact {
                name: item.name.clone(),
                path: item.path.clone(),
                reason,
            };

            let Some(artifact) = item.artifact.as_ref().filter(|_| item.status.is_success()) else {
                return Err(unusable(format!("last download {}", item.status)));
            };
            let digest = verify_file(&item.path).map_err(|e| unusable(e.to_string()))?;
            if !digests_match(&artifact.sha256, &digest) {
                return Err(unusable("checksum changed since download".to_string()));
            }
            verified += 1;
        }

        info!(job_id = %report.job_id, verified, "required artifacts present");
        Ok(Box::new(Verified))
    }
}

fn verify_file(path: &Path) -> std::io::Result<String> {
    if !path.is_file() {
        return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file is missing"));
    }
    sha256_file(path)
}

struct Verified;

#[async_trait]
impl Resource for Verified {
    fn name(&self) -> &str {
        "artifacts"
    }

    async fn release(self: Box<Self>) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// Owns `<data_dir>/server-status.json`.
///
/// Writes an initial snapshot on acquisition and removes the file on
/// release, so the file exists only while a server is up.
#[derive(Debug, Default)]
pub struct StatusFile;

#[async_trait]
impl ResourceProvider for StatusFile {
    fn name(&self) -> &str {
        "status-file"
    }

    async fn acquire(&self, ctx: &StartupContext) -> Result<Box<dyn Resource>, ResourceError> {
        let path = ctx.config.status_file();
        write_snapshot(&path, &ctx.state.snapshot())?;
        Ok(Box::new(OwnedStatusFile { path }))
    }
}

struct OwnedStatusFile {
    path: PathBuf,
}

#[async_trait]
impl Resource for OwnedStatusFile {
    fn name(&self) -> &str {
        "status-file"
    }

    async fn release(self: Box<Self>) -> Result<(), ResourceError> {
        self.release_now()
    }

    fn release_now(self: Box<Self>) -> Result<(), ResourceError> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(ResourceError::io("failed to remove", &self.path, e))
            }
            _ => Ok(()),
        }
    }
}

/// Writes `snapshot` to `path` through a temporary file.
pub(crate) fn write_snapshot(path: &Path, snapshot: &ServerSnapshot) -> Result<(), ResourceError> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| ResourceError::io("failed to write", &tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| ResourceError::io("failed to write", path, e))
}

/// Reads a status file written by a running server.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn read_status_file(path: &Path) -> Result<ServerSnapshot, ResourceError> {
    let content = fs::read(path).map_err(|e| ResourceError::io("failed to read", path, e))?;
    Ok(serde_json::from_slice(&content)?)
}
