//! Crash-safe files on the host: atomic metadata writes, round log archives and remote sync.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use flate2::{write::GzEncoder, Compression};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::cgroup_manager::{LimitedProcess, ProcessOutcome};

/// Write `bytes` to `path` so that readers see either the old or the new content.
///
/// The data goes to a hidden sibling file which is flushed to disk and renamed over `path`.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("{} is not a file path", path.display()))?
        .to_string_lossy();
    let tmp = dir.join(format!(".{file_name}.{}.tmp", std::process::id()));
    let result = (|| -> anyhow::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.with_context(|| format!("could not write {}", path.display()))
}

/// Pretty-print `value` as JSON to `path` atomically.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(value).context("could not serialize")?;
    atomic_write(path, &json)
}

/// Read and deserialize a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let file = File::open(path).with_context(|| format!("could not open {}", path.display()))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("could not parse {}", path.display()))
}

/// Where [`archive_dir`] puts the archive of `dir`.
pub fn archive_path(dir: &Path) -> PathBuf {
    let mut name = dir.file_name().unwrap_or_default().to_os_string();
    name.push(".tar.gz");
    dir.with_file_name(name)
}

/// Compress `dir` into `<dir>.tar.gz` and delete it.
///
/// The archive is written under a temporary name and renamed once complete, so an interrupted
/// run leaves the directory intact and no truncated archive behind.
pub fn archive_dir(dir: &Path) -> anyhow::Result<PathBuf> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let archive = archive_path(dir);
    let tmp = archive.with_extension("gz.tmp");
    let root_name = dir.file_name().unwrap_or_default().to_os_string();
    {
        let file = File::create(&tmp)
            .with_context(|| format!("could not create {}", tmp.display()))?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.follow_symlinks(false);
        builder
            .append_dir_all(&root_name, dir)
            .with_context(|| format!("could not archive {}", dir.display()))?;
        let encoder = builder.into_inner()?;
        encoder.finish()?.sync_all()?;
    }
    fs::rename(&tmp, &archive)?;
    fs::remove_dir_all(dir).with_context(|| format!("could not delete {}", dir.display()))?;
    debug!("Archived {} to {}", dir.display(), archive.display());
    Ok(archive)
}

/// Copies a finished output directory somewhere else.
pub trait RemoteSync: Send + Sync {
    /// Upload the contents of `local_dir`.
    fn sync(&self, local_dir: &Path) -> anyhow::Result<()>;
}

/// Runs a host command where `{src}` is replaced by the directory to upload,
/// e.g. `aws s3 sync {src} s3://bucket/logs/run`.
#[derive(Debug, Clone)]
pub struct CommandRemoteSync {
    template: String,
    timeout: Duration,
}

impl CommandRemoteSync {
    /// Sync with `template`, giving up after `timeout`.
    pub fn new(template: &str, timeout: Duration) -> Self {
        Self {
            template: template.to_string(),
            timeout,
        }
    }

    fn command(&self, local_dir: &Path) -> String {
        self.template.replace(
            "{src}",
            &crate::sandbox::quote(&local_dir.display().to_string()),
        )
    }
}

impl RemoteSync for CommandRemoteSync {
    fn sync(&self, local_dir: &Path) -> anyhow::Result<()> {
        let command = self.command(local_dir);
        info!("Syncing {} to remote", local_dir.display());
        let outcome = LimitedProcess::launch("sh", &["-c".to_string(), command.clone()], None, &[], None)?
            .wait_with_timeout(Some(self.timeout))?;
        match outcome {
            ProcessOutcome::Exited { exit_code: 0, .. } => Ok(()),
            ProcessOutcome::Exited { exit_code, output } => {
                bail!("remote sync `{command}` failed with exit code {exit_code}: {output}")
            }
            ProcessOutcome::TimedOut { .. } => {
                bail!("remote sync `{command}` timed out after {:?}", self.timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;

    #[test]
    fn atomic_write_replaces_content_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        write_json_atomic(&path, &BTreeMap::from([("round", 1)])).unwrap();
        write_json_atomic(&path, &BTreeMap::from([("round", 2)])).unwrap();
        let read: BTreeMap<String, u32> = read_json(&path).unwrap();
        assert_eq!(read["round"], 2);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn archive_replaces_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir_all(logs.join("inner")).unwrap();
        fs::write(logs.join("inner/sim_0.log"), "Blue won").unwrap();

        let archive = archive_dir(&logs).unwrap();
        assert_eq!(archive, dir.path().join("logs.tar.gz"));
        assert!(!logs.exists());

        let mut entries = tar::Archive::new(GzDecoder::new(File::open(&archive).unwrap()));
        let names: Vec<String> = entries
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "logs/inner/sim_0.log"));
    }

    #[cfg(unix)]
    #[test]
    fn command_sync_substitutes_source() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("metadata.json"), "{}").unwrap();
        let dest = tempfile::tempdir().unwrap();
        let sync = CommandRemoteSync::new(
            &format!("cp -r {{src}} {}/copy", dest.path().display()),
            Duration::from_secs(10),
        );
        sync.sync(src.path()).unwrap();
        assert!(dest.path().join("copy/metadata.json").exists());

        let failing = CommandRemoteSync::new("exit 3", Duration::from_secs(10));
        assert!(failing.sync(src.path()).is_err());
    }
}
